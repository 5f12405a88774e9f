use std::collections::HashMap;

use crate::llm::ProviderKind;

pub const DEFAULT_DB_PATH: &str = "folio.db";
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/**
 * \brief 环境变量式配置源。
 */
pub trait EnvSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /**
     * \brief 读取非空值。
     */
    fn non_empty(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }
}

/**
 * \brief 读取进程环境变量。
 */
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/**
 * \brief 基于内存映射的配置源，主要用于测试。
 */
#[derive(Debug, Default, Clone)]
pub struct MapEnv(HashMap<String, String>);

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }
}

impl EnvSource for MapEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/**
 * \brief 进程级配置。
 */
#[derive(Clone)]
pub struct Settings {
    /** \brief SQLite 数据库文件路径 */
    pub db_path: String,
    /** \brief HTTP 监听地址 */
    pub addr: String,
    /** \brief 凭据加密秘密串，未设置时使用开发默认值 */
    pub encryption_key: Option<String>,
    /** \brief 日志过滤表达式 */
    pub log_filter: String,
    /** \brief 追加写入的日志文件，可选 */
    pub log_file: Option<String>,
}

impl Settings {
    pub fn from_source(env: &dyn EnvSource) -> Self {
        Self {
            db_path: env
                .non_empty("FOLIO_DB_PATH")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            addr: env
                .non_empty("FOLIO_ADDR")
                .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            encryption_key: env.non_empty("ENCRYPTION_KEY"),
            log_filter: env
                .non_empty("FOLIO_LOG")
                .unwrap_or_else(|| "info".to_string()),
            log_file: env.non_empty("FOLIO_LOG_FILE"),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_source(&MapEnv::new())
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("db_path", &self.db_path)
            .field("addr", &self.addr)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<set>"))
            .field("log_filter", &self.log_filter)
            .field("log_file", &self.log_file)
            .finish()
    }
}

/**
 * \brief 单个厂商的环境变量配置：`{PREFIX}_API_KEY`、`{PREFIX}_API_URL`、`{PREFIX}_MODEL`。
 */
#[derive(Clone)]
pub struct VendorEnv {
    pub kind: ProviderKind,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
}

impl VendorEnv {
    /**
     * \brief 读取指定厂商配置；未设置 API Key 时返回 None。
     */
    pub fn load(env: &dyn EnvSource, kind: ProviderKind) -> Option<Self> {
        let prefix = kind.env_prefix();
        let api_key = env.non_empty(&format!("{}_API_KEY", prefix))?;
        let endpoint = env
            .non_empty(&format!("{}_API_URL", prefix))
            .unwrap_or_else(|| kind.default_endpoint().to_string());
        let model = env
            .non_empty(&format!("{}_MODEL", prefix))
            .unwrap_or_else(|| kind.default_model().to_string());
        Some(Self {
            kind,
            api_key,
            endpoint,
            model,
        })
    }

    /**
     * \brief 按固定顺序读取全部厂商配置。
     */
    pub fn load_all(env: &dyn EnvSource) -> Vec<Self> {
        ProviderKind::ALL
            .iter()
            .filter_map(|kind| Self::load(env, *kind))
            .collect()
    }
}
