use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{EnvSource, VendorEnv};
use crate::crypto::Cipher;
use crate::error::AiError;
use crate::llm::{build_provider, ChatProvider, ProviderKind};
use crate::models::{ChatCompletionRequest, ChatCompletionResponse, ProviderRecord};

#[derive(Default)]
struct Inner {
    providers: BTreeMap<String, Arc<dyn ChatProvider>>,
    default: Option<String>,
}

/**
 * \brief 按名称索引的 Provider 注册表，带默认选择。
 * \details 状态集中在一把 `RwLock` 中。查找时克隆出 `Arc` 后立即释放锁，网络调用期间不持锁。
 */
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
    client: reqwest::Client,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /** \brief 指定加载器构建适配器时共用的 HTTP 客户端。 */
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            client,
        }
    }

    /**
     * \brief 注册或替换 `name`。空注册表中第一个注册的 Provider 成为默认。
     */
    pub fn register(&self, name: &str, provider: Arc<dyn ChatProvider>) {
        let model = provider.model_name().to_string();
        let mut inner = self.inner.write();
        inner.providers.insert(name.to_string(), provider);
        if inner.default.is_none() {
            inner.default = Some(name.to_string());
        }
        tracing::info!(provider = name, model = %model, "registered provider");
    }

    pub fn set_default(&self, name: &str) -> Result<(), AiError> {
        let mut inner = self.inner.write();
        if !inner.providers.contains_key(name) {
            return Err(AiError::NotFound(name.to_string()));
        }
        inner.default = Some(name.to_string());
        tracing::info!(provider = name, "default provider set");
        Ok(())
    }

    /**
     * \brief 查找 Provider，空名称表示默认 Provider。
     * \return 未配置任何 Provider 时为 NoProvidersConfigured，名称不存在时为 NotFound
     */
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ChatProvider>, AiError> {
        let inner = self.inner.read();
        let key = if name.is_empty() {
            inner
                .default
                .as_deref()
                .ok_or(AiError::NoProvidersConfigured)?
        } else {
            name
        };
        inner
            .providers
            .get(key)
            .cloned()
            .ok_or_else(|| AiError::NotFound(key.to_string()))
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.read().providers.keys().cloned().collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.read().providers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().providers.is_empty()
    }

    pub fn default_name(&self) -> Option<String> {
        self.inner.read().default.clone()
    }

    /**
     * \brief 在读锁内解析 Provider，释放锁后再调用适配器。
     */
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, AiError> {
        let provider = self.resolve(name)?;
        provider.chat_completion(cancel, request).await
    }

    /** \brief 清空所有 Provider 与默认选择。 */
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.providers.clear();
        inner.default = None;
        tracing::info!("cleared all providers");
    }

    /**
     * \brief 注册数据库中所有启用的 Provider。
     * \details 解密失败的 Key 按原文使用；Key 为空或厂商未知的记录跳过。
     * \return 成功注册的数量
     */
    pub fn load_from_records(&self, records: &[ProviderRecord], cipher: &Cipher) -> usize {
        let mut loaded = 0;
        for record in records.iter().filter(|r| r.is_active) {
            let api_key = cipher.decrypt_or_plaintext(&record.api_key_encrypted);
            if api_key.is_empty() {
                tracing::warn!(provider = %record.name, "provider has no api key, skipping");
                continue;
            }
            let Some(kind) = ProviderKind::from_tag(&record.name) else {
                tracing::warn!(provider = %record.name, "unknown provider type, skipping");
                continue;
            };
            let provider = build_provider(
                kind,
                &record.endpoint,
                &api_key,
                &record.model_name,
                self.client.clone(),
            );
            self.register(&record.name, provider);
            loaded += 1;
        }
        tracing::info!(count = loaded, "loaded providers from store");
        loaded
    }

    /**
     * \brief 为每个设置了 `{PREFIX}_API_KEY` 的厂商注册一个 Provider。
     */
    pub fn load_from_env(&self, env: &dyn EnvSource) -> usize {
        let vendors = VendorEnv::load_all(env);
        for vendor in &vendors {
            let provider = build_provider(
                vendor.kind,
                &vendor.endpoint,
                &vendor.api_key,
                &vendor.model,
                self.client.clone(),
            );
            self.register(vendor.kind.tag(), provider);
        }
        tracing::info!(count = vendors.len(), "loaded providers from environment");
        vendors.len()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ProviderRegistry")
            .field("default", &inner.default)
            .field("count", &inner.providers.len())
            .finish()
    }
}
