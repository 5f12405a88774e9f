use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::config::{EnvSource, Settings};
use crate::crypto::Cipher;
use crate::db::{self, NewMessage, NewProvider};
use crate::error::AiError;
use crate::llm::ProviderKind;
use crate::models::{
    Character, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatUsage,
    ModelCatalogEntry, Role, StoredMessage, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
use crate::registry::ProviderRegistry;

/** \brief 单条用户消息的最大字符数。 */
pub const MAX_MESSAGE_CHARS: usize = 10_000;
/** \brief 每次对话携带的历史消息条数上限。 */
pub const HISTORY_LIMIT: usize = 20;
const TITLE_CHARS: usize = 30;

/**
 * \brief 一次聊天请求。
 */
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatInput {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub character_id: Option<i64>,
    /** \brief Provider 名称，缺省使用默认 Provider */
    #[serde(default)]
    pub provider: Option<String>,
    /** \brief 由 HTTP 层根据连接填写，不从请求体读取 */
    #[serde(skip)]
    pub user_ip: String,
}

/**
 * \brief 聊天结果。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutput {
    pub session_id: String,
    pub conversation_id: i64,
    pub character_id: i64,
    pub reply: String,
    pub provider: String,
    pub model: String,
    pub usage: ChatUsage,
}

/**
 * \brief 管理端写入 Provider 的输入，api_key 为明文。
 */
#[derive(Debug, Clone)]
pub struct ProviderInput {
    pub kind: ProviderKind,
    pub api_key: String,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub display_name: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub active: bool,
}

/**
 * \brief AI 功能的编排层：持有注册表、目录缓存与加密器，并按需打开数据库。
 */
pub struct AiService {
    settings: Settings,
    env: Arc<dyn EnvSource>,
    cipher: Cipher,
    registry: ProviderRegistry,
    models: TtlCache<Vec<ModelCatalogEntry>>,
    characters: TtlCache<Vec<Character>>,
}

impl AiService {
    pub fn new(settings: Settings, env: Arc<dyn EnvSource>) -> Self {
        let cipher = Cipher::from_settings(&settings);
        Self {
            settings,
            env,
            cipher,
            registry: ProviderRegistry::new(),
            models: TtlCache::default(),
            characters: TtlCache::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /**
     * \brief 迁移数据库、写入默认数据并加载 Provider。
     * \return 加载完成后注册的 Provider 名称
     */
    pub async fn bootstrap(&self) -> Result<Vec<String>, AiError> {
        let cipher = self.cipher.clone();
        let env = Arc::clone(&self.env);
        self.with_conn(move |conn| {
            db::migrate(conn)?;
            db::seed_defaults(conn, &cipher, env.as_ref())
        })
        .await?;
        self.reload().await
    }

    /**
     * \brief 重新加载 Provider：优先使用数据库中的启用配置，为空或读取失败时回退到环境变量。
     * \details 先读取数据库再清空注册表，避免加载期间出现空窗。
     */
    pub async fn reload(&self) -> Result<Vec<String>, AiError> {
        let records = match self.with_conn(|conn| db::list_active_providers(conn)).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read providers from store, using environment");
                Vec::new()
            }
        };

        self.registry.clear();
        let mut loaded = self.registry.load_from_records(&records, &self.cipher);
        if loaded == 0 {
            loaded = self.registry.load_from_env(self.env.as_ref());
        }
        if loaded == 0 {
            tracing::warn!("no AI provider configured");
        }

        self.models.invalidate();
        self.characters.invalidate();
        Ok(self.registry.list_names())
    }

    /**
     * \brief 将请求转发给指定 Provider，空名称表示默认 Provider。
     */
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        provider: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, AiError> {
        self.registry.dispatch(cancel, provider, request).await
    }

    /**
     * \brief 可用模型列表，缓存 5 分钟。数据库中没有启用配置时由已注册的 Provider 生成。
     */
    pub async fn model_catalog(&self) -> Result<Arc<Vec<ModelCatalogEntry>>, AiError> {
        self.models
            .get_or_refresh(move || async move {
                let records = match self.with_conn(|conn| db::list_active_providers(conn)).await {
                    Ok(records) => records,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to read model catalog from store");
                        Vec::new()
                    }
                };
                if !records.is_empty() {
                    return Ok(records
                        .into_iter()
                        .map(|r| {
                            let display_name = if r.display_name.is_empty() {
                                format!("{} - {}", r.name, r.model_name)
                            } else {
                                r.display_name
                            };
                            ModelCatalogEntry {
                                name: r.name,
                                model: r.model_name,
                                display_name,
                            }
                        })
                        .collect());
                }
                Ok::<_, AiError>(self.registry_catalog())
            })
            .await
    }

    fn registry_catalog(&self) -> Vec<ModelCatalogEntry> {
        self.registry
            .list_names()
            .into_iter()
            .filter_map(|name| {
                let model = self.registry.resolve(&name).ok()?.model_name().to_string();
                Some(ModelCatalogEntry {
                    display_name: format!("{} - {}", name, model),
                    name,
                    model,
                })
            })
            .collect()
    }

    /**
     * \brief 启用中的角色列表，缓存 5 分钟。
     */
    pub async fn character_catalog(&self) -> Result<Arc<Vec<Character>>, AiError> {
        self.characters
            .get_or_refresh(move || self.with_conn(|conn| db::list_active_characters(conn)))
            .await
    }

    /**
     * \brief 完整的一轮聊天：校验、准备对话与角色、调用 Provider、持久化。
     */
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        input: ChatInput,
    ) -> Result<ChatOutput, AiError> {
        if input.message.trim().is_empty() {
            return Err(AiError::InvalidInput("message is empty".to_string()));
        }
        if input.message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(AiError::InvalidInput(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }

        let provider_name = input.provider.clone().unwrap_or_default();
        let provider = self.registry.resolve(provider_name.trim())?;

        let session_id = input.session_id.clone();
        let title = conversation_title(&input.message);
        let (conversation_id, character, history) = self
            .with_conn({
                let requested = input.conversation_id;
                let character_id = input.character_id;
                move |conn| prepare_turn(conn, &session_id, &title, requested, character_id)
            })
            .await??;

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(character.system_prompt.clone()));
        messages.extend(history.into_iter().map(|m| {
            let role = Role::parse(&m.role).unwrap_or(Role::Assistant);
            ChatMessage::new(role, m.content)
        }));
        messages.push(ChatMessage::user(input.message.clone()));

        let request = ChatCompletionRequest::new(messages)
            .with_temperature(DEFAULT_TEMPERATURE)
            .with_max_tokens(DEFAULT_MAX_TOKENS);
        let response = provider.chat_completion(cancel, &request).await?;
        let reply = response.first_content().unwrap_or_default().to_string();

        let usage = response.usage;
        let persisted = self
            .with_conn({
                let session_id = input.session_id.clone();
                let user_ip = input.user_ip.clone();
                let message = input.message.clone();
                let reply = reply.clone();
                let character_id = character.id;
                move |conn| {
                    db::insert_message(
                        conn,
                        &NewMessage {
                            conversation_id,
                            session_id: &session_id,
                            user_ip: &user_ip,
                            character_id,
                            role: Role::User.as_str(),
                            content: &message,
                            token_count: usage.prompt_tokens,
                        },
                    )?;
                    db::insert_message(
                        conn,
                        &NewMessage {
                            conversation_id,
                            session_id: &session_id,
                            user_ip: &user_ip,
                            character_id,
                            role: Role::Assistant.as_str(),
                            content: &reply,
                            token_count: usage.completion_tokens,
                        },
                    )?;
                    db::touch_conversation(conn, conversation_id)
                }
            })
            .await;
        if let Err(err) = persisted {
            tracing::error!(conversation_id, error = %err, "failed to persist chat messages");
        }

        Ok(ChatOutput {
            session_id: input.session_id,
            conversation_id,
            character_id: character.id,
            reply,
            provider: provider.provider_name().to_string(),
            model: response.model,
            usage,
        })
    }

    /**
     * \brief 会话的全部聊天记录。
     */
    pub async fn history(&self, session_id: &str) -> Result<Vec<StoredMessage>, AiError> {
        if session_id.trim().is_empty() {
            return Err(AiError::InvalidInput("session_id is required".to_string()));
        }
        let session_id = session_id.to_string();
        self.with_conn(move |conn| db::list_messages_by_session(conn, &session_id))
            .await
    }

    /**
     * \brief 删除会话的全部聊天记录，返回删除条数。
     */
    pub async fn clear_history(&self, session_id: &str) -> Result<usize, AiError> {
        if session_id.trim().is_empty() {
            return Err(AiError::InvalidInput("session_id is required".to_string()));
        }
        let session_id = session_id.to_string();
        let removed = self
            .with_conn(move |conn| db::delete_messages_by_session(conn, &session_id))
            .await?;
        tracing::info!(removed, "cleared chat history");
        Ok(removed)
    }

    /**
     * \brief 加密 Key 并写入 Provider 配置。写入后需调用 reload 才会生效。
     */
    pub async fn store_provider(&self, input: ProviderInput) -> Result<i64, AiError> {
        if input.api_key.trim().is_empty() {
            return Err(AiError::InvalidInput("api_key is required".to_string()));
        }
        let kind = input.kind;
        let model = input
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| kind.default_model().to_string());
        let record = NewProvider {
            name: kind.tag().to_string(),
            display_name: input
                .display_name
                .unwrap_or_else(|| format!("{} - {}", kind.tag(), model)),
            endpoint: input
                .endpoint
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| kind.default_endpoint().to_string()),
            model_name: model,
            max_tokens: input.max_tokens.unwrap_or(4000),
            temperature: input.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            api_key_encrypted: self.cipher.encrypt(input.api_key.trim())?,
            is_active: input.active,
        };
        let id = self
            .with_conn(move |conn| db::upsert_provider(conn, &record))
            .await?;
        self.models.invalidate();
        tracing::info!(provider = %kind, id, "stored provider");
        Ok(id)
    }

    /**
     * \brief 启用或停用已保存的 Provider，需 reload 后生效。
     */
    pub async fn set_provider_active(&self, name: &str, active: bool) -> Result<(), AiError> {
        let key = name.trim().to_string();
        let found = {
            let key = key.clone();
            self.with_conn(move |conn| db::set_provider_active(conn, &key, active))
                .await?
        };
        if !found {
            return Err(AiError::NotFound(key));
        }
        self.models.invalidate();
        tracing::info!(provider = %key, active, "updated provider state");
        Ok(())
    }

    /**
     * \brief 在阻塞线程池中打开数据库并执行 `op`。
     */
    async fn with_conn<T, F>(&self, op: F) -> Result<T, AiError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.settings.db_path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut conn = db::open(&path)?;
            op(&mut conn)
        })
        .await
        .map_err(|err| AiError::Store(format!("store task failed: {}", err)))?;
        joined.map_err(AiError::from)
    }
}

impl std::fmt::Debug for AiService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiService")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

type Turn = (i64, Character, Vec<StoredMessage>);

fn prepare_turn(
    conn: &Connection,
    session_id: &str,
    title: &str,
    requested: Option<i64>,
    character_id: Option<i64>,
) -> anyhow::Result<Result<Turn, AiError>> {
    let character = match character_id {
        Some(id) => db::get_character(conn, id)?.filter(|c| c.is_active),
        None => db::first_active_character(conn)?,
    };
    let Some(character) = character else {
        return Ok(Err(AiError::InvalidInput(match character_id {
            Some(id) => format!("character {} not found", id),
            None => "no active character".to_string(),
        })));
    };

    let conversation_id = match requested {
        Some(id) => match db::get_conversation(conn, id)?.filter(|c| c.session_id == session_id) {
            Some(conversation) => conversation.id,
            None => {
                return Ok(Err(AiError::InvalidInput(format!(
                    "conversation {} not found",
                    id
                ))))
            }
        },
        None => db::create_conversation(conn, session_id, title)?,
    };
    let history = db::load_history(conn, conversation_id, HISTORY_LIMIT)?;
    Ok(Ok((conversation_id, character, history)))
}

fn conversation_title(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() > TITLE_CHARS {
        let head: String = trimmed.chars().take(TITLE_CHARS).collect();
        format!("{}...", head)
    } else {
        trimmed.to_string()
    }
}
