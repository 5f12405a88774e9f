use serde::{Deserialize, Serialize};

/** \brief 默认采样温度。 */
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/** \brief 默认最大生成 token 数。 */
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

/**
 * \brief 消息角色，序列化为小写字符串。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /**
     * \brief 从存储中的字符串还原角色，未知值返回 None。
     */
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/**
 * \brief 厂商无关的聊天请求。
 * \details `model` 在分发时由适配器覆盖；`stream` 恒为 false。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
}

impl ChatCompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            model: String::new(),
            messages,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            stream: false,
        }
    }

    /**
     * \brief 设置温度，超出 [0,2] 时截断。
     */
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = if temperature.is_nan() {
            DEFAULT_TEMPERATURE
        } else {
            temperature.clamp(0.0, 2.0)
        };
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }
}

/**
 * \brief 统一的聊天响应。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "completion_object")]
    pub object: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: ChatUsage,
}

impl ChatCompletionResponse {
    /**
     * \brief 第一个候选回复的正文。
     */
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

pub(crate) fn completion_object() -> String {
    "chat.completion".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    /** \brief 厂商原样返回的结束原因，如 stop/length/content_filter。 */
    #[serde(default)]
    pub finish_reason: String,
}

/**
 * \brief Token 用量，按厂商上报原样透传，不重新计算 total。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/**
 * \brief 持久化的 Provider 配置行。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: i64,
    /** \brief 厂商标识，如 deepseek，唯一 */
    pub name: String,
    pub display_name: String,
    /** \brief API 基地址 */
    pub endpoint: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /** \brief 加密后的 API Key，不对外序列化 */
    #[serde(skip_serializing, default)]
    pub api_key_encrypted: String,
    pub is_active: bool,
}

/**
 * \brief AI 角色。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub avatar: String,
    pub personality_tags: Vec<String>,
    pub greeting_message: String,
    pub is_active: bool,
}

/**
 * \brief 模型目录条目。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub name: String,
    pub model: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub session_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief 带主键的聊天记录。
 */
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub session_id: String,
    pub user_ip: String,
    pub character_id: i64,
    pub role: String,
    pub content: String,
    pub token_count: u32,
    pub created_at: String,
}
