use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AiError;
use crate::models::{ChatCompletionRequest, ChatCompletionResponse};

mod compat;
mod glm;
mod http;
mod openai;

pub use compat::CompatProvider;
pub use glm::GlmProvider;
pub use http::{HttpTransport, REQUEST_TIMEOUT};
pub use openai::OpenAiProvider;

/**
 * \brief 所有厂商适配器共享的能力：厂商无关请求进，厂商无关响应出。
 */
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /**
     * \brief 执行一次非流式聊天补全。
     * \param cancel 取消令牌，触发后中止进行中的 HTTP 请求
     */
    async fn chat_completion(
        &self,
        cancel: &CancellationToken,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, AiError>;

    /** \brief 当前使用的模型名。 */
    fn model_name(&self) -> &str;

    /** \brief 固定的厂商标识，如 glm、deepseek。 */
    fn provider_name(&self) -> &'static str;
}

/**
 * \brief 支持的厂商集合。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Glm,
    DeepSeek,
    Qwen,
    Kimi,
    OpenAi,
}

impl ProviderKind {
    /** \brief 环境变量回退加载时的固定顺序。 */
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Glm,
        ProviderKind::DeepSeek,
        ProviderKind::Qwen,
        ProviderKind::Kimi,
        ProviderKind::OpenAi,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            ProviderKind::Glm => "glm",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Qwen => "qwen",
            ProviderKind::Kimi => "kimi",
            ProviderKind::OpenAi => "openai",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "glm" => Some(ProviderKind::Glm),
            "deepseek" => Some(ProviderKind::DeepSeek),
            "qwen" => Some(ProviderKind::Qwen),
            "kimi" => Some(ProviderKind::Kimi),
            "openai" => Some(ProviderKind::OpenAi),
            _ => None,
        }
    }

    pub fn env_prefix(&self) -> &'static str {
        match self {
            ProviderKind::Glm => "GLM",
            ProviderKind::DeepSeek => "DEEPSEEK",
            ProviderKind::Qwen => "QWEN",
            ProviderKind::Kimi => "KIMI",
            ProviderKind::OpenAi => "OPENAI",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderKind::Glm => "https://open.bigmodel.cn/api/paas/v4",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Qwen => "https://dashscope.aliyuncs.com/compatible-mode/v1",
            ProviderKind::Kimi => "https://api.moonshot.cn/v1",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Glm => "glm-4-flash",
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Qwen => "qwen-turbo",
            ProviderKind::Kimi => "moonshot-v1-8k",
            ProviderKind::OpenAi => "gpt-3.5-turbo",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/**
 * \brief 按厂商类型构造适配器实例。
 * \param api_key 已解密的明文 Key，不做格式校验
 */
pub fn build_provider(
    kind: ProviderKind,
    endpoint: &str,
    api_key: &str,
    model: &str,
    client: reqwest::Client,
) -> Arc<dyn ChatProvider> {
    let transport = HttpTransport::bearer(client, endpoint, api_key);
    match kind {
        ProviderKind::Glm => Arc::new(GlmProvider::with_transport(transport, model)),
        ProviderKind::DeepSeek | ProviderKind::Qwen | ProviderKind::Kimi => {
            Arc::new(CompatProvider::with_transport(kind, transport, model))
        }
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::with_transport(transport, model)),
    }
}

/**
 * \brief 校验并记录成功响应；没有候选回复视为失败。
 */
fn finish(
    vendor: &'static str,
    response: ChatCompletionResponse,
) -> Result<ChatCompletionResponse, AiError> {
    if response.choices.is_empty() {
        tracing::warn!(vendor, model = %response.model, "response carried no choices");
        return Err(AiError::EmptyChoices);
    }
    tracing::info!(
        vendor,
        model = %response.model,
        total_tokens = response.usage.total_tokens,
        "chat completion succeeded"
    );
    Ok(response)
}
