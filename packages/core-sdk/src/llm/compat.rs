use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::http::{decode, CompatRequest, CompatResponse, HttpTransport};
use super::{finish, ChatProvider, ProviderKind};
use crate::error::AiError;
use crate::models::{ChatCompletionRequest, ChatCompletionResponse};

/**
 * \brief OpenAI 兼容格式厂商的通用适配器：DeepSeek、通义千问（DashScope 兼容模式）、Moonshot Kimi。
 * \details 三家的请求体与响应体一致，差异只在错误信封里 type/code 是否出现，由传输层统一处理。
 */
#[derive(Debug, Clone)]
pub struct CompatProvider {
    vendor: &'static str,
    transport: HttpTransport,
    model: String,
}

impl CompatProvider {
    pub fn with_transport(kind: ProviderKind, transport: HttpTransport, model: &str) -> Self {
        Self {
            vendor: kind.tag(),
            transport,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ChatProvider for CompatProvider {
    async fn chat_completion(
        &self,
        cancel: &CancellationToken,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, AiError> {
        let body = CompatRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };
        let text = self.transport.post_chat(self.vendor, cancel, &body).await?;
        let resp: CompatResponse = decode(self.vendor, &text)?;
        finish(self.vendor, resp.into())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &'static str {
        self.vendor
    }
}
