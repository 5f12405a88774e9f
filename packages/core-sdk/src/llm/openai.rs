use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::http::{decode, CompatResponse, HttpTransport};
use super::{finish, ChatProvider};
use crate::error::AiError;
use crate::models::{ChatCompletionRequest, ChatCompletionResponse};

const VENDOR: &str = "openai";

/**
 * \brief OpenAI 适配器。
 * \details 请求即统一格式本身，只覆盖 model 字段；响应里 content、finish_reason 可能为 null。
 */
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    transport: HttpTransport,
    model: String,
}

impl OpenAiProvider {
    pub fn with_transport(transport: HttpTransport, model: &str) -> Self {
        Self {
            transport,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn chat_completion(
        &self,
        cancel: &CancellationToken,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, AiError> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            stream: false,
            ..request.clone()
        };
        let text = self.transport.post_chat(VENDOR, cancel, &body).await?;
        let resp: CompatResponse = decode(VENDOR, &text)?;
        finish(VENDOR, resp.into())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &'static str {
        VENDOR
    }
}
