use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::http::{decode, CompatRequest, HttpTransport, WireChoice};
use super::{finish, ChatProvider};
use crate::error::AiError;
use crate::models::{completion_object, ChatCompletionRequest, ChatCompletionResponse, ChatUsage};

const VENDOR: &str = "glm";

/**
 * \brief 智谱 GLM 适配器。
 */
#[derive(Debug, Clone)]
pub struct GlmProvider {
    transport: HttpTransport,
    model: String,
}

/**
 * \brief GLM 响应不带 object 字段。
 */
#[derive(Debug, Deserialize)]
struct GlmResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

impl GlmProvider {
    pub fn with_transport(transport: HttpTransport, model: &str) -> Self {
        Self {
            transport,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ChatProvider for GlmProvider {
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
        let text = self.transport.post_chat(VENDOR, cancel, &body).await?;
        let resp: GlmResponse = decode(VENDOR, &text)?;
        finish(
            VENDOR,
            ChatCompletionResponse {
                id: resp.id,
                object: completion_object(),
                model: resp.model,
                choices: resp.choices.into_iter().map(Into::into).collect(),
                usage: resp.usage,
            },
        )
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &'static str {
        VENDOR
    }
}
