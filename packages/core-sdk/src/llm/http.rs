use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AiError;
use crate::models::{
    completion_object, ChatChoice, ChatCompletionResponse, ChatMessage, ChatUsage, Role,
};

/** \brief 单次厂商调用的固定超时。 */
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const EXCERPT_CHARS: usize = 200;

/**
 * \brief OpenAI 兼容厂商共享的 HTTP 传输层。
 */
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    /**
     * \brief 使用 Bearer 鉴权构造。Key 在调用时才写入请求头，非法 Key 表现为调用失败。
     */
    pub fn bearer(client: Client, endpoint: &str, api_key: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /**
     * \brief POST `{endpoint}/chat/completions`，返回 2xx 响应体原文。
     * \details 请求与取消令牌竞争，取消时丢弃进行中的请求以释放连接。
     */
    pub async fn post_chat<B>(
        &self,
        vendor: &'static str,
        cancel: &CancellationToken,
        body: &B,
    ) -> Result<String, AiError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}/chat/completions", self.endpoint);
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .timeout(REQUEST_TIMEOUT)
            .json(body);

        let exchange = async move {
            let resp = request.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let (status, text) = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::warn!(vendor, "request cancelled by caller");
                return Err(AiError::Transport("request cancelled".to_string()));
            }
            result = exchange => result.map_err(|err| {
                let reason = if err.is_timeout() { "request timed out" } else { "request failed" };
                tracing::warn!(vendor, error = %err, "{}", reason);
                AiError::Transport(format!("{}: {}", reason, err))
            })?,
        };

        if !status.is_success() {
            return Err(error_from_body(vendor, status.as_u16(), &text));
        }
        Ok(text)
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/**
 * \brief OpenAI 兼容厂商的请求体。
 */
#[derive(Debug, Serialize)]
pub(crate) struct CompatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

/**
 * \brief 厂商返回的单个候选，finish_reason 可能为 null。
 */
#[derive(Debug, Deserialize)]
pub(crate) struct WireChoice {
    #[serde(default)]
    pub index: u32,
    pub message: WireMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl From<WireChoice> for ChatChoice {
    fn from(choice: WireChoice) -> Self {
        let role = Role::parse(&choice.message.role).unwrap_or(Role::Assistant);
        ChatChoice {
            index: choice.index,
            message: ChatMessage::new(role, choice.message.content.unwrap_or_default()),
            finish_reason: choice.finish_reason.unwrap_or_default(),
        }
    }
}

/**
 * \brief OpenAI 兼容厂商的响应体，object 缺省时补为 chat.completion。
 */
#[derive(Debug, Deserialize)]
pub(crate) struct CompatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<WireChoice>,
    #[serde(default)]
    pub usage: ChatUsage,
}

impl From<CompatResponse> for ChatCompletionResponse {
    fn from(resp: CompatResponse) -> Self {
        ChatCompletionResponse {
            id: resp.id,
            object: resp
                .object
                .filter(|o| !o.is_empty())
                .unwrap_or_else(completion_object),
            model: resp.model,
            choices: resp.choices.into_iter().map(Into::into).collect(),
            usage: resp.usage,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

fn error_from_body(vendor: &'static str, status: u16, body: &str) -> AiError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|env| env.error);
    if let Some(err) = parsed {
        if let Some(message) = err.message.filter(|m| !m.is_empty()) {
            tracing::warn!(
                vendor,
                status,
                kind = err.kind.as_deref().unwrap_or(""),
                code = %err.code.unwrap_or(serde_json::Value::Null),
                "provider API error: {}",
                message
            );
            return AiError::ProviderApi {
                vendor: vendor.to_string(),
                message,
            };
        }
    }
    let excerpt = excerpt(body);
    tracing::warn!(vendor, status, body = %excerpt, "provider HTTP error");
    AiError::ProviderHttp {
        status,
        body: excerpt,
    }
}

/**
 * \brief 解析 2xx 响应体，失败时记录片段。
 */
pub(crate) fn decode<T: DeserializeOwned>(vendor: &'static str, body: &str) -> Result<T, AiError> {
    serde_json::from_str(body).map_err(|err| {
        tracing::warn!(vendor, error = %err, body = %excerpt(body), "failed to decode response");
        AiError::ResponseDecode(err.to_string())
    })
}

fn excerpt(body: &str) -> String {
    body.chars().take(EXCERPT_CHARS).collect()
}
