use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::AiError;
use crate::service::{AiService, ChatInput, ChatOutput};

/** \brief 对外展示的统一错误文案，内部细节只进日志。 */
pub const GENERIC_ERROR: &str = "AI服务暂时不可用，请稍后重试";

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;

/**
 * \brief 构建 HTTP 路由，AI 接口挂载在 `/api/v1/ai` 下。
 * \details 聊天接口读取对端地址，需以 `into_make_service_with_connect_info::<SocketAddr>()` 方式提供服务。
 */
pub fn router(service: Arc<AiService>) -> Router {
    let ai = Router::new()
        .route("/models", get(list_models))
        .route("/characters", get(list_characters))
        .route("/chat", post(chat))
        .route("/history", get(get_history).delete(clear_history))
        .route("/reload", post(reload));

    Router::new()
        .route("/api/health", get(health_check))
        .nest("/api/v1/ai", ai)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/**
 * \brief 启动 HTTP 服务，`shutdown` 触发后优雅退出。
 * \param addr 监听地址，如 "127.0.0.1:8080"
 */
pub async fn run(addr: &str, service: Arc<AiService>, shutdown: CancellationToken) -> Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

/**
 * \brief 将内部错误映射为状态码与通用文案。
 */
fn api_err(err: AiError) -> (StatusCode, Json<Value>) {
    let (status, message) = match &err {
        AiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        e if e.is_configuration() => (StatusCode::SERVICE_UNAVAILABLE, GENERIC_ERROR.to_string()),
        AiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR.to_string()),
        _ => (StatusCode::BAD_GATEWAY, GENERIC_ERROR.to_string()),
    };
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), error = %err, "request failed");
    } else {
        tracing::info!(error = %err, "rejected request");
    }
    (status, Json(json!({ "error": message })))
}

async fn health_check(State(service): State<Arc<AiService>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "providers": service.registry().len(),
    }))
}

async fn list_models(State(service): State<Arc<AiService>>) -> ApiResult<Value> {
    let models = service.model_catalog().await.map_err(api_err)?;
    Ok(Json(json!({ "models": models.as_ref() })))
}

async fn list_characters(State(service): State<Arc<AiService>>) -> ApiResult<Value> {
    let characters = service.character_catalog().await.map_err(api_err)?;
    Ok(Json(json!({ "characters": characters.as_ref() })))
}

/**
 * \brief 处理一轮聊天。客户端断开时请求 future 被丢弃，drop guard 随之取消上游调用。
 */
async fn chat(
    State(service): State<Arc<AiService>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut input): Json<ChatInput>,
) -> ApiResult<ChatOutput> {
    input.user_ip = client_ip(&headers, peer);
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let output = service.chat(&cancel, input).await.map_err(api_err)?;
    Ok(Json(output))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(default)]
    session_id: String,
}

async fn get_history(
    State(service): State<Arc<AiService>>,
    Query(q): Query<SessionQuery>,
) -> ApiResult<Value> {
    let messages = service.history(&q.session_id).await.map_err(api_err)?;
    Ok(Json(json!({ "messages": messages })))
}

async fn clear_history(
    State(service): State<Arc<AiService>>,
    Query(q): Query<SessionQuery>,
) -> ApiResult<Value> {
    let removed = service.clear_history(&q.session_id).await.map_err(api_err)?;
    Ok(Json(json!({ "message": "聊天历史已清空", "removed": removed })))
}

async fn reload(State(service): State<Arc<AiService>>) -> ApiResult<Value> {
    let providers = service.reload().await.map_err(api_err)?;
    Ok(Json(json!({
        "message": "Provider配置已重新加载",
        "providers": providers,
    })))
}

/**
 * \brief 客户端地址：优先反向代理头，否则取 TCP 对端地址。
 */
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_err_status_mapping() {
        assert_eq!(api_err(AiError::NoProvidersConfigured).0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api_err(AiError::NotFound("x".into())).0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api_err(AiError::EmptyChoices).0, StatusCode::BAD_GATEWAY);
        assert_eq!(
            api_err(AiError::Transport("request timed out".into())).0,
            StatusCode::BAD_GATEWAY
        );
        let (status, Json(body)) = api_err(AiError::InvalidInput("message is empty".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "message is empty");
    }

    #[test]
    fn test_api_err_hides_provider_details() {
        let (_, Json(body)) = api_err(AiError::ProviderApi {
            vendor: "glm".into(),
            message: "Invalid API key sk-123".into(),
        });
        assert_eq!(body["error"], GENERIC_ERROR);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let peer: SocketAddr = "192.168.1.7:50123".parse().expect("addr");
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "192.168.1.7");
        headers.insert("x-real-ip", "10.0.0.2".parse().expect("header"));
        assert_eq!(client_ip(&headers, peer), "10.0.0.2");
        headers.insert("x-forwarded-for", "1.2.3.4, 10.0.0.1".parse().expect("header"));
        assert_eq!(client_ip(&headers, peer), "1.2.3.4");
    }

    #[test]
    fn test_client_ip_ignores_blank_forwarded_header() {
        let peer: SocketAddr = "127.0.0.1:8080".parse().expect("addr");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", " ".parse().expect("header"));
        assert_eq!(client_ip(&headers, peer), "127.0.0.1");
    }
}
