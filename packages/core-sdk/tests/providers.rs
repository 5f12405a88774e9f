use std::time::Duration;

use folio_core_sdk::error::AiError;
use folio_core_sdk::llm::{build_provider, ProviderKind};
use folio_core_sdk::models::{ChatCompletionRequest, ChatMessage, Role};
use mockito::{Matcher, Server};
use tokio_util::sync::CancellationToken;

const OK_BODY: &str = r#"{
    "id": "chatcmpl-1",
    "object": "chat.completion",
    "created": 1700000000,
    "model": "m-1",
    "choices": [
        {"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}
    ],
    "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
}"#;

fn request() -> ChatCompletionRequest {
    ChatCompletionRequest::new(vec![
        ChatMessage::system("be brief"),
        ChatMessage::user("Hi"),
    ])
}

#[tokio::test]
async fn test_every_vendor_maps_success_and_sends_bearer_auth() {
    for kind in ProviderKind::ALL {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "m-1",
                "stream": false,
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "Hi"}
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(OK_BODY)
            .create_async()
            .await;

        let provider = build_provider(kind, &server.url(), "sk-test", "m-1", reqwest::Client::new());
        let resp = provider
            .chat_completion(&CancellationToken::new(), &request())
            .await
            .unwrap_or_else(|e| panic!("{} failed: {:?}", kind, e));

        mock.assert_async().await;
        assert_eq!(resp.object, "chat.completion");
        assert_eq!(resp.first_content(), Some("Hello!"));
        assert_eq!(resp.choices[0].message.role, Role::Assistant);
        assert_eq!(resp.choices[0].finish_reason, "stop");
        assert_eq!(resp.usage.total_tokens, 15);
    }
}

#[tokio::test]
async fn test_adapter_overrides_request_model() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(serde_json::json!({"model": "deepseek-chat"})))
        .with_status(200)
        .with_body(OK_BODY)
        .create_async()
        .await;

    let provider = build_provider(
        ProviderKind::DeepSeek,
        &format!("{}/", server.url()),
        "sk-test",
        "deepseek-chat",
        reqwest::Client::new(),
    );
    let mut req = request();
    req.model = "caller-model".to_string();
    provider
        .chat_completion(&CancellationToken::new(), &req)
        .await
        .expect("chat");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_missing_object_defaults_to_chat_completion() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(r#"{"id":"x","created":1,"model":"glm-4-flash","choices":[{"index":0,"message":{"role":"assistant","content":"你好"},"finish_reason":"sensitive"}]}"#)
        .create_async()
        .await;

    let provider = build_provider(ProviderKind::Glm, &server.url(), "k", "glm-4-flash", reqwest::Client::new());
    let resp = provider
        .chat_completion(&CancellationToken::new(), &request())
        .await
        .expect("chat");
    assert_eq!(resp.object, "chat.completion");
    assert_eq!(resp.choices[0].finish_reason, "sensitive");
    assert_eq!(resp.usage.total_tokens, 0);
}

#[tokio::test]
async fn test_null_content_and_finish_reason_accepted_by_every_vendor() {
    for kind in ProviderKind::ALL {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"id":"x","object":"chat.completion","model":"m-1","choices":[{"index":0,"message":{"role":"assistant","content":null},"finish_reason":null}],"usage":{"prompt_tokens":1,"completion_tokens":0,"total_tokens":1}}"#)
            .create_async()
            .await;

        let provider = build_provider(kind, &server.url(), "k", "m-1", reqwest::Client::new());
        let resp = provider
            .chat_completion(&CancellationToken::new(), &request())
            .await
            .unwrap_or_else(|e| panic!("{} failed: {:?}", kind, e));
        assert_eq!(resp.choices.len(), 1, "{}", kind);
        assert_eq!(resp.first_content(), Some(""), "{}", kind);
        assert_eq!(resp.choices[0].finish_reason, "", "{}", kind);
    }
}

#[tokio::test]
async fn test_error_envelope_becomes_provider_api_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body(r#"{"error":{"message":"Invalid API key","type":"invalid_request_error","code":"invalid_api_key"}}"#)
        .create_async()
        .await;

    let provider = build_provider(ProviderKind::Kimi, &server.url(), "bad", "moonshot-v1-8k", reqwest::Client::new());
    let err = provider
        .chat_completion(&CancellationToken::new(), &request())
        .await
        .expect_err("should fail");
    match err {
        AiError::ProviderApi { vendor, message } => {
            assert_eq!(vendor, "kimi");
            assert_eq!(message, "Invalid API key");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_unparseable_error_body_keeps_status() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body("<html>upstream unavailable</html>")
        .create_async()
        .await;

    let provider = build_provider(ProviderKind::Qwen, &server.url(), "k", "qwen-turbo", reqwest::Client::new());
    let err = provider
        .chat_completion(&CancellationToken::new(), &request())
        .await
        .expect_err("should fail");
    assert!(matches!(err, AiError::ProviderHttp { status: 503, .. }), "{:?}", err);
}

#[tokio::test]
async fn test_bad_success_body_is_decode_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body("not json")
        .create_async()
        .await;

    let provider = build_provider(ProviderKind::OpenAi, &server.url(), "k", "gpt-3.5-turbo", reqwest::Client::new());
    let err = provider
        .chat_completion(&CancellationToken::new(), &request())
        .await
        .expect_err("should fail");
    assert!(matches!(err, AiError::ResponseDecode(_)), "{:?}", err);
}

#[tokio::test]
async fn test_zero_choices_is_empty_choices() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(r#"{"id":"x","model":"deepseek-chat","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":0,"total_tokens":3}}"#)
        .create_async()
        .await;

    let provider = build_provider(ProviderKind::DeepSeek, &server.url(), "k", "deepseek-chat", reqwest::Client::new());
    let err = provider
        .chat_completion(&CancellationToken::new(), &request())
        .await
        .expect_err("should fail");
    assert!(matches!(err, AiError::EmptyChoices));
}

#[tokio::test]
async fn test_cancelled_token_aborts_request() {
    // Accepts the connection and never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let provider = build_provider(
        ProviderKind::DeepSeek,
        &format!("http://{}", addr),
        "k",
        "deepseek-chat",
        reqwest::Client::new(),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        provider.chat_completion(&cancel, &request()),
    )
    .await
    .expect("cancellation should end the call promptly")
    .expect_err("should fail");
    match err {
        AiError::Transport(msg) => assert_eq!(msg, "request cancelled"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_error() {
    let provider = build_provider(ProviderKind::Glm, "http://127.0.0.1:1", "k", "glm-4-flash", reqwest::Client::new());
    let err = provider
        .chat_completion(&CancellationToken::new(), &request())
        .await
        .expect_err("should fail");
    assert!(matches!(err, AiError::Transport(_)), "{:?}", err);
}
