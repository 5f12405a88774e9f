use std::sync::Arc;

use folio_core_sdk::config::{MapEnv, Settings};
use folio_core_sdk::error::AiError;
use folio_core_sdk::llm::ProviderKind;
use folio_core_sdk::service::{AiService, ChatInput, ProviderInput, MAX_MESSAGE_CHARS};
use mockito::{Matcher, Server};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const REPLY: &str = r#"{
    "id": "chatcmpl-1",
    "object": "chat.completion",
    "model": "deepseek-chat",
    "choices": [
        {"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}
    ],
    "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
}"#;

fn service(dir: &TempDir, env: MapEnv) -> AiService {
    let db_path = dir.path().join("folio.db");
    let env = env
        .with("FOLIO_DB_PATH", &db_path.to_string_lossy())
        .with("ENCRYPTION_KEY", "service-test-secret");
    let settings = Settings::from_source(&env);
    AiService::new(settings, Arc::new(env))
}

fn input(message: &str) -> ChatInput {
    ChatInput {
        session_id: "s-1".to_string(),
        message: message.to_string(),
        ..ChatInput::default()
    }
}

#[tokio::test]
async fn test_chat_round_trip_persists_history() {
    let mut server = Server::new_async().await;
    let first = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-deepseek")
        .match_body(Matcher::PartialJson(json!({
            "model": "deepseek-chat",
            "temperature": 0.7,
            "max_tokens": 2000,
            "messages": [{"role": "system"}, {"role": "user", "content": "first"}]
        })))
        .with_status(200)
        .with_body(REPLY)
        .create_async()
        .await;

    let dir = TempDir::new().expect("tempdir");
    let env = MapEnv::new()
        .with("DEEPSEEK_API_KEY", "sk-deepseek")
        .with("DEEPSEEK_API_URL", &server.url());
    let service = service(&dir, env);
    let names = service.bootstrap().await.expect("bootstrap");
    assert_eq!(names, vec!["deepseek"]);

    let out = service
        .chat(&CancellationToken::new(), input("first"))
        .await
        .expect("chat");
    first.assert_async().await;
    assert_eq!(out.reply, "Hello!");
    assert_eq!(out.provider, "deepseek");
    assert_eq!(out.model, "deepseek-chat");
    assert_eq!(out.usage.total_tokens, 15);

    let history = service.history("s-1").await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, "user");
    assert_eq!(history[0].token_count, 10);
    assert_eq!(history[1].role, "assistant");
    assert_eq!(history[1].content, "Hello!");
    assert_eq!(history[1].token_count, 5);

    first.remove_async().await;
    let second = server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({
            "messages": [
                {"role": "system"},
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "Hello!"},
                {"role": "user", "content": "second"}
            ]
        })))
        .with_status(200)
        .with_body(REPLY)
        .create_async()
        .await;
    let follow_up = ChatInput {
        conversation_id: Some(out.conversation_id),
        ..input("second")
    };
    let again = service
        .chat(&CancellationToken::new(), follow_up)
        .await
        .expect("second turn");
    second.assert_async().await;
    assert_eq!(again.conversation_id, out.conversation_id);

    assert_eq!(service.clear_history("s-1").await.expect("clear"), 4);
    assert!(service.history("s-1").await.expect("history").is_empty());
}

#[tokio::test]
async fn test_provider_failure_persists_nothing() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body(r#"{"error":{"message":"Invalid API key"}}"#)
        .create_async()
        .await;

    let dir = TempDir::new().expect("tempdir");
    let env = MapEnv::new()
        .with("DEEPSEEK_API_KEY", "sk-bad")
        .with("DEEPSEEK_API_URL", &server.url());
    let service = service(&dir, env);
    service.bootstrap().await.expect("bootstrap");

    let err = service
        .chat(&CancellationToken::new(), input("hello"))
        .await
        .expect_err("should fail");
    assert!(matches!(err, AiError::ProviderApi { .. }), "{:?}", err);
    assert!(service.history("s-1").await.expect("history").is_empty());
}

#[tokio::test]
async fn test_env_fallback_and_registry_catalog() {
    let dir = TempDir::new().expect("tempdir");
    let env = MapEnv::new().with("GLM_API_KEY", "sk-glm");
    let service = service(&dir, env);

    let names = service.bootstrap().await.expect("bootstrap");
    assert_eq!(names, vec!["glm"]);

    let models = service.model_catalog().await.expect("models");
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "glm");
    assert_eq!(models[0].model, "glm-4-flash");
    assert_eq!(models[0].display_name, "glm - glm-4-flash");
}

#[tokio::test]
async fn test_stored_provider_wins_after_reload() {
    let dir = TempDir::new().expect("tempdir");
    let env = MapEnv::new().with("GLM_API_KEY", "sk-glm");
    let service = service(&dir, env);
    service.bootstrap().await.expect("bootstrap");

    service
        .store_provider(ProviderInput {
            kind: ProviderKind::Kimi,
            api_key: "sk-kimi".to_string(),
            endpoint: None,
            model: Some("moonshot-v1-32k".to_string()),
            display_name: Some("Kimi 32k".to_string()),
            max_tokens: None,
            temperature: None,
            active: true,
        })
        .await
        .expect("store");

    let names = service.reload().await.expect("reload");
    assert_eq!(names, vec!["kimi"]);
    assert_eq!(service.registry().default_name().as_deref(), Some("kimi"));

    let models = service.model_catalog().await.expect("models");
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].display_name, "Kimi 32k");
    assert_eq!(models[0].model, "moonshot-v1-32k");
}

#[tokio::test]
async fn test_disabled_provider_drops_out_after_reload() {
    let dir = TempDir::new().expect("tempdir");
    let env = MapEnv::new().with("GLM_API_KEY", "sk-glm");
    let service = service(&dir, env);
    service.bootstrap().await.expect("bootstrap");

    for (kind, key) in [(ProviderKind::Kimi, "sk-kimi"), (ProviderKind::Qwen, "sk-qwen")] {
        service
            .store_provider(ProviderInput {
                kind,
                api_key: key.to_string(),
                endpoint: None,
                model: None,
                display_name: None,
                max_tokens: None,
                temperature: None,
                active: true,
            })
            .await
            .expect("store");
    }
    assert_eq!(service.reload().await.expect("reload"), vec!["kimi", "qwen"]);

    service.set_provider_active("kimi", false).await.expect("disable");
    assert_eq!(service.reload().await.expect("reload"), vec!["qwen"]);
    assert_eq!(service.registry().default_name().as_deref(), Some("qwen"));

    service.set_provider_active("qwen", false).await.expect("disable");
    assert_eq!(service.reload().await.expect("reload"), vec!["glm"]);

    service.set_provider_active("kimi", true).await.expect("enable");
    assert_eq!(service.reload().await.expect("reload"), vec!["kimi"]);

    let err = service
        .set_provider_active("missing", false)
        .await
        .expect_err("unknown provider");
    assert!(matches!(err, AiError::NotFound(name) if name == "missing"));
}

#[tokio::test]
async fn test_default_characters_are_seeded() {
    let dir = TempDir::new().expect("tempdir");
    let service = service(&dir, MapEnv::new());
    service.bootstrap().await.expect("bootstrap");

    let characters = service.character_catalog().await.expect("characters");
    assert_eq!(characters.len(), 2);
    assert!(characters.iter().all(|c| c.is_active && !c.system_prompt.is_empty()));
}

#[tokio::test]
async fn test_chat_rejects_bad_input_before_calling_out() {
    let dir = TempDir::new().expect("tempdir");
    let service = service(&dir, MapEnv::new().with("QWEN_API_KEY", "sk-qwen"));
    service.bootstrap().await.expect("bootstrap");
    let cancel = CancellationToken::new();

    let too_long = "a".repeat(MAX_MESSAGE_CHARS + 1);
    let err = service.chat(&cancel, input(&too_long)).await.expect_err("too long");
    assert!(matches!(err, AiError::InvalidInput(_)));

    let err = service.chat(&cancel, input("   ")).await.expect_err("empty");
    assert!(matches!(err, AiError::InvalidInput(_)));

    let unknown_provider = ChatInput {
        provider: Some("openai".to_string()),
        ..input("hi")
    };
    let err = service
        .chat(&cancel, unknown_provider)
        .await
        .expect_err("unknown provider");
    assert!(matches!(err, AiError::NotFound(ref n) if n == "openai"));

    let unknown_character = ChatInput {
        character_id: Some(999),
        ..input("hi")
    };
    let err = service
        .chat(&cancel, unknown_character)
        .await
        .expect_err("unknown character");
    assert!(matches!(err, AiError::InvalidInput(_)));

    let unknown_conversation = ChatInput {
        conversation_id: Some(999),
        ..input("hi")
    };
    let err = service
        .chat(&cancel, unknown_conversation)
        .await
        .expect_err("unknown conversation");
    assert!(matches!(err, AiError::InvalidInput(_)));
}

#[tokio::test]
async fn test_chat_without_providers_is_configuration_error() {
    let dir = TempDir::new().expect("tempdir");
    let service = service(&dir, MapEnv::new());
    assert!(service.bootstrap().await.expect("bootstrap").is_empty());

    let err = service
        .chat(&CancellationToken::new(), input("hi"))
        .await
        .expect_err("no providers");
    assert!(matches!(err, AiError::NoProvidersConfigured));
    assert!(service.history("").await.is_err());
}
