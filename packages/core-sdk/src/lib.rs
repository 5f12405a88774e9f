pub mod cache;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod registry;
pub mod server;
pub mod service;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块与类型。
 */
pub mod prelude {
    pub use crate::config::{EnvSource, MapEnv, ProcessEnv, Settings};
    pub use crate::crypto::Cipher;
    pub use crate::error::{AiError, CryptoError};
    pub use crate::llm::{ChatProvider, ProviderKind};
    pub use crate::models::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage};
    pub use crate::registry::ProviderRegistry;
    pub use crate::service::{AiService, ChatInput, ChatOutput, ProviderInput};
    pub use crate::{db, llm, models, server, telemetry};
}
