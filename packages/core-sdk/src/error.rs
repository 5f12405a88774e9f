use thiserror::Error;

/**
 * \brief 凭据加解密错误。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("encryption key must be 32 bytes")]
    InvalidKeyLength,
    #[error("ciphertext is not valid base64")]
    InvalidEncoding,
    #[error("ciphertext is shorter than the nonce")]
    InvalidCiphertext,
    #[error("ciphertext failed authentication")]
    AuthenticationFailure,
    #[error("decrypted payload is not valid utf-8")]
    InvalidUtf8,
    #[error("encryption failed")]
    EncryptionFailure,
}

/**
 * \brief AI 子系统统一错误类型。
 * \details Provider 适配器、注册表与编排层都只返回该类型，从不 panic。
 */
#[derive(Debug, Error)]
pub enum AiError {
    #[error("no AI provider configured")]
    NoProvidersConfigured,
    #[error("provider {0} not found")]
    NotFound(String),
    #[error("{vendor} API error: {message}")]
    ProviderApi { vendor: String, message: String },
    #[error("provider returned HTTP {status}: {body}")]
    ProviderHttp { status: u16, body: String },
    #[error("failed to decode provider response: {0}")]
    ResponseDecode(String),
    #[error("provider returned no choices")]
    EmptyChoices,
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("store error: {0}")]
    Store(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl AiError {
    /**
     * \brief 是否属于配置类错误（无可用 Provider 或名称不存在）。
     */
    pub fn is_configuration(&self) -> bool {
        matches!(self, AiError::NoProvidersConfigured | AiError::NotFound(_))
    }
}

impl From<anyhow::Error> for AiError {
    fn from(err: anyhow::Error) -> Self {
        AiError::Store(format!("{:#}", err))
    }
}

impl From<rusqlite::Error> for AiError {
    fn from(err: rusqlite::Error) -> Self {
        AiError::Store(err.to_string())
    }
}
