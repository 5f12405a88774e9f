use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::{config::Settings, error::CryptoError};

/** \brief AES-256 密钥长度。 */
pub const KEY_LEN: usize = 32;
/** \brief GCM nonce 长度。 */
pub const NONCE_LEN: usize = 12;
/**
 * \brief 未配置 ENCRYPTION_KEY 时使用的开发密钥，生产环境必须覆盖。
 */
pub const DEV_SECRET: &str = "personal-website-default-key!!";

const ENCRYPTED_MIN_LEN: usize = 20;

/**
 * \brief API Key 的对称加解密器。
 * \details 密钥由配置的秘密串补零或截断到 32 字节得到，输出为 base64(nonce || 密文)。
 */
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LEN],
}

impl Cipher {
    pub fn new(secret: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        let bytes = secret.as_bytes();
        let n = bytes.len().min(KEY_LEN);
        key[..n].copy_from_slice(&bytes[..n]);
        Self { key }
    }

    /**
     * \brief 按配置构造；未设置秘密串时回退到开发密钥并告警。
     */
    pub fn from_settings(settings: &Settings) -> Self {
        match settings.encryption_key.as_deref() {
            Some(secret) if !secret.is_empty() => Self::new(secret),
            _ => {
                tracing::warn!("ENCRYPTION_KEY not set, using insecure development key");
                Self::new(DEV_SECRET)
            }
        }
    }

    fn aead(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKeyLength)
    }

    /**
     * \brief 加密明文；空串原样返回空串。
     */
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let aead = self.aead()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /**
     * \brief 解密 `encrypt` 的输出；空串原样返回空串。
     */
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        let data = STANDARD
            .decode(ciphertext)
            .map_err(|_| CryptoError::InvalidEncoding)?;
        if data.len() < NONCE_LEN {
            return Err(CryptoError::InvalidCiphertext);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let aead = self.aead()?;
        let plain = aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::AuthenticationFailure)?;
        String::from_utf8(plain).map_err(|_| CryptoError::InvalidUtf8)
    }

    /**
     * \brief 解密存储值，失败时视为旧版明文并记录告警。
     */
    pub fn decrypt_or_plaintext(&self, stored: &str) -> String {
        match self.decrypt(stored) {
            Ok(plain) => plain,
            Err(err) => {
                tracing::warn!(error = %err, "stored api key did not decrypt, treating as plaintext");
                stored.to_string()
            }
        }
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

/**
 * \brief 粗略判断字符串是否像已加密的值。
 * \details 仅检查 base64 可解码且长度超过 20，不是密码学判断，只用于迁移旧明文。
 */
pub fn is_probably_encrypted(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    STANDARD.decode(s).is_ok() && s.len() > ENCRYPTED_MIN_LEN
}
