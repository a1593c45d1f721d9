use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// No detail: malformed input, wrong key and tag mismatch look the same.
    #[error("Decryption failed")]
    Decrypt,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Key encoding error: {0}")]
    Encoding(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
