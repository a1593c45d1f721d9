//! Error types for chatseal-core

use chatseal_crypto::{CryptoError, KeyType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatSealError {
    #[error("No active {key_type} key for owner {owner_id}")]
    KeyNotFound { owner_id: String, key_type: KeyType },

    #[error("Unknown key id: {0}")]
    UnknownKeyId(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Opaque; see `CryptoError::Decrypt`.
    #[error("Message could not be decrypted")]
    Decrypt,

    #[error("Ledger log failed validation: {0}")]
    ChainCorruption(String),

    #[error("Block rejected at chain head: {0}")]
    AppendRejected(String),

    #[error("Mining exceeded {timeout_ms} ms at difficulty {difficulty}")]
    MiningTimeout { difficulty: usize, timeout_ms: u128 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatSealError>;
