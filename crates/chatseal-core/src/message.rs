//! Message identity as handed over by the messaging layer.
//!
//! The core never owns messages; it only needs stable ids and the bytes
//! whose hash the ledger commits to.

use chatseal_crypto::hash::content_hash;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    None,
    Image,
    Video,
}

/// Canonical representation a content hash is computed over: the decrypted
/// plaintext when the caller has it, otherwise the stored ciphertext reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageContent {
    Plaintext(String),
    CiphertextRef(String),
}

impl MessageContent {
    pub fn canonical_bytes(&self) -> &[u8] {
        match self {
            MessageContent::Plaintext(text) => text.as_bytes(),
            MessageContent::CiphertextRef(reference) => reference.as_bytes(),
        }
    }

    pub fn content_hash(&self) -> String {
        content_hash(self.canonical_bytes())
    }
}

/// Everything the ledger records about one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: MessageContent,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub has_signature: bool,
    #[serde(default)]
    pub media_type: MediaType,
}

/// What the auditor needs to re-check one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSubject {
    pub message_id: String,
    #[serde(flatten)]
    pub content: MessageContent,
}

impl AuditSubject {
    pub fn plaintext(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            content: MessageContent::Plaintext(text.into()),
        }
    }
}

impl From<&MessageRecord> for AuditSubject {
    fn from(record: &MessageRecord) -> Self {
        Self {
            message_id: record.message_id.clone(),
            content: record.content.clone(),
        }
    }
}
