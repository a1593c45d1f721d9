//! Ledger blocks and proof-of-work mining.
//!
//! Block hash:
//!
//!   hash = SHA256_hex(canonical_json({index, nonce, payload, previous_hash, timestamp}))
//!
//! Canonical JSON is compact with object keys in lexicographic order, so
//! the hash is independent of struct field order. Mining increments `nonce`
//! from 0 until the hash starts with `difficulty` '0' characters.

use chatseal_crypto::hash::sha256_hex;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::message::{MediaType, MessageRecord};

/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Upper bound for the configurable difficulty. Each step multiplies the
/// expected mining work by 16.
pub const MAX_DIFFICULTY: usize = 8;

/// Nonces tried between deadline checks.
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Genesis,
    Message,
}

/// One message's integrity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub message_id: String,
    pub sender_id: String,
    pub content_hash: String,
    pub is_encrypted: bool,
    #[serde(default)]
    pub has_signature: bool,
    #[serde(default)]
    pub media_type: MediaType,
    /// Unix seconds.
    pub timestamp: f64,
}

impl LedgerEntry {
    pub fn from_record(record: &MessageRecord, timestamp: f64) -> Self {
        Self {
            message_id: record.message_id.clone(),
            sender_id: record.sender_id.clone(),
            content_hash: record.content.content_hash(),
            is_encrypted: record.is_encrypted,
            has_signature: record.has_signature,
            media_type: record.media_type,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub block_type: BlockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub entries: Vec<LedgerEntry>,
}

impl BlockPayload {
    pub fn genesis() -> Self {
        Self {
            block_type: BlockType::Genesis,
            conversation_id: None,
            entries: Vec::new(),
        }
    }

    pub fn messages(conversation_id: impl Into<String>, entries: Vec<LedgerEntry>) -> Self {
        Self {
            block_type: BlockType::Message,
            conversation_id: Some(conversation_id.into()),
            entries,
        }
    }
}

/// A block exactly as stored in the ledger log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    /// Unix seconds.
    pub timestamp: f64,
    pub payload: BlockPayload,
    pub previous_hash: String,
    pub nonce: u64,
    pub hash: String,
}

/// Mining gave up before finding a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiningTimedOut {
    pub attempts: u64,
}

impl Block {
    /// The fixed first block. Every field is constant, so every fresh
    /// ledger starts from the same genesis hash.
    pub fn genesis() -> Self {
        let mut block = Self {
            index: 0,
            timestamp: 0.0,
            payload: BlockPayload::genesis(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Unmined successor candidate; call [`Block::mine`] before appending.
    pub fn candidate(index: u64, timestamp: f64, payload: BlockPayload, previous_hash: String) -> Self {
        let mut block = Self {
            index,
            timestamp,
            payload,
            previous_hash,
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.payload.conversation_id.as_deref()
    }

    pub fn calculate_hash(&self) -> String {
        HashInput::new(self).hash_with_nonce(self.nonce)
    }

    pub fn has_valid_hash(&self) -> bool {
        chatseal_crypto::hash::constant_time_eq(self.calculate_hash().as_bytes(), self.hash.as_bytes())
    }

    /// Proof of work: search nonces from 0 upward until the hash meets
    /// `difficulty`. With a deadline, gives up once it has passed and leaves
    /// the block unmined.
    pub fn mine(&mut self, difficulty: usize, deadline: Option<Instant>) -> Result<u64, MiningTimedOut> {
        let input = HashInput::new(self);
        let mut nonce = 0u64;
        loop {
            let hash = input.hash_with_nonce(nonce);
            if meets_difficulty(&hash, difficulty) {
                self.nonce = nonce;
                self.hash = hash;
                return Ok(nonce + 1);
            }
            nonce += 1;
            if let Some(deadline) = deadline {
                if nonce % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                    return Err(MiningTimedOut { attempts: nonce });
                }
            }
        }
    }
}

/// Whether `hash` starts with `difficulty` '0' characters.
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Pre-serialized canonical form with a slot for the nonce. Keys in sorted
/// order: index, nonce, payload, previous_hash, timestamp.
struct HashInput {
    prefix: String,
    suffix: String,
}

impl HashInput {
    fn new(block: &Block) -> Self {
        let payload = serde_json::json!(block.payload).to_string();
        let previous_hash = serde_json::Value::String(block.previous_hash.clone()).to_string();
        let timestamp = serde_json::json!(block.timestamp).to_string();
        Self {
            prefix: format!("{{\"index\":{},\"nonce\":", block.index),
            suffix: format!(",\"payload\":{payload},\"previous_hash\":{previous_hash},\"timestamp\":{timestamp}}}"),
        }
    }

    fn hash_with_nonce(&self, nonce: u64) -> String {
        let mut buf = String::with_capacity(self.prefix.len() + self.suffix.len() + 20);
        buf.push_str(&self.prefix);
        buf.push_str(&nonce.to_string());
        buf.push_str(&self.suffix);
        sha256_hex(buf.as_bytes())
    }
}
