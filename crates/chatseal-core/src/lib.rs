//! chatseal-core: conversation E2E fan-out and the message integrity ledger
//!
//! # Module layout
//! - `keystore`  per-owner signing/encryption key registry (public halves only)
//! - `fanout`    per-recipient envelope sealing, sender signature, envelope opening
//! - `message`   message identity handed over by the messaging layer
//! - `ledger`    proof-of-work hash chain of message content hashes
//! - `auditor`   content-hash cross-checks against the ledger
//! - `settings`  tunables loaded from `settings.json`
//! - `encoding`  serde helpers for binary fields
//! - `paths`     data directory resolution
//! - `error`     unified error type

pub mod auditor;
pub mod encoding;
pub mod error;
pub mod fanout;
pub mod keystore;
pub mod ledger;
pub mod message;
pub mod paths;
pub mod settings;

pub use auditor::{AuditReport, IntegrityAuditor, IntegrityCheck, MessageAudit, MessageStatus};
pub use error::{ChatSealError, Result};
pub use fanout::{
    EncryptedEnvelope, FanoutEncryptor, FanoutResult, MessageSignature, MessageView, SignatureStatus,
    UNREADABLE_PLACEHOLDER,
};
pub use keystore::{GeneratedKeyPair, Identity, KeyRecord, KeyStore};
pub use ledger::{
    verify_blocks, AppendReceipt, Block, ChainVerification, ConversationStats, IntegrityLedger, LedgerConfig,
    LedgerEntry, LocatedEntry,
};
pub use message::{AuditSubject, MessageContent, MessageRecord};
pub use settings::ChatSealSettings;
