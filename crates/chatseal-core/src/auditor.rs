//! Integrity auditing: recompute a message's content hash and compare it
//! with what the ledger recorded.

use std::sync::Arc;

use chatseal_crypto::hash::constant_time_eq;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::{ChainVerification, IntegrityLedger};
use crate::message::AuditSubject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Recorded, and the content still hashes to the recorded value.
    Verified,
    /// Recorded, but the content or its block has changed since.
    Mismatched,
    /// Never recorded.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAudit {
    pub message_id: String,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_index: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub conversation_id: String,
    pub total: usize,
    pub verified: usize,
    pub mismatched: usize,
    pub missing: usize,
    pub details: Vec<MessageAudit>,
}

impl AuditReport {
    fn tally(&mut self, audit: MessageAudit) {
        self.total += 1;
        match audit.status {
            MessageStatus::Verified => self.verified += 1,
            MessageStatus::Mismatched => self.mismatched += 1,
            MessageStatus::Missing => self.missing += 1,
        }
        self.details.push(audit);
    }

    /// Every message verified.
    pub fn is_clean(&self) -> bool {
        self.verified == self.total
    }
}

/// Result of a routine check: the whole chain plus a random message sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub chain_valid: bool,
    pub chain: ChainVerification,
    pub sampled: usize,
    pub verified: usize,
    pub mismatched: usize,
    pub missing: usize,
    /// Sampled messages that did not verify.
    pub problems: Vec<MessageAudit>,
}

pub struct IntegrityAuditor {
    ledger: Arc<IntegrityLedger>,
}

impl IntegrityAuditor {
    pub fn new(ledger: Arc<IntegrityLedger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<IntegrityLedger> {
        &self.ledger
    }

    pub fn verify_message(&self, message: &AuditSubject) -> bool {
        self.check_message(message) == MessageStatus::Verified
    }

    pub fn check_message(&self, message: &AuditSubject) -> MessageStatus {
        self.audit_message(message).status
    }

    pub fn audit_message(&self, message: &AuditSubject) -> MessageAudit {
        let Some(located) = self.ledger.find_entry(&message.message_id) else {
            return MessageAudit {
                message_id: message.message_id.clone(),
                status: MessageStatus::Missing,
                block_index: None,
            };
        };
        let current = message.content.content_hash();
        let status = if located.block_intact
            && constant_time_eq(current.as_bytes(), located.entry.content_hash.as_bytes())
        {
            MessageStatus::Verified
        } else {
            MessageStatus::Mismatched
        };
        MessageAudit {
            message_id: message.message_id.clone(),
            status,
            block_index: Some(located.block_index),
        }
    }

    /// Audit each of `messages` (the conversation's messages as currently
    /// stored) against the ledger.
    pub fn audit_conversation(&self, conversation_id: &str, messages: &[AuditSubject]) -> AuditReport {
        let mut report = AuditReport {
            conversation_id: conversation_id.to_string(),
            ..Default::default()
        };
        for message in messages {
            report.tally(self.audit_message(message));
        }

        if report.is_clean() {
            info!(conversation_id, total = report.total, "conversation audit clean");
        } else {
            warn!(
                conversation_id,
                total = report.total,
                mismatched = report.mismatched,
                missing = report.missing,
                "conversation audit found problems"
            );
        }
        report
    }

    /// Validate the whole chain and audit up to `sample_size` messages
    /// chosen at random.
    pub fn integrity_check(&self, messages: &[AuditSubject], sample_size: usize) -> IntegrityCheck {
        let chain = self.ledger.verify_chain();
        let sample: Vec<&AuditSubject> = messages
            .choose_multiple(&mut rand::thread_rng(), sample_size)
            .collect();

        let mut check = IntegrityCheck {
            chain_valid: chain.valid,
            chain,
            sampled: sample.len(),
            verified: 0,
            mismatched: 0,
            missing: 0,
            problems: Vec::new(),
        };
        for message in sample {
            let audit = self.audit_message(message);
            match audit.status {
                MessageStatus::Verified => check.verified += 1,
                MessageStatus::Mismatched => check.mismatched += 1,
                MessageStatus::Missing => check.missing += 1,
            }
            if audit.status != MessageStatus::Verified {
                check.problems.push(audit);
            }
        }

        if !check.chain_valid {
            warn!(
                first_invalid = ?check.chain.first_invalid_index,
                error = check.chain.error_message.as_deref().unwrap_or(""),
                "integrity check: chain invalid"
            );
        }
        info!(
            chain_valid = check.chain_valid,
            sampled = check.sampled,
            verified = check.verified,
            mismatched = check.mismatched,
            missing = check.missing,
            "integrity check complete"
        );
        check
    }
}
