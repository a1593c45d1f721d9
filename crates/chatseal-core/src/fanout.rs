//! Conversation fan-out
//!
//! One plaintext becomes one envelope per participant that has an active
//! encryption key, plus at most one sender signature over the plaintext.
//! Participants without a key are skipped, never failing the send.

use std::collections::HashSet;
use std::sync::Arc;

use chatseal_crypto::{cipher, KeyType, SecretKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::encoding::base64_bytes;
use crate::error::{ChatSealError, Result};
use crate::keystore::KeyStore;

/// Shown in place of content the reader cannot decrypt.
pub const UNREADABLE_PLACEHOLDER: &str = "[Encrypted message - unable to decrypt]";

/// Ciphertext of one message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub message_id: String,
    pub recipient_id: String,
    /// Encryption key the envelope was sealed to.
    pub key_id: String,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSignature {
    pub message_id: String,
    pub signer_id: String,
    pub key_id: String,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FanoutResult {
    pub envelopes: Vec<EncryptedEnvelope>,
    pub signature: Option<MessageSignature>,
    /// Recipients left out for lack of an active encryption key.
    pub skipped: Vec<String>,
}

impl FanoutResult {
    pub fn envelope_for(&self, recipient_id: &str) -> Option<&EncryptedEnvelope> {
        self.envelopes.iter().find(|e| e.recipient_id == recipient_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    Unsigned,
    Valid,
    Invalid,
    /// The content could not be decrypted, so there was nothing to check.
    Unverified,
}

/// What a reader sees for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub message_id: String,
    pub readable: bool,
    pub text: String,
    pub signature: SignatureStatus,
}

pub struct FanoutEncryptor {
    keystore: Arc<KeyStore>,
}

impl FanoutEncryptor {
    pub fn new(keystore: Arc<KeyStore>) -> Self {
        Self { keystore }
    }

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    /// Seal `plaintext` for every participant and the sender.
    ///
    /// Recipients are `participant_ids` in order, deduplicated, with the
    /// sender appended unless already present. When `sender_signing_secret`
    /// matches the sender's active signing key the plaintext is signed once.
    pub fn encrypt_for_conversation<I, S>(
        &self,
        message_id: &str,
        plaintext: &[u8],
        sender_id: &str,
        participant_ids: I,
        sender_signing_secret: Option<&SecretKey>,
    ) -> Result<FanoutResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut result = FanoutResult::default();
        let created_at = Utc::now();

        for recipient_id in recipients(participant_ids, sender_id) {
            let record = match self.keystore.get_active_key(&recipient_id, KeyType::Encryption) {
                Ok(record) => record,
                Err(ChatSealError::KeyNotFound { .. }) => {
                    debug!(message_id, recipient_id = %recipient_id, "no encryption key; recipient skipped");
                    result.skipped.push(recipient_id);
                    continue;
                }
                Err(err) => return Err(err),
            };
            let ciphertext = cipher::encrypt(&record.public_key, plaintext)?;
            result.envelopes.push(EncryptedEnvelope {
                message_id: message_id.to_string(),
                recipient_id,
                key_id: record.key_id,
                ciphertext,
                created_at,
            });
        }

        if let Some(secret) = sender_signing_secret {
            result.signature = self.sign(message_id, plaintext, sender_id, secret)?;
        }

        debug!(
            message_id,
            envelopes = result.envelopes.len(),
            skipped = result.skipped.len(),
            signed = result.signature.is_some(),
            "message fanned out"
        );
        Ok(result)
    }

    fn sign(
        &self,
        message_id: &str,
        plaintext: &[u8],
        sender_id: &str,
        secret: &SecretKey,
    ) -> Result<Option<MessageSignature>> {
        let record = match self.keystore.get_active_key(sender_id, KeyType::Signing) {
            Ok(record) => record,
            Err(ChatSealError::KeyNotFound { .. }) => {
                debug!(message_id, sender_id, "sender has no signing key; message unsigned");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if secret.key_type() != KeyType::Signing || secret.public_key() != record.public_key {
            warn!(
                message_id,
                sender_id,
                key_id = %record.key_id,
                "supplied secret does not match the active signing key; message unsigned"
            );
            return Ok(None);
        }
        let signature = cipher::sign(secret, plaintext)?;
        Ok(Some(MessageSignature {
            message_id: message_id.to_string(),
            signer_id: sender_id.to_string(),
            key_id: record.key_id,
            signature,
        }))
    }

    /// Decrypt an envelope with the recipient's encryption secret.
    pub fn open_envelope(envelope: &EncryptedEnvelope, secret: &SecretKey) -> Result<Zeroizing<Vec<u8>>> {
        cipher::decrypt(secret, &envelope.ciphertext).map_err(|_| ChatSealError::Decrypt)
    }

    /// Check `signature` over `plaintext` as `sender_id`'s. Uses the key the
    /// signature names when it is one of the sender's signing keys, else the
    /// sender's verification key.
    pub fn verify_signature(&self, sender_id: &str, plaintext: &[u8], signature: &MessageSignature) -> bool {
        if signature.signer_id != sender_id {
            return false;
        }
        let named = self
            .keystore
            .get_key(&signature.key_id)
            .ok()
            .filter(|r| r.owner_id == sender_id && r.key_type == KeyType::Signing);
        let Some(record) = named.or_else(|| self.keystore.verification_key(sender_id).ok()) else {
            return false;
        };
        cipher::verify(&record.public_key, plaintext, &signature.signature)
    }

    /// Decrypt and verify for display. Never fails: unreadable content
    /// becomes [`UNREADABLE_PLACEHOLDER`].
    pub fn read_message(
        &self,
        message_id: &str,
        envelope: Option<&EncryptedEnvelope>,
        reader_secret: &SecretKey,
        sender_id: &str,
        signature: Option<&MessageSignature>,
    ) -> MessageView {
        let opened = envelope.and_then(|envelope| match Self::open_envelope(envelope, reader_secret) {
            Ok(plaintext) => Some(plaintext),
            Err(_) => {
                debug!(message_id, recipient_id = %envelope.recipient_id, "envelope could not be opened");
                None
            }
        });

        let Some(plaintext) = opened else {
            return MessageView {
                message_id: message_id.to_string(),
                readable: false,
                text: UNREADABLE_PLACEHOLDER.to_string(),
                signature: match signature {
                    Some(_) => SignatureStatus::Unverified,
                    None => SignatureStatus::Unsigned,
                },
            };
        };

        let status = match signature {
            None => SignatureStatus::Unsigned,
            Some(sig) if self.verify_signature(sender_id, &plaintext, sig) => SignatureStatus::Valid,
            Some(_) => SignatureStatus::Invalid,
        };
        MessageView {
            message_id: message_id.to_string(),
            readable: true,
            text: String::from_utf8_lossy(&plaintext).into_owned(),
            signature: status,
        }
    }
}

/// Participants in order without duplicates, sender included exactly once.
fn recipients<I, S>(participant_ids: I, sender_id: &str) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for id in participant_ids {
        let id = id.as_ref();
        if seen.insert(id.to_string()) {
            out.push(id.to_string());
        }
    }
    if seen.insert(sender_id.to_string()) {
        out.push(sender_id.to_string());
    }
    out
}
