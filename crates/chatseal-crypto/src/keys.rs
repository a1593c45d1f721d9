//! Key material
//!
//! Every user owns two kinds of key pairs:
//!   - a *signing* pair (Ed25519) used to sign message plaintexts, and
//!   - an *encryption* pair (X25519) that envelopes are sealed to.
//!
//! Keys are exported in a self-describing text form so historical keys
//! stay loadable even if the algorithm set grows:
//!
//!   "<algorithm>:<base64url(raw 32 bytes)>"
//!
//! with algorithms `ed25519`, `x25519` for public halves and
//! `ed25519-secret`, `x25519-secret` for secret halves.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::hash;

pub const KEY_LEN: usize = 32;

// ── Key type ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Signing,
    Encryption,
}

impl KeyType {
    pub const ALL: [KeyType; 2] = [KeyType::Signing, KeyType::Encryption];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Signing => "signing",
            KeyType::Encryption => "encryption",
        }
    }

    fn public_tag(&self) -> &'static str {
        match self {
            KeyType::Signing => "ed25519",
            KeyType::Encryption => "x25519",
        }
    }

    fn secret_tag(&self) -> &'static str {
        match self {
            KeyType::Signing => "ed25519-secret",
            KeyType::Encryption => "x25519-secret",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signing" => Ok(KeyType::Signing),
            "encryption" => Ok(KeyType::Encryption),
            other => Err(CryptoError::Encoding(format!("unknown key type '{other}'"))),
        }
    }
}

fn split_encoded(s: &str) -> Result<(&str, [u8; KEY_LEN]), CryptoError> {
    let (tag, body) = s
        .split_once(':')
        .ok_or_else(|| CryptoError::Encoding("missing algorithm prefix".into()))?;
    let bytes = URL_SAFE_NO_PAD.decode(body.trim())?;
    let raw: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("key must be {KEY_LEN} bytes, got {}", bytes.len()))
    })?;
    Ok((tag, raw))
}

// ── Public key ────────────────────────────────────────────────────────────────

/// Public half of a signing or encryption key.
/// Serialized as its self-describing text encoding.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey {
    key_type: KeyType,
    bytes: [u8; KEY_LEN],
}

impl PublicKey {
    pub fn from_bytes(key_type: KeyType, bytes: [u8; KEY_LEN]) -> Self {
        Self { key_type, bytes }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.key_type.public_tag(), URL_SAFE_NO_PAD.encode(self.bytes))
    }

    pub fn decode(s: &str) -> Result<Self, CryptoError> {
        let (tag, bytes) = split_encoded(s)?;
        let key_type = KeyType::ALL
            .into_iter()
            .find(|kt| kt.public_tag() == tag)
            .ok_or_else(|| CryptoError::Encoding(format!("unknown public key algorithm '{tag}'")))?;
        Ok(Self { key_type, bytes })
    }

    /// Stable identifier for this key. Also the lookup handle for
    /// historical (deactivated) keys.
    pub fn fingerprint(&self) -> String {
        let mut data = Vec::with_capacity(KEY_LEN + 8);
        data.extend_from_slice(self.key_type.public_tag().as_bytes());
        data.push(0);
        data.extend_from_slice(&self.bytes);
        hash::fingerprint(&data)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.encode())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl TryFrom<String> for PublicKey {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.encode()
    }
}

// ── Secret key ────────────────────────────────────────────────────────────────

/// Secret half of a key pair. Held by the key's owner only; drop clears memory.
#[derive(ZeroizeOnDrop)]
pub struct SecretKey {
    #[zeroize(skip)]
    key_type: KeyType,
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    pub fn from_bytes(key_type: KeyType, bytes: [u8; KEY_LEN]) -> Self {
        Self { key_type, bytes }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let bytes = match self.key_type {
            KeyType::Signing => ed25519_dalek::SigningKey::from_bytes(&self.bytes)
                .verifying_key()
                .to_bytes(),
            KeyType::Encryption => {
                let secret = x25519_dalek::StaticSecret::from(self.bytes);
                x25519_dalek::PublicKey::from(&secret).to_bytes()
            }
        };
        PublicKey::from_bytes(self.key_type, bytes)
    }

    /// Export for handing to the key's owner. Callers must not persist this
    /// on the server side.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.key_type.secret_tag(), URL_SAFE_NO_PAD.encode(self.bytes))
    }

    pub fn decode(s: &str) -> Result<Self, CryptoError> {
        let (tag, bytes) = split_encoded(s)?;
        let key_type = KeyType::ALL
            .into_iter()
            .find(|kt| kt.secret_tag() == tag)
            .ok_or_else(|| CryptoError::Encoding(format!("unknown secret key algorithm '{tag}'")))?;
        Ok(Self { key_type, bytes })
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({}, <redacted>)", self.key_type)
    }
}
