//! Message cipher: stateless asymmetric operations.
//!
//! Encryption is hybrid: a per-envelope content key seals the plaintext, and
//! only that key's derivation depends on the recipient's long-term key.
//!
//! # Encryption flow (sender)
//!
//! ```text
//! 1. ephemeral   ← X25519.generate()
//! 2. shared      ← ECDH(ephemeral, recipient_x25519)
//! 3. content_key ← HKDF-SHA256(shared, salt="chatseal-e2e-v1",
//!                              info=ephemeral_pub || recipient_pub)
//! 4. body        ← XChaCha20-Poly1305(content_key, random nonce, plaintext,
//!                                     aad = version || ephemeral_pub)
//! ```
//!
//! Wire format:
//!   [ version (1) | ephemeral_pub (32) | nonce (24) | ciphertext + tag ]
//!
//! Signatures are Ed25519 over the raw message bytes.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand_core::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::aead;
use crate::error::CryptoError;
use crate::kdf::derive_content_key;
use crate::keys::{KeyType, PublicKey, SecretKey, KEY_LEN};

pub const ENVELOPE_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + KEY_LEN;

/// Generate a fresh key pair of the requested type.
///
/// Fails only if the OS random source is unavailable.
pub fn generate_keypair(key_type: KeyType) -> Result<(PublicKey, SecretKey), CryptoError> {
    let mut seed = Zeroizing::new([0u8; KEY_LEN]);
    OsRng
        .try_fill_bytes(&mut seed[..])
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

    let secret = SecretKey::from_bytes(key_type, *seed);
    let public = secret.public_key();
    Ok((public, secret))
}

/// Seal `plaintext` to `recipient`'s encryption key.
pub fn encrypt(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if recipient.key_type() != KeyType::Encryption {
        return Err(CryptoError::InvalidKey("encryption requires an x25519 key".into()));
    }
    let recipient_x = X25519Public::from(*recipient.as_bytes());

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_x);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("recipient key is a low-order point".into()));
    }

    let content_key = derive_content_key(shared.as_bytes(), ephemeral_pub.as_bytes(), recipient.as_bytes())?;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.push(ENVELOPE_VERSION);
    header.extend_from_slice(ephemeral_pub.as_bytes());

    let body = aead::encrypt(&content_key, plaintext, &header)?;

    let mut out = header;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Open an envelope with the recipient's encryption secret.
///
/// Every failure (wrong key type, truncated data, unknown version, wrong
/// key, tampering) yields the same `CryptoError::Decrypt`.
pub fn decrypt(secret: &SecretKey, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if secret.key_type() != KeyType::Encryption {
        return Err(CryptoError::Decrypt);
    }
    if data.len() < HEADER_LEN + aead::NONCE_LEN + aead::TAG_LEN || data[0] != ENVELOPE_VERSION {
        return Err(CryptoError::Decrypt);
    }
    let (header, body) = data.split_at(HEADER_LEN);
    let ephemeral_bytes: [u8; KEY_LEN] = header[1..].try_into().map_err(|_| CryptoError::Decrypt)?;

    let static_secret = StaticSecret::from(*secret.as_bytes());
    let own_public = X25519Public::from(&static_secret);
    let shared = static_secret.diffie_hellman(&X25519Public::from(ephemeral_bytes));
    if !shared.was_contributory() {
        return Err(CryptoError::Decrypt);
    }

    let content_key = derive_content_key(shared.as_bytes(), &ephemeral_bytes, own_public.as_bytes())
        .map_err(|_| CryptoError::Decrypt)?;
    aead::decrypt(&content_key, body, header).map_err(|_| CryptoError::Decrypt)
}

/// Sign `message`; returns the 64-byte raw Ed25519 signature.
pub fn sign(secret: &SecretKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if secret.key_type() != KeyType::Signing {
        return Err(CryptoError::InvalidKey("signing requires an ed25519 key".into()));
    }
    let key = SigningKey::from_bytes(secret.as_bytes());
    Ok(key.sign(message).to_bytes().to_vec())
}

/// Verify a signature. Malformed keys or signatures simply return `false`.
pub fn verify(public: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    if public.key_type() != KeyType::Signing {
        return false;
    }
    let Ok(key) = VerifyingKey::from_bytes(public.as_bytes()) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_strict(message, &sig).is_ok()
}
