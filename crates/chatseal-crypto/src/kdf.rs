//! Key derivation
//!
//! `derive_content_key`: HKDF-SHA256 over the X25519 shared secret,
//! bound to both the ephemeral and the recipient public keys.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

const CONTENT_KEY_SALT: &[u8] = b"chatseal-e2e-v1";

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive the 32-byte AEAD key for one envelope.
pub fn derive_content_key(
    shared_secret: &[u8],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut info = [0u8; 64];
    info[..32].copy_from_slice(ephemeral_public);
    info[32..].copy_from_slice(recipient_public);

    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(shared_secret, Some(CONTENT_KEY_SALT), &info, &mut key[..])?;
    Ok(key)
}
