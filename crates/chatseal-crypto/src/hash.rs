//! Hash utilities
//!
//! - SHA-256 content hashes recorded in the integrity ledger
//! - BLAKE3 key fingerprints
//! - Constant-time comparison of digests

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Content hash of a message's canonical representation.
pub fn content_hash(canonical: &[u8]) -> String {
    sha256_hex(canonical)
}

/// 128-bit BLAKE3 fingerprint, hex-encoded.
pub fn fingerprint(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    hex::encode(&hash.as_bytes()[..16])
}

/// Constant-time comparison to prevent timing side channels.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
