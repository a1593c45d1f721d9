//! chatseal-crypto: message cipher primitives
//!
//! # Design principles
//! - NO custom crypto; every primitive comes from an audited Rust crate.
//! - Secret key material is zeroized on drop and never serialized implicitly.
//! - Every function takes its key material explicitly; there is no global key state.
//!
//! # Module layout
//! - `keys`    key types, self-describing public/secret key encoding, fingerprints
//! - `cipher`  key generation, hybrid encrypt/decrypt, sign/verify
//! - `aead`    XChaCha20-Poly1305 helpers
//! - `kdf`     HKDF-SHA256 content-key derivation
//! - `hash`    SHA-256 content hashes and constant-time comparison
//! - `error`   unified error type

pub mod aead;
pub mod cipher;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod keys;

pub use error::CryptoError;
pub use keys::{KeyType, PublicKey, SecretKey};
