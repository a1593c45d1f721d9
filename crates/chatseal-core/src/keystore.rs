//! Key registry
//!
//! Holds the public half of every signing and encryption key ever issued,
//! grouped by owner. Secret halves are handed to the caller at generation
//! time and never retained.
//!
//! Invariant: at most one active key per (owner, key type). Rotation keeps
//! the previous key, inactive, so envelopes and signatures made with it can
//! still be opened and verified by `key_id`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chatseal_crypto::cipher::generate_keypair;
use chatseal_crypto::{CryptoError, KeyType, PublicKey, SecretKey};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::error::{ChatSealError, Result};

const REGISTRY_VERSION: u32 = 1;

/// Registry entry for one key. Contains no secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub owner_id: String,
    pub key_type: KeyType,
    pub public_key: PublicKey,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A freshly issued key: the registered public record plus the secret,
/// which the store does not keep.
#[derive(Debug)]
pub struct GeneratedKeyPair {
    pub record: KeyRecord,
    pub secret: SecretKey,
}

#[derive(Debug)]
pub struct Identity {
    pub owner_id: String,
    pub signing: GeneratedKeyPair,
    pub encryption: GeneratedKeyPair,
}

/// One owner's key history, oldest first.
#[derive(Debug, Clone, Default)]
struct OwnerKeys {
    records: Vec<KeyRecord>,
}

impl OwnerKeys {
    fn active(&self, key_type: KeyType) -> Option<&KeyRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.key_type == key_type && r.is_active)
    }

    /// Deactivate the current key of `key_type` and register `public_key`
    /// as the new active one. Returns the new record and the id of the key
    /// it replaced.
    fn install(&mut self, owner_id: &str, public_key: PublicKey) -> (KeyRecord, Option<String>) {
        let key_type = public_key.key_type();
        let mut previous = None;
        for record in self
            .records
            .iter_mut()
            .filter(|r| r.key_type == key_type && r.is_active)
        {
            record.is_active = false;
            previous = Some(record.key_id.clone());
        }
        let record = KeyRecord {
            key_id: public_key.fingerprint(),
            owner_id: owner_id.to_string(),
            key_type,
            public_key,
            is_active: true,
            created_at: Utc::now(),
        };
        self.records.push(record.clone());
        (record, previous)
    }

    /// Leave only the newest active key of each type active.
    fn repair(&mut self) -> usize {
        let mut fixed = 0;
        for key_type in KeyType::ALL {
            let mut seen_active = false;
            for record in self.records.iter_mut().rev().filter(|r| r.key_type == key_type) {
                if record.is_active {
                    if seen_active {
                        record.is_active = false;
                        fixed += 1;
                    }
                    seen_active = true;
                }
            }
        }
        fixed
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Registry {
    version: u32,
    keys: Vec<KeyRecord>,
}

pub struct KeyStore {
    owners: RwLock<HashMap<String, Arc<Mutex<OwnerKeys>>>>,
    /// key_id -> owner_id
    key_owners: RwLock<HashMap<String, String>>,
    registry_path: Option<PathBuf>,
    /// Serializes mutations. Held across staging, the registry write and
    /// the swap, so at most one thread ever holds more than one owner lock.
    write_lock: Mutex<()>,
}

impl KeyStore {
    pub fn in_memory() -> Self {
        Self {
            owners: RwLock::new(HashMap::new()),
            key_owners: RwLock::new(HashMap::new()),
            registry_path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Open (or start) the registry file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::in_memory();
        store.registry_path = Some(path.clone());
        if !path.exists() {
            return Ok(store);
        }

        let bytes = fs::read(&path)?;
        let registry: Registry = serde_json::from_slice(&bytes)?;
        if registry.version != REGISTRY_VERSION {
            return Err(ChatSealError::Config(format!(
                "unsupported key registry version {}",
                registry.version
            )));
        }

        let mut owners: HashMap<String, OwnerKeys> = HashMap::new();
        let mut key_owners = HashMap::new();
        for record in registry.keys {
            key_owners.insert(record.key_id.clone(), record.owner_id.clone());
            owners.entry(record.owner_id.clone()).or_default().records.push(record);
        }

        let mut repaired = 0;
        for (owner_id, keys) in owners.iter_mut() {
            let fixed = keys.repair();
            if fixed > 0 {
                warn!(owner_id = %owner_id, fixed, "registry had multiple active keys; kept the newest");
                repaired += fixed;
            }
        }

        *store.key_owners.get_mut() = key_owners;
        *store.owners.get_mut() = owners
            .into_iter()
            .map(|(owner, keys)| (owner, Arc::new(Mutex::new(keys))))
            .collect();

        if repaired > 0 {
            store.write_registry(&[])?;
        }
        Ok(store)
    }

    /// Issue an active signing and an active encryption key for `owner_id`.
    /// Any keys the owner already had are deactivated, not removed.
    pub fn generate_identity(&self, owner_id: &str) -> Result<Identity> {
        let (signing_public, signing_secret) = generate(KeyType::Signing)?;
        let (encryption_public, encryption_secret) = generate(KeyType::Encryption)?;

        let (signing, encryption) = self.commit(&[owner_id], |staged| {
            let keys = &mut staged[0].1;
            let (signing, _) = keys.install(owner_id, signing_public);
            let (encryption, _) = keys.install(owner_id, encryption_public);
            Ok((signing, encryption))
        })?;

        info!(
            owner_id,
            signing_key = %signing.key_id,
            encryption_key = %encryption.key_id,
            "identity created"
        );
        Ok(Identity {
            owner_id: owner_id.to_string(),
            signing: GeneratedKeyPair {
                record: signing,
                secret: signing_secret,
            },
            encryption: GeneratedKeyPair {
                record: encryption,
                secret: encryption_secret,
            },
        })
    }

    /// Replace the active `key_type` key of `owner_id` with a new one.
    pub fn rotate(&self, owner_id: &str, key_type: KeyType) -> Result<GeneratedKeyPair> {
        let (public, secret) = generate(key_type)?;
        let (record, previous) =
            self.commit(&[owner_id], |staged| Ok(staged[0].1.install(owner_id, public)))?;

        info!(
            owner_id,
            key_type = %key_type,
            key_id = %record.key_id,
            previous = previous.as_deref().unwrap_or("none"),
            "key rotated"
        );
        Ok(GeneratedKeyPair { record, secret })
    }

    /// Generate the key types each owner is missing. Owners that already
    /// have an active key of every type are left alone. Either every
    /// missing key is issued and saved or none is.
    pub fn provision_missing<I, S>(&self, owner_ids: I) -> Result<Vec<GeneratedKeyPair>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unique: Vec<String> = Vec::new();
        for owner_id in owner_ids {
            let owner_id = owner_id.as_ref();
            if !unique.iter().any(|seen| seen == owner_id) {
                unique.push(owner_id.to_string());
            }
        }
        if unique.is_empty() {
            return Ok(Vec::new());
        }
        let owner_ids: Vec<&str> = unique.iter().map(String::as_str).collect();

        let issued = self.commit(&owner_ids, |staged| {
            let mut issued = Vec::new();
            for (owner_id, keys) in staged.iter_mut() {
                for key_type in KeyType::ALL {
                    if keys.active(key_type).is_some() {
                        continue;
                    }
                    let (public, secret) = generate(key_type)?;
                    let (record, _) = keys.install(*owner_id, public);
                    issued.push(GeneratedKeyPair { record, secret });
                }
            }
            Ok(issued)
        })?;
        for pair in &issued {
            info!(
                owner_id = %pair.record.owner_id,
                key_type = %pair.record.key_type,
                key_id = %pair.record.key_id,
                "key provisioned"
            );
        }
        Ok(issued)
    }

    pub fn get_active_key(&self, owner_id: &str, key_type: KeyType) -> Result<KeyRecord> {
        self.owner(owner_id)
            .and_then(|owner| owner.lock().active(key_type).cloned())
            .ok_or_else(|| ChatSealError::KeyNotFound {
                owner_id: owner_id.to_string(),
                key_type,
            })
    }

    /// Look up any key ever issued, active or not.
    pub fn get_key(&self, key_id: &str) -> Result<KeyRecord> {
        let owner_id = self.key_owners.read().get(key_id).cloned();
        owner_id
            .and_then(|owner_id| self.owner(&owner_id))
            .and_then(|owner| {
                owner
                    .lock()
                    .records
                    .iter()
                    .find(|r| r.key_id == key_id)
                    .cloned()
            })
            .ok_or_else(|| ChatSealError::UnknownKeyId(key_id.to_string()))
    }

    /// Every `key_type` key of `owner_id`, oldest first.
    pub fn keys_for(&self, owner_id: &str, key_type: KeyType) -> Vec<KeyRecord> {
        self.owner(owner_id)
            .map(|owner| {
                owner
                    .lock()
                    .records
                    .iter()
                    .filter(|r| r.key_type == key_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Key to check `owner_id`'s signatures with: the active signing key,
    /// else the most recently issued one.
    pub fn verification_key(&self, owner_id: &str) -> Result<KeyRecord> {
        let found = self.owner(owner_id).and_then(|owner| {
            let keys = owner.lock();
            keys.active(KeyType::Signing)
                .or_else(|| {
                    keys.records
                        .iter()
                        .rev()
                        .find(|r| r.key_type == KeyType::Signing)
                })
                .cloned()
        });
        found.ok_or_else(|| ChatSealError::KeyNotFound {
            owner_id: owner_id.to_string(),
            key_type: KeyType::Signing,
        })
    }

    /// Owners with at least one key, sorted.
    pub fn owners(&self) -> Vec<String> {
        let handles: Vec<(String, Arc<Mutex<OwnerKeys>>)> = self
            .owners
            .read()
            .iter()
            .map(|(owner_id, keys)| (owner_id.clone(), Arc::clone(keys)))
            .collect();
        let mut owners: Vec<String> = handles
            .into_iter()
            .filter(|(_, keys)| !keys.lock().records.is_empty())
            .map(|(owner_id, _)| owner_id)
            .collect();
        owners.sort();
        owners
    }

    pub fn registry_path(&self) -> Option<&Path> {
        self.registry_path.as_deref()
    }

    fn owner(&self, owner_id: &str) -> Option<Arc<Mutex<OwnerKeys>>> {
        self.owners.read().get(owner_id).cloned()
    }

    fn owner_entry(&self, owner_id: &str) -> Arc<Mutex<OwnerKeys>> {
        if let Some(owner) = self.owner(owner_id) {
            return owner;
        }
        self.owners
            .write()
            .entry(owner_id.to_string())
            .or_default()
            .clone()
    }

    /// Apply `change` to copies of the named owners' keys, write the
    /// registry with those copies, then install them. If `change` or the
    /// write fails the store is left exactly as it was.
    ///
    /// `owner_ids` must not repeat.
    fn commit<T>(
        &self,
        owner_ids: &[&str],
        change: impl FnOnce(&mut [(&str, OwnerKeys)]) -> Result<T>,
    ) -> Result<T> {
        let _writer = self.write_lock.lock();
        let handles: Vec<Arc<Mutex<OwnerKeys>>> = owner_ids.iter().map(|id| self.owner_entry(id)).collect();
        let mut guards: Vec<MutexGuard<'_, OwnerKeys>> = handles.iter().map(|owner| owner.lock()).collect();
        let mut staged: Vec<(&str, OwnerKeys)> = owner_ids
            .iter()
            .copied()
            .zip(guards.iter().map(|keys| (**keys).clone()))
            .collect();

        let out = change(staged.as_mut_slice())?;
        self.write_registry(&staged)?;

        let mut key_owners = self.key_owners.write();
        for ((owner_id, keys), guard) in staged.into_iter().zip(guards.iter_mut()) {
            for record in &keys.records {
                key_owners.insert(record.key_id.clone(), owner_id.to_string());
            }
            **guard = keys;
        }
        Ok(out)
    }

    /// Write the registry file, taking the keys of owners in `staged` from
    /// there and every other owner's from the store. The caller holds the
    /// locks of the staged owners.
    fn write_registry(&self, staged: &[(&str, OwnerKeys)]) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        let owners: Vec<(String, Arc<Mutex<OwnerKeys>>)> = self
            .owners
            .read()
            .iter()
            .map(|(owner_id, keys)| (owner_id.clone(), Arc::clone(keys)))
            .collect();
        let mut keys: Vec<KeyRecord> = Vec::new();
        for (owner_id, owner) in &owners {
            match staged.iter().find(|(id, _)| *id == owner_id.as_str()) {
                Some((_, pending)) => keys.extend(pending.records.iter().cloned()),
                None => keys.extend(owner.lock().records.iter().cloned()),
            }
        }
        keys.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
        let registry = Registry {
            version: REGISTRY_VERSION,
            keys,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(&registry)?)?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| ChatSealError::Persistence(format!("{}: {}", path.display(), e.error)))?;
        Ok(())
    }
}

fn generate(key_type: KeyType) -> Result<(PublicKey, SecretKey)> {
    generate_keypair(key_type).map_err(|e| match e {
        CryptoError::KeyGeneration(reason) => ChatSealError::KeyGeneration(reason),
        other => ChatSealError::Crypto(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    fn active_count(store: &KeyStore, owner: &str, key_type: KeyType) -> usize {
        store
            .keys_for(owner, key_type)
            .iter()
            .filter(|r| r.is_active)
            .count()
    }

    #[test]
    fn identity_has_both_active_keys() {
        let store = KeyStore::in_memory();
        let identity = store.generate_identity("alice").unwrap();
        assert_eq!(identity.signing.record.key_type, KeyType::Signing);
        assert_eq!(identity.encryption.record.key_type, KeyType::Encryption);
        assert_eq!(
            identity.encryption.secret.public_key(),
            identity.encryption.record.public_key
        );

        let active = store.get_active_key("alice", KeyType::Encryption).unwrap();
        assert_eq!(active, identity.encryption.record);
    }

    #[test]
    fn unknown_owner_has_no_key() {
        let store = KeyStore::in_memory();
        let err = store.get_active_key("bob", KeyType::Signing).unwrap_err();
        assert!(matches!(err, ChatSealError::KeyNotFound { key_type: KeyType::Signing, .. }));
        assert!(store.keys_for("bob", KeyType::Signing).is_empty());
    }

    #[test]
    fn second_identity_deactivates_first() {
        let store = KeyStore::in_memory();
        let first = store.generate_identity("alice").unwrap();
        let second = store.generate_identity("alice").unwrap();
        assert_eq!(active_count(&store, "alice", KeyType::Signing), 1);
        assert_eq!(active_count(&store, "alice", KeyType::Encryption), 1);
        assert!(!store.get_key(&first.signing.record.key_id).unwrap().is_active);
        assert!(store.get_key(&second.signing.record.key_id).unwrap().is_active);
    }

    #[test]
    fn rotation_keeps_history() {
        let store = KeyStore::in_memory();
        let identity = store.generate_identity("alice").unwrap();
        let rotated = store.rotate("alice", KeyType::Encryption).unwrap();

        let history = store.keys_for("alice", KeyType::Encryption);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].key_id, identity.encryption.record.key_id);
        assert!(!history[0].is_active);
        assert!(history[1].is_active);
        assert_eq!(history[1].key_id, rotated.record.key_id);

        // The other key type is untouched.
        assert!(store.get_key(&identity.signing.record.key_id).unwrap().is_active);
    }

    #[test]
    fn unknown_key_id() {
        let store = KeyStore::in_memory();
        assert!(matches!(store.get_key("ffff"), Err(ChatSealError::UnknownKeyId(_))));
    }

    #[test]
    fn provision_only_fills_gaps() {
        let store = KeyStore::in_memory();
        store.generate_identity("alice").unwrap();
        let issued = store.provision_missing(["alice", "bob", "carol"]).unwrap();
        assert_eq!(issued.len(), 4);
        assert!(issued.iter().all(|pair| pair.record.owner_id != "alice"));
        assert!(store.provision_missing(["alice", "bob"]).unwrap().is_empty());
        assert_eq!(store.owners(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn concurrent_rotations_leave_one_active() {
        let store = Arc::new(KeyStore::in_memory());
        store.generate_identity("alice").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..5 {
                        store.rotate("alice", KeyType::Signing).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.keys_for("alice", KeyType::Signing).len(), 41);
        assert_eq!(active_count(&store, "alice", KeyType::Signing), 1);
    }

    #[test]
    fn provision_racing_rotation_keeps_one_active_key() {
        let store = Arc::new(KeyStore::in_memory());
        let owners: Vec<String> = (0..16).map(|i| format!("user{i}")).collect();
        let rotator = {
            let store = Arc::clone(&store);
            let owners = owners.clone();
            thread::spawn(move || {
                for owner in &owners {
                    store.rotate(owner, KeyType::Encryption).unwrap();
                }
            })
        };
        let provisioner = {
            let store = Arc::clone(&store);
            let owners = owners.clone();
            thread::spawn(move || {
                for owner in &owners {
                    store.provision_missing([owner]).unwrap();
                }
            })
        };
        rotator.join().unwrap();
        provisioner.join().unwrap();

        for owner in &owners {
            for key_type in KeyType::ALL {
                assert_eq!(active_count(&store, owner, key_type), 1, "{owner} {key_type}");
            }
        }
    }

    #[test]
    fn failed_registry_write_changes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let store = KeyStore::open(&path).unwrap();
        let identity = store.generate_identity("alice").unwrap();

        // A directory in place of the registry file makes every write fail.
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(store.rotate("alice", KeyType::Encryption).is_err());
        assert!(store.generate_identity("alice").is_err());
        assert!(store.provision_missing(["alice", "bob"]).is_err());

        assert_eq!(
            store.get_active_key("alice", KeyType::Encryption).unwrap(),
            identity.encryption.record
        );
        assert_eq!(
            store.get_active_key("alice", KeyType::Signing).unwrap(),
            identity.signing.record
        );
        assert_eq!(store.keys_for("alice", KeyType::Encryption).len(), 1);
        assert_eq!(store.keys_for("alice", KeyType::Signing).len(), 1);
        assert!(store.get_active_key("bob", KeyType::Signing).is_err());
        assert_eq!(store.owners(), vec!["alice"]);

        fs::remove_dir(&path).unwrap();
        let rotated = store.rotate("alice", KeyType::Encryption).unwrap();
        let reopened = KeyStore::open(&path).unwrap();
        assert_eq!(reopened.keys_for("alice", KeyType::Encryption).len(), 2);
        assert_eq!(
            reopened.get_active_key("alice", KeyType::Encryption).unwrap().key_id,
            rotated.record.key_id
        );
    }

    #[test]
    fn registry_persists_public_records_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let identity = {
            let store = KeyStore::open(&path).unwrap();
            let identity = store.generate_identity("alice").unwrap();
            store.rotate("alice", KeyType::Signing).unwrap();
            identity
        };

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("secret"));

        let store = KeyStore::open(&path).unwrap();
        assert_eq!(store.keys_for("alice", KeyType::Signing).len(), 2);
        let old = store.get_key(&identity.signing.record.key_id).unwrap();
        assert!(!old.is_active);
        assert_eq!(old.public_key, identity.signing.record.public_key);
    }

    #[test]
    fn open_repairs_duplicate_active_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        {
            let store = KeyStore::open(&path).unwrap();
            store.generate_identity("alice").unwrap();
            store.rotate("alice", KeyType::Signing).unwrap();
        }
        let mut registry: Registry = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        for record in registry.keys.iter_mut() {
            record.is_active = true;
        }
        fs::write(&path, serde_json::to_vec(&registry).unwrap()).unwrap();

        let store = KeyStore::open(&path).unwrap();
        assert_eq!(active_count(&store, "alice", KeyType::Signing), 1);
        let newest = store.keys_for("alice", KeyType::Signing).pop().unwrap();
        assert!(newest.is_active);
    }

    #[test]
    fn verification_key_falls_back_to_most_recent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let rotated = {
            let store = KeyStore::open(&path).unwrap();
            store.generate_identity("alice").unwrap();
            store.rotate("alice", KeyType::Signing).unwrap()
        };
        let mut registry: Registry = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        for record in registry.keys.iter_mut() {
            record.is_active = false;
        }
        fs::write(&path, serde_json::to_vec(&registry).unwrap()).unwrap();

        let store = KeyStore::open(&path).unwrap();
        assert!(store.get_active_key("alice", KeyType::Signing).is_err());
        assert_eq!(
            store.verification_key("alice").unwrap().key_id,
            rotated.record.key_id
        );
    }
}
