use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::ledger::LedgerConfig;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Leading zero hex characters required of every mined block hash.
    pub difficulty: usize,
    /// 0 disables the mining deadline.
    pub mining_timeout_ms: u64,
    pub log_file: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            difficulty: 2,
            mining_timeout_ms: 5_000,
            log_file: "ledger.jsonl".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    pub registry_file: String,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            registry_file: "keys.json".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Messages sampled by a routine integrity check.
    pub sample_size: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self { sample_size: 100 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSealSettings {
    pub ledger: LedgerSettings,
    pub keys: KeySettings,
    pub audit: AuditSettings,
}

impl ChatSealSettings {
    /// Load `settings.json` from `data_dir`, falling back to defaults when
    /// the file does not exist.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir)?;
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(data_dir.join(SETTINGS_FILE), data)?;
        Ok(())
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        let timeout = match self.ledger.mining_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        LedgerConfig::new(self.ledger.difficulty).with_mining_timeout(timeout)
    }

    pub fn ledger_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.ledger.log_file)
    }

    pub fn key_registry_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.keys.registry_file)
    }
}
