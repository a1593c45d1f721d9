use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::{ChatSealError, Result};

pub const APP_QUALIFIER: &str = "io";
pub const APP_ORG: &str = "chatseal";
pub const APP_NAME: &str = "chatseal";
pub const DATA_DIR_ENV: &str = "CHATSEAL_DATA_DIR";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| ChatSealError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}
