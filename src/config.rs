use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, KILOBYTE, MEGABYTE};

const DEFAULT_STORAGE_FILE: &str = ".profile-editor/storage.json";

/// Tunables of the profile editor.
///
/// Every field has a default, so a config file only needs to name the
/// values it overrides.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Location of the local key-value store
    pub storage_path: PathBuf,
    /// Largest file accepted for processing
    pub max_input_bytes: u64,
    /// Largest compressed output
    pub max_output_bytes: u64,
    /// Bound on both width and height of compressed output
    pub max_dimension: u32,
    /// How long a persisted success message stays visible
    pub success_ttl_secs: u64,
    /// Size of body chunks handed to the HTTP client
    pub upload_chunk_size: usize,
    pub default_name: String,
    pub default_bio: String,
    pub default_avatar: String,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(DEFAULT_STORAGE_FILE),
            max_input_bytes: 2 * MEGABYTE,
            max_output_bytes: MEGABYTE,
            max_dimension: 600,
            success_ttl_secs: 5 * 60,
            upload_chunk_size: 64 * KILOBYTE as usize,
            default_name: String::new(),
            default_bio: String::new(),
            default_avatar: "/default-avatar.jpg".to_owned(),
        }
    }
}

impl EditorConfig {
    /// Load a JSON config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)?;
        log::debug!("loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn with_storage_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn success_ttl(&self) -> Duration {
        Duration::from_secs(self.success_ttl_secs)
    }
}
