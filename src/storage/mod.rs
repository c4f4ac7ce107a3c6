pub mod file_storage;
pub mod profile;

use std::collections::BTreeMap;

use serde_json::Value;

pub use file_storage::JsonFileStore;
pub use profile::{PersistedProfile, ProfileStore, SuccessNotice};

/// Keys under which the editor mirrors its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageKey {
    Name,
    Bio,
    Preview,
    UploadUrl,
    DarkTheme,
    CompressionEnabled,
    UploadDuration,
    OriginalSize,
    CompressedSize,
    SuccessMessage,
}

impl StorageKey {
    pub const ALL: [StorageKey; 10] = [
        StorageKey::Name,
        StorageKey::Bio,
        StorageKey::Preview,
        StorageKey::UploadUrl,
        StorageKey::DarkTheme,
        StorageKey::CompressionEnabled,
        StorageKey::UploadDuration,
        StorageKey::OriginalSize,
        StorageKey::CompressedSize,
        StorageKey::SuccessMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::Name => "profileName",
            StorageKey::Bio => "profileBio",
            StorageKey::Preview => "profilePreview",
            StorageKey::UploadUrl => "profileUploadUrl",
            StorageKey::DarkTheme => "profileDarkTheme",
            StorageKey::CompressionEnabled => "profileCompressionEnabled",
            StorageKey::UploadDuration => "profileUploadDuration",
            StorageKey::OriginalSize => "profileOriginalSize",
            StorageKey::CompressedSize => "profileCompressedSize",
            StorageKey::SuccessMessage => "profileSuccessMessage",
        }
    }
}

/// String-keyed store of JSON values.
///
/// Reads never fail: a store that cannot be read behaves as empty.
/// Writes report errors so callers can decide whether to surface them.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<Value>;

    /// Create or update an entry and persist it.
    fn set(&mut self, key: &str, value: Value) -> crate::Result<()>;

    /// Remove an entry and persist the removal.
    /// Removing a missing key is not an error.
    fn remove(&mut self, key: &str) -> crate::Result<()>;

    /// Snapshot of every entry
    fn entries(&self) -> BTreeMap<String, Value>;
}
