use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

use super::{KeyValueStore, StorageKey};
use crate::process::Preview;

/// A success message together with the moment it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessNotice {
    pub message: String,
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
}

impl SuccessNotice {
    pub fn new<S: Into<String>>(message: S, now: SystemTime) -> Self {
        Self {
            message: message.into(),
            timestamp: unix_millis(now),
        }
    }

    pub fn is_fresh(&self, now: SystemTime, ttl: Duration) -> bool {
        let age = unix_millis(now).saturating_sub(self.timestamp);
        age <= ttl.as_millis() as u64
    }
}

/// Everything the editor restores on start-up. Absent values fall back to
/// defaults chosen by the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedProfile {
    pub name: Option<String>,
    pub bio: Option<String>,
    pub preview: Option<Preview>,
    pub upload_url: Option<Url>,
    pub dark_theme: Option<bool>,
    pub compression_enabled: Option<bool>,
    pub upload_duration: Option<f64>,
    pub original_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub success: Option<SuccessNotice>,
}

/// Typed access to the editor's keys.
///
/// Storage problems are never surfaced: they are logged and the editor
/// carries on with in-memory state.
pub struct ProfileStore<S: KeyValueStore> {
    store: S,
    success_ttl: Duration,
}

impl<S: KeyValueStore> ProfileStore<S> {
    pub fn new(store: S, success_ttl: Duration) -> Self {
        Self { store, success_ttl }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Read every key. An expired success message is discarded and
    /// removed from storage.
    pub fn load(&mut self, now: SystemTime) -> PersistedProfile {
        let mut success: Option<SuccessNotice> =
            self.read(StorageKey::SuccessMessage);
        if let Some(notice) = &success {
            if !notice.is_fresh(now, self.success_ttl) {
                log::debug!("dropping expired success message");
                success = None;
                self.clear(StorageKey::SuccessMessage);
            }
        }

        PersistedProfile {
            name: self.read(StorageKey::Name),
            bio: self.read(StorageKey::Bio),
            preview: self.read(StorageKey::Preview),
            upload_url: self.read(StorageKey::UploadUrl),
            dark_theme: self.read(StorageKey::DarkTheme),
            compression_enabled: self.read(StorageKey::CompressionEnabled),
            upload_duration: self.read(StorageKey::UploadDuration),
            original_size: self.read(StorageKey::OriginalSize),
            compressed_size: self.read(StorageKey::CompressedSize),
            success,
        }
    }

    pub fn save<T: Serialize>(&mut self, key: StorageKey, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("cannot serialize {}: {}", key.as_str(), e);
                return;
            }
        };
        if let Err(e) = self.store.set(key.as_str(), value) {
            log::warn!("failed to persist {}: {}", key.as_str(), e);
        }
    }

    pub fn clear(&mut self, key: StorageKey) {
        if let Err(e) = self.store.remove(key.as_str()) {
            log::warn!("failed to remove {}: {}", key.as_str(), e);
        }
    }

    pub fn save_success(&mut self, message: &str, now: SystemTime) {
        self.save(
            StorageKey::SuccessMessage,
            &SuccessNotice::new(message, now),
        );
    }

    /// Remove every key the editor owns
    pub fn reset(&mut self) {
        for key in StorageKey::ALL {
            self.clear(key);
        }
    }

    fn read<T: DeserializeOwned>(&self, key: StorageKey) -> Option<T> {
        let value = self.store.get(key.as_str())?;
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("ignoring malformed {}: {}", key.as_str(), e);
                None
            }
        }
    }
}

pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonFileStore;
    use serde_json::json;
    use tempdir::TempDir;

    const TTL: Duration = Duration::from_secs(300);

    fn open(dir: &TempDir) -> ProfileStore<JsonFileStore> {
        let path = dir.path().join("storage.json");
        ProfileStore::new(JsonFileStore::open("profile".to_owned(), &path), TTL)
    }

    #[test]
    fn typed_values_round_trip_through_file() {
        let dir = TempDir::new("profile_store").unwrap();
        let mut store = open(&dir);
        let url = Url::parse("https://acct.blob.core.windows.net/c/a.png")
            .unwrap();
        store.save(StorageKey::Name, &"Ada");
        store.save(StorageKey::UploadUrl, &url);
        store.save(StorageKey::UploadDuration, &1.3);
        store.save(StorageKey::CompressionEnabled, &false);

        let loaded = open(&dir).load(SystemTime::now());
        assert_eq!(loaded.name.as_deref(), Some("Ada"));
        assert_eq!(loaded.upload_url, Some(url));
        assert_eq!(loaded.upload_duration, Some(1.3));
        assert_eq!(loaded.compression_enabled, Some(false));
        assert_eq!(loaded.bio, None);
    }

    #[test]
    fn success_message_expires_after_ttl() {
        let dir = TempDir::new("profile_store").unwrap();
        let mut store = open(&dir);
        let saved_at = SystemTime::now();
        store.save_success("Profile saved", saved_at);

        let fresh = store.load(saved_at + Duration::from_secs(299));
        assert_eq!(
            fresh.success.map(|notice| notice.message),
            Some("Profile saved".to_owned())
        );

        let stale = store.load(saved_at + Duration::from_secs(301));
        assert_eq!(stale.success, None);
        assert_eq!(store.inner().get("profileSuccessMessage"), None);
    }

    #[test]
    fn malformed_value_is_ignored() {
        let dir = TempDir::new("profile_store").unwrap();
        let mut store = open(&dir);
        store.save(StorageKey::OriginalSize, &"lots");
        store.save(StorageKey::Bio, &"hello");

        let loaded = store.load(SystemTime::now());
        assert_eq!(loaded.original_size, None);
        assert_eq!(loaded.bio.as_deref(), Some("hello"));
    }

    #[test]
    fn reset_removes_every_key() {
        let dir = TempDir::new("profile_store").unwrap();
        let mut store = open(&dir);
        for key in StorageKey::ALL {
            store.save(key, &json!(null));
        }
        store.reset();

        assert!(open(&dir).inner().entries().is_empty());
    }

    #[test]
    fn success_notice_uses_expected_shape() {
        let notice = SuccessNotice {
            message: "ok".to_owned(),
            timestamp: 42,
        };
        assert_eq!(
            serde_json::to_value(&notice).unwrap(),
            json!({"message": "ok", "timestamp": 42})
        );
    }
}
