use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::KeyValueStore;
use crate::{ProfileError, Result};

const STORAGE_VERSION: i32 = 1;

/// Key-value store persisted as a single JSON document.
///
/// Every mutation rewrites the whole file through a temporary file in the
/// same directory, so a crash leaves either the old or the new document.
pub struct JsonFileStore {
    label: String,
    path: PathBuf,
    data: JsonFileStoreData,
}

/// The document that is serialized to disk.
#[derive(Serialize, Deserialize)]
struct JsonFileStoreData {
    version: i32,
    entries: BTreeMap<String, Value>,
}

impl Default for JsonFileStoreData {
    fn default() -> Self {
        Self {
            version: STORAGE_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl JsonFileStore {
    /// Open a store with a diagnostic label and file path.
    ///
    /// A missing, unreadable or incompatible file yields an empty store.
    pub fn open(label: String, path: &Path) -> Self {
        let mut store = Self {
            label,
            path: PathBuf::from(path),
            data: JsonFileStoreData::default(),
        };
        if store.path.exists() {
            match store.read_fs() {
                Ok(entries) => store.data.entries = entries,
                Err(e) => log::warn!(
                    "{}: ignoring unreadable storage {}: {}",
                    store.label,
                    store.path.display(),
                    e
                ),
            }
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the data from the storage file
    fn read_fs(&self) -> Result<BTreeMap<String, Value>> {
        let file = File::open(&self.path)?;
        let data: JsonFileStoreData = serde_json::from_reader(file)
            .map_err(|err| {
                ProfileError::Storage(self.label.clone(), err.to_string())
            })?;
        if data.version != STORAGE_VERSION {
            return Err(ProfileError::Storage(
                self.label.clone(),
                format!(
                    "Storage version mismatch: expected {}, got {}",
                    STORAGE_VERSION, data.version
                ),
            ));
        }
        log::debug!(
            "{}: {} entries read from {}",
            self.label,
            data.entries.len(),
            self.path.display()
        );
        Ok(data.entries)
    }

    /// Write the data to the storage file
    fn write_fs(&self) -> Result<()> {
        let parent_dir = self.path.parent().ok_or_else(|| {
            ProfileError::Storage(
                self.label.clone(),
                "Failed to get parent directory".to_owned(),
            )
        })?;
        fs::create_dir_all(parent_dir)?;

        let tmp_name: String = std::iter::repeat_with(fastrand::alphanumeric)
            .take(10)
            .collect();
        let tmp_path = parent_dir.join(format!(".{}.tmp", tmp_name));
        let written = (|| -> Result<()> {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            serde_json::to_writer(&mut writer, &self.data)?;
            writer.flush()?;
            writer
                .into_inner()
                .map_err(|e| e.into_error())?
                .sync_data()?;
            fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })();
        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written?;

        log::info!(
            "{}: {} entries have been written",
            self.label,
            self.data.entries.len()
        );
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.data.entries.insert(key.to_owned(), value);
        self.write_fs()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.data.entries.remove(key).is_none() {
            return Ok(());
        }
        self.write_fs()
    }

    fn entries(&self) -> BTreeMap<String, Value> {
        self.data.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempdir::TempDir;

    #[test]
    fn values_survive_reopen() {
        let dir = TempDir::new("profile_storage").unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let mut store = JsonFileStore::open("test".to_owned(), &path);
        store.set("profileName", json!("Ada")).unwrap();
        store.set("profileDarkTheme", json!(true)).unwrap();
        store.set("profileOriginalSize", json!(1024)).unwrap();

        let reopened = JsonFileStore::open("test".to_owned(), &path);
        assert_eq!(reopened.get("profileName"), Some(json!("Ada")));
        assert_eq!(reopened.get("profileDarkTheme"), Some(json!(true)));
        assert_eq!(reopened.get("profileOriginalSize"), Some(json!(1024)));
        assert_eq!(reopened.entries().len(), 3);
    }

    #[test]
    fn remove_persists() {
        let dir = TempDir::new("profile_storage").unwrap();
        let path = dir.path().join("storage.json");

        let mut store = JsonFileStore::open("test".to_owned(), &path);
        store.set("a", json!(1)).unwrap();
        store.set("b", json!(2)).unwrap();
        store.remove("a").unwrap();
        store.remove("missing").unwrap();

        let reopened = JsonFileStore::open("test".to_owned(), &path);
        assert_eq!(reopened.get("a"), None);
        assert_eq!(reopened.get("b"), Some(json!(2)));
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let dir = TempDir::new("profile_storage").unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "{ definitely not json").unwrap();

        let store = JsonFileStore::open("test".to_owned(), &path);
        assert!(store.entries().is_empty());
    }

    #[test]
    fn version_mismatch_opens_empty() {
        let dir = TempDir::new("profile_storage").unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, r#"{"version": 99, "entries": {"a": 1}}"#).unwrap();

        let store = JsonFileStore::open("test".to_owned(), &path);
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let dir = TempDir::new("profile_storage").unwrap();
        let path = dir.path().join("storage.json");

        let mut store = JsonFileStore::open("test".to_owned(), &path);
        for i in 0..5 {
            store.set("counter", json!(i)).unwrap();
        }

        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn unwritable_location_reports_error() {
        let dir = TempDir::new("profile_storage").unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();

        let mut store =
            JsonFileStore::open("test".to_owned(), &blocker.join("s.json"));
        assert!(store.set("a", json!(1)).is_err());
        // the in-memory value is still visible
        assert_eq!(store.get("a"), Some(json!(1)));
    }
}
