//! Local key-value storage collaborator.
//!
//! The engine persists everything through [`Storage`]: sync flag, recovery
//! phrase, sync id, invites, photos and the local profile copy. Hosts supply
//! one implementation per platform. [`MemoryStorage`] backs tests and
//! ephemeral sessions. [`FileStorage`] keeps a single JSON map on disk.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Storage key: sync enabled flag.
pub const KEY_SYNC_ENABLED: &str = "manylla_sync_enabled";
/// Storage key: recovery phrase.
pub const KEY_RECOVERY_PHRASE: &str = "manylla_recovery_phrase";
/// Storage key: derived sync identifier.
pub const KEY_SYNC_ID: &str = "manylla_sync_id";
/// Storage key: timestamp of the last successful pull.
pub const KEY_LAST_PULL: &str = "manylla_last_pull";
/// Storage key: local invite code map.
pub const KEY_INVITES: &str = "manylla_invites";
/// Storage key: full local profile.
pub const KEY_PROFILE: &str = "manylla_profile";
/// Storage key: device identifier.
pub const KEY_DEVICE_ID: &str = "manylla_device_id";
/// Storage key: device nickname.
pub const KEY_DEVICE_NAME: &str = "manylla_device_name";
/// Storage key prefix for locally held photos.
pub const PHOTO_KEY_PREFIX: &str = "manylla_photos_";

/// Keys removed by `disable()`. Profile, device identity and photos stay.
pub const SYNC_KEYS: &[&str] = &[KEY_SYNC_ENABLED, KEY_RECOVERY_PHRASE, KEY_SYNC_ID, KEY_LAST_PULL, KEY_INVITES];

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt storage file: {0}")]
    Corrupt(String),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Asynchronous string key-value store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a value. `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory storage.
///
/// Writes can be made to fail on demand, which lets tests exercise the
/// "storage write failed" paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set`/`remove` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of every stored key.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Backend("writes are disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// Storage backed by one JSON file.
///
/// The whole map is rewritten on every change through a temporary file and
/// a rename, so a crash never leaves a half-written store behind.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    /// Use (or create on first write) the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store located in the platform data directory.
    pub fn in_data_dir() -> Self {
        Self::new(crate::platform::get_default_store_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| StorageError::Corrupt(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let text = serde_json::to_string_pretty(values)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut values = self.load().await?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut values = self.load().await?;
        if values.remove(key).is_some() {
            self.save(&values).await?;
        }
        Ok(())
    }
}
