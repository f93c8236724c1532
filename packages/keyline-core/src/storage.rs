//! Client-side key/value storage with platform keyring and file-based fallback.
//!
//! Storage priority:
//! 1. Platform keyring (if `keyring-storage` feature enabled and available)
//! 2. File-based storage (JSON object, owner read/write only on Unix)
//!
//! All backends are synchronous; values are read and written in place so a
//! `set` is visible to the very next `get`.

use crate::error::StorageError;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(feature = "keyring-storage")]
use keyring::Entry;

/// Service name used for keyring storage
#[cfg(feature = "keyring-storage")]
const KEYRING_SERVICE: &str = "keyline";

/// File name of the file-based store inside the config directory
const STORAGE_FILE: &str = ".credentials";

/// Synchronous string key/value storage.
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    /// Human readable location, for `keyline status` and `keyline config`.
    fn describe(&self) -> String;
}

/// Get the keyline config directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    let dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| StorageError::Unavailable("failed to find config directory".into()))?;
    Ok(dir.join("keyline"))
}

// ============================================================================
// In-memory storage
// ============================================================================

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        "In-memory storage".to_string()
    }
}

// ============================================================================
// File-based storage (always available)
// ============================================================================

/// JSON object on disk. Every operation reads and rewrites the whole file
/// under a process-wide lock.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `~/.config/keyline/.credentials`
    pub fn default_location() -> Result<Self, StorageError> {
        Ok(Self::new(config_dir()?.join(STORAGE_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if map.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
            }
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string(map)?;

        // Set restrictive permissions on Unix before writing
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600) // Owner read/write only
                .open(&self.path)?;
            let mut file = std::io::BufWriter::new(file);
            file.write_all(json.as_bytes())?;
            file.flush()?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.path, &json)?;
        }

        Ok(())
    }
}

impl KeyValueStore for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)?;
        tracing::debug!("Stored '{}' in {:?}", key, self.path);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
            tracing::debug!("Removed '{}' from {:?}", key, self.path);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("File-based storage: {}", self.path.display())
    }
}

// ============================================================================
// Keyring-based storage (optional, platform-specific)
// ============================================================================

/// One keychain entry per key, with the file store as fallback when the
/// platform keychain is missing or refuses the operation.
#[cfg(feature = "keyring-storage")]
#[derive(Debug)]
pub struct KeyringStorage {
    fallback: FileStorage,
}

#[cfg(feature = "keyring-storage")]
impl KeyringStorage {
    pub fn new(fallback: FileStorage) -> Self {
        Self { fallback }
    }

    fn entry(key: &str) -> Result<Entry, StorageError> {
        tracing::trace!(
            "Creating keyring entry for service='{}', user='{}'",
            KEYRING_SERVICE,
            key
        );
        Entry::new(KEYRING_SERVICE, key).map_err(|e| StorageError::Keychain(e.to_string()))
    }
}

#[cfg(feature = "keyring-storage")]
impl KeyValueStore for KeyringStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entry = match Self::entry(key) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("{}, trying file fallback", e);
                return self.fallback.get(key);
            }
        };

        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("No '{}' in keyring, trying file fallback", key);
                self.fallback.get(key)
            }
            Err(e) => {
                tracing::warn!("Failed to read '{}' from keyring: {}, trying file fallback", key, e);
                self.fallback.get(key)
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let entry = match Self::entry(key) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("{}, using file storage", e);
                return self.fallback.set(key, value);
            }
        };

        if let Err(e) = entry.set_password(value) {
            tracing::warn!("Failed to save '{}' to keyring: {}, using file storage", key, e);
            return self.fallback.set(key, value);
        }

        // A stale file copy would shadow a later keyring miss
        if let Err(e) = self.fallback.remove(key) {
            tracing::debug!("Failed to drop file copy of '{}': {}", key, e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        // Always delete from file as well
        self.fallback.remove(key)?;

        // The file copy is gone; an unusable keychain cannot hold one either
        let entry = match Self::entry(key) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("{}, removed file copy only", e);
                return Ok(());
            }
        };
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => {
                tracing::warn!("Failed to delete '{}' from keyring: {}, removed file copy only", key, e);
                Ok(())
            }
        }
    }

    fn describe(&self) -> String {
        #[cfg(target_os = "windows")]
        let platform = "Windows Credential Manager";
        #[cfg(target_os = "macos")]
        let platform = "macOS Keychain";
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        let platform = "Linux Secret Service (GNOME Keyring/KWallet)";

        format!("{} (with file fallback: {})", platform, self.fallback.path.display())
    }
}

/// Storage backend selected by the enabled features.
pub fn default_storage() -> Result<Arc<dyn KeyValueStore>, StorageError> {
    let file = FileStorage::default_location()?;

    #[cfg(feature = "keyring-storage")]
    let storage: Arc<dyn KeyValueStore> = Arc::new(KeyringStorage::new(file));

    #[cfg(not(feature = "keyring-storage"))]
    let storage: Arc<dyn KeyValueStore> = Arc::new(file);

    Ok(storage)
}

/// Describe where [`default_storage`] keeps its data.
pub fn storage_info() -> String {
    default_storage()
        .map(|s| s.describe())
        .unwrap_or_else(|_| "File-based storage: ~/.config/keyline/.credentials".to_string())
}
