//! The access credential and its store.
//!
//! The store is the only writer of the `accessToken` entry. Reads go through a
//! write-through cache so that a `set` is visible to the next request even when
//! the backing storage is slow or failing.

use crate::error::StorageError;
use crate::storage::{KeyValueStore, MemoryStorage};
use parking_lot::RwLock;
use std::sync::Arc;

/// Storage key of the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Opaque bearer token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl From<String> for Credential {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for Credential {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Single source of truth for the current access credential.
#[derive(Debug)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
    current: RwLock<Option<Credential>>,
}

impl CredentialStore {
    /// Open the store, loading any credential already persisted in `backend`.
    pub fn open(backend: Arc<dyn KeyValueStore>) -> Self {
        let current = match backend.get(ACCESS_TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.is_empty()).map(Credential::from),
            Err(e) => {
                tracing::warn!("Failed to load stored credential: {}, starting signed out", e);
                None
            }
        };

        if current.is_some() {
            tracing::debug!("Loaded credential from {}", backend.describe());
        }

        Self {
            backend,
            current: RwLock::new(current),
        }
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryStorage::new()))
    }

    pub fn get(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    /// Overwrite the credential. The in-memory value is updated even if
    /// persisting it fails.
    pub fn set(&self, credential: Credential) -> Result<(), StorageError> {
        let mut current = self.current.write();
        *current = Some(credential.clone());
        self.backend.set(ACCESS_TOKEN_KEY, credential.as_str())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let mut current = self.current.write();
        *current = None;
        self.backend.remove(ACCESS_TOKEN_KEY)
    }

    /// The storage this store persists into.
    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let store = CredentialStore::in_memory();
        assert_eq!(store.get(), None);

        store.set(Credential::new("x")).unwrap();
        assert_eq!(store.get(), Some(Credential::new("x")));
    }

    #[test]
    fn test_clear_then_get() {
        let store = CredentialStore::in_memory();
        store.set(Credential::new("x")).unwrap();
        store.clear().unwrap();
        assert_eq!(store.get(), None);
        // Clearing twice is fine
        store.clear().unwrap();
        assert_eq!(store.get(), None);
    }

    #[test]
    fn test_persists_under_access_token_key() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStorage::new());
        let store = CredentialStore::open(backend.clone());

        store.set(Credential::new("abc")).unwrap();
        assert_eq!(backend.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("abc"));

        let reopened = CredentialStore::open(backend.clone());
        assert_eq!(reopened.get(), Some(Credential::new("abc")));

        store.clear().unwrap();
        assert_eq!(backend.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential::new("super-secret");
        assert!(!format!("{:?}", credential).contains("super-secret"));
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(CredentialStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.set(Credential::new(format!("token-{}", i))).unwrap();
                        assert!(store.get().is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let last = store.get().unwrap();
        assert!(last.as_str().starts_with("token-"));
        assert_eq!(
            store.backend().get(ACCESS_TOKEN_KEY).unwrap().as_deref(),
            Some(last.as_str())
        );
    }
}
