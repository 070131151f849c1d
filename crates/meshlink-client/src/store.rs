//! Persistence adapter
//!
//! The host supplies a plain string key-value store ([`StateStorage`]).
//! [`StateStore`] layers the two things the control plane persists on top
//! of it: the node credential and the instance ownership token.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Host-supplied key-value store
pub trait StateStorage: Send + Sync {
    /// Persist a value. Failures are the implementation's concern.
    fn set_state(&self, id: &str, value: &str);

    /// Read a value; the empty string when absent
    fn get_state(&self, id: &str) -> String;
}

/// In-process storage, shareable between clients through an `Arc`
#[derive(Debug, Default)]
pub struct MemoryStateStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStorage for MemoryStateStorage {
    fn set_state(&self, id: &str, value: &str) {
        self.entries().insert(id.to_string(), value.to_string());
    }

    fn get_state(&self, id: &str) -> String {
        self.entries().get(id).cloned().unwrap_or_default()
    }
}

/// Storage backed by a single JSON document on disk.
///
/// Every write rewrites the whole file; the last write wins.
#[derive(Debug)]
pub struct FileStateStorage {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStateStorage {
    /// Open the store at `path`, loading existing entries if the file exists
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) -> io::Result<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, json)
    }
}

impl StateStorage for FileStateStorage {
    fn set_state(&self, id: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(id.to_string(), value.to_string());

        if let Err(e) = self.persist(&entries) {
            warn!("Failed to write state file {:?}: {}", self.path, e);
        }
    }

    fn get_state(&self, id: &str) -> String {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(id).cloned().unwrap_or_default()
    }
}

/// Control-plane view of the host storage
#[derive(Clone, Default)]
pub struct StateStore {
    storage: Option<Arc<dyn StateStorage>>,
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

impl StateStore {
    /// Key holding the node credential
    pub const CREDENTIAL_KEY: &'static str = "_credential";
    /// Key holding the token of the instance that owns the stored identity
    pub const OWNER_KEY: &'static str = "_owner";

    pub fn new(storage: Option<Arc<dyn StateStorage>>) -> Self {
        Self { storage }
    }

    /// False when no storage was configured; nothing survives a restart
    pub fn is_persistent(&self) -> bool {
        self.storage.is_some()
    }

    fn get(&self, key: &str) -> Option<String> {
        let value = self.storage.as_ref()?.get_state(key);
        (!value.is_empty()).then_some(value)
    }

    fn set(&self, key: &str, value: &str) {
        if let Some(storage) = &self.storage {
            storage.set_state(key, value);
        }
    }

    /// Persisted node credential, if any
    pub fn credential(&self) -> Option<String> {
        self.get(Self::CREDENTIAL_KEY)
    }

    pub fn set_credential(&self, credential: &str) {
        debug!("Persisting node credential");
        self.set(Self::CREDENTIAL_KEY, credential);
    }

    pub fn clear_credential(&self) {
        self.set(Self::CREDENTIAL_KEY, "");
    }

    /// Record `token` as the owner of the stored identity
    pub fn claim(&self, token: &str) {
        self.set(Self::OWNER_KEY, token);
    }

    /// Whether `token` still owns the stored identity.
    ///
    /// Always true without storage, since no other instance can share it.
    pub fn is_owned_by(&self, token: &str) -> bool {
        match &self.storage {
            Some(storage) => storage.get_state(Self::OWNER_KEY) == token,
            None => true,
        }
    }

    /// Drop ownership, unless another instance has taken it over since
    pub fn release(&self, token: &str) {
        if self.storage.is_some() && self.is_owned_by(token) {
            self.set(Self::OWNER_KEY, "");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_absent_is_empty() {
        let storage = MemoryStateStorage::new();
        assert_eq!(storage.get_state("missing"), "");

        storage.set_state("k", "v");
        assert_eq!(storage.get_state("k"), "v");
    }

    #[test]
    fn test_credential_roundtrip_treats_empty_as_absent() {
        let store = StateStore::new(Some(Arc::new(MemoryStateStorage::new())));
        assert_eq!(store.credential(), None);

        store.set_credential("cred-123");
        assert_eq!(store.credential().as_deref(), Some("cred-123"));

        store.clear_credential();
        assert_eq!(store.credential(), None);
    }

    #[test]
    fn test_store_without_storage() {
        let store = StateStore::new(None);
        assert!(!store.is_persistent());

        store.set_credential("cred-123");
        assert_eq!(store.credential(), None);
        assert!(store.is_owned_by("anything"));
    }

    #[test]
    fn test_release_keeps_foreign_owner() {
        let storage = Arc::new(MemoryStateStorage::new());
        let store = StateStore::new(Some(storage.clone()));

        store.claim("token-a");
        assert!(store.is_owned_by("token-a"));

        // A second instance takes over
        store.claim("token-b");
        assert!(!store.is_owned_by("token-a"));

        store.release("token-a");
        assert_eq!(storage.get_state(StateStore::OWNER_KEY), "token-b");

        store.release("token-b");
        assert_eq!(storage.get_state(StateStore::OWNER_KEY), "");
    }

    #[test]
    fn test_file_storage_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        {
            let storage = FileStateStorage::open(&path).unwrap();
            storage.set_state(StateStore::CREDENTIAL_KEY, "cred-abc");
            storage.set_state("other", "1");
        }

        let reopened = FileStateStorage::open(&path).unwrap();
        assert_eq!(reopened.get_state(StateStore::CREDENTIAL_KEY), "cred-abc");
        assert_eq!(reopened.get_state("other"), "1");
        assert_eq!(reopened.get_state("missing"), "");
    }

    #[test]
    fn test_file_storage_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();

        let err = FileStateStorage::open(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
