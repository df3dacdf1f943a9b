use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Possible session store errors.
#[derive(Debug)]
pub enum SessionStoreError {
    Io(std::io::Error),
    Serde(serde_json::Error),
}

/// Key-value store the engine persists session state in.
///
/// Raw-byte and JSON accessors; `get*` returns `Ok(None)` for missing keys.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), SessionStoreError>;
    fn delete(&self, key: &str) -> Result<(), SessionStoreError>;
}

/// JSON conveniences over the raw accessors.
pub trait SessionStoreExt {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SessionStoreError>;
    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SessionStoreError>;
}

impl<S: SessionStore + ?Sized> SessionStoreExt for S {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SessionStoreError> {
        match self.get(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(SessionStoreError::Serde)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SessionStoreError> {
        let bytes = serde_json::to_vec(value).map_err(SessionStoreError::Serde)?;
        self.set(key, &bytes)
    }
}

/// `SessionStore` writing each key to a file under a directory.
pub struct FileSessionStore {
    directory: PathBuf,
}

impl FileSessionStore {
    pub fn new(directory: &Path) -> Result<FileSessionStore, SessionStoreError> {
        std::fs::create_dir_all(directory).map_err(SessionStoreError::Io)?;
        Ok(FileSessionStore {
            directory: directory.to_path_buf(),
        })
    }

    // keys contain ':' which some filesystems dislike
    fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(key.replace(':', "_"))
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SessionStoreError::Io(err)),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), SessionStoreError> {
        std::fs::write(self.path_for(key), value).map_err(SessionStoreError::Io)
    }

    fn delete(&self, key: &str) -> Result<(), SessionStoreError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionStoreError::Io(err)),
        }
    }
}

/// In-memory `SessionStore` used by tests and ephemeral hosts.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> MemorySessionStore {
        MemorySessionStore::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), SessionStoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), SessionStoreError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
