/// Durable key/value persistence underneath the engine
///
/// Raw collections, cache snapshots, the sync queue, the client identity and
/// the cached auth session all live here as JSON values.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Key/value persistence with JSON values.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Replaces the value stored under `key` atomically.
    fn set(&self, key: &str, value: Value) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Typed helpers on top of any [`LocalStore`].
pub trait StoreExt {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>>;
    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()>;
}

impl<S: LocalStore + ?Sized> StoreExt for S {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?)
    }
}

impl<S: LocalStore + ?Sized> LocalStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

/// In-memory store for tests and ephemeral sessions.
///
/// Clones share the same underlying map, so a clone handed to a second
/// engine behaves like the same store surviving a restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

// Encoded keys longer than this are stored under a digest instead
const MAX_ENCODED_KEY_LEN: usize = 128;

/// Directory-backed store: one JSON document per key.
///
/// Writes go to a temporary sibling file that is fsynced and renamed over the
/// target, so a crash leaves either the old or the new value. Keys whose
/// encoded form would make an overlong file name (filtered cache keys, for
/// instance) are stored under their SHA-256 digest, with the original key
/// kept inside the document.
pub struct FileStore {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!("Opened file store at {}", dir.display());
        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> FileSlot {
        let encoded = encode_key(key);
        if encoded.len() <= MAX_ENCODED_KEY_LEN {
            return FileSlot {
                path: self.dir.join(format!("{}.json", encoded)),
                digest: false,
            };
        }
        // Encoded names never contain '.', so digest names cannot collide
        // with them
        let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
        FileSlot {
            path: self.dir.join(format!("{}.digest.json", digest)),
            digest: true,
        }
    }
}

struct FileSlot {
    path: PathBuf,
    digest: bool,
}

/// Document stored under a digest file name
#[derive(Serialize, Deserialize)]
struct DigestEntry {
    key: String,
    value: Value,
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.read();
        let slot = self.file_for(key);
        let path = &slot.path;

        let contents = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value: Value = match serde_json::from_slice(&contents) {
            Ok(value) => value,
            Err(e) => {
                warn!("Discarding unreadable entry {}: {}", path.display(), e);
                return Err(Error::Storage(format!("corrupt entry for key '{}': {}", key, e)));
            }
        };
        if !slot.digest {
            return Ok(Some(value));
        }

        match serde_json::from_value::<DigestEntry>(value) {
            Ok(entry) if entry.key == key => Ok(Some(entry.value)),
            Ok(entry) => {
                warn!("Digest file {} holds key '{}', not '{}'", path.display(), entry.key, key);
                Ok(None)
            }
            Err(e) => Err(Error::Storage(format!("corrupt entry for key '{}': {}", key, e))),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.write();
        let slot = self.file_for(key);
        let path = slot.path;
        let tmp = path.with_extension("json.tmp");

        let bytes = if slot.digest {
            serde_json::to_vec(&DigestEntry {
                key: key.to_string(),
                value,
            })?
        } else {
            serde_json::to_vec(&value)?
        };
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.write();
        match fs::remove_file(self.file_for(key).path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// Keys contain separators such as ':' and '?', so anything outside a safe
// set is percent-encoded into the file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("a").unwrap().is_none());

        store.set("a", json!({"x": 1})).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!({"x": 1})));

        let clone = store.clone();
        clone.remove("a").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_typed_helpers() {
        let store = MemoryStore::new();
        store.set_json("ids", &vec!["a", "b"]).unwrap();
        let ids: Vec<String> = store.get_json("ids").unwrap().unwrap();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set("cache:fees?{\"a\":1}", json!([1, 2, 3])).unwrap();
            store.set("client_id", json!("abc")).unwrap();
            store.remove("client_id").unwrap();
            store.remove("never-written").unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("cache:fees?{\"a\":1}").unwrap(),
            Some(json!([1, 2, 3]))
        );
        assert!(store.get("client_id").unwrap().is_none());
    }

    #[test]
    fn test_file_store_reports_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        assert!(matches!(store.get("broken"), Err(Error::Storage(_))));
    }

    #[test]
    fn test_file_store_long_keys() {
        let dir = TempDir::new().unwrap();
        let ids: Vec<String> = (0..8).map(|_| uuid::Uuid::new_v4().to_string()).collect();
        let key = format!("cache:fees?{{\"student_id\":{}}}", serde_json::to_string(&ids).unwrap());
        assert!(encode_key(&key).len() > 255);

        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set(&key, json!([{"id": "f1"}])).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(json!([{"id": "f1"}])));

        // A different long key maps to a different file
        let other = format!("{}x", key);
        assert!(store.get(&other).unwrap().is_none());

        store.remove(&key).unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("sync_queue"), "sync_queue");
        assert_eq!(encode_key("collection:fees"), "collection%3Afees");
    }
}
