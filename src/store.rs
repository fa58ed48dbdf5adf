//! Injected key-value storage.
//!
//! The overlay keeps no storage engine of its own. Pins (and anything else that
//! must survive restarts) go through [`KeyValueStore`], namespaced by a short
//! string. [`MemoryStore`] backs tests and ephemeral nodes; [`FileStore`] keeps
//! one file per key under a directory.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};

pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Writes only when `key` is absent. Returns whether the write happened.
    /// Must be atomic with respect to concurrent callers.
    fn put_if_absent(&self, namespace: &str, key: &str, value: &[u8]) -> Result<bool>;

    fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn put_if_absent(&self, namespace: &str, key: &str, value: &[u8]) -> Result<bool> {
        let mut entries = self.entries.write();
        let slot = (namespace.to_string(), key.to_string());
        if entries.contains_key(&slot) {
            return Ok(false);
        }
        entries.insert(slot, value.to_vec());
        Ok(true)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.entries
            .write()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, k)| k.clone())
            .collect())
    }
}

/// `<root>/<namespace>/<hex(key)>`, one file per value.
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store at {}", root.display()))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(hex::encode(key.as_bytes()))
    }

    fn write_atomic(&self, path: &Path, value: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("failed to commit {}", path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(namespace, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read store entry"),
        }
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write_atomic(&self.path_for(namespace, key), value)
    }

    fn put_if_absent(&self, namespace: &str, key: &str, value: &[u8]) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(namespace, key);
        if path.exists() {
            return Ok(false);
        }
        self.write_atomic(&path, value)?;
        Ok(true)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.path_for(namespace, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to delete store entry"),
        }
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let dir = self.root.join(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("failed to list store namespace"),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Ok(bytes) = hex::decode(name)
                && let Ok(key) = String::from_utf8(bytes)
            {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
