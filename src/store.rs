//! Durable key-value storage for the persisted analysis registers.
//!
//! Only single byte values are stored: the quadrant split and the eight burner
//! coordinates. [`YamlFileStore`] keeps them in a small YAML document that is
//! rewritten on every accepted write.

use crate::error::StoreError;
use log::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<u8>;
    fn put(&mut self, key: &str, value: u8) -> Result<(), StoreError>;
}

/// Volatile store, for tests and emulators without a backing file.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, u8)>,
        K: Into<String>,
    {
        Self {
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<u8> {
        self.values.get(key).copied()
    }

    fn put(&mut self, key: &str, value: u8) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Debug)]
pub struct YamlFileStore {
    path: PathBuf,
    values: BTreeMap<String, u8>,
}

impl YamlFileStore {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            debug!("Loading store from {path:?}");
            let text = std::fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_yaml::from_str(&text)?
            }
        } else {
            info!("Store {path:?} does not exist yet, starting empty");
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        let file = File::create(&self.path)?;
        serde_yaml::to_writer(file, &self.values)?;
        Ok(())
    }
}

impl KeyValueStore for YamlFileStore {
    fn get(&self, key: &str) -> Option<u8> {
        self.values.get(key).copied()
    }

    fn put(&mut self, key: &str, value: u8) -> Result<(), StoreError> {
        if self.values.get(key) == Some(&value) {
            return Ok(());
        }
        self.values.insert(key.to_string(), value);
        self.flush()
    }
}
