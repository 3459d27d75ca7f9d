//! JSON file backed key-value store
//!
//! The whole map lives in memory and is rewritten on every mutation through
//! a temporary file and an atomic rename. Keys and values are hex encoded so
//! arbitrary bytes survive the JSON round trip.

use crate::storage::{has_prefix, KvObject, KvStore, StorageError};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Default file name inside the data directory
pub const STORE_FILE: &str = "store.json";

pub struct FileStore {
    path: PathBuf,
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl FileStore {
    /// Open (or create) the store inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(STORE_FILE);
        let data = if path.exists() {
            Self::load(&path)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let encoded: BTreeMap<String, String> = serde_json::from_reader(reader)?;

        let mut data = BTreeMap::new();
        for (k, v) in encoded {
            let key = hex::decode(&k)
                .map_err(|e| StorageError::InvalidData(format!("bad key {}: {}", k, e)))?;
            let value = hex::decode(&v)
                .map_err(|e| StorageError::InvalidData(format!("bad value for {}: {}", k, e)))?;
            data.insert(key, value);
        }
        Ok(data)
    }

    fn flush(&self, data: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), StorageError> {
        let encoded: BTreeMap<String, String> = data
            .iter()
            .map(|(k, v)| (hex::encode(k), hex::encode(v)))
            .collect();

        // Write to temporary file first
        let temp_path = self.path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &encoded)?;

        // Atomic rename
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn put(&self, objs: Vec<KvObject>) -> Result<(), StorageError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        for obj in objs {
            data.insert(obj.full_key(), obj.value);
        }
        self.flush(&data)
    }

    fn get_by_prefix(&self, prefix: &[u8]) -> Result<Vec<KvObject>, StorageError> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .iter()
            .filter(|(k, _)| has_prefix(k, prefix))
            .map(|(k, v)| KvObject::from_full_key(prefix, k, v.clone()))
            .collect())
    }

    fn delete_by_prefix(&self, prefix: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let before = data.len();
        data.retain(|k, _| !has_prefix(k, prefix));
        if data.len() != before {
            self.flush(&data)?;
        }
        Ok(())
    }
}
