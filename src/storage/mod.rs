//! Key-value storage used for peer persistence
//!
//! This module provides:
//! - The `KvStore` interface (put, prefix scan, prefix delete)
//! - An in-memory store for tests and ephemeral nodes
//! - A JSON file store with atomic writes

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::io;
use thiserror::Error;

/// Separator between an object's prefix and its key
pub const KEY_SEPARATOR: u8 = b':';

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// A stored record, addressed by `prefix:key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvObject {
    pub prefix: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KvObject {
    pub fn new(prefix: &[u8], key: &[u8], value: Vec<u8>) -> Self {
        Self {
            prefix: prefix.to_vec(),
            key: key.to_vec(),
            value,
        }
    }

    /// The full key under which the object is stored
    pub fn full_key(&self) -> Vec<u8> {
        make_key(&self.prefix, &self.key)
    }

    /// Split a full key back into an object
    pub(crate) fn from_full_key(prefix: &[u8], full_key: &[u8], value: Vec<u8>) -> Self {
        let key = full_key
            .get(prefix.len() + 1..)
            .map(|k| k.to_vec())
            .unwrap_or_default();
        Self {
            prefix: prefix.to_vec(),
            key,
            value,
        }
    }
}

pub fn make_key(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(prefix.len() + 1 + key.len());
    full.extend_from_slice(prefix);
    full.push(KEY_SEPARATOR);
    full.extend_from_slice(key);
    full
}

/// Matches keys stored under `prefix`
pub(crate) fn has_prefix(full_key: &[u8], prefix: &[u8]) -> bool {
    full_key.len() > prefix.len()
        && full_key.starts_with(prefix)
        && full_key[prefix.len()] == KEY_SEPARATOR
}

/// Storage collaborator
pub trait KvStore: Send + Sync {
    /// Insert or overwrite a batch of objects
    fn put(&self, objs: Vec<KvObject>) -> Result<(), StorageError>;
    fn get_by_prefix(&self, prefix: &[u8]) -> Result<Vec<KvObject>, StorageError>;
    fn delete_by_prefix(&self, prefix: &[u8]) -> Result<(), StorageError>;
}
