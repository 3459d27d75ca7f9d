//! In-memory key-value store

use crate::storage::{has_prefix, KvObject, KvStore, StorageError};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Ordered map behind a mutex
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn put(&self, objs: Vec<KvObject>) -> Result<(), StorageError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        for obj in objs {
            data.insert(obj.full_key(), obj.value);
        }
        Ok(())
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
        data.retain(|k, _| !has_prefix(k, prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_scan() {
        let store = MemoryStore::new();
        store
            .put(vec![
                KvObject::new(b"address", b"a", b"1".to_vec()),
                KvObject::new(b"address", b"b", b"2".to_vec()),
                KvObject::new(b"other", b"a", b"3".to_vec()),
            ])
            .unwrap();

        let found = store.get_by_prefix(b"address").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].key, b"a".to_vec());
        assert_eq!(found[1].value, b"2".to_vec());
    }

    #[test]
    fn test_delete_by_prefix() {
        let store = MemoryStore::new();
        store
            .put(vec![
                KvObject::new(b"address", b"a", vec![]),
                KvObject::new(b"other", b"a", vec![]),
            ])
            .unwrap();

        store.delete_by_prefix(b"address").unwrap();
        assert!(store.get_by_prefix(b"address").unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }
}
