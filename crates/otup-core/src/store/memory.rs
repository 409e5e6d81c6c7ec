//! In-memory store backend for tests.

use std::collections::HashMap;

use super::{KeyValueStore, StoreError, Transaction};
use crate::error::Error;

/// A [`KeyValueStore`] holding everything in a `HashMap`.
///
/// Write transactions snapshot the map up front and restore it on error.
/// Simple, but all the atomicity the orchestrator needs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryTxn<'a> {
    map: &'a mut HashMap<String, Vec<u8>>,
}

impl Transaction for MemoryTxn<'_> {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.map
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::key_not_found(key))
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.map
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::key_not_found(key))
    }
}

struct MemoryReadTxn<'a> {
    map: &'a HashMap<String, Vec<u8>>,
}

impl Transaction for MemoryReadTxn<'_> {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.map
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::key_not_found(key))
    }

    fn write(&mut self, _key: &str, _value: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn remove(&mut self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.map
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::key_not_found(key))
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.map
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::key_not_found(key))
    }

    fn read_transaction(
        &self,
        op: &mut dyn FnMut(&dyn Transaction) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let txn = MemoryReadTxn { map: &self.map };
        op(&txn)
    }

    fn write_transaction(
        &mut self,
        op: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let backup = self.map.clone();
        let result = {
            let mut txn = MemoryTxn { map: &mut self.map };
            op(&mut txn)
        };
        if result.is_err() {
            self.map = backup;
        }
        result
    }
}
