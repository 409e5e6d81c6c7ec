//! Durable key-value storage for device state.
//!
//! The orchestrator records everything it must not lose -- committed
//! artifact provenance and the in-progress update record -- through the
//! [`KeyValueStore`] trait. Two backends are provided:
//!
//! - [`SqliteStore`]: the on-device store, a single `SQLite` file
//! - [`MemoryStore`]: an in-memory map for tests
//!
//! Transactions are closure-scoped: the closure either returns `Ok` and the
//! whole transaction commits, or returns an error and every write inside it
//! is rolled back. Read transactions hand out a shared reference, so the
//! type system keeps them read-only.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Error;

/// Errors from the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested key does not exist.
    ///
    /// This is the one non-fatal kind: callers use it to distinguish
    /// "nothing stored" from a real fault.
    #[error("key not found: {key}")]
    KeyNotFound {
        /// The key that was requested.
        key: String,
    },

    /// Failure in the underlying storage engine.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A write was attempted inside a read-only transaction.
    #[error("write attempted in read-only transaction")]
    ReadOnly,
}

impl StoreError {
    /// Returns `true` for the distinguished absent-key kind.
    #[must_use]
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. })
    }

    pub(crate) fn key_not_found(key: &str) -> Self {
        Self::KeyNotFound {
            key: key.to_string(),
        }
    }
}

/// Operations available inside a store transaction.
///
/// Writes take `&mut self`; a read transaction only hands out
/// `&dyn Transaction`, making mutation unrepresentable there.
pub trait Transaction {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] when the key is absent.
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Writes `value` under `key`, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be performed.
    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Removes the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] when the key is absent.
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// A transactional string-to-bytes store.
pub trait KeyValueStore {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] when the key is absent.
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Writes `value` under `key` in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be performed.
    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Removes `key` in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] when the key is absent.
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    /// Runs `op` inside a read-only transaction.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `op`, or a store error if the
    /// transaction itself cannot be started.
    fn read_transaction(
        &self,
        op: &mut dyn FnMut(&dyn Transaction) -> Result<(), Error>,
    ) -> Result<(), Error>;

    /// Runs `op` inside a write transaction. All writes commit together
    /// when `op` returns `Ok`; any error rolls every one of them back.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `op`, or a store error from the
    /// transaction machinery.
    fn write_transaction(
        &mut self,
        op: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), Error>,
    ) -> Result<(), Error>;
}
