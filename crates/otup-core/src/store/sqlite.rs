//! `SQLite` store backend.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use super::{KeyValueStore, StoreError, Transaction};
use crate::error::Error;

/// A [`KeyValueStore`] backed by a single `SQLite` database file.
///
/// One `kv` table maps keys to blobs. `SQLite`'s own file locking enforces
/// the single-opener requirement on shared stores.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (creating if absent) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("could not create {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(path).map_err(backend)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(backend)?;

        Ok(Self { conn })
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn read_value(conn: &Connection, key: &str) -> Result<Vec<u8>, StoreError> {
    conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
    .map_err(backend)?
    .ok_or_else(|| StoreError::key_not_found(key))
}

fn write_value(conn: &Connection, key: &str, value: &[u8]) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(backend)?;
    Ok(())
}

fn remove_value(conn: &Connection, key: &str) -> Result<(), StoreError> {
    let removed = conn
        .execute("DELETE FROM kv WHERE key = ?1", params![key])
        .map_err(backend)?;
    if removed == 0 {
        return Err(StoreError::key_not_found(key));
    }
    Ok(())
}

struct SqliteTxn<'conn> {
    conn: &'conn Connection,
}

impl Transaction for SqliteTxn<'_> {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        read_value(self.conn, key)
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        write_value(self.conn, key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        remove_value(self.conn, key)
    }
}

impl KeyValueStore for SqliteStore {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        read_value(&self.conn, key)
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        write_value(&self.conn, key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        remove_value(&self.conn, key)
    }

    fn read_transaction(
        &self,
        op: &mut dyn FnMut(&dyn Transaction) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let txn = self
            .conn
            .unchecked_transaction()
            .map_err(|e| Error::Store(backend(e)))?;
        let wrapper = SqliteTxn { conn: &txn };
        op(&wrapper)
        // Read-only: dropping the transaction without commit is fine.
    }

    fn write_transaction(
        &mut self,
        op: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let txn = self
            .conn
            .transaction()
            .map_err(|e| Error::Store(backend(e)))?;
        {
            let mut wrapper = SqliteTxn { conn: &txn };
            // An error drops the transaction, rolling back every write.
            op(&mut wrapper)?;
        }
        txn.commit().map_err(|e| Error::Store(backend(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_read_write_remove() {
        let (_dir, mut store) = open_temp();

        assert!(store.read("missing").unwrap_err().is_key_not_found());

        store.write("key", b"value").unwrap();
        assert_eq!(store.read("key").unwrap(), b"value");

        store.write("key", b"replaced").unwrap();
        assert_eq!(store.read("key").unwrap(), b"replaced");

        store.remove("key").unwrap();
        assert!(store.read("key").unwrap_err().is_key_not_found());
        assert!(store.remove("key").unwrap_err().is_key_not_found());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.write("key", b"persisted").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.read("key").unwrap(), b"persisted");
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("store.db");

        let mut store = SqliteStore::open(&path).unwrap();
        store.write("key", b"value").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_write_transaction_rolls_back_on_error() {
        let (_dir, mut store) = open_temp();
        store.write("stable", b"before").unwrap();

        let result = store.write_transaction(&mut |txn| {
            txn.write("stable", b"after")?;
            txn.write("extra", b"data")?;
            Err(Error::Programming("forced abort".to_string()))
        });
        assert!(result.is_err());

        assert_eq!(store.read("stable").unwrap(), b"before");
        assert!(store.read("extra").unwrap_err().is_key_not_found());
    }

    #[test]
    fn test_write_transaction_commits_all_writes() {
        let (_dir, mut store) = open_temp();

        store
            .write_transaction(&mut |txn| {
                txn.write("a", b"1")?;
                txn.remove("a").map_err(Error::from)?;
                txn.write("b", b"2")?;
                Ok(())
            })
            .unwrap();

        assert!(store.read("a").unwrap_err().is_key_not_found());
        assert_eq!(store.read("b").unwrap(), b"2");
    }

    #[test]
    fn test_read_transaction_reads_consistently() {
        let (_dir, mut store) = open_temp();
        store.write("a", b"1").unwrap();
        store.write("b", b"2").unwrap();

        let mut values = Vec::new();
        store
            .read_transaction(&mut |txn| {
                values.push(txn.read("a").map_err(Error::from)?);
                values.push(txn.read("b").map_err(Error::from)?);
                Ok(())
            })
            .unwrap();
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);
    }
}
