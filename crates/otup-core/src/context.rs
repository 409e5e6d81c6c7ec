//! Device context: the durable view of what is installed.
//!
//! [`DeviceContext`] owns the device-wide key-value store and exposes the
//! committed artifact provenance (what the device currently runs) and the
//! commit path that updates it. The standalone state engine reads and
//! writes its in-progress record through the same store so that both can
//! change in one transaction.

use std::collections::BTreeMap;

use tracing::info;

use crate::config::UpdaterConfig;
use crate::error::Error;
use crate::store::{KeyValueStore, SqliteStore, StoreError, Transaction};

/// Committed artifact provenance as one flat string-to-string mapping.
pub type ProvidesData = BTreeMap<String, String>;

/// Mutation run inside the provenance commit transaction.
pub type AuxiliaryMutation<'a> = dyn FnMut(&mut dyn Transaction) -> Result<(), Error> + 'a;

/// File name of the key-value store inside the data store directory.
const STORE_FILE_NAME: &str = "mender-store";

/// Owns the device-wide store and the committed artifact provenance.
pub struct DeviceContext {
    config: UpdaterConfig,
    store: Box<dyn KeyValueStore>,
}

impl DeviceContext {
    /// Store key holding the committed artifact name.
    pub const ARTIFACT_NAME_KEY: &'static str = "artifact_name";
    /// Store key holding the committed artifact group.
    pub const ARTIFACT_GROUP_KEY: &'static str = "artifact_group";
    /// Store key holding the committed provides mapping, serialized JSON.
    pub const ARTIFACT_PROVIDES_KEY: &'static str = "artifact_provides";
    /// Store key holding the in-progress update record.
    pub const STANDALONE_STATE_KEY: &'static str = "standalone_state_key";
    /// Stale key from authenticated mode, cleared on open.
    pub const AUTH_TOKEN_KEY: &'static str = "auth_token";
    /// Stale key from authenticated mode, cleared on open.
    pub const AUTH_TOKEN_CACHE_INVALIDATOR_KEY: &'static str = "auth_token_cache_invalidator";

    /// Suffix recorded on the artifact name when an install failed on a
    /// device that could not roll back.
    pub const BROKEN_ARTIFACT_NAME_SUFFIX: &'static str = "_INCONSISTENT";
    /// Version of the standalone state record this client writes.
    pub const STANDALONE_DATA_VERSION: u64 = 1;

    /// Opens the context against the configured data store directory.
    ///
    /// Creates `<data_store_dir>/mender-store` if absent and clears stale
    /// `auth_token` keys left by a previous authenticated session. Opening an
    /// already-initialized store is a no-op beyond that.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or a stale key
    /// removal fails for a reason other than absence.
    pub fn open(config: UpdaterConfig) -> Result<Self, Error> {
        let path = config.data_store_dir.join(STORE_FILE_NAME);
        let store = SqliteStore::open(&path)?;
        Self::with_store(config, Box::new(store))
    }

    /// Builds a context on an already-open store.
    ///
    /// Performs the same stale-key cleanup as [`DeviceContext::open`].
    ///
    /// # Errors
    ///
    /// Returns an error if a stale key removal fails for a reason other
    /// than absence.
    pub fn with_store(
        config: UpdaterConfig,
        store: Box<dyn KeyValueStore>,
    ) -> Result<Self, Error> {
        let mut ctx = Self { config, store };
        ctx.clear_stale_auth_keys()?;
        Ok(ctx)
    }

    fn clear_stale_auth_keys(&mut self) -> Result<(), Error> {
        for key in [Self::AUTH_TOKEN_KEY, Self::AUTH_TOKEN_CACHE_INVALIDATOR_KEY] {
            match self.store.remove(key) {
                Ok(()) => info!(key, "Removed stale auth entry from store"),
                // Absent keys are the common case, not a fault.
                Err(err) if err.is_key_not_found() => {},
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// The configuration this context was opened with.
    #[must_use]
    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Shared access to the underlying store.
    #[must_use]
    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    /// Mutable access to the underlying store.
    pub fn store_mut(&mut self) -> &mut dyn KeyValueStore {
        self.store.as_mut()
    }

    /// Loads the committed artifact provenance.
    ///
    /// Reads the three provenance keys in one read transaction; missing
    /// keys are treated as empty. The result is a flat mapping of
    /// `artifact_name`, `artifact_group` and every deserialized provides
    /// entry, with empty values omitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails, the serialized provides
    /// mapping is not valid JSON, or any of its values is not a string.
    pub fn load_provides(&self) -> Result<ProvidesData, Error> {
        let mut artifact_name = String::new();
        let mut artifact_group = String::new();
        let mut provides_str = String::new();

        self.store.read_transaction(&mut |txn| {
            artifact_name = read_string_or_empty(txn, Self::ARTIFACT_NAME_KEY)?;
            artifact_group = read_string_or_empty(txn, Self::ARTIFACT_GROUP_KEY)?;
            provides_str = read_string_or_empty(txn, Self::ARTIFACT_PROVIDES_KEY)?;
            Ok(())
        })?;

        let mut provides = ProvidesData::new();
        if !artifact_name.is_empty() {
            provides.insert("artifact_name".to_string(), artifact_name);
        }
        if !artifact_group.is_empty() {
            provides.insert("artifact_group".to_string(), artifact_group);
        }
        if provides_str.is_empty() {
            return Ok(provides);
        }

        let value: serde_json::Value = serde_json::from_str(&provides_str)?;
        let object = value.as_object().ok_or_else(|| {
            Error::TypeMismatch("stored provides is not an object".to_string())
        })?;
        for (key, entry) in object {
            let entry = entry.as_str().ok_or_else(|| {
                Error::TypeMismatch("unexpected non-string data in provides".to_string())
            })?;
            provides.insert(key.clone(), entry.to_string());
        }

        Ok(provides)
    }

    /// Commits new artifact provenance in a single write transaction.
    ///
    /// Within the transaction: existing provides entries matching any
    /// pattern in `clears_provides` are dropped, the new name, group and
    /// provides entries are written, and `aux` runs last. Either all of it
    /// commits or none of it does.
    ///
    /// # Errors
    ///
    /// Returns the first error raised inside the transaction; in that case
    /// no mutation is applied.
    pub fn commit_artifact_data(
        &mut self,
        artifact_name: &str,
        artifact_group: &str,
        provides: Option<&BTreeMap<String, String>>,
        clears_provides: Option<&[String]>,
        aux: &mut AuxiliaryMutation<'_>,
    ) -> Result<(), Error> {
        self.store.write_transaction(&mut |txn| {
            let existing = read_string_or_empty(txn, Self::ARTIFACT_PROVIDES_KEY)?;
            let mut merged: BTreeMap<String, String> = if existing.is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&existing)?
            };

            if let Some(patterns) = clears_provides {
                merged.retain(|key, _| !patterns.iter().any(|p| provides_matches(p, key)));
            }
            if let Some(new_provides) = provides {
                for (key, value) in new_provides {
                    merged.insert(key.clone(), value.clone());
                }
            }

            txn.write(Self::ARTIFACT_NAME_KEY, artifact_name.as_bytes())?;
            txn.write(Self::ARTIFACT_GROUP_KEY, artifact_group.as_bytes())?;
            let serialized = serde_json::to_string(&merged)?;
            txn.write(Self::ARTIFACT_PROVIDES_KEY, serialized.as_bytes())?;

            aux(txn)
        })
    }

    /// Reads this device's type from the configured `device_type` file.
    ///
    /// The file holds a single `device_type=<name>` line.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds no
    /// `device_type` entry.
    pub fn get_device_type(&self) -> Result<String, Error> {
        read_device_type(&self.config.device_type_file)
    }
}

/// Reads a `device_type=<name>` file.
pub(crate) fn read_device_type(path: &std::path::Path) -> Result<String, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("could not read {}", path.display()), e))?;

    content
        .lines()
        .find_map(|line| line.strip_prefix("device_type="))
        .map(|value| value.trim().to_string())
        .ok_or_else(|| Error::Config(format!("no device_type entry in {}", path.display())))
}

/// Matches a clears-provides pattern against a provides key.
///
/// Patterns are concrete keys or glob-style wildcards (`rootfs-image.*`).
/// A malformed pattern falls back to literal comparison.
fn provides_matches(pattern: &str, key: &str) -> bool {
    glob::Pattern::new(pattern).map_or(pattern == key, |p| p.matches(key))
}

fn read_string_or_empty(txn: &dyn Transaction, key: &str) -> Result<String, StoreError> {
    match txn.read(key) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.is_key_not_found() => Ok(String::new()),
        Err(err) => Err(err),
    }
}
