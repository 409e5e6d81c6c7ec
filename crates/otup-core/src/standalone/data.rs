//! The in-progress update record.
//!
//! Present in the store when and only when an update is mid-flight. The
//! record is a small JSON object whose field names are fixed wire literals;
//! it names the update module (`PayloadTypes[0]`) that must service every
//! subsequent commit or rollback, so it must survive process restarts and
//! power loss byte-for-byte.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactHeader;
use crate::context::DeviceContext;
use crate::error::Error;
use crate::store::KeyValueStore;

/// Durable record of an in-progress standalone update.
///
/// Serialized field order is part of the format: `Version`,
/// `ArtifactName`, `ArtifactGroup`, `PayloadTypes`, then the optional
/// fields when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandaloneData {
    /// Record format version; must equal
    /// [`DeviceContext::STANDALONE_DATA_VERSION`].
    #[serde(rename = "Version")]
    pub version: u64,

    /// Name of the artifact being installed.
    #[serde(rename = "ArtifactName")]
    pub artifact_name: String,

    /// Group of the artifact being installed; may be empty.
    #[serde(rename = "ArtifactGroup", default)]
    pub artifact_group: String,

    /// Update module names, one per payload. Exactly one is supported.
    #[serde(rename = "PayloadTypes")]
    pub payload_types: Vec<String>,

    /// Typed-info assertions the artifact provides.
    #[serde(
        rename = "ArtifactTypeInfoProvides",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub artifact_provides: Option<BTreeMap<String, String>>,

    /// Provides-keys the artifact clears on commit.
    #[serde(
        rename = "ArtifactClearsProvides",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub artifact_clears_provides: Option<Vec<String>>,
}

impl StandaloneData {
    /// Builds the record for a freshly parsed artifact header.
    #[must_use]
    pub fn from_header(header: &ArtifactHeader) -> Self {
        Self {
            version: DeviceContext::STANDALONE_DATA_VERSION,
            artifact_name: header.artifact_name.clone(),
            artifact_group: header.artifact_group.clone(),
            payload_types: vec![header.payload_type.clone()],
            artifact_provides: header.artifact_provides.clone(),
            artifact_clears_provides: header.clears_artifact_provides.clone(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.version != DeviceContext::STANDALONE_DATA_VERSION {
            return Err(Error::UnsupportedVersion {
                version: self.version,
            });
        }
        if self.artifact_name.is_empty() {
            return Err(Error::InvalidStateData("`ArtifactName` is empty".to_string()));
        }
        if self.payload_types.is_empty() {
            return Err(Error::InvalidStateData("`PayloadTypes` is empty".to_string()));
        }
        if self.payload_types.len() >= 2 {
            return Err(Error::NotSupported(
                "`PayloadTypes` contains multiple payloads".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads the standalone record from the store.
///
/// Returns `Ok(None)` when no record exists -- no update is in progress.
///
/// # Errors
///
/// Returns an error when the store read fails for any reason other than
/// absence, the record does not parse, or it violates its schema.
pub fn load_standalone_data(store: &dyn KeyValueStore) -> Result<Option<StandaloneData>, Error> {
    let bytes = match store.read(DeviceContext::STANDALONE_STATE_KEY) {
        Ok(bytes) => bytes,
        Err(err) if err.is_key_not_found() => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let data: StandaloneData = serde_json::from_slice(&bytes)?;
    data.validate()?;
    Ok(Some(data))
}

/// Saves the standalone record. Not atomic with any other store mutation.
///
/// # Errors
///
/// Returns an error if serialization or the store write fails.
pub fn save_standalone_data(
    store: &mut dyn KeyValueStore,
    data: &StandaloneData,
) -> Result<(), Error> {
    let serialized = serde_json::to_vec(data)?;
    store
        .write(DeviceContext::STANDALONE_STATE_KEY, &serialized)
        .map_err(Error::from)
}

/// Removes the standalone record. The record must exist.
///
/// # Errors
///
/// Returns an error if the record is absent or the removal fails.
pub fn remove_standalone_data(store: &mut dyn KeyValueStore) -> Result<(), Error> {
    store
        .remove(DeviceContext::STANDALONE_STATE_KEY)
        .map_err(Error::from)
}
