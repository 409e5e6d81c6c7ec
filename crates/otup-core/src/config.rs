//! Device configuration.
//!
//! A small set of filesystem paths, loaded from a JSON config file. A
//! missing file is not an error; the defaults match the standard on-device
//! layout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;

fn default_data_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/otup")
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("/usr/share/otup/modules/v3")
}

fn default_modules_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/otup/modules/v3")
}

fn default_artifact_scripts_dir() -> PathBuf {
    PathBuf::from("/var/lib/otup/scripts")
}

fn default_device_type_file() -> PathBuf {
    PathBuf::from("/var/lib/otup/device_type")
}

/// Paths the update client operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Directory holding the device-wide key-value store.
    #[serde(default = "default_data_store_dir")]
    pub data_store_dir: PathBuf,

    /// Directory holding the installed update module programs.
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// Root of the per-update module work directories.
    #[serde(default = "default_modules_work_dir")]
    pub modules_work_dir: PathBuf,

    /// Destination for state scripts carried inside artifacts.
    #[serde(default = "default_artifact_scripts_dir")]
    pub artifact_scripts_dir: PathBuf,

    /// File naming this device's type, as `device_type=<name>`.
    #[serde(default = "default_device_type_file")]
    pub device_type_file: PathBuf,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            data_store_dir: default_data_store_dir(),
            modules_dir: default_modules_dir(),
            modules_work_dir: default_modules_work_dir(),
            artifact_scripts_dir: default_artifact_scripts_dir(),
            device_type_file: default_device_type_file(),
        }
    }
}

impl UpdaterConfig {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields the defaults; unset fields fall back to their
    /// defaults individually.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file exists but cannot be read
    /// or parsed.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("could not read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("could not parse {}: {e}", path.display())))
    }
}
