//! Update-module contract.
//!
//! An update module is the pluggable program that actually writes a payload
//! to the device. The orchestrator only depends on the [`UpdateModule`]
//! trait -- nine operations covering install, commit, rollback and the
//! failure hooks -- so tests can substitute an in-memory stub and embedders
//! can bring their own execution strategy. [`external::ExternalModule`]
//! is the standard implementation, invoking an external program.

pub mod external;

pub use external::ExternalModule;

use std::path::Path;

use crate::artifact::{ArtifactHeader, Payload};

/// Whether a reboot is required after installing a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    /// No reboot needed.
    No,
    /// The module reboots the device itself.
    Automatic,
    /// The host must reboot the device.
    Yes,
}

/// Errors reported by an update module.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// The module program could not be started.
    #[error("failed to run update module {module}: {source}")]
    Spawn {
        /// Path of the module program.
        module: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A verb ran but reported failure.
    #[error("update module verb {verb} failed ({status}): {stderr}")]
    VerbFailed {
        /// The verb that failed.
        verb: String,
        /// Exit status description.
        status: String,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// A query verb produced output this client cannot interpret.
    #[error("unexpected output from {verb}: {output:?}")]
    UnexpectedOutput {
        /// The verb that was queried.
        verb: String,
        /// The offending output line.
        output: String,
    },

    /// Filesystem failure while managing the module's work tree.
    #[error("module file tree error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure. Used by embedder-provided implementations.
    #[error("{0}")]
    Other(String),
}

/// The operations an update module implements.
///
/// Every device-modifying step of an update flows through exactly one of
/// these. Implementations must make [`cleanup`](UpdateModule::cleanup)
/// idempotent and tolerant of absent state, since it runs on every failure
/// path regardless of how far the update got.
pub trait UpdateModule {
    /// The per-update working directory this module operates in.
    fn work_dir(&self) -> &Path;

    /// Materializes the working directory layout the module expects.
    /// Undone by [`cleanup`](UpdateModule::cleanup).
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be created.
    fn prepare_file_tree(
        &mut self,
        workdir: &Path,
        header: &ArtifactHeader,
    ) -> Result<(), ModuleError>;

    /// Streams the payload into the module's file tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be stored or the module
    /// rejects it.
    fn download(&mut self, payload: &mut Payload) -> Result<(), ModuleError>;

    /// Writes the payload to the target device.
    ///
    /// # Errors
    ///
    /// Returns an error if installation fails.
    fn artifact_install(&mut self) -> Result<(), ModuleError>;

    /// Reports whether a reboot is required after install.
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot be queried.
    fn needs_reboot(&mut self) -> Result<RebootAction, ModuleError>;

    /// Reports whether the just-installed payload can be rolled back.
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot be queried.
    fn supports_rollback(&mut self) -> Result<bool, ModuleError>;

    /// Makes the installed payload permanent.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails on the device.
    fn artifact_commit(&mut self) -> Result<(), ModuleError>;

    /// Reverts the installed payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback fails.
    fn artifact_rollback(&mut self) -> Result<(), ModuleError>;

    /// Module-defined hook invoked after any failed verb.
    ///
    /// # Errors
    ///
    /// Returns an error if the hook itself fails.
    fn artifact_failure(&mut self) -> Result<(), ModuleError>;

    /// Removes the working directory and any temporary state. Idempotent;
    /// absent state is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if existing state cannot be removed.
    fn cleanup(&mut self) -> Result<(), ModuleError>;
}
