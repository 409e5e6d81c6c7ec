//! Standalone update orchestration.
//!
//! Drives a single device through `install`, `commit` and `rollback`
//! without a server. The three entry points compose the artifact reader,
//! the update module and the persistent store into atomic end-user
//! operations: whatever fails, the device ends up in a defined state --
//! committed, rolled back, or explicitly recorded as broken.
//!
//! Two ordering rules carry the crash-safety story:
//!
//! - the state record is saved *before* any device-modifying verb runs;
//! - the record is removed *in the same store transaction* that commits
//!   new (or broken) provenance, so provenance and in-progress state can
//!   never disagree across a power loss.

pub mod data;

pub use data::StandaloneData;

use std::fs::File;
use std::io::BufReader;

use tracing::{error, info};

use crate::artifact::{self, Artifact, ParserConfig};
use crate::context::DeviceContext;
use crate::error::{Error, follow};
use crate::module::{ExternalModule, RebootAction, UpdateModule};

/// What a top-level operation did to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Install succeeded; reboot not required; awaiting commit.
    Installed,
    /// Install succeeded; reboot required before commit.
    InstalledRebootRequired,
    /// Install plus implicit commit succeeded (module has no rollback).
    InstalledAndCommitted,
    /// Install plus implicit commit succeeded; reboot required.
    InstalledAndCommittedRebootRequired,
    /// Commit succeeded on the device but post-commit housekeeping failed.
    InstalledButFailedInPostCommit,
    /// Explicit commit succeeded.
    Committed,
    /// Explicit rollback succeeded.
    RolledBack,
    /// The module reports no rollback capability.
    NoRollback,
    /// Rollback was attempted and failed.
    RollbackFailed,
    /// Commit or rollback invoked without an active update.
    NoUpdateInProgress,
    /// Failure before any device state was changed.
    FailedNothingDone,
    /// Install failed; rollback succeeded; device is in its prior state.
    FailedAndRolledBack,
    /// Install failed; no rollback capability; artifact recorded broken.
    FailedAndNoRollback,
    /// Install failed and rollback failed; device state is undefined.
    FailedAndRollbackFailed,
}

impl Outcome {
    /// Returns `true` when the operation did not achieve what was asked.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::FailedNothingDone
                | Self::FailedAndRolledBack
                | Self::FailedAndNoRollback
                | Self::FailedAndRollbackFailed
                | Self::RollbackFailed
                | Self::NoRollback
        )
    }

    /// Returns `true` when the device must be rebooted to finish.
    #[must_use]
    pub const fn needs_reboot(self) -> bool {
        matches!(
            self,
            Self::InstalledRebootRequired | Self::InstalledAndCommittedRebootRequired
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Installed => "installed",
            Self::InstalledRebootRequired => "installed, reboot required",
            Self::InstalledAndCommitted => "installed and committed",
            Self::InstalledAndCommittedRebootRequired => {
                "installed and committed, reboot required"
            },
            Self::InstalledButFailedInPostCommit => "installed, but post-commit steps failed",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::NoRollback => "no rollback support",
            Self::RollbackFailed => "rollback failed",
            Self::NoUpdateInProgress => "no update in progress",
            Self::FailedNothingDone => "failed, nothing done",
            Self::FailedAndRolledBack => "failed and rolled back",
            Self::FailedAndNoRollback => "failed, no rollback support",
            Self::FailedAndRollbackFailed => "failed and rollback failed",
        };
        write!(f, "{name}")
    }
}

/// Composite result of a top-level operation.
///
/// The outcome always describes the device's state; the error, when
/// present, aggregates every failure met along the way in causal order.
#[derive(Debug)]
pub struct OperationResult {
    /// What the operation did to the device.
    pub outcome: Outcome,
    /// The failure chain, if anything went wrong.
    pub error: Option<Error>,
}

impl OperationResult {
    fn ok(outcome: Outcome) -> Self {
        Self {
            outcome,
            error: None,
        }
    }

    fn failed(outcome: Outcome, error: Error) -> Self {
        Self {
            outcome,
            error: Some(error),
        }
    }
}

/// Supplies the update module servicing a payload type.
///
/// [`install`], [`commit`] and [`rollback`] use the external-program
/// module; the `*_with` variants let embedders and tests substitute their
/// own implementation.
pub type ModuleFactory<'a> =
    dyn FnMut(&DeviceContext, &str) -> Result<Box<dyn UpdateModule>, Error> + 'a;

fn external_module(
    ctx: &DeviceContext,
    payload_type: &str,
) -> Result<Box<dyn UpdateModule>, Error> {
    Ok(Box::new(ExternalModule::new(ctx, payload_type)?))
}

/// Installs the artifact at `src`.
///
/// `src` must be a local file path; `http://` and `https://` sources are
/// rejected. On success the update is left awaiting [`commit`] or
/// [`rollback`], unless the module lacks rollback support, in which case
/// it is committed immediately.
pub fn install(ctx: &mut DeviceContext, src: &str) -> OperationResult {
    install_with(ctx, src, &mut external_module)
}

/// [`install`] with a caller-supplied module factory.
pub fn install_with(
    ctx: &mut DeviceContext,
    src: &str,
    factory: &mut ModuleFactory<'_>,
) -> OperationResult {
    match data::load_standalone_data(ctx.store()) {
        Err(err) => return OperationResult::failed(Outcome::FailedNothingDone, err),
        Ok(Some(_)) => {
            return OperationResult::failed(
                Outcome::FailedNothingDone,
                Error::OperationInProgress(
                    "Update already in progress. Please commit or roll back first".to_string(),
                ),
            );
        },
        Ok(None) => {},
    }

    if src.starts_with("http://") || src.starts_with("https://") {
        return OperationResult::failed(
            Outcome::FailedNothingDone,
            Error::NotSupported("HTTP not supported yet".to_string()),
        );
    }

    let file = match File::open(src) {
        Ok(file) => file,
        Err(err) => {
            return OperationResult::failed(
                Outcome::FailedNothingDone,
                Error::io(format!("Could not open {src}"), err),
            );
        },
    };

    let parser_config = ParserConfig {
        artifact_scripts_dir: ctx.config().artifact_scripts_dir.clone(),
    };
    let mut artifact = match artifact::parse(BufReader::new(file), &parser_config) {
        Ok(artifact) => artifact,
        Err(err) => return OperationResult::failed(Outcome::FailedNothingDone, err.into()),
    };
    let header = artifact.header().clone();

    let mut module = match factory(ctx, &header.payload_type) {
        Ok(module) => module,
        Err(err) => return OperationResult::failed(Outcome::FailedNothingDone, err),
    };

    let workdir = module.work_dir().to_path_buf();
    if let Err(err) = module.prepare_file_tree(&workdir, &header) {
        let mut err = Error::from(err);
        if let Err(cleanup_err) = module.cleanup() {
            err = err.followed_by(cleanup_err.into());
        }
        return OperationResult::failed(Outcome::FailedNothingDone, err);
    }

    let data = StandaloneData::from_header(&header);
    if let Err(err) = data::save_standalone_data(ctx.store_mut(), &data) {
        let mut err = err;
        if let Err(cleanup_err) = module.cleanup() {
            err = err.followed_by(cleanup_err.into());
        }
        return OperationResult::failed(Outcome::FailedNothingDone, err);
    }

    do_install_states(ctx, data, &mut artifact, module.as_mut())
}

/// Commits the in-progress update.
pub fn commit(ctx: &mut DeviceContext) -> OperationResult {
    commit_with(ctx, &mut external_module)
}

/// [`commit`] with a caller-supplied module factory.
pub fn commit_with(ctx: &mut DeviceContext, factory: &mut ModuleFactory<'_>) -> OperationResult {
    let mut data = match data::load_standalone_data(ctx.store()) {
        Err(err) => return OperationResult::failed(Outcome::FailedNothingDone, err),
        Ok(None) => {
            return OperationResult::failed(
                Outcome::NoUpdateInProgress,
                Error::NoUpdateInProgress("Cannot commit".to_string()),
            );
        },
        Ok(Some(data)) => data,
    };

    let mut module = match factory(ctx, &data.payload_types[0]) {
        Ok(module) => module,
        Err(err) => return OperationResult::failed(Outcome::FailedNothingDone, err),
    };

    do_commit(ctx, &mut data, module.as_mut())
}

/// Rolls back the in-progress update.
pub fn rollback(ctx: &mut DeviceContext) -> OperationResult {
    rollback_with(ctx, &mut external_module)
}

/// [`rollback`] with a caller-supplied module factory.
pub fn rollback_with(ctx: &mut DeviceContext, factory: &mut ModuleFactory<'_>) -> OperationResult {
    let mut data = match data::load_standalone_data(ctx.store()) {
        Err(err) => return OperationResult::failed(Outcome::FailedNothingDone, err),
        Ok(None) => {
            return OperationResult::failed(
                Outcome::NoUpdateInProgress,
                Error::NoUpdateInProgress("Cannot roll back".to_string()),
            );
        },
        Ok(Some(data)) => data,
    };

    let mut module = match factory(ctx, &data.payload_types[0]) {
        Ok(module) => module,
        Err(err) => return OperationResult::failed(Outcome::FailedNothingDone, err),
    };

    let mut result = do_rollback(module.as_mut());

    if result.outcome == Outcome::NoRollback {
        // No rollback support. Leave the update data in place: the user
        // must either commit or restore the rollback capability.
        return result;
    }

    if let Err(err) = module.cleanup() {
        result.outcome = Outcome::FailedAndRollbackFailed;
        result.error = follow(result.error.take(), err.into());
    }

    let finalize = if result.outcome == Outcome::RolledBack {
        data::remove_standalone_data(ctx.store_mut())
    } else {
        commit_broken_artifact(ctx, &mut data)
    };
    if let Err(err) = finalize {
        result.outcome = Outcome::RollbackFailed;
        result.error = follow(result.error.take(), err);
    }

    result
}

/// Runs the install-side states once the record is saved.
fn do_install_states(
    ctx: &mut DeviceContext,
    mut data: StandaloneData,
    artifact: &mut Artifact,
    module: &mut dyn UpdateModule,
) -> OperationResult {
    let mut payload = match artifact.next_payload() {
        Ok(payload) => payload,
        Err(err) => return OperationResult::failed(Outcome::FailedNothingDone, err.into()),
    };

    info!(artifact = %data.artifact_name, "Installing artifact...");

    if let Err(err) = module.download(&mut payload) {
        // Nothing has touched the device target yet; undo everything.
        let mut err = Error::from(err);
        if let Err(cleanup_err) = module.cleanup() {
            err = err.followed_by(cleanup_err.into());
        }
        if let Err(remove_err) = data::remove_standalone_data(ctx.store_mut()) {
            err = err.followed_by(remove_err);
        }
        return OperationResult::failed(Outcome::FailedNothingDone, err);
    }

    if let Err(err) = module.artifact_install() {
        let err = Error::from(err);
        error!("Installation failed: {err}");
        return installation_failure_handler(ctx, &mut data, module, err);
    }

    let reboot = match module.needs_reboot() {
        Ok(reboot) => reboot,
        Err(err) => {
            let err = Error::from(err);
            error!("Could not query for reboot: {err}");
            return installation_failure_handler(ctx, &mut data, module, err);
        },
    };

    let rollback_support = match module.supports_rollback() {
        Ok(support) => support,
        Err(err) => {
            let err = Error::from(err);
            error!("Could not query for rollback support: {err}");
            return installation_failure_handler(ctx, &mut data, module, err);
        },
    };

    if rollback_support {
        return OperationResult::ok(if reboot == RebootAction::No {
            Outcome::Installed
        } else {
            Outcome::InstalledRebootRequired
        });
    }

    info!("Update module does not support rollback. Committing immediately.");

    let mut result = do_commit(ctx, &mut data, module);
    if result.outcome == Outcome::Committed {
        result.outcome = if reboot == RebootAction::No {
            Outcome::InstalledAndCommitted
        } else {
            Outcome::InstalledAndCommittedRebootRequired
        };
    }
    result
}

/// Commits on the device, then commits provenance and removes the state
/// record in one store transaction.
fn do_commit(
    ctx: &mut DeviceContext,
    data: &mut StandaloneData,
    module: &mut dyn UpdateModule,
) -> OperationResult {
    if let Err(err) = module.artifact_commit() {
        let err = Error::from(err);
        error!("Commit failed: {err}");
        return installation_failure_handler(ctx, data, module, err);
    }

    // The device itself is committed from here on; later failures only
    // demote the reported outcome.
    let mut outcome = Outcome::Committed;
    let mut return_err = None;

    if let Err(err) = module.cleanup() {
        outcome = Outcome::InstalledButFailedInPostCommit;
        return_err = follow(return_err, err.into());
    }

    let commit_result = ctx.commit_artifact_data(
        &data.artifact_name,
        &data.artifact_group,
        data.artifact_provides.as_ref(),
        data.artifact_clears_provides.as_deref(),
        &mut |txn| {
            txn.remove(DeviceContext::STANDALONE_STATE_KEY)
                .map_err(Error::from)
        },
    );
    if let Err(err) = commit_result {
        outcome = Outcome::InstalledButFailedInPostCommit;
        return_err = follow(return_err, err);
    }

    OperationResult {
        outcome,
        error: return_err,
    }
}

/// Attempts a rollback, reporting capability as part of the outcome.
fn do_rollback(module: &mut dyn UpdateModule) -> OperationResult {
    match module.supports_rollback() {
        Err(err) => OperationResult::failed(Outcome::NoRollback, err.into()),
        Ok(true) => match module.artifact_rollback() {
            Err(err) => OperationResult::failed(Outcome::RollbackFailed, err.into()),
            Ok(()) => OperationResult::ok(Outcome::RolledBack),
        },
        Ok(false) => OperationResult::ok(Outcome::NoRollback),
    }
}

/// Unwinds a failed install: roll back if possible, run the module's
/// failure hook, clean up, and finalize persistent state.
///
/// `cause` is the error that triggered the unwind; every further failure
/// is chained behind it.
fn installation_failure_handler(
    ctx: &mut DeviceContext,
    data: &mut StandaloneData,
    module: &mut dyn UpdateModule,
    cause: Error,
) -> OperationResult {
    let mut result = do_rollback(module);
    result.outcome = match result.outcome {
        Outcome::RolledBack => Outcome::FailedAndRolledBack,
        Outcome::NoRollback => Outcome::FailedAndNoRollback,
        Outcome::RollbackFailed => Outcome::FailedAndRollbackFailed,
        other => {
            return OperationResult::failed(
                Outcome::FailedAndRollbackFailed,
                cause.followed_by(Error::Programming(format!(
                    "unexpected rollback outcome `{other}` in installation failure handler"
                ))),
            );
        },
    };
    result.error = Some(match result.error.take() {
        Some(err) => cause.followed_by(err),
        None => cause,
    });

    if let Err(err) = module.artifact_failure() {
        result.outcome = Outcome::FailedAndRollbackFailed;
        result.error = follow(result.error.take(), err.into());
    }

    if let Err(err) = module.cleanup() {
        result.outcome = Outcome::FailedAndRollbackFailed;
        result.error = follow(result.error.take(), err.into());
    }

    let finalize = if result.outcome == Outcome::FailedAndRolledBack {
        data::remove_standalone_data(ctx.store_mut())
    } else {
        commit_broken_artifact(ctx, data)
    };
    if let Err(err) = finalize {
        result.outcome = Outcome::FailedAndRollbackFailed;
        result.error = follow(result.error.take(), err);
    }

    result
}

/// Records that the device now runs an installation that was never fully
/// validated: the artifact name gains the broken suffix and the state
/// record is removed in the same transaction.
fn commit_broken_artifact(ctx: &mut DeviceContext, data: &mut StandaloneData) -> Result<(), Error> {
    data.artifact_name
        .push_str(DeviceContext::BROKEN_ARTIFACT_NAME_SUFFIX);
    if let Some(provides) = data.artifact_provides.as_mut() {
        provides.insert("artifact_name".to_string(), data.artifact_name.clone());
    }
    ctx.commit_artifact_data(
        &data.artifact_name,
        &data.artifact_group,
        data.artifact_provides.as_ref(),
        data.artifact_clears_provides.as_deref(),
        &mut |txn| {
            txn.remove(DeviceContext::STANDALONE_STATE_KEY)
                .map_err(Error::from)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_outcomes_are_failures() {
        for outcome in [
            Outcome::FailedNothingDone,
            Outcome::FailedAndRolledBack,
            Outcome::FailedAndNoRollback,
            Outcome::FailedAndRollbackFailed,
            Outcome::RollbackFailed,
            Outcome::NoRollback,
        ] {
            assert!(outcome.is_failure(), "{outcome} should be a failure");
        }
        for outcome in [
            Outcome::Installed,
            Outcome::Committed,
            Outcome::RolledBack,
            Outcome::InstalledAndCommitted,
            Outcome::NoUpdateInProgress,
        ] {
            assert!(!outcome.is_failure(), "{outcome} should not be a failure");
        }
    }

    #[test]
    fn test_reboot_required_outcomes() {
        assert!(Outcome::InstalledRebootRequired.needs_reboot());
        assert!(Outcome::InstalledAndCommittedRebootRequired.needs_reboot());
        assert!(!Outcome::Installed.needs_reboot());
        assert!(!Outcome::Committed.needs_reboot());
    }
}
