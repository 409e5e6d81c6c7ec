//! Command implementations: drive the orchestrator and translate its
//! outcomes into user-facing messages and exit codes.

use std::process::ExitCode;

use anyhow::Result;
use tracing::error;

use otup_core::context::DeviceContext;
use otup_core::standalone::{self, OperationResult, Outcome};

/// Exit code signalling that the device must be rebooted to proceed.
const REBOOT_EXIT_CODE: u8 = 4;

fn describe(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Installed | Outcome::InstalledRebootRequired => {
            "Installed, but not committed.\n\
             Use 'commit' to update, or 'rollback' to roll back the update."
        },
        Outcome::InstalledAndCommitted | Outcome::InstalledAndCommittedRebootRequired => {
            "Installed and committed."
        },
        Outcome::InstalledButFailedInPostCommit => {
            "Installed and committed, but one or more post-commit steps failed."
        },
        Outcome::Committed => "Committed.",
        Outcome::RolledBack => "Rolled back.",
        Outcome::NoRollback => {
            "Update module does not support rollback. \
             Commit the update, or restore the rollback capability."
        },
        Outcome::RollbackFailed => {
            "Rollback failed. System may be in an inconsistent state."
        },
        Outcome::NoUpdateInProgress => "No update in progress.",
        Outcome::FailedNothingDone => "Installation failed. System not modified.",
        Outcome::FailedAndRolledBack => "Installation failed. Rolled back.",
        Outcome::FailedAndNoRollback => {
            "Installation failed, and the update module does not support rollback. \
             The artifact has been recorded as inconsistent."
        },
        Outcome::FailedAndRollbackFailed => {
            "Installation failed, and rollback also failed. \
             System may be in an inconsistent state."
        },
    }
}

fn finish(result: OperationResult, reboot_exit_code: bool) -> ExitCode {
    if let Some(err) = &result.error {
        error!("{err}");
    }

    println!("{}", describe(result.outcome));
    if result.outcome.needs_reboot() {
        println!("The update requires a reboot of the device.");
    }

    if result.error.is_some() || result.outcome.is_failure() {
        return ExitCode::FAILURE;
    }
    if reboot_exit_code && result.outcome.needs_reboot() {
        return ExitCode::from(REBOOT_EXIT_CODE);
    }
    ExitCode::SUCCESS
}

/// Installs the artifact at `source`.
pub fn install(ctx: &mut DeviceContext, source: &str, reboot_exit_code: bool) -> ExitCode {
    finish(standalone::install(ctx, source), reboot_exit_code)
}

/// Commits the in-progress update.
pub fn commit(ctx: &mut DeviceContext) -> ExitCode {
    finish(standalone::commit(ctx), false)
}

/// Rolls back the in-progress update.
pub fn rollback(ctx: &mut DeviceContext) -> ExitCode {
    finish(standalone::rollback(ctx), false)
}

/// Prints the name of the currently installed artifact.
pub fn show_artifact(ctx: &DeviceContext) -> Result<()> {
    let provides = ctx.load_provides()?;
    match provides.get("artifact_name") {
        Some(name) if !name.is_empty() => println!("{name}"),
        _ => println!("unknown"),
    }
    Ok(())
}

/// Prints everything the currently installed artifact provides, one
/// `key=value` per line.
pub fn show_provides(ctx: &DeviceContext) -> Result<()> {
    let provides = ctx.load_provides()?;
    for (key, value) in &provides {
        println!("{key}={value}");
    }
    Ok(())
}
