//! otup - standalone OTA update client
//!
//! CLI for installing, committing and rolling back signed artifacts on an
//! embedded Linux device, without a server.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use otup_core::config::UpdaterConfig;
use otup_core::context::DeviceContext;

mod commands;

/// otup - standalone OTA update client
#[derive(Parser, Debug)]
#[command(name = "otup")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/otup/otup.conf")]
    config: PathBuf,

    /// Override the data store directory
    #[arg(long)]
    data: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install an artifact from a local file
    Install {
        /// Path of the artifact file
        source: String,

        /// Exit with code 4 when the installed update requires a reboot
        #[arg(long)]
        reboot_exit_code: bool,
    },

    /// Commit the installed update, making it permanent
    Commit,

    /// Roll back the installed update
    Rollback,

    /// Print the name of the currently installed artifact
    ShowArtifact,

    /// Print everything the currently installed artifact provides
    ShowProvides,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(&cli.log_level)
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Could not fulfill request: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = UpdaterConfig::load(&cli.config)?;
    if let Some(data_dir) = cli.data {
        config.data_store_dir = data_dir;
    }

    let mut ctx = DeviceContext::open(config)?;

    match cli.command {
        Commands::Install {
            source,
            reboot_exit_code,
        } => Ok(commands::install(&mut ctx, &source, reboot_exit_code)),
        Commands::Commit => Ok(commands::commit(&mut ctx)),
        Commands::Rollback => Ok(commands::rollback(&mut ctx)),
        Commands::ShowArtifact => commands::show_artifact(&ctx).map(|()| ExitCode::SUCCESS),
        Commands::ShowProvides => commands::show_provides(&ctx).map(|()| ExitCode::SUCCESS),
    }
}
