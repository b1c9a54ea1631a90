//! fwagentctl - operator tool for the firmware update core
//!
//! Runs the update building blocks by hand on a device: assemble a
//! fragmented package, install a package, inspect the boot layout and the
//! target table the agent registers.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod error;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fwagent_update::UpdateConfig;

use crate::commands::{CommandContext, TargetArg};
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "fwagentctl")]
#[command(about = "Firmware update tool for the device agent")]
#[command(version)]
#[command(long_about = "
fwagentctl drives the firmware update core outside the cloud connector.
It assembles fragmented packages from a manifest, installs packages on
single- and dual-boot devices, and reports the boot layout and the firmware
targets the agent registers.

Use --json flag for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Agent configuration file (JSON)
    #[arg(short, long, global = true, env = "FWAGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Output format (human-readable or JSON)
    #[arg(
        long,
        global = true,
        help = "Output in JSON format for machine parsing"
    )]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a fragmented package described by a manifest
    Assemble {
        /// Manifest file
        #[arg(short, long)]
        manifest: PathBuf,
        /// Directory for the assembled package
        #[arg(short, long)]
        download_dir: Option<PathBuf>,
    },

    /// Install a package without rebooting
    Install {
        /// Package, or manifest with `--target manifest`
        package: PathBuf,
        /// Firmware target the file belongs to
        #[arg(short, long, value_enum, default_value = "system")]
        target: TargetArg,
    },

    /// Print whether the device is single- or dual-boot
    BootType,

    /// Print the firmware target table
    Targets {
        /// Firmware version to report instead of the configured one
        #[arg(long)]
        firmware_version: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("fwagentctl={log_level},fwagent_update={log_level}").into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match execute_command(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }
            ExitCode::from(error::exit_code(&e))
        }
    }
}

fn execute_command(cli: &Cli) -> Result<()> {
    let ctx = CommandContext {
        config: load_config(cli.config.as_deref())?,
        json: cli.json,
    };

    match &cli.command {
        Commands::Assemble {
            manifest,
            download_dir,
        } => commands::assemble::execute(&ctx, manifest, download_dir.as_deref()),
        Commands::Install { package, target } => {
            commands::install::execute(&ctx, package, *target)
        }
        Commands::BootType => commands::system::boot_type(&ctx),
        Commands::Targets { firmware_version } => {
            commands::system::targets(&ctx, firmware_version.as_deref())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<UpdateConfig> {
    let Some(path) = path else {
        return Ok(UpdateConfig::default());
    };
    UpdateConfig::load(path)
        .map_err(|e| CliError::InvalidConfiguration(e.to_string()))
        .with_context(|| format!("loading configuration from '{}'", path.display()))
}
