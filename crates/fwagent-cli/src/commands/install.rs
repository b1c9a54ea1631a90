//! Package installation without the connector

use anyhow::{Context, Result};
use colored::*;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use fwagent_update::{
    BootSystemClassifier, BootType, CommandRunner, FirmwareTarget, FwSetenvRecovery,
    InstallDispatcher, RecoveryWriter, SystemCommandRunner, assemble_from_manifest,
};

use super::{CommandContext, TargetArg};
use crate::error::CliError;
use crate::output;

/// Install `package` for `target`. A manifest is assembled first.
///
/// The device is not rebooted; the operator decides when to apply the update.
pub fn execute(ctx: &CommandContext, package: &Path, target: TargetArg) -> Result<()> {
    let target = FirmwareTarget::from(target);
    let timeout = ctx.config.command_timeout();

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
    let classifier = Arc::new(BootSystemClassifier::with_timeout(
        Arc::clone(&runner),
        timeout,
    ));
    if classifier.classify() == BootType::Unknown {
        return Err(CliError::BootTypeUnknown.into());
    }

    let recovery: Arc<dyn RecoveryWriter> =
        Arc::new(FwSetenvRecovery::new(Arc::clone(&runner), timeout));
    let dispatcher = InstallDispatcher::new(runner, classifier, Some(recovery));

    let package = match target {
        FirmwareTarget::Manifest => {
            assemble_from_manifest(package, &ctx.config.firmware_download_path)
                .with_context(|| format!("assembling package from '{}'", package.display()))?
        }
        FirmwareTarget::Swu => package.to_path_buf(),
    };

    info!("Installing '{}' (target {})", package.display(), target);
    let boot_type = dispatcher
        .install(&package, target)
        .with_context(|| format!("installing '{}'", package.display()))?;

    let next_step = match boot_type {
        BootType::Single => "reboot into recovery to apply",
        _ => "reboot to start the updated system",
    };

    if ctx.json {
        output::print_json(json!({
            "package": package,
            "target": target.number(),
            "boot_type": boot_type,
            "next_step": next_step,
        }))?;
    } else {
        println!(
            "{} {} ({} boot), {}",
            "Installed".green().bold(),
            package.display(),
            boot_type,
            next_step
        );
    }
    Ok(())
}
