//! Device queries: boot layout and the firmware target table

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;

use fwagent_update::{BootSystemClassifier, BootType, SystemCommandRunner, firmware_targets};

use super::CommandContext;
use crate::error::CliError;
use crate::output;

/// Print whether the device is single- or dual-boot.
pub fn boot_type(ctx: &CommandContext) -> Result<()> {
    let classifier = BootSystemClassifier::with_timeout(
        Arc::new(SystemCommandRunner::new()),
        ctx.config.command_timeout(),
    );
    let boot_type = classifier.classify();

    if ctx.json {
        output::print_json(json!({ "boot_type": boot_type }))?;
    } else {
        output::print_boot_type(boot_type);
    }

    if boot_type == BootType::Unknown {
        return Err(CliError::BootTypeUnknown.into());
    }
    Ok(())
}

/// Print the targets the agent registers with the connector.
pub fn targets(ctx: &CommandContext, firmware_version: Option<&str>) -> Result<()> {
    let version = firmware_version.unwrap_or(&ctx.config.firmware_version);
    let targets =
        firmware_targets(version).ok_or_else(|| CliError::InvalidVersion(version.to_string()))?;

    if ctx.json {
        output::print_json(json!({ "targets": targets }))?;
    } else {
        output::print_targets(&targets);
    }
    Ok(())
}
