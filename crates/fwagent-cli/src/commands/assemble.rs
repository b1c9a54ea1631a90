//! Local manifest assembly

use anyhow::{Context, Result};
use colored::*;
use serde_json::json;
use std::path::Path;
use tracing::info;

use fwagent_update::assemble_from_manifest;

use super::CommandContext;
use crate::output;

/// Assemble the package described by `manifest` into `download_dir`, or the
/// configured download directory.
pub fn execute(ctx: &CommandContext, manifest: &Path, download_dir: Option<&Path>) -> Result<()> {
    let download_dir = download_dir.unwrap_or(&ctx.config.firmware_download_path);
    info!(
        "Assembling '{}' into '{}'",
        manifest.display(),
        download_dir.display()
    );

    let package = assemble_from_manifest(manifest, download_dir)
        .with_context(|| format!("assembling package from '{}'", manifest.display()))?;
    let size = std::fs::metadata(&package)
        .with_context(|| format!("reading '{}'", package.display()))?
        .len();

    if ctx.json {
        output::print_json(json!({
            "package": package,
            "size": size,
        }))?;
    } else {
        println!(
            "{} {} ({} bytes)",
            "Assembled".green().bold(),
            package.display(),
            size
        );
    }
    Ok(())
}
