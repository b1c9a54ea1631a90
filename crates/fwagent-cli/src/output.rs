//! Output formatting for CLI responses

use anyhow::Error;
use colored::*;
use serde_json::{Value, json};

use fwagent_update::{BootType, TargetDescriptor};

/// Print error in JSON format
pub fn print_error_json(error: &Error) {
    let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
    let error_json = json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "causes": chain,
        }
    });
    match serde_json::to_string_pretty(&error_json) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to format error as JSON: {}", e),
    }
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    for cause in error.chain().skip(1) {
        eprintln!("  {} {}", "Caused by:".yellow(), cause);
    }
}

/// Print a JSON success document with `body` merged in.
pub fn print_json(body: Value) -> Result<(), serde_json::Error> {
    let mut output = json!({ "success": true });
    if let (Some(target), Value::Object(fields)) = (output.as_object_mut(), body) {
        target.extend(fields);
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Print the boot layout.
pub fn print_boot_type(boot_type: BootType) {
    let label = match boot_type {
        BootType::Dual => "dual".green(),
        BootType::Single => "single".cyan(),
        BootType::Unknown => "unknown".red(),
    };
    println!("{} {}", "Boot system:".bold(), label);
}

/// Print the target registration table.
pub fn print_targets(targets: &[TargetDescriptor]) {
    println!("{}", "Firmware targets:".bold());
    for target in targets {
        let chunk = if target.chunk_size == 0 {
            "default".dimmed().to_string()
        } else {
            target.chunk_size.to_string()
        };
        println!(
            "  {} {:<16} version {}  chunk {}  files {}",
            target.number.to_string().bold(),
            target.description,
            target.version,
            chunk,
            target.filespec.dimmed()
        );
    }
}
