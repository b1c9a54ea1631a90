//! Error types for fwagentctl

use fwagent_update::{ErrorCategory, FirmwareUpdateError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid firmware version '{0}'")]
    InvalidVersion(String),

    #[error("Boot system type could not be determined")]
    BootTypeUnknown,
}

/// Process exit code for a failed command.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(cli) = error.downcast_ref::<CliError>() {
        return match cli {
            CliError::InvalidConfiguration(_) => 2,
            CliError::InvalidVersion(_) => 4,
            CliError::BootTypeUnknown => 9,
        };
    }

    match error.downcast_ref::<FirmwareUpdateError>().map(FirmwareUpdateError::category) {
        Some(ErrorCategory::Validation) => 4,
        Some(ErrorCategory::Io) => 3,
        Some(ErrorCategory::Fragment) => 5,
        Some(ErrorCategory::Integrity) => 6,
        Some(ErrorCategory::Resource) => 7,
        Some(ErrorCategory::Install) => 8,
        Some(ErrorCategory::ClassifierUnknown) => 9,
        Some(ErrorCategory::ProtocolTimeout | ErrorCategory::Process) => 10,
        Some(ErrorCategory::State) | None => 1,
    }
}
