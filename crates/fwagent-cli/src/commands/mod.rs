//! Command implementations for fwagentctl

pub mod assemble;
pub mod install;
pub mod system;

use clap::ValueEnum;
use fwagent_update::{FirmwareTarget, UpdateConfig};

/// Settings shared by every command
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub config: UpdateConfig,
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetArg {
    /// Complete `.swu` package
    System,
    /// `manifest.txt` describing a fragmented package
    Manifest,
}

impl From<TargetArg> for FirmwareTarget {
    fn from(target: TargetArg) -> Self {
        match target {
            TargetArg::System => FirmwareTarget::Swu,
            TargetArg::Manifest => FirmwareTarget::Manifest,
        }
    }
}
