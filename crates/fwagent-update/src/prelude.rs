//! Convenience re-exports for common firmware update types

pub use crate::assembler::{PackageAssembler, assemble_from_manifest};
pub use crate::boot::{BootSystemClassifier, BootType};
pub use crate::config::UpdateConfig;
pub use crate::error::{ErrorCategory, FirmwareUpdateError};
pub use crate::fragment::FirmwareInfo;
pub use crate::installer::{InstallDispatcher, RecoveryWriter};
pub use crate::manifest::FirmwareManifest;
pub use crate::process::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use crate::reboot::{RebootPlan, SystemRestart};
pub use crate::session::{DeliveryMode, SessionState, UpdateOutcome, UpdateSessionController};
pub use crate::streaming::{
    EndStatus, PostUpdateAction, StreamRequest, StreamSession, StreamingEngine,
};
pub use crate::target::{
    CancelReason, DataError, FirmwareCallbacks, FirmwareTarget, FirmwareVersion, RequestError,
    ResetDecision,
};
