//! Firmware update core for the device agent
//!
//! This crate receives over-the-air firmware images through the connector's
//! four-callback contract and installs them:
//! - Manifest-driven reassembly of fragmented packages, verified by size and CRC32
//! - Dual-boot installs into the inactive partition, or recovery installs on
//!   single-boot devices
//! - On-the-fly installs that stream chunks straight into the streaming engine
//! - Reboot scheduling on a detached worker
//!
//! # Architecture
//!
//! - [`manifest`]: Manifest file parsing
//! - [`fragment`]: Fragment discovery
//! - [`assembler`]: Package assembly and verification
//! - [`space`]: Free space checks
//! - [`boot`]: Single- vs dual-boot detection
//! - [`installer`]: Install dispatch
//! - [`partition`]: A/B partition handling for streaming installs
//! - [`streaming`]: Producer/consumer bridge to the streaming engine
//! - [`reboot`]: Restart scheduling
//! - [`session`]: Callback state machine composing the above
//! - [`target`]: Target table and connector codes
//! - [`process`]: External command execution
//! - [`config`]: Configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```ignore
//! use fwagent_update::prelude::*;
//!
//! let config = UpdateConfig::load(Path::new("/etc/fwagent.json"))?;
//! let controller = UpdateSessionController::builder(config).build()?;
//!
//! controller.request(0, "image.swu", 4096)?;
//! controller.data(0, 0, &chunk, true)?;
//! let decision = controller.reset(0, &FirmwareVersion::default());
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod assembler;
pub mod boot;
pub mod config;
pub mod error;
pub mod fragment;
pub mod installer;
pub mod manifest;
pub mod partition;
pub mod prelude;
pub mod process;
pub mod reboot;
pub mod session;
pub mod space;
pub mod streaming;
pub mod target;

pub use assembler::{PackageAssembler, assemble_from_manifest};
pub use boot::{BootSystemClassifier, BootType};
pub use config::{UpdateConfig, UpdateConfigBuilder};
pub use error::{ErrorCategory, FirmwareUpdateError};
pub use fragment::{FirmwareInfo, Fragment, locate_fragments};
pub use installer::{
    DUAL_BOOT_FAILURE_MARKER, FwSetenvRecovery, InstallDispatcher, RecoveryWriter,
};
pub use manifest::FirmwareManifest;
pub use partition::{Partition, RunningMode, StorageMedia, StreamPreparation};
pub use process::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use reboot::{KernelRestart, RebootPlan, RebootScheduler, SystemRestart};
pub use session::{
    DeliveryMode, SessionState, UpdateOutcome, UpdateSessionController,
    UpdateSessionControllerBuilder,
};
pub use space::{available_space, ensure_available};
pub use streaming::{
    EndStatus, NoPostUpdate, PostUpdateAction, StreamRequest, StreamSession, StreamingEngine,
};
pub use target::{
    CancelReason, DataError, FirmwareCallbacks, FirmwareTarget, FirmwareVersion, RequestError,
    ResetDecision, TargetDescriptor, firmware_targets,
};
