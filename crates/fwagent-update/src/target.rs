//! Firmware targets and the connector callback contract
//!
//! The cloud connector registers one entry per firmware target and then
//! drives each update through four callbacks: `request`, `data`, `cancel`
//! and `reset`. This module holds the target table, the firmware version
//! reported for every target, and the codes the callbacks hand back.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streaming::STREAM_CHUNK_SIZE;

/// Firmware target number as registered with the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirmwareTarget {
    /// Complete `.swu` package ("System")
    Swu,
    /// `manifest.txt` describing a fragmented package ("Update manifest")
    Manifest,
}

impl FirmwareTarget {
    /// All targets in registration order.
    pub const ALL: [FirmwareTarget; 2] = [FirmwareTarget::Swu, FirmwareTarget::Manifest];

    /// Target number used on the wire.
    pub fn number(self) -> u32 {
        match self {
            FirmwareTarget::Swu => 0,
            FirmwareTarget::Manifest => 1,
        }
    }

    /// Human-readable description shown by the remote manager.
    pub fn description(self) -> &'static str {
        match self {
            FirmwareTarget::Swu => "System",
            FirmwareTarget::Manifest => "Update manifest",
        }
    }

    /// File name pattern accepted for this target.
    pub fn filespec(self) -> &'static str {
        match self {
            FirmwareTarget::Swu => r".*\.[sS][wW][uU]",
            FirmwareTarget::Manifest => r"[mM][aA][nN][iI][fF][eE][sS][tT]\.[tT][xX][tT]",
        }
    }

    /// Chunk size requested from the connector, 0 for its default.
    pub fn chunk_size(self) -> usize {
        match self {
            FirmwareTarget::Swu => STREAM_CHUNK_SIZE,
            FirmwareTarget::Manifest => 0,
        }
    }
}

impl TryFrom<u32> for FirmwareTarget {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FirmwareTarget::Swu),
            1 => Ok(FirmwareTarget::Manifest),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for FirmwareTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.number(), self.description())
    }
}

/// Four-part firmware version reported for every target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Major number
    pub major: u8,
    /// Minor number
    pub minor: u8,
    /// Revision number
    pub revision: u8,
    /// Build number
    pub build: u8,
}

impl FirmwareVersion {
    /// Parse `major[.minor[.revision[.build]]]`.
    ///
    /// Missing trailing parts are zero. Returns `None` when the leading part
    /// is not a number, in which case firmware update stays disabled.
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = [0u8; 4];
        let mut parsed = 0usize;

        for (slot, token) in parts.iter_mut().zip(version.trim().split('.')) {
            match token.trim().parse::<u8>() {
                Ok(value) => {
                    *slot = value;
                    parsed = parsed.saturating_add(1);
                }
                Err(_) => break,
            }
        }

        if parsed == 0 {
            return None;
        }

        let [major, minor, revision, build] = parts;
        Some(Self {
            major,
            minor,
            revision,
            build,
        })
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.build
        )
    }
}

/// Registration entry for one firmware target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Target
    pub target: FirmwareTarget,
    /// Target number
    pub number: u32,
    /// Description
    pub description: String,
    /// Accepted file name pattern
    pub filespec: String,
    /// Requested chunk size, 0 for the connector default
    pub chunk_size: usize,
    /// Maximum accepted size, 0 for no limit
    pub maximum_size: u64,
    /// Version reported for the target
    pub version: FirmwareVersion,
}

/// Build the target table for the given firmware version string.
///
/// Returns `None` if the version cannot be parsed; the agent then runs
/// without firmware update support.
pub fn firmware_targets(version: &str) -> Option<Vec<TargetDescriptor>> {
    let Some(version) = FirmwareVersion::parse(version) else {
        tracing::error!(
            "Bad firmware_version string '{}', firmware update disabled",
            version
        );
        return None;
    };

    Some(
        FirmwareTarget::ALL
            .iter()
            .map(|&target| TargetDescriptor {
                target,
                number: target.number(),
                description: target.description().to_string(),
                filespec: target.filespec().to_string(),
                chunk_size: target.chunk_size(),
                maximum_size: 0,
                version,
            })
            .collect(),
    )
}

/// Rejection codes for the `request` callback
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestError {
    /// Download denied
    #[error("download denied")]
    DownloadDenied,
    /// Declared size cannot be accommodated
    #[error("download size cannot be accommodated")]
    DownloadInvalidSize,
    /// Version not accepted
    #[error("firmware version not accepted")]
    DownloadInvalidVersion,
    /// Requester not authenticated
    #[error("download not authenticated")]
    DownloadUnauthenticated,
    /// Download not allowed
    #[error("download not allowed")]
    DownloadNotAllowed,
    /// Device configured to reject downloads
    #[error("device configured to reject downloads")]
    DownloadConfiguredToReject,
    /// Generic failure
    #[error("error processing the download request")]
    EncounteredError,
}

/// Error codes for the `data` callback
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataError {
    /// Device busy
    #[error("device busy")]
    Busy,
    /// Chunk offset does not match what was received so far
    #[error("invalid chunk offset")]
    InvalidOffset,
    /// Chunk could not be stored or the update failed
    #[error("invalid data")]
    InvalidData,
    /// Integrity check failed
    #[error("integrity check failed")]
    HashError,
}

/// Reasons the connector gives when cancelling an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    /// Cancelled by the user
    UserAbort,
    /// Device error
    DeviceError,
    /// Invalid offset reported
    InvalidOffset,
    /// Invalid data reported
    InvalidData,
    /// Hardware error
    HardwareError,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            CancelReason::UserAbort => "user abort",
            CancelReason::DeviceError => "device error",
            CancelReason::InvalidOffset => "invalid offset",
            CancelReason::InvalidData => "invalid data",
            CancelReason::HardwareError => "hardware error",
        };
        f.write_str(reason)
    }
}

/// What `reset` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResetDecision {
    /// Reboot flag handed back to the connector. The agent reboots on its
    /// own thread, so this stays `false`.
    pub system_reset: bool,
    /// Whether the agent scheduled a reboot
    pub reboot_scheduled: bool,
}

/// Callback contract consumed by the connector engine
///
/// Target numbers arrive raw; implementations reject numbers that are not a
/// registered [`FirmwareTarget`].
pub trait FirmwareCallbacks: Send + Sync {
    /// Accept or reject an incoming firmware download.
    fn request(&self, target: u32, filename: &str, total_size: u64) -> Result<(), RequestError>;

    /// Receive one data chunk.
    fn data(&self, target: u32, offset: u64, data: &[u8], last_chunk: bool)
    -> Result<(), DataError>;

    /// Abort the update in progress.
    fn cancel(&self, target: u32, reason: CancelReason);

    /// Decide whether to reboot after the update finished.
    fn reset(&self, target: u32, version: &FirmwareVersion) -> ResetDecision;
}
