//! Error types for firmware update operations
//!
//! Every failure inside the update core is a [`FirmwareUpdateError`]. The
//! connector engine never sees these directly: the session controller folds
//! them into the small set of codes in [`crate::target`] via
//! [`FirmwareUpdateError::request_error`] and [`FirmwareUpdateError::data_error`].

use std::path::PathBuf;

use thiserror::Error;

use crate::target::{DataError, RequestError};

/// Errors that can occur during firmware update operations
#[derive(Error, Debug)]
pub enum FirmwareUpdateError {
    /// A manifest field is missing or invalid
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// File system operation failed
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        /// Path the operation was acting on
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A fragment of the firmware image is missing
    #[error("Missing fragment number {index} ('{}')", path.display())]
    MissingFragment {
        /// Fragment index
        index: u32,
        /// Expected fragment location
        path: PathBuf,
    },

    /// A fragment archive could not be read
    #[error("Error assembling fragment '{}': {reason}", path.display())]
    Archive {
        /// Fragment location
        path: PathBuf,
        /// Archive failure description
        reason: String,
    },

    /// Data chunk does not continue where the previous one ended
    #[error("Unexpected chunk offset {actual}, expected {expected}")]
    OffsetMismatch {
        /// Bytes received so far
        expected: u64,
        /// Offset reported by the connector
        actual: u64,
    },

    /// Assembled package does not match the manifest
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Not enough free space for the download or the assembled package
    #[error("Not enough space in '{}': needed {required} bytes, have {available}", path.display())]
    InsufficientSpace {
        /// Directory that was checked
        path: PathBuf,
        /// Bytes needed
        required: u64,
        /// Bytes free
        available: u64,
    },

    /// Free space could not be queried
    #[error("Unable to get available space in '{}'", path.display())]
    SpaceUnavailable {
        /// Directory that was checked
        path: PathBuf,
    },

    /// Installer or recovery writer reported a failure
    #[error("Install failed: {0}")]
    InstallFailed(String),

    /// Timeout during operation
    #[error("Timeout during operation: {0}")]
    Timeout(String),

    /// Single- or dual-boot layout could not be determined
    #[error("Unable to determine boot system type")]
    BootTypeUnknown,

    /// External command could not be executed
    #[error("Command '{command}' failed: {reason}")]
    Command {
        /// Command line that was run
        command: String,
        /// Failure description
        reason: String,
    },

    /// Streaming update engine reported a failure
    #[error("Streaming update failed: {0}")]
    StreamingFailed(String),

    /// Invalid state for operation
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Coarse classification of a [`FirmwareUpdateError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad manifest field or configuration value
    Validation,
    /// Open, read, write or fsync failure
    Io,
    /// Fragment set incomplete or unreadable
    Fragment,
    /// Size or CRC32 mismatch
    Integrity,
    /// Insufficient space or resources
    Resource,
    /// Installer or recovery writer failure
    Install,
    /// Streaming finalization wait exceeded, or a command timed out
    ProtocolTimeout,
    /// Boot type indeterminate
    ClassifierUnknown,
    /// External process failure
    Process,
    /// Callback arrived in the wrong session state, or was cancelled
    State,
}

impl FirmwareUpdateError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(reason: impl Into<String>) -> Self {
        Self::InvalidManifest(reason.into())
    }

    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidManifest(_)
            | Self::InvalidConfiguration(_)
            | Self::OffsetMismatch { .. } => ErrorCategory::Validation,
            Self::Io { .. } | Self::SerializationError(_) => ErrorCategory::Io,
            Self::MissingFragment { .. } | Self::Archive { .. } => ErrorCategory::Fragment,
            Self::Integrity(_) => ErrorCategory::Integrity,
            Self::InsufficientSpace { .. } | Self::SpaceUnavailable { .. } => {
                ErrorCategory::Resource
            }
            Self::InstallFailed(_) | Self::StreamingFailed(_) => ErrorCategory::Install,
            Self::Timeout(_) => ErrorCategory::ProtocolTimeout,
            Self::BootTypeUnknown => ErrorCategory::ClassifierUnknown,
            Self::Command { .. } => ErrorCategory::Process,
            Self::InvalidState(_) | Self::Cancelled(_) => ErrorCategory::State,
        }
    }

    /// Code returned to the connector from the `request` callback.
    pub fn request_error(&self) -> RequestError {
        match self {
            Self::InsufficientSpace { .. } => RequestError::DownloadInvalidSize,
            _ => RequestError::EncounteredError,
        }
    }

    /// Code returned to the connector from the `data` callback.
    pub fn data_error(&self) -> DataError {
        match self {
            Self::OffsetMismatch { .. } => DataError::InvalidOffset,
            Self::Integrity(_) => DataError::HashError,
            _ => DataError::InvalidData,
        }
    }
}

impl From<serde_json::Error> for FirmwareUpdateError {
    fn from(e: serde_json::Error) -> Self {
        FirmwareUpdateError::SerializationError(e.to_string())
    }
}
