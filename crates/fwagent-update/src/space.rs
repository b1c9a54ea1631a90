//! Free space checks on the download filesystem

use std::path::Path;

use tracing::{debug, error};

use crate::error::FirmwareUpdateError;

/// Bytes available on the filesystem holding `path`, or `None` if the
/// filesystem cannot be queried.
///
/// Computed as block size times free blocks, so space reserved for root
/// counts as available.
pub fn query_available_space(path: &Path) -> Option<u64> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let block_size = u64::from(stat.block_size());
            let free_blocks = u64::from(stat.blocks_free());
            Some(block_size.saturating_mul(free_blocks))
        }
        Err(e) => {
            error!("Unable to get available space in '{}': {}", path.display(), e);
            None
        }
    }
}

/// Bytes available on the filesystem holding `path`, 0 on query failure.
pub fn available_space(path: &Path) -> u64 {
    query_available_space(path).unwrap_or(0)
}

/// Check that `required` bytes fit on the filesystem holding `path`.
///
/// A failed query is [`FirmwareUpdateError::SpaceUnavailable`]; too little
/// space is [`FirmwareUpdateError::InsufficientSpace`].
pub fn ensure_available(path: &Path, required: u64) -> Result<u64, FirmwareUpdateError> {
    let available = query_available_space(path).ok_or_else(|| {
        FirmwareUpdateError::SpaceUnavailable {
            path: path.to_path_buf(),
        }
    })?;

    debug!(
        "'{}': {} bytes required, {} available",
        path.display(),
        required,
        available
    );

    if required > available {
        error!(
            "Not enough space in '{}' for the firmware file: needed {}, have {}",
            path.display(),
            required,
            available
        );
        return Err(FirmwareUpdateError::InsufficientSpace {
            path: path.to_path_buf(),
            required,
            available,
        });
    }

    Ok(available)
}
