//! Package assembly from compressed fragments
//!
//! Each fragment is a zip archive holding one slice of the final package,
//! stored under the package name. Slices are appended to the destination in
//! index order and every fragment is deleted as soon as it has been consumed,
//! so the fragments and the package never both sit on flash in full.
//!
//! Once all slices are written the destination is synced, then checked
//! against the manifest size and CRC32. Any failure removes the destination
//! and every fragment not yet consumed.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use zip::ZipArchive;

use crate::error::FirmwareUpdateError;
use crate::fragment::{Fragment, FirmwareInfo};
use crate::manifest::FirmwareManifest;
use crate::space;

/// Size of the buffer used to inflate fragments and checksum the package
pub const ASSEMBLY_BUFFER_SIZE: usize = 128 * 1024;

/// Streams fragments into one verified package file
#[derive(Debug, Default, Clone, Copy)]
pub struct PackageAssembler;

impl PackageAssembler {
    /// Create an assembler.
    pub fn new() -> Self {
        Self
    }

    /// Assemble the package described by `info`.
    ///
    /// Returns the package path. The fragment set is consumed whatever the
    /// outcome.
    pub fn assemble(&self, info: &FirmwareInfo) -> Result<PathBuf, FirmwareUpdateError> {
        info!(
            "Assembling '{}' from {} fragments",
            info.destination.display(),
            info.fragments.len()
        );

        let mut output = match File::create(&info.destination) {
            Ok(file) => file,
            Err(e) => {
                error!(
                    "Unable to create file '{}': {}",
                    info.destination.display(),
                    e
                );
                remove_fragments(&info.fragments);
                return Err(FirmwareUpdateError::io(&info.destination, e));
            }
        };

        let mut buffer = vec![0u8; ASSEMBLY_BUFFER_SIZE];

        for (position, fragment) in info.fragments.iter().enumerate() {
            if let Err(e) = append_fragment(&mut output, fragment, info.entry_name(), &mut buffer)
            {
                error!("Error assembling fragment '{}': {}", fragment.file_name, e);
                drop(output);
                remove_fragments(info.fragments.get(position..).unwrap_or_default());
                remove_destination(&info.destination);
                return Err(e);
            }

            if let Err(e) = fragment.remove() {
                warn!("Unable to remove fragment '{}': {}", fragment.file_name, e);
            }
        }

        if let Err(e) = output.sync_all() {
            error!(
                "Unable to sync file '{}': {}",
                info.destination.display(),
                e
            );
            drop(output);
            remove_destination(&info.destination);
            return Err(FirmwareUpdateError::io(&info.destination, e));
        }
        drop(output);

        if let Err(e) = verify_package(&info.destination, info, &mut buffer) {
            error!("{}", e);
            remove_destination(&info.destination);
            return Err(e);
        }

        info!(
            "Firmware package '{}' assembled and verified",
            info.destination.display()
        );
        Ok(info.destination.clone())
    }
}

/// Parse the manifest at `manifest_path`, check there is room for the
/// package in `download_dir`, locate the fragments and assemble them.
///
/// The manifest file itself is left in place.
pub fn assemble_from_manifest(
    manifest_path: &Path,
    download_dir: &Path,
) -> Result<PathBuf, FirmwareUpdateError> {
    let manifest = FirmwareManifest::parse(manifest_path)?;
    space::ensure_available(download_dir, manifest.total_size)?;

    let info = FirmwareInfo::prepare(manifest, download_dir)?;
    debug!(
        "{} fragments are ready, beginning image assembly",
        info.fragments.len()
    );
    PackageAssembler::new().assemble(&info)
}

fn append_fragment(
    output: &mut File,
    fragment: &Fragment,
    entry_name: &str,
    buffer: &mut [u8],
) -> Result<u64, FirmwareUpdateError> {
    let archive_error = |reason: String| FirmwareUpdateError::Archive {
        path: fragment.path.clone(),
        reason,
    };

    let file = File::open(&fragment.path).map_err(|e| FirmwareUpdateError::io(&fragment.path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|e| archive_error(format!("unable to open archive: {e}")))?;
    let mut entry = archive
        .by_name(entry_name)
        .map_err(|e| archive_error(format!("unable to locate '{entry_name}': {e}")))?;

    let mut written = 0u64;
    loop {
        let read = entry
            .read(buffer)
            .map_err(|e| archive_error(format!("decompression failed: {e}")))?;
        if read == 0 {
            break;
        }
        let chunk = buffer.get(..read).unwrap_or_default();
        output
            .write_all(chunk)
            .map_err(|e| archive_error(format!("write failed: {e}")))?;
        written = written.saturating_add(read as u64);
    }

    debug!(
        "Appended {} bytes from fragment {} ('{}')",
        written, fragment.index, fragment.file_name
    );
    Ok(written)
}

fn verify_package(
    path: &Path,
    info: &FirmwareInfo,
    buffer: &mut [u8],
) -> Result<(), FirmwareUpdateError> {
    let size = std::fs::metadata(path)
        .map_err(|e| FirmwareUpdateError::io(path, e))?
        .len();
    if size != info.manifest.total_size {
        return Err(FirmwareUpdateError::Integrity(format!(
            "Wrong size for '{}': {} bytes, manifest says {}",
            path.display(),
            size,
            info.manifest.total_size
        )));
    }

    let checksum = file_crc32(path, buffer)?;
    if checksum != info.manifest.checksum {
        return Err(FirmwareUpdateError::Integrity(format!(
            "Wrong CRC32 for '{}': calculated {}, manifest says {}",
            path.display(),
            checksum,
            info.manifest.checksum
        )));
    }

    Ok(())
}

/// CRC32 (IEEE) of the file at `path`.
pub fn file_crc32(path: &Path, buffer: &mut [u8]) -> Result<u32, FirmwareUpdateError> {
    let mut file = File::open(path).map_err(|e| FirmwareUpdateError::io(path, e))?;
    let mut hasher = crc32fast::Hasher::new();
    loop {
        let read = file
            .read(buffer)
            .map_err(|e| FirmwareUpdateError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(buffer.get(..read).unwrap_or_default());
    }
    Ok(hasher.finalize())
}

fn remove_fragments(fragments: &[Fragment]) {
    for fragment in fragments {
        if let Err(e) = fragment.remove() {
            warn!("Unable to remove fragment '{}': {}", fragment.file_name, e);
        }
    }
}

fn remove_destination(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Unable to remove '{}': {}", path.display(), e);
    }
}
