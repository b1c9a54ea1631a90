//! Fragment discovery for manifest-driven updates

use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::error::FirmwareUpdateError;
use crate::manifest::FirmwareManifest;

/// One compressed piece of a firmware package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Full path of the fragment archive
    pub path: PathBuf,
    /// File name, `<name><index>.zip`
    pub file_name: String,
    /// Position of the fragment in the package
    pub index: u32,
}

impl Fragment {
    /// Remove the fragment from disk.
    pub fn remove(&self) -> Result<(), FirmwareUpdateError> {
        std::fs::remove_file(&self.path).map_err(|e| FirmwareUpdateError::io(&self.path, e))
    }
}

/// Resolve every fragment the manifest names, in index order.
///
/// Only presence is checked. A single missing fragment fails the whole set.
/// The list grows as fragments are found; the count comes from the manifest
/// and is not trusted for allocation.
pub fn locate_fragments(manifest: &FirmwareManifest) -> Result<Vec<Fragment>, FirmwareUpdateError> {
    let mut fragments = Vec::new();

    for index in 0..manifest.fragment_count {
        let file_name = manifest.fragment_file_name(index);
        let path = manifest.source_dir.join(&file_name);

        if !path.is_file() {
            error!("Missing fragment number {}, '{}'", index, path.display());
            return Err(FirmwareUpdateError::MissingFragment { index, path });
        }

        debug!("Found fragment {} at '{}'", index, path.display());
        fragments.push(Fragment {
            path,
            file_name,
            index,
        });
    }

    Ok(fragments)
}

/// Everything needed to assemble one package from its manifest
#[derive(Debug, Clone)]
pub struct FirmwareInfo {
    /// Destination package path
    pub destination: PathBuf,
    /// Destination file name
    pub file_name: String,
    /// Parsed manifest
    pub manifest: FirmwareManifest,
    /// Fragments in index order
    pub fragments: Vec<Fragment>,
}

impl FirmwareInfo {
    /// Build the assembly plan for `manifest`, writing into `download_dir`.
    pub fn prepare(
        manifest: FirmwareManifest,
        download_dir: &Path,
    ) -> Result<Self, FirmwareUpdateError> {
        let fragments = locate_fragments(&manifest)?;
        let file_name = manifest.package_file_name();
        let destination = download_dir.join(&file_name);

        Ok(Self {
            destination,
            file_name,
            manifest,
            fragments,
        })
    }

    /// Name of the entry every fragment archive holds.
    pub fn entry_name(&self) -> &str {
        &self.file_name
    }
}
