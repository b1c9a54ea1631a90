//! Firmware manifest parsing
//!
//! A manifest describes a firmware package that was uploaded as several
//! compressed fragments:
//!
//! ```text
//! size = 1000000
//! fragments = 2
//! name = "img"
//! checksum = 2882130225
//! src_dir = "/mnt/update/fragments"
//! ```
//!
//! Unknown keys are ignored so newer manifests keep working.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::error::FirmwareUpdateError;

/// Extension of the assembled firmware package
pub const UPDATE_PACKAGE_EXT: &str = ".swu";

/// Extension of every fragment archive
pub const FRAGMENT_EXT: &str = ".zip";

const PROP_SIZE: &str = "size";
const PROP_FRAGMENTS: &str = "fragments";
const PROP_NAME: &str = "name";
const PROP_CHECKSUM: &str = "checksum";
const PROP_SRC_DIR: &str = "src_dir";

/// Parsed firmware manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareManifest {
    /// Size in bytes of the assembled package
    pub total_size: u64,
    /// Number of fragments to reconstruct the package
    pub fragment_count: u32,
    /// Fragment base name, without index or extension
    pub name: String,
    /// CRC32 of the assembled package
    pub checksum: u32,
    /// Directory holding the fragments
    pub source_dir: PathBuf,
}

impl FirmwareManifest {
    /// Parse the manifest file at `path`.
    ///
    /// An unreadable file is an I/O error; any missing or invalid key is an
    /// [`FirmwareUpdateError::InvalidManifest`].
    pub fn parse(path: &Path) -> Result<Self, FirmwareUpdateError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            error!(
                "Firmware manifest file '{}' cannot be read: {}",
                path.display(),
                e
            );
            FirmwareUpdateError::io(path, e)
        })?;

        let manifest = Self::parse_str(&content).inspect_err(|e| {
            error!("Error parsing firmware manifest file '{}': {}", path.display(), e);
        })?;

        debug!(
            "Manifest '{}': {} bytes in {} fragments named '{}'",
            path.display(),
            manifest.total_size,
            manifest.fragment_count,
            manifest.name
        );
        Ok(manifest)
    }

    /// Parse manifest text.
    pub fn parse_str(content: &str) -> Result<Self, FirmwareUpdateError> {
        let properties = parse_properties(content)?;

        let total_size = positive_int(&properties, PROP_SIZE)?;
        let fragment_count = u32::try_from(positive_int(&properties, PROP_FRAGMENTS)?)
            .map_err(|e| {
                FirmwareUpdateError::invalid_manifest(format!("{PROP_FRAGMENTS}: {e}"))
            })?;
        let name = package_name(&properties)?.to_string();

        let checksum_text = non_empty(&properties, PROP_CHECKSUM)?;
        let checksum = checksum_text.parse::<u32>().map_err(|e| {
            FirmwareUpdateError::invalid_manifest(format!(
                "{PROP_CHECKSUM} ({checksum_text}): not a decimal CRC32: {e}"
            ))
        })?;

        let source_dir = PathBuf::from(non_empty(&properties, PROP_SRC_DIR)?);
        if std::fs::read_dir(&source_dir).is_err() {
            return Err(FirmwareUpdateError::invalid_manifest(format!(
                "{PROP_SRC_DIR} ({}): file does not exist or is not readable",
                source_dir.display()
            )));
        }

        Ok(Self {
            total_size,
            fragment_count,
            name,
            checksum,
            source_dir,
        })
    }

    /// File name of the assembled package, `<name>.swu`.
    pub fn package_file_name(&self) -> String {
        format!("{}{}", self.name, UPDATE_PACKAGE_EXT)
    }

    /// File name of the fragment at `index`, `<name><index>.zip`.
    pub fn fragment_file_name(&self, index: u32) -> String {
        format!("{}{}{}", self.name, index, FRAGMENT_EXT)
    }
}

fn parse_properties(content: &str) -> Result<HashMap<&str, &str>, FirmwareUpdateError> {
    let mut properties = HashMap::new();

    for (line_no, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(FirmwareUpdateError::invalid_manifest(format!(
                "line {}: expected 'key = value'",
                line_no.saturating_add(1)
            )));
        };

        properties.insert(key.trim(), unquote(value.trim()));
    }

    Ok(properties)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn required<'a>(
    properties: &HashMap<&str, &'a str>,
    key: &str,
) -> Result<&'a str, FirmwareUpdateError> {
    properties
        .get(key)
        .copied()
        .ok_or_else(|| FirmwareUpdateError::invalid_manifest(format!("missing {key}")))
}

fn non_empty<'a>(
    properties: &HashMap<&str, &'a str>,
    key: &str,
) -> Result<&'a str, FirmwareUpdateError> {
    let value = required(properties, key)?;
    if value.is_empty() {
        return Err(FirmwareUpdateError::invalid_manifest(format!(
            "{key}: cannot be empty"
        )));
    }
    Ok(value)
}

/// The name becomes part of file names inside the download and source
/// directories, so it must be a plain file name component.
fn package_name<'a>(properties: &HashMap<&str, &'a str>) -> Result<&'a str, FirmwareUpdateError> {
    let name = non_empty(properties, PROP_NAME)?;
    if name.contains(['/', '\\']) || name.contains("..") || Path::new(name).is_absolute() {
        return Err(FirmwareUpdateError::invalid_manifest(format!(
            "{PROP_NAME} ({name}): must be a plain file name"
        )));
    }
    Ok(name)
}

fn positive_int(properties: &HashMap<&str, &str>, key: &str) -> Result<u64, FirmwareUpdateError> {
    let value = required(properties, key)?;
    let number = value.parse::<i64>().map_err(|e| {
        FirmwareUpdateError::invalid_manifest(format!("{key} ({value}): {e}"))
    })?;

    u64::try_from(number)
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| {
            FirmwareUpdateError::invalid_manifest(format!(
                "{key} ({number}): must be greater than 0"
            ))
        })
}
