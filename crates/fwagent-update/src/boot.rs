//! Single- vs dual-boot detection

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::process::CommandRunner;

/// Bootloader environment reader
pub const FW_PRINTENV: &str = "fw_printenv";

/// Bootloader variable that marks a dual-boot device
pub const DUALBOOT_VARIABLE: &str = "dualboot";

/// Default bound on the `fw_printenv` query
pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Device boot layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BootType {
    /// Layout could not be determined
    Unknown,
    /// One system partition, updated through recovery
    Single,
    /// Redundant A/B system partitions
    Dual,
}

impl std::fmt::Display for BootType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootType::Unknown => write!(f, "unknown"),
            BootType::Single => write!(f, "single"),
            BootType::Dual => write!(f, "dual"),
        }
    }
}

/// Detects the boot layout once and remembers it
///
/// An `Unknown` result is not cached, so the next call queries again.
pub struct BootSystemClassifier {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    cached: Mutex<Option<BootType>>,
}

impl BootSystemClassifier {
    /// Create a classifier that queries through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_timeout(runner, DEFAULT_CLASSIFY_TIMEOUT)
    }

    /// Create a classifier with a custom query bound.
    pub fn with_timeout(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            cached: Mutex::new(None),
        }
    }

    /// Create a classifier with a fixed answer.
    pub fn fixed(runner: Arc<dyn CommandRunner>, boot_type: BootType) -> Self {
        let classifier = Self::new(runner);
        if boot_type != BootType::Unknown {
            *classifier.cached.lock() = Some(boot_type);
        }
        classifier
    }

    /// Return the boot layout, querying the bootloader on first use.
    pub fn classify(&self) -> BootType {
        let mut cached = self.cached.lock();
        if let Some(boot_type) = *cached {
            return boot_type;
        }

        let boot_type = self.query();
        if boot_type == BootType::Unknown {
            warn!("Unable to determine boot system type");
        } else {
            info!("Boot system type: {}", boot_type);
            *cached = Some(boot_type);
        }
        boot_type
    }

    /// Whether the device is dual-boot.
    pub fn is_dual(&self) -> bool {
        self.classify() == BootType::Dual
    }

    fn query(&self) -> BootType {
        let output = match self.runner.run(
            FW_PRINTENV,
            &["-n", DUALBOOT_VARIABLE],
            Some(self.timeout),
        ) {
            Ok(output) => output,
            Err(e) => {
                debug!("{} failed: {}", FW_PRINTENV, e);
                return BootType::Unknown;
            }
        };

        let value = output.stdout.trim();
        if value.is_empty() {
            return BootType::Unknown;
        }
        if value == "yes" {
            BootType::Dual
        } else {
            BootType::Single
        }
    }
}

impl std::fmt::Debug for BootSystemClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootSystemClassifier")
            .field("timeout", &self.timeout)
            .field("cached", &*self.cached.lock())
            .finish_non_exhaustive()
    }
}
