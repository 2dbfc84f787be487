//! Error types for board bring-up
//!
//! Provides comprehensive error handling using thiserror for ergonomic error definitions.

use crate::mount::FsKind;
use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for bring-up operations
pub type Result<T> = std::result::Result<T, BringupError>;

/// Main error type for bring-up
#[derive(Error, Debug)]
pub enum BringupError {
    /// Device or file not found
    #[error("Device not found: {0}")]
    DeviceNotFound(PathBuf),

    /// Device carries no recognizable partition table
    #[error("No partition table on {0}")]
    NoPartitionTable(PathBuf),

    /// Partition table is present but inconsistent
    #[error("Malformed partition table on {path}: {reason}")]
    MalformedPartitionTable { path: PathBuf, reason: String },

    /// Partition index cannot be expressed in the sub-device naming scheme
    #[error("Partition index {0} is outside the single-digit naming range 0-9")]
    InvalidPartitionIndex(u32),

    /// Sub-device registration failed
    #[error("Failed to register sub-device {name}: {reason}")]
    RegistrationFailed { name: PathBuf, reason: String },

    /// A mandatory mount failed
    #[error(
        "Failed to mount {fs} from {} at {}: {errno}",
        display_device(.device),
        .target.display()
    )]
    MountFailed {
        device: Option<PathBuf>,
        target: PathBuf,
        fs: FsKind,
        errno: Errno,
    },

    /// Command execution failed
    #[error("Command '{cmd}' failed with exit code {code}: {stderr}")]
    CommandFailed {
        cmd: String,
        code: i32,
        stderr: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Insufficient permissions
    #[error("Insufficient permissions: {0}. This program must be run as root.")]
    PermissionDenied(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),
}

fn display_device(device: &Option<PathBuf>) -> String {
    device
        .as_ref()
        .map(|s| s.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl BringupError {
    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a malformed partition table error
    pub fn malformed<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::MalformedPartitionTable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errno of a failed mount, the code bring-up reports to its caller
    pub fn code(&self) -> Option<Errno> {
        match self {
            Self::MountFailed { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Check if error aborts the bring-up sequence
    ///
    /// Missing cards and missing partitions degrade gracefully; only mounts
    /// and configuration mistakes stop the sequence.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MountFailed { .. }
                | Self::ConfigError(_)
                | Self::Toml(_)
                | Self::PermissionDenied(_)
        )
    }
}
