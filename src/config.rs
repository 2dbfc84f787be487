//! Configuration types and management
//!
//! Defines where the card lives, which partitions are expected, and what
//! gets mounted where. Values come from defaults, an optional TOML file and
//! command-line overrides, in that order.

use crate::disk::partition::MAX_PARTITION_INDEX;
use crate::error::{BringupError, Result};
use crate::mount::{FsKind, MountRequest};
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parent block device and how to read it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Card slot number
    pub slot: u32,
    /// Parent block device (or disk image)
    pub device: PathBuf,
    /// Logical block size in bytes
    pub block_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            slot: 0,
            device: PathBuf::from("/dev/mmcsd0"),
            block_size: 512,
        }
    }
}

/// One filesystem to mount onto a partition sub-device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Partition index on the parent device (0-9)
    pub partition: u32,
    /// Mount point
    pub target: PathBuf,
    /// Filesystem kind
    pub fs: FsKind,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
    /// Filesystem-specific options
    #[serde(default)]
    pub options: Option<String>,
    /// Format the partition if it holds no filesystem yet
    #[serde(default)]
    pub autoformat: bool,
}

impl MountConfig {
    /// Build the mount request for this filesystem on `source`
    pub fn request(&self, source: PathBuf) -> MountRequest {
        let mut request = MountRequest::new(Some(source), &self.target, self.fs);
        if self.read_only {
            request.flags |= MsFlags::MS_RDONLY;
        }
        request.options = self.options.clone();
        request.autoformat = self.autoformat;
        request
    }
}

/// procfs mount performed ahead of storage bring-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcfsConfig {
    /// Mount procfs at all
    pub enabled: bool,
    /// Mount point
    pub target: PathBuf,
}

impl Default for ProcfsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: PathBuf::from("/proc"),
        }
    }
}

impl ProcfsConfig {
    /// Build the mount request for procfs
    pub fn request(&self) -> MountRequest {
        MountRequest::new(None, &self.target, FsKind::Procfs)
    }
}

/// Main bring-up configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parent block device
    pub storage: StorageConfig,

    /// User-facing filesystem, mandatory
    pub user_mount: MountConfig,

    /// Power-loss-safe filesystem
    pub power_safe_mount: MountConfig,

    /// Mount the power-safe filesystem (inactive until its driver is available)
    pub enable_power_safe_mount: bool,

    /// procfs mount
    pub procfs: ProcfsConfig,

    /// Dry run mode (don't actually make changes)
    #[serde(skip)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            user_mount: MountConfig {
                partition: 0,
                target: PathBuf::from("/mnt/usrfs"),
                fs: FsKind::Vfat,
                read_only: false,
                options: None,
                autoformat: false,
            },
            power_safe_mount: MountConfig {
                partition: 1,
                target: PathBuf::from("/mnt/pwrfs"),
                fs: FsKind::Littlefs,
                read_only: false,
                options: None,
                autoformat: true,
            },
            enable_power_safe_mount: false,
            procfs: ProcfsConfig::default(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file, filling unspecified values with defaults
    pub fn load(path: &Path) -> Result<Self> {
        log::debug!("Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Partition indices to discover, in discovery order
    pub fn expected_partitions(&self) -> [u32; 2] {
        [self.user_mount.partition, self.power_safe_mount.partition]
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.device.as_os_str().is_empty() {
            return Err(BringupError::config("Storage device path cannot be empty"));
        }

        let block_size = self.storage.block_size;
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(BringupError::config(format!(
                "Block size must be a power of two of at least 512, got {}",
                block_size
            )));
        }

        // Sub-device names carry a single digit
        for (role, mount) in [("user", &self.user_mount), ("power-safe", &self.power_safe_mount)] {
            if mount.partition > MAX_PARTITION_INDEX {
                return Err(BringupError::config(format!(
                    "{} partition index must be between 0 and {}, got {}",
                    role, MAX_PARTITION_INDEX, mount.partition
                )));
            }
            if !mount.target.is_absolute() {
                return Err(BringupError::config(format!(
                    "{} mount point must be an absolute path: {}",
                    role,
                    mount.target.display()
                )));
            }
        }

        if !self.power_safe_mount.fs.is_power_safe() {
            log::warn!(
                "Power-safe mount at {} uses {}, which does not survive power loss",
                self.power_safe_mount.target.display(),
                self.power_safe_mount.fs
            );
        }

        if self.user_mount.partition == self.power_safe_mount.partition {
            return Err(BringupError::config(format!(
                "User and power-safe filesystems cannot share partition {}",
                self.user_mount.partition
            )));
        }

        if self.user_mount.target == self.power_safe_mount.target {
            return Err(BringupError::config(format!(
                "User and power-safe filesystems cannot share mount point {}",
                self.user_mount.target.display()
            )));
        }

        if self.procfs.enabled && !self.procfs.target.is_absolute() {
            return Err(BringupError::config(format!(
                "procfs mount point must be an absolute path: {}",
                self.procfs.target.display()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.expected_partitions(), [0, 1]);
        assert!(!config.enable_power_safe_mount);
        assert!(config.power_safe_mount.autoformat);
    }

    #[test]
    fn test_config_validation_two_digit_index() {
        let mut config = Config::default();
        config.power_safe_mount.partition = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_shared_partition() {
        let mut config = Config::default();
        config.power_safe_mount.partition = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_block_size() {
        let mut config = Config::default();
        config.storage.block_size = 1000;
        assert!(config.validate().is_err());

        config.storage.block_size = 4096;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_relative_target() {
        let mut config = Config::default();
        config.user_mount.target = PathBuf::from("mnt/usrfs");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            enable_power_safe_mount = true

            [storage]
            device = "/dev/mmcblk1"

            [power_safe_mount]
            partition = 2
            target = "/mnt/pwrfs"
            fs = "littlefs"
            autoformat = true
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.device, PathBuf::from("/dev/mmcblk1"));
        assert_eq!(config.storage.block_size, 512);
        assert_eq!(config.user_mount, Config::default().user_mount);
        assert_eq!(config.expected_partitions(), [0, 2]);
        assert!(config.enable_power_safe_mount);
        assert!(config.procfs.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bringup.toml");
        std::fs::write(&path, "[procfs]\nenabled = false\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.procfs.enabled);
        assert_eq!(config.procfs.target, PathBuf::from("/proc"));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bringup.toml");
        std::fs::write(&path, "[storage\n").unwrap();

        assert!(matches!(Config::load(&path), Err(BringupError::Toml(_))));
    }

    #[test]
    fn test_mount_request_flags() {
        let mut mount = Config::default().user_mount;
        mount.read_only = true;
        let request = mount.request(PathBuf::from("/dev/mmcsd0p0"));

        assert!(request.flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(request.source, Some(PathBuf::from("/dev/mmcsd0p0")));
        assert_eq!(request.fs, FsKind::Vfat);
        assert!(!request.autoformat);
    }
}
