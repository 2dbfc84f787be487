//! Block device initialization
//!
//! Resolves the card slot to a device node (or a disk image standing in for
//! one) and reports its geometry.

use crate::error::{BringupError, Result};
use serde::Serialize;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// An initialized parent block device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDeviceHandle {
    /// Slot the device was brought up from
    pub slot: u32,
    /// Device path (e.g., /dev/mmcsd0)
    pub path: PathBuf,
    /// Logical block size in bytes
    pub block_size: u32,
    /// Device size in blocks
    pub block_count: u64,
    /// Whether the path is a disk image rather than a device node
    pub is_image: bool,
}

impl BlockDeviceHandle {
    /// Device size in bytes
    pub fn size(&self) -> u64 {
        self.block_count * u64::from(self.block_size)
    }

    /// Get human-readable size
    pub fn size_human(&self) -> String {
        bytesize::ByteSize(self.size()).to_string()
    }
}

/// Brings the storage device in a slot online
#[cfg_attr(test, mockall::automock)]
pub trait BlockDeviceLayer {
    /// Initialize the device in `slot`
    fn initialize(&mut self, slot: u32) -> Result<BlockDeviceHandle>;
}

/// Card slot backed by a host device node or image file
#[derive(Debug, Clone)]
pub struct HostCard {
    path: PathBuf,
    block_size: u32,
}

impl HostCard {
    /// Create a card slot for `path` using `block_size` for image files
    pub fn new<P: Into<PathBuf>>(path: P, block_size: u32) -> Self {
        Self {
            path: path.into(),
            block_size,
        }
    }

    /// Read a value from sysfs
    fn read_sys_value(sys_path: &Path, attr: &str) -> Result<String> {
        let path = sys_path.join(attr);
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(BringupError::Io)
    }

    fn parse_sys_value<T: std::str::FromStr>(sys_path: &Path, attr: &str) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        Self::read_sys_value(sys_path, attr)?.parse::<T>().map_err(|e| {
            BringupError::ParseError(format!("{}/{}: {}", sys_path.display(), attr, e))
        })
    }

    /// Geometry of a real block device, from /sys/class/block
    fn device_geometry(&self) -> Result<(u32, u64)> {
        let name = self
            .path
            .file_name()
            .ok_or_else(|| BringupError::DeviceNotFound(self.path.clone()))?
            .to_string_lossy()
            .to_string();
        let sys_path = PathBuf::from(format!("/sys/class/block/{}", name));

        // Size is always reported in 512-byte sectors
        let sectors: u64 = Self::parse_sys_value(&sys_path, "size")?;
        let block_size: u32 = Self::parse_sys_value(&sys_path, "queue/logical_block_size")
            .unwrap_or(self.block_size);

        if block_size != self.block_size {
            log::warn!(
                "{} reports {}-byte blocks, configured for {}",
                self.path.display(),
                block_size,
                self.block_size
            );
        }

        Ok((block_size, sectors * 512 / u64::from(block_size)))
    }
}

impl BlockDeviceLayer for HostCard {
    fn initialize(&mut self, slot: u32) -> Result<BlockDeviceHandle> {
        log::debug!("Initializing slot {} at {}", slot, self.path.display());

        let metadata = fs::metadata(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BringupError::DeviceNotFound(self.path.clone()),
            _ => BringupError::Io(e),
        })?;

        let file_type = metadata.file_type();
        let (block_size, block_count, is_image) = if file_type.is_block_device() {
            let (block_size, block_count) = self.device_geometry()?;
            (block_size, block_count, false)
        } else if file_type.is_file() {
            (
                self.block_size,
                metadata.len() / u64::from(self.block_size),
                true,
            )
        } else {
            return Err(BringupError::DeviceNotFound(self.path.clone()));
        };

        Ok(BlockDeviceHandle {
            slot,
            path: self.path.clone(),
            block_size,
            block_count,
            is_image,
        })
    }
}
