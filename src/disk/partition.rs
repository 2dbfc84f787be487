//! Partition entries, requests and sub-device naming
//!
//! Matching a table entry against an expected partition is a pure function:
//! it describes the sub-device to create and leaves the registration itself
//! to the caller.

use crate::error::{BringupError, Result};
use bytesize::ByteSize;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Highest partition index representable by the `<parent>p<digit>` scheme
pub const MAX_PARTITION_INDEX: u32 = 9;

/// Where a partition entry came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKind {
    /// Primary or logical MBR entry
    Mbr {
        /// System ID byte
        type_byte: u8,
        /// Active (0x80) flag
        bootable: bool,
    },
    /// GPT entry
    Gpt {
        /// Partition type GUID
        type_guid: Uuid,
        /// Partition name (UTF-16 decoded)
        name: String,
    },
}

/// One partition found in a partition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Ordinal position in the table (0-based)
    pub index: u32,
    /// Starting block on the parent device
    pub first_block: u64,
    /// Length in blocks
    pub block_count: u64,
    /// Table-specific details
    pub kind: PartitionKind,
}

impl PartitionEntry {
    /// Create an MBR entry with a given type byte
    pub fn mbr(index: u32, first_block: u64, block_count: u64, type_byte: u8) -> Self {
        Self {
            index,
            first_block,
            block_count,
            kind: PartitionKind::Mbr {
                type_byte,
                bootable: false,
            },
        }
    }
}

/// Lifecycle of an expected partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    /// Scan not yet performed
    Pending,
    /// Sub-device registered
    Registered,
    /// Partition absent, or its registration failed
    NotFound,
}

impl std::fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Registered => write!(f, "registered"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

/// A named block range to expose on the parent device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubDeviceSpec {
    /// Sub-device name, `<parent>p<digit>`
    pub name: PathBuf,
    /// Unit number handed to the registrar
    pub unit: u32,
    /// Parent block device
    pub parent: PathBuf,
    /// First block of the range
    pub first_block: u64,
    /// Number of blocks in the range
    pub block_count: u64,
}

impl SubDeviceSpec {
    /// Exclusive end block of the range
    pub fn end_block(&self) -> u64 {
        self.first_block.saturating_add(self.block_count)
    }

    /// Byte offset of the range on the parent, `None` if it overflows
    pub fn byte_offset(&self, block_size: u32) -> Option<u64> {
        self.first_block.checked_mul(u64::from(block_size))
    }

    /// Byte length of the range, `None` if it overflows
    pub fn byte_len(&self, block_size: u32) -> Option<u64> {
        self.block_count.checked_mul(u64::from(block_size))
    }

    /// Human-readable size of the range
    pub fn size_human(&self, block_size: u32) -> String {
        match self.byte_len(block_size) {
            Some(len) => ByteSize(len).to_string(),
            None => format!("{} blocks", self.block_count),
        }
    }
}

/// Tracks one expected partition through discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionRequest {
    /// Partition ordinal to match
    pub wanted_index: u32,
    /// Current status
    pub status: PartitionStatus,
    /// Registered sub-device, once there is one
    pub sub_device: Option<SubDeviceSpec>,
}

impl PartitionRequest {
    /// Create a pending request
    pub fn new(wanted_index: u32) -> Self {
        Self {
            wanted_index,
            status: PartitionStatus::Pending,
            sub_device: None,
        }
    }

    /// Record a successful registration
    pub fn mark_registered(&mut self, spec: SubDeviceSpec) {
        self.status = PartitionStatus::Registered;
        self.sub_device = Some(spec);
    }

    /// Settle a request the scan did not satisfy
    pub fn resolve(&mut self) {
        if self.status != PartitionStatus::Registered {
            self.status = PartitionStatus::NotFound;
        }
    }

    /// Whether a sub-device was registered
    pub fn is_registered(&self) -> bool {
        self.status == PartitionStatus::Registered
    }
}

/// Build the sub-device name for partition `index` of `parent`
///
/// `/dev/mmcsd0` and 1 give `/dev/mmcsd0p1`. Only single decimal digits are
/// representable; anything above 9 is an error rather than a wrong name.
pub fn format_partition_device_name(parent: &Path, index: u32) -> Result<PathBuf> {
    let digit =
        char::from_digit(index, 10).ok_or(BringupError::InvalidPartitionIndex(index))?;

    let mut name = OsString::from(parent.as_os_str());
    name.push(format!("p{}", digit));
    Ok(PathBuf::from(name))
}

/// Describe the sub-device for `entry` if it is the partition we want
///
/// Indices above 9 never match, whatever the table holds.
pub fn match_and_describe(
    entry: &PartitionEntry,
    wanted_index: u32,
    parent: &Path,
) -> Option<SubDeviceSpec> {
    if wanted_index > MAX_PARTITION_INDEX || entry.index != wanted_index {
        return None;
    }

    let name = format_partition_device_name(parent, wanted_index).ok()?;
    Some(SubDeviceSpec {
        name,
        unit: 0,
        parent: parent.to_path_buf(),
        first_block: entry.first_block,
        block_count: entry.block_count,
    })
}
