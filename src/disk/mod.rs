//! Disk management module
//!
//! Block device initialization, partition table scanning and sub-device
//! registration.

pub mod block_device;
pub mod partition;
pub mod registrar;
pub mod scanner;

pub use block_device::{BlockDeviceHandle, BlockDeviceLayer, HostCard};
pub use partition::{
    format_partition_device_name, match_and_describe, PartitionEntry, PartitionKind,
    PartitionRequest, PartitionStatus, SubDeviceSpec, MAX_PARTITION_INDEX,
};
pub use registrar::{LoopRegistrar, SubDeviceRegistrar};
pub use scanner::{parse_partition_table, DeviceTableScanner, PartitionScanner};
