//! Board Storage Bring-up Library
//!
//! Brings an attached block-storage device online at boot:
//! - Initializes the card in its slot
//! - Walks the partition table (MBR, extended, GPT)
//! - Registers each expected partition as a `<parent>p<digit>` sub-device
//! - Mounts the user-facing and power-safe filesystems, in order
//!
//! # Architecture
//!
//! The crate is organized into modules:
//! - `config`: Configuration types and validation
//! - `disk`: Block device init, partition scanning and sub-device registration
//! - `mount`: Filesystem mounting
//! - `system`: Host utilities
//! - `error`: Error types and handling
//!
//! Every external capability (block device layer, scanner, registrar,
//! mounter) is a trait; [`Capabilities::host`] wires up the Linux host
//! implementations.
//!
//! # Example
//!
//! ```rust,no_run
//! use board_bringup::*;
//!
//! # fn main() -> Result<()> {
//! let mut config = Config::default();
//! config.storage.device = "/dev/mmcblk0".into();
//! config.dry_run = true;
//!
//! let mut bringup = Bringup::host(config)?;
//! let report = bringup.run()?;
//! for request in &report.partitions {
//!     println!("partition {}: {}", request.wanted_index, request.status);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod disk;
pub mod error;
pub mod mount;
pub mod system;

// Re-export commonly used types
pub use config::{Config, MountConfig, ProcfsConfig, StorageConfig};
pub use disk::{
    BlockDeviceHandle, BlockDeviceLayer, DeviceTableScanner, HostCard, LoopRegistrar,
    PartitionEntry, PartitionRequest, PartitionScanner, PartitionStatus, SubDeviceRegistrar,
    SubDeviceSpec,
};
pub use error::{BringupError, Result};
pub use mount::{FsKind, MountOutcome, MountRequest, Mounter, SystemMounter};

use disk::{format_partition_device_name, match_and_describe};
use nix::errno::Errno;
use serde::Serialize;

/// External capabilities bring-up drives
pub struct Capabilities {
    /// Block device layer
    pub block_devices: Box<dyn BlockDeviceLayer>,
    /// Partition table scanner
    pub scanner: Box<dyn PartitionScanner>,
    /// Sub-device registrar
    pub registrar: Box<dyn SubDeviceRegistrar>,
    /// Mount capability
    pub mounter: Box<dyn Mounter>,
}

impl Capabilities {
    /// Linux host implementations for `config`
    pub fn host(config: &Config) -> Self {
        let storage = &config.storage;
        Self {
            block_devices: Box::new(HostCard::new(&storage.device, storage.block_size)),
            scanner: Box::new(DeviceTableScanner::new(storage.block_size)),
            registrar: Box::new(LoopRegistrar::new(storage.block_size, config.dry_run)),
            mounter: Box::new(SystemMounter::new(config.dry_run)),
        }
    }
}

/// What bring-up found and did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BringupReport {
    /// Parent block device, if initialization succeeded
    pub device: Option<BlockDeviceHandle>,
    /// Expected partitions and their final status
    pub partitions: Vec<PartitionRequest>,
    /// Every mount attempted, in order
    pub mounts: Vec<MountOutcome>,
}

impl BringupReport {
    /// Request for partition `index`, if it was expected
    pub fn partition(&self, index: u32) -> Option<&PartitionRequest> {
        self.partitions.iter().find(|r| r.wanted_index == index)
    }
}

/// Storage bring-up orchestrator
pub struct Bringup {
    config: Config,
    caps: Capabilities,
    report: BringupReport,
}

impl Bringup {
    /// Create a bring-up run over the given capabilities
    pub fn new(config: Config, caps: Capabilities) -> Result<Self> {
        // Validate configuration
        config.validate()?;

        Ok(Self {
            config,
            caps,
            report: BringupReport::default(),
        })
    }

    /// Create a bring-up run using the host implementations
    pub fn host(config: Config) -> Result<Self> {
        let caps = Capabilities::host(&config);
        Self::new(config, caps)
    }

    /// Report of the last run, complete up to the point it stopped
    pub fn report(&self) -> &BringupReport {
        &self.report
    }

    /// Run the bring-up sequence once
    ///
    /// A missing card or missing partitions are logged and tolerated. The
    /// first failed mount stops the sequence and is returned.
    pub fn run(&mut self) -> Result<BringupReport> {
        log::info!("Starting storage bring-up");
        log::info!("Device: {}", self.config.storage.device.display());
        if self.config.dry_run {
            log::warn!("DRY RUN MODE - No changes will be made");
        }

        self.report = BringupReport::default();

        if self.config.procfs.enabled {
            self.mount_procfs();
        }

        // Phase 1: Block device
        self.report.device = self.initialize_device()?;

        // Phase 2: Partitions
        for index in self.config.expected_partitions() {
            let request = self.discover_partition(index);
            self.report.partitions.push(request);
        }

        // Phase 3: User filesystem
        let user = self.config.user_mount.clone();
        self.mount_partition(&user, "user")?;

        // Phase 4: Power-safe filesystem
        if self.config.enable_power_safe_mount {
            let power_safe = self.config.power_safe_mount.clone();
            self.mount_partition(&power_safe, "power-safe")?;
        } else {
            log::info!("Power-safe filesystem mount is disabled");
        }

        log::info!("Storage bring-up completed successfully");
        Ok(self.report.clone())
    }

    fn mount_procfs(&mut self) {
        let request = self.config.procfs.request();
        let result = self.caps.mounter.mount(&request);
        self.report
            .mounts
            .push(MountOutcome::from_result(&request, &result));

        if let Err(errno) = result {
            log::error!(
                "Failed to mount the PROC filesystem at {}: {}",
                request.target.display(),
                errno
            );
        }
    }

    fn initialize_device(&mut self) -> Result<Option<BlockDeviceHandle>> {
        log::info!("Phase 1: Initializing block device");

        match self.caps.block_devices.initialize(self.config.storage.slot) {
            Ok(handle) => {
                log::info!(
                    "Block device {} ready: {} blocks of {} bytes ({})",
                    handle.path.display(),
                    handle.block_count,
                    handle.block_size,
                    handle.size_human()
                );
                Ok(Some(handle))
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log::error!(
                    "Failed to register SD card device in slot {}: {}",
                    self.config.storage.slot,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Scan for one expected partition and register it
    fn discover_partition(&mut self, wanted_index: u32) -> PartitionRequest {
        let parent = self.config.storage.device.clone();
        let mut request = PartitionRequest::new(wanted_index);
        let mut matches = Vec::new();

        let scanned = self.caps.scanner.scan(&parent, &mut |entry| {
            if let Some(spec) = match_and_describe(entry, wanted_index, &parent) {
                log::debug!(
                    "Partition {}: {} blocks at {}",
                    entry.index,
                    entry.block_count,
                    entry.first_block
                );
                matches.push(spec);
            }
        });

        if let Err(e) = scanned {
            log::warn!("Partition scan of {} failed: {}", parent.display(), e);
        }

        // A malformed table may list the index twice; the first match owns the name
        for spec in matches {
            match self.caps.registrar.register_range(&spec) {
                Ok(()) if request.is_registered() => {
                    log::debug!("{} registered again", spec.name.display())
                }
                Ok(()) => request.mark_registered(spec),
                Err(e) if request.is_registered() => log::warn!(
                    "Ignoring duplicate entry for partition {}: {}",
                    wanted_index,
                    e
                ),
                Err(e) => log::error!("Failed to register {}: {}", spec.name.display(), e),
            }
        }

        request.resolve();
        match &request.sub_device {
            Some(spec) if request.is_registered() => log::info!(
                "Partition {} registered as {}",
                wanted_index,
                spec.name.display()
            ),
            _ => log::warn!("Partition {} did not register", wanted_index),
        }

        request
    }

    fn mount_partition(&mut self, mount: &MountConfig, role: &str) -> Result<()> {
        let source = format_partition_device_name(&self.config.storage.device, mount.partition)?;
        let request = mount.request(source);

        let registered = self
            .report
            .partition(mount.partition)
            .is_some_and(PartitionRequest::is_registered);
        let result = if registered {
            self.caps.mounter.mount(&request)
        } else {
            log::debug!(
                "Partition {} has no sub-device, not mounting {}",
                mount.partition,
                mount.target.display()
            );
            Err(Errno::ENOENT)
        };
        self.report
            .mounts
            .push(MountOutcome::from_result(&request, &result));

        match result {
            Ok(()) => {
                log::info!(
                    "Mounted {} filesystem ({}) at {}",
                    role,
                    mount.fs,
                    mount.target.display()
                );
                Ok(())
            }
            Err(errno) => {
                log::error!(
                    "Could not mount {} partition {} ({}): {}",
                    role,
                    mount.partition,
                    mount.fs,
                    errno
                );
                Err(request.failure(errno))
            }
        }
    }
}
