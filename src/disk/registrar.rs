//! Sub-device registration
//!
//! Exposes a partition's block range under its sub-device name. On a Linux
//! host this is a loop device attached at the partition's byte offset, with
//! a symlink at the sub-device name pointing at it.

use crate::disk::partition::SubDeviceSpec;
use crate::error::{BringupError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Registers block-range sub-devices on a parent device
#[cfg_attr(test, mockall::automock)]
pub trait SubDeviceRegistrar {
    /// Expose `spec` under `spec.name`
    ///
    /// Registering the same name with the same range again must succeed
    /// without side effects. A different range under a taken name is an
    /// error and leaves the first registration in place.
    fn register_range(&mut self, spec: &SubDeviceSpec) -> Result<()>;
}

/// A registration performed by [`LoopRegistrar`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRegistration {
    /// Registered range
    pub spec: SubDeviceSpec,
    /// Loop device backing it
    pub loop_device: PathBuf,
}

/// Registrar backed by loop devices
pub struct LoopRegistrar {
    /// Logical block size of the parent device
    block_size: u32,
    /// Dry run mode - don't actually execute commands
    dry_run: bool,
    registered: HashMap<PathBuf, LoopRegistration>,
}

impl LoopRegistrar {
    /// Create a new registrar
    pub fn new(block_size: u32, dry_run: bool) -> Self {
        Self {
            block_size,
            dry_run,
            registered: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn registration(&self, name: &Path) -> Option<&LoopRegistration> {
        self.registered.get(name)
    }

    /// Execute a command, respecting dry-run mode
    fn execute(&self, cmd: &mut Command) -> Result<String> {
        let cmd_str = format!("{:?}", cmd);

        if self.dry_run {
            log::info!("[DRY RUN] Would execute: {}", cmd_str);
            return Ok(String::new());
        }

        log::debug!("Executing: {}", cmd_str);
        let output = cmd.output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BringupError::CommandFailed {
                cmd: cmd_str,
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn attach(&self, spec: &SubDeviceSpec) -> Result<PathBuf> {
        let (offset, len) = match (
            spec.byte_offset(self.block_size),
            spec.byte_len(self.block_size),
        ) {
            (Some(offset), Some(len)) => (offset, len),
            _ => {
                return Err(BringupError::RegistrationFailed {
                    name: spec.name.clone(),
                    reason: format!(
                        "blocks [{}, {}) are not addressable in bytes",
                        spec.first_block,
                        spec.end_block()
                    ),
                })
            }
        };

        let stdout = self.execute(
            Command::new("losetup")
                .arg("--find")
                .arg("--show")
                .arg("--offset")
                .arg(offset.to_string())
                .arg("--sizelimit")
                .arg(len.to_string())
                .arg(&spec.parent),
        )?;

        if self.dry_run {
            return Ok(PathBuf::from("/dev/loop-dry-run"));
        }

        if stdout.is_empty() {
            return Err(BringupError::RegistrationFailed {
                name: spec.name.clone(),
                reason: "losetup did not report a loop device".to_string(),
            });
        }

        Ok(PathBuf::from(stdout))
    }

    fn detach(&self, loop_device: &Path) -> Result<()> {
        self.execute(Command::new("losetup").arg("--detach").arg(loop_device))?;
        Ok(())
    }

    /// Point the sub-device name at the loop device
    fn publish(&self, name: &Path, loop_device: &Path) -> Result<()> {
        if self.dry_run {
            log::info!(
                "[DRY RUN] Would link {} -> {}",
                name.display(),
                loop_device.display()
            );
            return Ok(());
        }

        match fs::symlink_metadata(name) {
            Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(name)?,
            Ok(_) => {
                return Err(BringupError::RegistrationFailed {
                    name: name.to_path_buf(),
                    reason: "a non-symlink already exists at this name".to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        std::os::unix::fs::symlink(loop_device, name)?;
        Ok(())
    }
}

impl SubDeviceRegistrar for LoopRegistrar {
    fn register_range(&mut self, spec: &SubDeviceSpec) -> Result<()> {
        if let Some(existing) = self.registered.get(&spec.name) {
            if existing.spec == *spec {
                log::debug!("{} already registered", spec.name.display());
                return Ok(());
            }

            return Err(BringupError::RegistrationFailed {
                name: spec.name.clone(),
                reason: format!(
                    "already registered at blocks [{}, {})",
                    existing.spec.first_block,
                    existing.spec.end_block()
                ),
            });
        }

        log::info!(
            "Registering {} on {}: blocks [{}, {}) ({})",
            spec.name.display(),
            spec.parent.display(),
            spec.first_block,
            spec.end_block(),
            spec.size_human(self.block_size)
        );

        let loop_device = self.attach(spec)?;
        if let Err(e) = self.publish(&spec.name, &loop_device) {
            // Release the loop device again, the name is unusable
            let _ = self.detach(&loop_device);
            return Err(e);
        }

        self.registered.insert(
            spec.name.clone(),
            LoopRegistration {
                spec: spec.clone(),
                loop_device,
            },
        );
        Ok(())
    }
}
