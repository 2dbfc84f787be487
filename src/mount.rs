//! Filesystem mounting
//!
//! Wraps `mount(2)` via nix. Filesystems that cannot be formatted ahead of
//! time are mounted with auto-format: an `EINVAL` on first mount runs the
//! filesystem's mkfs program on the source and retries once.

use crate::error::{BringupError, Result};
use nix::errno::Errno;
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Filesystem kinds the board mounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    /// FAT, user friendly, not power safe
    Vfat,
    /// littlefs, power-loss safe
    Littlefs,
    /// Process information pseudo-filesystem
    Procfs,
}

impl FsKind {
    /// Filesystem type string passed to mount(2)
    pub fn fs_type(&self) -> &'static str {
        match self {
            Self::Vfat => "vfat",
            Self::Littlefs => "littlefs",
            Self::Procfs => "proc",
        }
    }

    /// Program that formats a source with this filesystem
    pub fn mkfs_program(&self) -> Option<&'static str> {
        match self {
            Self::Vfat => Some("mkfs.vfat"),
            Self::Littlefs => Some("mkfs.littlefs"),
            Self::Procfs => None,
        }
    }

    /// Whether the filesystem survives abrupt power loss
    pub fn is_power_safe(&self) -> bool {
        matches!(self, Self::Littlefs)
    }
}

impl std::fmt::Display for FsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vfat => write!(f, "vfat"),
            Self::Littlefs => write!(f, "littlefs"),
            Self::Procfs => write!(f, "procfs"),
        }
    }
}

/// A single mount to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Source device, none for pseudo-filesystems
    pub source: Option<PathBuf>,
    /// Mount point
    pub target: PathBuf,
    /// Filesystem kind
    pub fs: FsKind,
    /// Mount flags
    pub flags: MsFlags,
    /// Filesystem-specific options
    pub options: Option<String>,
    /// Format the source if it holds no filesystem yet
    pub autoformat: bool,
}

impl MountRequest {
    /// Create a request with no flags or options
    pub fn new(source: Option<PathBuf>, target: impl Into<PathBuf>, fs: FsKind) -> Self {
        Self {
            source,
            target: target.into(),
            fs,
            flags: MsFlags::empty(),
            options: None,
            autoformat: false,
        }
    }

    /// The error bring-up reports when this mount fails
    pub fn failure(&self, errno: Errno) -> BringupError {
        BringupError::MountFailed {
            device: self.source.clone(),
            target: self.target.clone(),
            fs: self.fs,
            errno,
        }
    }
}

/// Result of one mount attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountOutcome {
    /// Mount point
    pub target: PathBuf,
    /// Filesystem kind
    pub fs: FsKind,
    /// Whether the mount succeeded
    pub success: bool,
    /// Errno of a failed mount
    pub error_code: Option<i32>,
}

impl MountOutcome {
    /// Record the outcome of `request`
    pub fn from_result(request: &MountRequest, result: &std::result::Result<(), Errno>) -> Self {
        Self {
            target: request.target.clone(),
            fs: request.fs,
            success: result.is_ok(),
            error_code: result.as_ref().err().map(|e| *e as i32),
        }
    }
}

/// Mounts filesystems
#[cfg_attr(test, mockall::automock)]
pub trait Mounter {
    /// Perform `request`, returning the errno on failure
    fn mount(&mut self, request: &MountRequest) -> std::result::Result<(), Errno>;
}

/// Mounter calling mount(2) on the host
pub struct SystemMounter {
    /// Dry run mode - don't actually mount anything
    dry_run: bool,
}

impl SystemMounter {
    /// Create a new mounter
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    fn mount_once(&self, request: &MountRequest) -> std::result::Result<(), Errno> {
        nix::mount::mount(
            request.source.as_deref(),
            &request.target,
            Some(request.fs.fs_type()),
            request.flags,
            request.options.as_deref(),
        )
    }

    /// Format `source` with the request's filesystem
    fn format(&self, request: &MountRequest, source: &Path) -> Result<()> {
        let program = request.fs.mkfs_program().ok_or_else(|| {
            BringupError::config(format!("{} cannot be formatted", request.fs))
        })?;

        log::warn!(
            "Formatting {} as {} for {}",
            source.display(),
            request.fs,
            request.target.display()
        );

        let mut cmd = Command::new(program);
        cmd.arg(source);
        let cmd_str = format!("{:?}", cmd);
        log::debug!("Executing: {}", cmd_str);

        let output = cmd.output()?;
        if !output.status.success() {
            return Err(BringupError::CommandFailed {
                cmd: cmd_str,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

fn io_errno(e: &std::io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

impl Mounter for SystemMounter {
    fn mount(&mut self, request: &MountRequest) -> std::result::Result<(), Errno> {
        let source = request
            .source
            .as_ref()
            .map(|s| s.display().to_string())
            .unwrap_or_else(|| "none".to_string());

        if self.dry_run {
            log::info!(
                "[DRY RUN] Would mount {} ({}) at {}",
                source,
                request.fs,
                request.target.display()
            );
            return Ok(());
        }

        log::info!(
            "Mounting {} ({}) at {}",
            source,
            request.fs,
            request.target.display()
        );

        fs::create_dir_all(&request.target).map_err(|e| io_errno(&e))?;

        if let Some(ref src) = request.source {
            if !src.exists() {
                log::debug!("Mount source {} does not exist", src.display());
                return Err(Errno::ENOENT);
            }
        }

        match self.mount_once(request) {
            Err(Errno::EINVAL) if request.autoformat => {
                let src = request.source.as_deref().ok_or(Errno::EINVAL)?;
                self.format(request, src).map_err(|e| {
                    log::error!("Auto-format of {} failed: {}", src.display(), e);
                    Errno::EINVAL
                })?;
                self.mount_once(request)
            }
            other => other,
        }
    }
}
