//! Board Bring-up - Main Entry Point
//!
//! Brings the storage card online and mounts its filesystems.

use anyhow::{bail, Context};
use board_bringup::*;
use clap::Parser;
use std::path::PathBuf;
use std::process;

/// Board storage bring-up
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
EXAMPLES:
    # Bring up the default card
    board-bringup

    # Use a configuration file
    board-bringup --config /etc/board/bringup.toml

    # Inspect a disk image without touching anything
    board-bringup --device card.img --dry-run --json

    # Also mount the power-safe filesystem
    board-bringup --enable-power-safe
")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Parent block device or disk image
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Card slot number
    #[arg(long)]
    slot: Option<u32>,

    /// Logical block size in bytes
    #[arg(short, long)]
    block_size: Option<u32>,

    /// Partition index holding the user filesystem (0-9)
    #[arg(short, long)]
    user_partition: Option<u32>,

    /// Partition index holding the power-safe filesystem (0-9)
    #[arg(short, long)]
    power_safe_partition: Option<u32>,

    /// Mount the power-safe filesystem
    #[arg(short, long)]
    enable_power_safe: bool,

    /// Skip mounting procfs
    #[arg(long)]
    no_procfs: bool,

    /// Dry run - show what would be done without making changes
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Print the bring-up report as JSON
    #[arg(short, long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    // Parse arguments
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match run(args) {
        Ok(()) => process::exit(0),
        Err(e) => {
            log::error!("Bring-up failed: {:#}", e);
            process::exit(1);
        }
    }
}

fn build_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match args.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::new(),
    };

    if let Some(ref device) = args.device {
        config.storage.device = device.clone();
    }
    if let Some(slot) = args.slot {
        config.storage.slot = slot;
    }
    if let Some(block_size) = args.block_size {
        config.storage.block_size = block_size;
    }
    if let Some(index) = args.user_partition {
        config.user_mount.partition = index;
    }
    if let Some(index) = args.power_safe_partition {
        config.power_safe_mount.partition = index;
    }
    if args.enable_power_safe {
        config.enable_power_safe_mount = true;
    }
    if args.no_procfs {
        config.procfs.enabled = false;
    }
    config.dry_run = args.dry_run;

    Ok(config)
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = build_config(&args)?;

    // Check root privileges
    if !config.dry_run && !system::is_root() {
        bail!(BringupError::PermissionDenied(
            "mounting and loop device setup need root".to_string()
        ));
    }

    log::info!("Configuration:");
    log::info!("  Device: {}", config.storage.device.display());
    log::info!("  Slot: {}", config.storage.slot);
    log::info!("  Block size: {}", config.storage.block_size);
    log::info!(
        "  User filesystem: partition {} ({}) at {}",
        config.user_mount.partition,
        config.user_mount.fs,
        config.user_mount.target.display()
    );
    log::info!(
        "  Power-safe filesystem: partition {} ({}) at {}{}",
        config.power_safe_mount.partition,
        config.power_safe_mount.fs,
        config.power_safe_mount.target.display(),
        if config.enable_power_safe_mount {
            ""
        } else {
            " (disabled)"
        }
    );

    let json = args.json;
    let mut bringup = Bringup::host(config)?;
    let result = bringup.run();

    if json {
        let report = serde_json::to_string_pretty(bringup.report())
            .context("Failed to serialize bring-up report")?;
        println!("{}", report);
    }

    result?;
    Ok(())
}
