//! Command-line behaviour on disk images, in dry-run mode

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const BLOCK: usize = 512;

/// Write a disk image whose MBR holds `(slot, type, start, count)` records
fn card_image(dir: &Path, records: &[(usize, u8, u32, u32)]) -> PathBuf {
    let mut image = vec![0u8; 16 * BLOCK];
    for &(slot, type_byte, start, count) in records {
        let off = 446 + slot * 16;
        image[off + 4] = type_byte;
        image[off + 8..off + 12].copy_from_slice(&start.to_le_bytes());
        image[off + 12..off + 16].copy_from_slice(&count.to_le_bytes());
    }
    image[510] = 0x55;
    image[511] = 0xAA;

    let path = dir.join("card.img");
    std::fs::write(&path, image).unwrap();
    path
}

fn bringup() -> Command {
    let mut cmd = Command::cargo_bin("board-bringup").unwrap();
    cmd.env("RUST_LOG", "info");
    cmd
}

#[test]
fn test_dry_run_registers_partitions() {
    let dir = TempDir::new().unwrap();
    let image = card_image(dir.path(), &[(0, 0x0c, 2, 6), (1, 0x83, 8, 8)]);

    bringup()
        .arg("--device")
        .arg(&image)
        .arg("--dry-run")
        .arg("--no-procfs")
        .assert()
        .success()
        .stderr(predicate::str::contains("Partition 0 registered"))
        .stderr(predicate::str::contains("Partition 1 registered"))
        .stderr(predicate::str::contains("DRY RUN"));
}

#[test]
fn test_dry_run_warns_on_missing_partition() {
    let dir = TempDir::new().unwrap();
    let image = card_image(dir.path(), &[(0, 0x0c, 2, 6)]);

    bringup()
        .arg("--device")
        .arg(&image)
        .arg("--dry-run")
        .arg("--no-procfs")
        .assert()
        .success()
        .stderr(predicate::str::contains("Partition 1 did not register"));
}

#[test]
fn test_json_report() {
    let dir = TempDir::new().unwrap();
    let image = card_image(dir.path(), &[(0, 0x0c, 2, 6)]);

    let output = bringup()
        .arg("--device")
        .arg(&image)
        .arg("--dry-run")
        .arg("--no-procfs")
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["device"]["block_count"], 16);
    assert_eq!(report["partitions"][0]["status"], "registered");
    assert_eq!(report["partitions"][0]["sub_device"]["first_block"], 2);
    assert_eq!(report["partitions"][1]["status"], "not_found");
    assert_eq!(report["mounts"][0]["fs"], "vfat");
}

#[test]
fn test_dry_run_empty_table_fails_user_mount() {
    let dir = TempDir::new().unwrap();
    let image = card_image(dir.path(), &[]);

    let output = bringup()
        .arg("--device")
        .arg(&image)
        .arg("--dry-run")
        .arg("--no-procfs")
        .arg("--json")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["partitions"][0]["status"], "not_found");
    assert_eq!(report["mounts"][0]["fs"], "vfat");
    assert_eq!(report["mounts"][0]["success"], false);
    assert_eq!(report["mounts"][0]["error_code"], 2);
}

#[test]
fn test_two_digit_partition_rejected() {
    let dir = TempDir::new().unwrap();
    let image = card_image(dir.path(), &[]);

    bringup()
        .arg("--device")
        .arg(&image)
        .arg("--dry-run")
        .arg("--user-partition")
        .arg("10")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_config_file_is_applied() {
    let dir = TempDir::new().unwrap();
    let image = card_image(dir.path(), &[(2, 0x0c, 2, 6)]);
    let config = dir.path().join("bringup.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndevice = \"{}\"\n\n[procfs]\nenabled = false\n\n\
             [user_mount]\npartition = 2\ntarget = \"/mnt/usrfs\"\nfs = \"vfat\"\n",
            image.display()
        ),
    )
    .unwrap();

    bringup()
        .arg("--config")
        .arg(&config)
        .arg("--dry-run")
        .assert()
        .success()
        .stderr(predicate::str::contains("Partition 2 registered"));
}

#[test]
fn test_unreadable_config_fails() {
    bringup()
        .arg("--config")
        .arg("/nonexistent/bringup.toml")
        .arg("--dry-run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}
