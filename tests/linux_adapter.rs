//! Linux adapter integration tests.
//!
//! Enumeration smoke tests run anywhere udev is available. The loopback test
//! needs root and losetup/mkfs.ext4, and loop devices are filtered as virtual,
//! so it only checks that the pump survives the udev traffic.
//!
//! Run ignored tests: `sudo cargo test --test linux_adapter -- --ignored`

#![cfg(target_os = "linux")]

use drivelog::adapters::LinuxAdapter;
use drivelog::core::HardwareAdapter;
use nix::unistd::Uid;
use std::process::Command;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn is_root() -> bool {
    Uid::effective().is_root()
}

fn has_tool(name: &str, arg: &str) -> bool {
    Command::new(name).arg(arg).output().is_ok()
}

fn setup_loopback(file_path: &str, size_mb: u64) -> Option<String> {
    let dd = Command::new("dd")
        .args([
            "if=/dev/zero",
            &format!("of={}", file_path),
            "bs=1M",
            &format!("count={}", size_mb),
        ])
        .output()
        .ok()?;
    if !dd.status.success() {
        return None;
    }

    let mkfs = Command::new("mkfs.ext4")
        .args(["-F", "-q", file_path])
        .output()
        .ok()?;
    if !mkfs.status.success() {
        return None;
    }

    let output = Command::new("losetup")
        .args(["--find", "--show", file_path])
        .output()
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[tokio::test]
async fn test_list_devices() {
    let adapter = LinuxAdapter::new();
    let result = adapter.list_devices();
    assert!(
        result.is_ok(),
        "list_devices should not error: {:?}",
        result.err()
    );
}

#[tokio::test]
async fn test_list_volumes_only_removable() {
    let adapter = LinuxAdapter::new();
    let devices = adapter.list_devices().unwrap();
    let volumes = adapter.list_volumes().unwrap();

    for volume in volumes.values() {
        if let Some(serial) = &volume.device_serial {
            assert!(
                devices.contains_key(serial),
                "volume {} links to unknown device {}",
                volume.mount_id,
                serial
            );
        }
    }
}

#[tokio::test]
async fn test_start_stop() {
    let adapter = LinuxAdapter::new();
    let (tx, _rx) = mpsc::channel(32);

    adapter.start(tx);

    // Give udev monitor time to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    adapter.stop();

    // Give poll timeout (500ms) time to notice cancellation
    tokio::time::sleep(Duration::from_millis(600)).await;
}

#[tokio::test]
#[ignore = "requires root privileges and losetup/mkfs.ext4"]
async fn test_loopback_traffic_is_ignored() {
    if !is_root() || !has_tool("losetup", "--version") || !has_tool("mkfs.ext4", "-V") {
        eprintln!("Skipping: requires root, losetup and mkfs.ext4");
        return;
    }

    let temp_file = NamedTempFile::new().expect("create temp file");
    let file_path = temp_file.path().to_string_lossy().to_string();

    let adapter = LinuxAdapter::new();
    let (tx, mut rx) = mpsc::channel(32);
    adapter.start(tx);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let Some(loop_device) = setup_loopback(&file_path, 32) else {
        eprintln!("Failed to setup loopback device");
        adapter.stop();
        return;
    };

    let signal = timeout(Duration::from_secs(2), rx.recv()).await;

    let _ = Command::new("losetup").args(["-d", &loop_device]).output();
    adapter.stop();

    assert!(signal.is_err(), "loop devices should not raise signals: {:?}", signal);
    let devices = adapter.list_devices().unwrap();
    assert!(devices.values().all(|d| !d.caption.contains("loop")));
}
