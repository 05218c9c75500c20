//! udev-backed hardware adapter.
//!
//! A pump thread polls two descriptors: the udev block-subsystem monitor for
//! plug and unplug, and `/proc/self/mounts` (which raises POLLPRI whenever the
//! mount table changes) for volumes appearing after their device.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::core::hardware::{DeviceChange, HardwareAdapter};
use crate::core::inventory::{DeviceIdentity, DeviceInventory, VolumeInfo, VolumeInventory};
use crate::error::{Result, TrackerError};

const MOUNTS: &str = "/proc/self/mounts";
const POLL_TIMEOUT_MS: u16 = 500;

pub struct LinuxAdapter {
    cancel: CancellationToken,
}

impl LinuxAdapter {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for LinuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareAdapter for LinuxAdapter {
    fn start(&self, event_sender: mpsc::Sender<DeviceChange>) {
        let cancel = self.cancel.clone();
        let spawned = std::thread::Builder::new()
            .name("drivelog-udev".to_string())
            .spawn(move || {
                info!("Starting udev listener");
                if let Err(e) = pump(event_sender, cancel) {
                    error!(error = %e, "udev listener stopped");
                }
            });

        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn udev listener thread");
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn list_devices(&self) -> Result<DeviceInventory> {
        let disks = scan_block_devices().map_err(|e| TrackerError::enumeration("devices", e))?;
        let mut partitions: HashMap<String, u32> = HashMap::new();
        for dev in &disks {
            if devtype(&dev.device).as_deref() == Some("partition") {
                if let Some(parent) = dev.device.parent() {
                    *partitions.entry(sysname(&parent)).or_default() += 1;
                }
            }
        }

        let mut inventory = DeviceInventory::new();
        for dev in &disks {
            if devtype(&dev.device).as_deref() != Some("disk") || !is_removable_disk(&dev.device) {
                continue;
            }
            let Some(mut identity) = identity_of(&dev.device) else {
                trace!(device = %sysname(&dev.device), "Removable disk without serial");
                continue;
            };
            identity.partitions = partitions
                .get(&sysname(&dev.device))
                .copied()
                .unwrap_or(0);
            inventory.insert(identity.serial_number.clone(), identity);
        }
        Ok(inventory)
    }

    fn list_volumes(&self) -> Result<VolumeInventory> {
        let table = std::fs::read_to_string(MOUNTS)
            .map_err(|e| TrackerError::enumeration("volumes", e))?;
        let mounts = parse_mounts(&table);
        let devices = scan_block_devices().map_err(|e| TrackerError::enumeration("volumes", e))?;

        let mut inventory = VolumeInventory::new();
        for dev in devices {
            let Some(mount_point) = mounts.get(&sysname(&dev.device)) else {
                continue;
            };
            let disk = match devtype(&dev.device).as_deref() {
                Some("disk") => Some(dev.device.clone()),
                Some("partition") => dev.device.parent(),
                _ => None,
            };
            let Some(disk) = disk.filter(is_removable_disk) else {
                continue;
            };

            let root = PathBuf::from(mount_point);
            let (total_bytes, free_bytes) = capacity(&root);
            let mount_id = mount_point.clone();
            inventory.insert(
                mount_id.clone(),
                VolumeInfo {
                    mount_id,
                    root,
                    label: property(&dev.device, "ID_FS_LABEL").unwrap_or_default(),
                    total_bytes,
                    free_bytes,
                    device_serial: serial_of(&disk),
                },
            );
        }
        Ok(inventory)
    }
}

struct BlockDevice {
    device: udev::Device,
}

fn scan_block_devices() -> std::io::Result<Vec<BlockDevice>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("block")?;
    Ok(enumerator
        .scan_devices()?
        .filter(|device| !is_virtual(&sysname(device)))
        .map(|device| BlockDevice { device })
        .collect())
}

fn pump(tx: mpsc::Sender<DeviceChange>, cancel: CancellationToken) -> std::io::Result<()> {
    let socket = udev::MonitorBuilder::new()?
        .match_subsystem("block")?
        .listen()?;
    let mut mounts = File::open(MOUNTS)?;
    let mut scratch = String::new();
    // Prime the table so only later changes raise POLLPRI
    mounts.read_to_string(&mut scratch)?;

    while !cancel.is_cancelled() {
        let mut fds = [
            PollFd::new(socket.as_fd(), PollFlags::POLLIN),
            PollFd::new(mounts.as_fd(), PollFlags::POLLPRI),
        ];

        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        let udev_ready = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let mounts_changed = fds[1]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLPRI | PollFlags::POLLERR));

        let mut signals = Vec::new();
        if udev_ready {
            for event in socket.iter() {
                if let Some(change) = classify(&event) {
                    debug!(
                        device = %sysname(&event),
                        signal = change.as_str(),
                        "udev event"
                    );
                    signals.push(change);
                }
            }
        }
        if mounts_changed {
            // Re-reading acknowledges the change
            mounts.seek(SeekFrom::Start(0))?;
            scratch.clear();
            mounts.read_to_string(&mut scratch)?;
            debug!("Mount table changed");
            signals.push(DeviceChange::Arrived);
        }

        for signal in signals {
            if tx.blocking_send(signal).is_err() {
                return Ok(());
            }
        }
    }

    info!("udev listener stopped");
    Ok(())
}

fn classify(event: &udev::Event) -> Option<DeviceChange> {
    if is_virtual(&sysname(event)) {
        return None;
    }
    if !matches!(devtype(event).as_deref(), Some("disk") | Some("partition")) {
        return None;
    }
    match event.event_type() {
        udev::EventType::Add => Some(DeviceChange::Arrived),
        udev::EventType::Remove => Some(DeviceChange::Removed),
        _ => None,
    }
}

fn identity_of(disk: &udev::Device) -> Option<DeviceIdentity> {
    let serial = serial_of(disk)?;
    let vendor = property(disk, "ID_VENDOR").map(|v| v.replace('_', " "));
    let model = property(disk, "ID_MODEL").map(|m| m.replace('_', " "));
    let bus = property(disk, "ID_BUS").unwrap_or_default();

    let mut identity = DeviceIdentity::new(serial);
    identity.caption = match (&vendor, &model) {
        (Some(vendor), Some(model)) => format!("{} {}", vendor, model),
        (None, Some(model)) => model.clone(),
        (Some(vendor), None) => vendor.clone(),
        (None, None) => sysname(disk),
    };
    identity.manufacturer = vendor.unwrap_or_default();
    identity.model = model.unwrap_or_default();
    identity.interface_type = bus.to_uppercase();
    identity.media_type = "Removable Media".to_string();
    identity.firmware_revision = property(disk, "ID_REVISION").unwrap_or_default();
    identity.status = "OK".to_string();
    identity.capabilities = vec!["Random Access".to_string()];
    if attribute(disk, "removable").as_deref() == Some("1") {
        identity.capabilities.push("Supports Removable Media".to_string());
    }
    identity.total_size = attribute(disk, "size")
        .and_then(|s| s.parse::<u64>().ok())
        .map(|sectors| sectors * 512);
    Some(identity)
}

fn serial_of(disk: &udev::Device) -> Option<String> {
    property(disk, "ID_SERIAL_SHORT")
        .or_else(|| property(disk, "ID_SERIAL"))
        .filter(|s| !s.is_empty())
}

fn is_removable_disk(disk: &udev::Device) -> bool {
    property(disk, "ID_BUS").as_deref() == Some("usb")
        || attribute(disk, "removable").as_deref() == Some("1")
}

fn is_virtual(name: &str) -> bool {
    name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram")
}

fn capacity(root: &Path) -> (u64, u64) {
    match nix::sys::statvfs::statvfs(root) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as u64;
            (
                stat.blocks() as u64 * fragment,
                stat.blocks_available() as u64 * fragment,
            )
        }
        Err(e) => {
            debug!(path = %root.display(), error = %e, "statvfs failed");
            (0, 0)
        }
    }
}

fn property(device: &udev::Device, key: &str) -> Option<String> {
    device
        .property_value(key)
        .map(|v| v.to_string_lossy().into_owned())
}

fn attribute(device: &udev::Device, key: &str) -> Option<String> {
    device
        .attribute_value(key)
        .map(|v| v.to_string_lossy().trim().to_string())
}

fn devtype(device: &udev::Device) -> Option<String> {
    device.devtype().map(|v| v.to_string_lossy().into_owned())
}

fn sysname(device: &udev::Device) -> String {
    device.sysname().to_string_lossy().into_owned()
}

/// Kernel device name (`sdb1`) -> first mount point, for `/dev/` sources only.
fn parse_mounts(table: &str) -> HashMap<String, String> {
    let mut mounts = HashMap::new();
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(target)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some(name) = source
            .strip_prefix("/dev/")
            .and_then(|rest| Path::new(rest).file_name())
            .and_then(|n| n.to_str())
        else {
            continue;
        };
        mounts
            .entry(name.to_string())
            .or_insert_with(|| unescape_mount(target));
    }
    mounts
}

/// Undo the octal escaping `/proc/self/mounts` applies to spaces and tabs.
fn unescape_mount(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let byte = octal.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(byte) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mounts_keeps_dev_sources() {
        let table = "\
sysfs /sys sysfs rw,nosuid 0 0
/dev/sda2 / ext4 rw,relatime 0 0
/dev/sdb1 /media/user/MY\\040STICK vfat rw 0 0
/dev/sdb1 /mnt/again vfat rw 0 0
tmpfs /tmp tmpfs rw 0 0
";
        let mounts = parse_mounts(table);

        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts["sda2"], "/");
        assert_eq!(mounts["sdb1"], "/media/user/MY STICK");
    }

    #[test]
    fn test_parse_mounts_mapper_names() {
        let mounts = parse_mounts("/dev/mapper/vault /srv ext4 rw 0 0\n");
        assert_eq!(mounts["vault"], "/srv");
    }

    #[test]
    fn test_unescape_mount() {
        assert_eq!(unescape_mount("/a\\040b\\011c"), "/a b\tc");
        assert_eq!(unescape_mount("/plain"), "/plain");
        assert_eq!(unescape_mount("/trailing\\04"), "/trailing\\04");
    }

    #[test]
    fn test_virtual_devices_skipped() {
        assert!(is_virtual("loop0"));
        assert!(is_virtual("zram1"));
        assert!(!is_virtual("sdb"));
    }
}
