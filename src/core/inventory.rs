//! Device and volume inventories and the key-set differ.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Stable descriptive record for a physical removable drive.
///
/// Captured once per session and never mutated afterwards, apart from the
/// volume fields merged in at attach time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial_number: String,
    pub caption: String,
    pub manufacturer: String,
    pub interface_type: String,
    pub media_type: String,
    pub model: String,
    pub firmware_revision: String,
    pub capabilities: Vec<String>,
    pub partitions: u32,
    pub status: String,

    // Filled in from the paired volume when a session opens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_space: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_space: Option<u64>,
}

impl DeviceIdentity {
    pub fn new(serial_number: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            caption: String::new(),
            manufacturer: String::new(),
            interface_type: String::new(),
            media_type: String::new(),
            model: String::new(),
            firmware_revision: String::new(),
            capabilities: Vec::new(),
            partitions: 0,
            status: String::new(),
            display_name: None,
            total_size: None,
            free_space: None,
            used_space: None,
        }
    }

    /// Copy display name and capacity figures from the volume this device is mounted as.
    pub fn merge_volume(&mut self, volume: &VolumeInfo) {
        self.display_name = Some(volume.display_name());
        self.total_size = Some(volume.total_bytes);
        self.free_space = Some(volume.free_bytes);
        self.used_space = Some(volume.used_bytes());
    }
}

/// OS mount representation of an attached device's filesystem.
///
/// `mount_id` is transient: the same device can come back under a different one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub mount_id: String,
    pub root: PathBuf,
    pub label: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// Serial of the physical device backing this volume, when the OS layer knows it.
    pub device_serial: Option<String>,
}

impl VolumeInfo {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    /// Volume label, or `USB Drive (<mount>)` when the OS reports none.
    pub fn display_name(&self) -> String {
        if self.label.trim().is_empty() {
            format!("USB Drive ({})", self.mount_id)
        } else {
            self.label.clone()
        }
    }
}

/// Snapshot of a collaborator's listing, taken at one polling instant.
pub type Inventory<T> = BTreeMap<String, T>;
pub type DeviceInventory = Inventory<DeviceIdentity>;
pub type VolumeInventory = Inventory<VolumeInfo>;

/// Keys that appeared and disappeared between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryDiff<T> {
    pub added: Inventory<T>,
    pub removed: Inventory<T>,
}

impl<T> InventoryDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compare two snapshots by key set only. Content changes under an existing
/// key are not arrivals or removals.
pub fn diff<T: Clone>(previous: &Inventory<T>, current: &Inventory<T>) -> InventoryDiff<T> {
    let added = current
        .iter()
        .filter(|(key, _)| !previous.contains_key(*key))
        .map(|(key, record)| (key.clone(), record.clone()))
        .collect();

    let removed = previous
        .iter()
        .filter(|(key, _)| !current.contains_key(*key))
        .map(|(key, record)| (key.clone(), record.clone()))
        .collect();

    InventoryDiff { added, removed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn inv(keys: &[&str]) -> Inventory<u32> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| (k.to_string(), i as u32))
            .collect()
    }

    fn keys(map: &Inventory<u32>) -> BTreeSet<String> {
        map.keys().cloned().collect()
    }

    #[test]
    fn test_diff_added_and_removed() {
        let previous = inv(&["A", "B", "C"]);
        let current = inv(&["B", "C", "D"]);

        let d = diff(&previous, &current);

        assert_eq!(keys(&d.added), BTreeSet::from(["D".to_string()]));
        assert_eq!(keys(&d.removed), BTreeSet::from(["A".to_string()]));
    }

    #[test]
    fn test_diff_ignores_content_changes() {
        let mut previous = Inventory::new();
        previous.insert("SN1".to_string(), 1u32);
        let mut current = Inventory::new();
        current.insert("SN1".to_string(), 99u32);

        assert!(diff(&previous, &current).is_empty());
    }

    #[test]
    fn test_diff_partitions_symmetric_difference() {
        let cases: [(&[&str], &[&str]); 5] = [
            (&[], &[]),
            (&[], &["A", "B"]),
            (&["A", "B"], &[]),
            (&["A", "B", "C"], &["C", "D", "E"]),
            (&["X"], &["X"]),
        ];

        for (p, c) in cases {
            let previous = inv(p);
            let current = inv(c);
            let d = diff(&previous, &current);

            let added = keys(&d.added);
            let removed = keys(&d.removed);
            let p_keys = keys(&previous);
            let c_keys = keys(&current);
            let symmetric: BTreeSet<String> =
                p_keys.symmetric_difference(&c_keys).cloned().collect();

            assert!(added.is_disjoint(&removed));
            assert_eq!(added.union(&removed).cloned().collect::<BTreeSet<_>>(), symmetric);
        }
    }

    #[test]
    fn test_display_name_falls_back_to_mount() {
        let mut volume = VolumeInfo {
            mount_id: "E:".to_string(),
            root: PathBuf::from("E:"),
            label: String::new(),
            total_bytes: 100,
            free_bytes: 40,
            device_serial: None,
        };
        assert_eq!(volume.display_name(), "USB Drive (E:)");

        volume.label = "KINGSTON".to_string();
        assert_eq!(volume.display_name(), "KINGSTON");
    }

    #[test]
    fn test_merge_volume_copies_capacity() {
        let volume = VolumeInfo {
            mount_id: "/media/usb0".to_string(),
            root: PathBuf::from("/media/usb0"),
            label: "BACKUP".to_string(),
            total_bytes: 1000,
            free_bytes: 250,
            device_serial: Some("SN1".to_string()),
        };
        let mut device = DeviceIdentity::new("SN1");
        device.merge_volume(&volume);

        assert_eq!(device.display_name.as_deref(), Some("BACKUP"));
        assert_eq!(device.total_size, Some(1000));
        assert_eq!(device.free_space, Some(250));
        assert_eq!(device.used_space, Some(750));
    }
}
