//! Session records and the persistence boundary.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::inventory::DeviceIdentity;
use crate::error::Result;

/// Emitted once when a device and its volume are paired at attach time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDetected {
    pub serial_number: String,
    pub device: DeviceIdentity,
    pub tree: String,
    pub insertion_time: DateTime<Local>,
}

/// Emitted once at detach, after the volume's monitor has fully stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRemoved {
    pub serial_number: String,
    pub removal_time: DateTime<Local>,
    pub activity_log: String,
}

/// One persisted attach/detach cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub serial_number: String,
    pub device_snapshot: DeviceIdentity,
    pub tree: String,
    pub insertion_time: DateTime<Local>,
    pub removal_time: Option<DateTime<Local>>,
    pub activity_log: Option<String>,
    pub is_registered: bool,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        self.removal_time.is_none()
    }
}

/// Persistence collaborator. Rejections surface as
/// [`TrackerError::PersistenceHandoff`](crate::error::TrackerError::PersistenceHandoff).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Open a new session; returns its id.
    async fn device_detected(&self, event: DeviceDetected) -> Result<String>;

    /// Close the device's open session.
    async fn device_removed(&self, event: DeviceRemoved) -> Result<()>;

    /// Mark every session of a device as registered. Idempotent; returns rows touched.
    async fn register(&self, serial_number: &str) -> Result<usize>;

    async fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<SessionRecord>>;

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Every session of one device, newest first.
    async fn sessions_for_device(&self, serial_number: &str) -> Result<Vec<SessionRecord>>;

    /// The newest session of each device ever seen, newest first.
    async fn latest_per_device(&self) -> Result<Vec<SessionRecord>>;
}
