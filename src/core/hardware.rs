use tokio::sync::mpsc;

use super::inventory::{DeviceInventory, VolumeInventory};
use crate::error::Result;

/// Coarse device-change notification. Carries no payload: the orchestrator
/// re-enumerates on every signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChange {
    Arrived,
    Removed,
}

impl DeviceChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arrived => "arrived",
            Self::Removed => "removed",
        }
    }
}

pub trait HardwareAdapter: Send + Sync {
    /// Start the notification pump.
    /// Spawns an internal thread that sends signals to the provided channel.
    fn start(&self, event_sender: mpsc::Sender<DeviceChange>);

    /// Stop the notification pump gracefully.
    fn stop(&self);

    /// Current removable devices keyed by serial number.
    /// NOTE: may block on OS enumeration; call from a blocking context.
    fn list_devices(&self) -> Result<DeviceInventory>;

    /// Current mounted volumes of removable devices keyed by mount identifier.
    fn list_volumes(&self) -> Result<VolumeInventory>;
}
