use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::hardware::{DeviceChange, HardwareAdapter};
use crate::core::inventory::{DeviceIdentity, DeviceInventory, VolumeInfo, VolumeInventory};
use crate::error::{Result, TrackerError};

#[derive(Default)]
struct SimState {
    devices: DeviceInventory,
    volumes: VolumeInventory,
    fail_enumeration: bool,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives a [`SimulatedAdapter`]: mutates its inventory and fires signals.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
    tx: mpsc::UnboundedSender<DeviceChange>,
}

impl Simulator {
    /// Plug in a device with one volume mounted at `mount_id`, backed by `root`.
    pub fn attach(&self, serial: &str, mount_id: &str, root: impl Into<PathBuf>) {
        {
            let mut state = lock(&self.state);
            let mut device = DeviceIdentity::new(serial);
            device.caption = format!("Simulated USB Device {}", serial);
            device.interface_type = "USB".to_string();
            device.media_type = "Removable Media".to_string();
            device.partitions = 1;
            state.devices.insert(serial.to_string(), device);
            state.volumes.insert(
                mount_id.to_string(),
                VolumeInfo {
                    mount_id: mount_id.to_string(),
                    root: root.into(),
                    label: String::new(),
                    total_bytes: 64 * 1024 * 1024 * 1024,
                    free_bytes: 32 * 1024 * 1024 * 1024,
                    device_serial: Some(serial.to_string()),
                },
            );
        }
        self.signal(DeviceChange::Arrived);
    }

    /// Plug in a device whose volume is not mounted yet.
    pub fn attach_device(&self, device: DeviceIdentity) {
        lock(&self.state)
            .devices
            .insert(device.serial_number.clone(), device);
        self.signal(DeviceChange::Arrived);
    }

    pub fn mount(&self, volume: VolumeInfo) {
        lock(&self.state)
            .volumes
            .insert(volume.mount_id.clone(), volume);
        self.signal(DeviceChange::Arrived);
    }

    /// Unplug a device along with every volume linked to it.
    pub fn detach(&self, serial: &str) {
        {
            let mut state = lock(&self.state);
            state.devices.remove(serial);
            state
                .volumes
                .retain(|_, v| v.device_serial.as_deref() != Some(serial));
        }
        self.signal(DeviceChange::Removed);
    }

    /// Make every following enumeration fail until cleared.
    pub fn fail_enumeration(&self, fail: bool) {
        lock(&self.state).fail_enumeration = fail;
    }

    /// Fire a signal without touching the inventory.
    pub fn signal(&self, change: DeviceChange) {
        let _ = self.tx.send(change);
    }
}

pub struct SimulatedAdapter {
    state: Arc<Mutex<SimState>>,
    // Taken by `start()`, which only runs once.
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<DeviceChange>>>,
    cancel: tokio_util::sync::CancellationToken,
}

impl SimulatedAdapter {
    pub fn new() -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SimState::default()));

        (
            Self {
                state: state.clone(),
                cmd_rx: Mutex::new(Some(rx)),
                cancel: tokio_util::sync::CancellationToken::new(),
            },
            Simulator { state, tx },
        )
    }
}

impl HardwareAdapter for SimulatedAdapter {
    fn start(&self, event_sender: mpsc::Sender<DeviceChange>) {
        let Some(mut rx) = self
            .cmd_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("Simulated adapter already started");
            return;
        };

        debug!("Simulated adapter listening for controller commands");
        let cancel = self.cancel.clone();

        // Bridge task
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = rx.recv() => match change {
                        Some(change) => {
                            if event_sender.send(change).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn list_devices(&self) -> Result<DeviceInventory> {
        let state = lock(&self.state);
        if state.fail_enumeration {
            return Err(TrackerError::enumeration("devices", "simulated failure"));
        }
        Ok(state.devices.clone())
    }

    fn list_volumes(&self) -> Result<VolumeInventory> {
        let state = lock(&self.state);
        if state.fail_enumeration {
            return Err(TrackerError::enumeration("volumes", "simulated failure"));
        }
        Ok(state.volumes.clone())
    }
}
