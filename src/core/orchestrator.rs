//! Session orchestrator.
//!
//! Receives device-change signals, re-enumerates, diffs against the cached
//! inventories and opens or closes sessions. Every reconciliation pass runs
//! under one mutex covering the cached inventories, the pending attach
//! candidates and the mount -> monitor map, so two passes never interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::hardware::{DeviceChange, HardwareAdapter};
use super::inventory::{
    DeviceIdentity, DeviceInventory, VolumeInfo, VolumeInventory, diff,
};
use super::live::LiveSessions;
use super::monitor::VolumeMonitor;
use super::session::{DeviceDetected, DeviceRemoved, SessionStore};
use super::tree::Snapshotter;
use crate::context::AppContext;
use crate::error::{Result, TrackerError};

#[derive(Default)]
struct ReconcileState {
    devices: DeviceInventory,
    volumes: VolumeInventory,
    /// Newly seen devices and volumes that have not been paired yet.
    pending_devices: DeviceInventory,
    pending_volumes: VolumeInventory,
    arrivals: Arrivals,
    pass: u64,
    /// serial -> mount of every open session
    open: HashMap<String, String>,
    /// mount -> monitor watching it
    monitors: HashMap<String, VolumeMonitor>,
}

/// Pass number at which each pending candidate was first seen.
#[derive(Debug, Default)]
struct Arrivals {
    devices: HashMap<String, u64>,
    volumes: HashMap<String, u64>,
}

impl Arrivals {
    fn device(&self, serial: &str) -> u64 {
        self.devices.get(serial).copied().unwrap_or_default()
    }

    fn volume(&self, mount: &str) -> u64 {
        self.volumes.get(mount).copied().unwrap_or_default()
    }

    fn retain_pending(&mut self, devices: &DeviceInventory, volumes: &VolumeInventory) {
        self.devices.retain(|serial, _| devices.contains_key(serial));
        self.volumes.retain(|mount, _| volumes.contains_key(mount));
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    adapter: Arc<dyn HardwareAdapter>,
    store: Arc<dyn SessionStore>,
    live: LiveSessions,
    snapshotter: Arc<Snapshotter>,
    coalesce_window: Duration,
    state: Arc<Mutex<ReconcileState>>,
}

impl Orchestrator {
    pub fn new(ctx: &AppContext, adapter: Arc<dyn HardwareAdapter>) -> Self {
        Self {
            adapter,
            store: ctx.store.clone(),
            live: ctx.live.clone(),
            snapshotter: Arc::new(Snapshotter::new(ctx.config.reserved_dirs.clone())),
            coalesce_window: Duration::from_secs(ctx.config.coalesce_window_secs),
            state: Arc::new(Mutex::new(ReconcileState::default())),
        }
    }

    /// Capture the baseline inventory. Devices attached before this point are
    /// not sessions.
    pub async fn init(&self) -> Result<()> {
        let (devices, volumes) = self.enumerate().await?;
        info!(
            devices = devices.len(),
            volumes = volumes.len(),
            "Captured baseline inventory"
        );

        let mut state = self.state.lock().await;
        state.devices = devices;
        state.volumes = volumes;
        Ok(())
    }

    /// Run until `shutdown` fires or the adapter's channel closes, then close
    /// every open session.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.init().await?;

        let (tx, mut rx) = mpsc::channel(32);
        self.adapter.start(tx);
        info!("Watching for removable devices");

        let mut passes = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = passes.join_next(), if !passes.is_empty() => {}
                signal = rx.recv() => match signal {
                    Some(signal) => {
                        // Each signal gets its own worker so the pump never waits on enumeration
                        let this = self.clone();
                        passes.spawn(async move {
                            this.reconcile(signal).await;
                        });
                    }
                    None => break,
                },
            }
        }

        self.adapter.stop();
        while passes.join_next().await.is_some() {}
        self.shutdown().await;
        Ok(())
    }

    /// One reconciliation pass. Removals are handled before arrivals whatever
    /// the triggering signal was; the signal only labels the pass.
    pub async fn reconcile(&self, signal: DeviceChange) -> ReconcileOutcome {
        let span = info_span!("reconcile", signal = signal.as_str());
        async {
            let mut state = self.state.lock().await;
            let mut outcome = ReconcileOutcome::default();

            let (devices, volumes) = match self.enumerate().await {
                Ok(inventories) => inventories,
                Err(e) => {
                    warn!(error = %e, "Enumeration failed, treating as no change");
                    return outcome;
                }
            };

            let device_diff = diff(&state.devices, &devices);
            let volume_diff = diff(&state.volumes, &volumes);
            debug!(
                devices_added = device_diff.added.len(),
                devices_removed = device_diff.removed.len(),
                volumes_added = volume_diff.added.len(),
                volumes_removed = volume_diff.removed.len(),
                "Inventory diff"
            );

            for mount in volume_diff.removed.keys() {
                state.pending_volumes.remove(mount);
                if state.monitors.contains_key(mount) {
                    debug!(mount = %mount, "Volume gone, session closes with its device");
                }
            }

            for serial in device_diff.removed.keys() {
                if state.pending_devices.remove(serial).is_some() {
                    debug!(serial = %serial, "Unpaired device removed");
                    continue;
                }
                if self.close_session(&mut state, serial).await {
                    outcome.closed.push(serial.clone());
                }
            }

            state.pass += 1;
            let pass = state.pass;
            let ReconcileState {
                pending_devices,
                pending_volumes,
                arrivals,
                ..
            } = &mut *state;
            for (serial, device) in device_diff.added {
                arrivals.devices.insert(serial.clone(), pass);
                pending_devices.insert(serial, device);
            }
            for (mount, volume) in volume_diff.added {
                arrivals.volumes.insert(mount.clone(), pass);
                pending_volumes.insert(mount, volume);
            }
            prune_foreign_volumes(pending_volumes, pending_devices, &devices);

            let pairs = pair_candidates(pending_devices, pending_volumes, arrivals);
            arrivals.retain_pending(pending_devices, pending_volumes);
            if pairs.is_empty() && !(pending_devices.is_empty() && pending_volumes.is_empty()) {
                let reason = TrackerError::Correlation(format!(
                    "{} device(s) with {} volume(s)",
                    state.pending_devices.len(),
                    state.pending_volumes.len()
                ));
                info!(%reason, "Insufficient correlation, waiting for the next signal");
            }

            for (device, volume) in pairs {
                let serial = device.serial_number.clone();
                if state.open.contains_key(&serial) {
                    warn!(serial = %serial, "Device already has an open session");
                    continue;
                }
                self.open_session(&mut state, device, volume).await;
                outcome.opened.push(serial);
            }

            state.devices = devices;
            state.volumes = volumes;
            outcome
        }
        .instrument(span)
        .await
    }

    /// Stop the adapter pump and every monitor, closing each open session
    /// with the current time and its collected log.
    pub async fn shutdown(&self) {
        self.adapter.stop();
        let mut state = self.state.lock().await;
        let serials: Vec<String> = state.open.keys().cloned().collect();
        if !serials.is_empty() {
            info!(sessions = serials.len(), "Closing open sessions");
        }
        for serial in serials {
            self.close_session(&mut state, &serial).await;
        }
    }

    async fn enumerate(&self) -> Result<(DeviceInventory, VolumeInventory)> {
        let adapter = self.adapter.clone();
        tokio::task::spawn_blocking(move || -> Result<(DeviceInventory, VolumeInventory)> {
            Ok((adapter.list_devices()?, adapter.list_volumes()?))
        })
        .await
        .map_err(|e| TrackerError::enumeration("inventory", e))?
    }

    async fn open_session(
        &self,
        state: &mut ReconcileState,
        mut device: DeviceIdentity,
        volume: VolumeInfo,
    ) {
        let serial = device.serial_number.clone();
        let mount = volume.mount_id.clone();
        let insertion_time = Local::now();
        device.merge_volume(&volume);
        let display_name = volume.display_name();

        info!(serial = %serial, mount = %mount, name = %display_name, "Device attached");

        let monitor = self.start_monitor(&volume).await;

        let snapshotter = self.snapshotter.clone();
        let root = volume.root.clone();
        let label = mount.clone();
        let tree = match tokio::task::spawn_blocking(move || snapshotter.snapshot_as(&root, &label))
            .await
        {
            Ok(snapshot) => {
                if snapshot.is_partial() {
                    let reason = TrackerError::SnapshotPartial {
                        path: volume.root.clone(),
                        reason: format!("{} unreadable subtree(s)", snapshot.unreadable.len()),
                    };
                    warn!(serial = %serial, %reason, "Recording a partial tree");
                }
                snapshot.text
            }
            Err(e) => {
                error!(serial = %serial, error = %e, "Tree snapshot failed");
                format!("{}\n", mount)
            }
        };

        let event = DeviceDetected {
            serial_number: serial.clone(),
            device,
            tree,
            insertion_time,
        };
        if let Err(e) = self.store.device_detected(event).await {
            error!(serial = %serial, error = %e, "Failed to hand off detected device");
        }

        state.open.insert(serial.clone(), mount.clone());
        if let Some(monitor) = monitor {
            self.live
                .open(&serial, &mount, &display_name, insertion_time, monitor.stats())
                .await;
            state.monitors.insert(mount, monitor);
        }
    }

    async fn start_monitor(&self, volume: &VolumeInfo) -> Option<VolumeMonitor> {
        let mut monitor = VolumeMonitor::new(volume.mount_id.clone(), self.coalesce_window);
        let root = volume.root.clone();

        let started = tokio::task::spawn_blocking(move || {
            let result = monitor.start(&root);
            (monitor, result)
        })
        .await;

        match started {
            Ok((monitor, Ok(()))) => Some(monitor),
            Ok((_, Err(e))) => {
                error!(mount = %volume.mount_id, error = %e, "Failed to start volume monitor");
                None
            }
            Err(e) => {
                error!(mount = %volume.mount_id, error = %e, "Volume monitor task failed");
                None
            }
        }
    }

    /// Stop the device's monitor and emit its removal. Returns false when the
    /// device had no open session.
    async fn close_session(&self, state: &mut ReconcileState, serial: &str) -> bool {
        let Some(mount) = state.open.remove(serial) else {
            debug!(serial = %serial, "Removed device had no session");
            return false;
        };

        let activity_log = match state.monitors.remove(&mount) {
            Some(monitor) => self.stop_monitor(monitor).await,
            None => {
                let reason = TrackerError::Correlation(format!("no monitor for {}", mount));
                warn!(serial = %serial, %reason, "Closing session with an empty activity log");
                String::new()
            }
        };
        self.live.close(serial).await;

        let removal_time = Local::now();
        info!(serial = %serial, mount = %mount, "Device removed");

        let event = DeviceRemoved {
            serial_number: serial.to_string(),
            removal_time,
            activity_log,
        };
        if let Err(e) = self.store.device_removed(event).await {
            error!(serial = %serial, error = %e, "Failed to hand off removed device");
        }
        true
    }

    async fn stop_monitor(&self, monitor: VolumeMonitor) -> String {
        let mount = monitor.mount_id().to_string();
        let stopped = tokio::task::spawn_blocking(move || {
            let mut monitor = monitor;
            monitor.stop()
        })
        .await;

        match stopped {
            Ok(Ok(log)) => log,
            Ok(Err(e)) => {
                error!(mount = %mount, error = %e, "Failed to stop volume monitor");
                String::new()
            }
            Err(e) => {
                error!(mount = %mount, error = %e, "Volume monitor task failed");
                String::new()
            }
        }
    }
}

/// Drop pending volumes that belong to a device already tracked outside the
/// pending set (a second partition, a remount). They can never pair.
fn prune_foreign_volumes(
    volumes: &mut VolumeInventory,
    pending_devices: &DeviceInventory,
    current_devices: &DeviceInventory,
) {
    volumes.retain(|mount, volume| match &volume.device_serial {
        Some(serial)
            if current_devices.contains_key(serial) && !pending_devices.contains_key(serial) =>
        {
            debug!(mount = %mount, serial = %serial, "Ignoring volume of a tracked device");
            false
        }
        _ => true,
    });
}

/// Pair pending devices with pending volumes, removing the pairs from both.
///
/// A volume that names its device's serial always wins. Otherwise devices
/// and unlinked volumes are paired in key order, which is only reliable when
/// a single device attaches per signal. An unlinked volume never pairs with a
/// device that showed up after it: that volume was already mounted and is not
/// the device's.
fn pair_candidates(
    devices: &mut DeviceInventory,
    volumes: &mut VolumeInventory,
    arrivals: &Arrivals,
) -> Vec<(DeviceIdentity, VolumeInfo)> {
    let mut pairs = Vec::new();

    let linked: Vec<(String, String)> = volumes
        .iter()
        .filter_map(|(mount, volume)| {
            let serial = volume.device_serial.as_ref()?;
            devices
                .contains_key(serial)
                .then(|| (serial.clone(), mount.clone()))
        })
        .collect();

    for (serial, mount) in linked {
        if let (Some(device), Some(volume)) = (devices.remove(&serial), volumes.remove(&mount)) {
            pairs.push((device, volume));
        }
    }

    let mut unlinked: Vec<String> = volumes
        .iter()
        .filter(|(_, v)| v.device_serial.is_none())
        .map(|(mount, _)| mount.clone())
        .collect();

    if devices.len() > 1 && !unlinked.is_empty() {
        warn!(
            devices = devices.len(),
            volumes = unlinked.len(),
            "Several devices attached at once, pairing by order"
        );
    }

    let serials: Vec<String> = devices.keys().cloned().collect();
    for serial in serials {
        let since = arrivals.device(&serial);
        let Some(slot) = unlinked.iter().position(|m| arrivals.volume(m) >= since) else {
            debug!(serial = %serial, "No unlinked volume newer than the device");
            continue;
        };
        let mount = unlinked.remove(slot);
        if let (Some(device), Some(volume)) = (devices.remove(&serial), volumes.remove(&mount)) {
            pairs.push((device, volume));
        }
    }

    pairs
}
