pub mod activity;
pub mod format;
pub mod hardware;
pub mod inventory;
pub mod live;
pub mod monitor;
pub mod orchestrator;
pub mod session;
pub mod tree;

pub use activity::{ActivityEvent, ActivityKind, ActivityLog, FsEvent, FsEventKind};
pub use format::format_size;
pub use hardware::{DeviceChange, HardwareAdapter};
pub use inventory::{DeviceIdentity, DeviceInventory, InventoryDiff, VolumeInfo, VolumeInventory, diff};
pub use live::{LiveSession, LiveSessions};
pub use monitor::{MonitorStats, VolumeMonitor};
pub use orchestrator::{Orchestrator, ReconcileOutcome};
pub use session::{DeviceDetected, DeviceRemoved, SessionRecord, SessionStore};
pub use tree::{Snapshotter, TreeSnapshot};
