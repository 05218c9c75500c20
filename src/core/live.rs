//! In-memory view of currently open sessions.
//!
//! The orchestrator inserts an entry when a session opens and removes it at
//! detach. Byte and line counters are read live from the volume's monitor.
//! Nothing here is persisted; the session store holds the durable record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::monitor::MonitorStats;

#[derive(Debug, Clone)]
struct LiveEntry {
    serial_number: String,
    mount_id: String,
    display_name: String,
    insertion_time: DateTime<Local>,
    stats: Arc<MonitorStats>,
}

/// Point-in-time view of one open session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSession {
    pub serial_number: String,
    pub mount_id: String,
    pub display_name: String,
    pub insertion_time: DateTime<Local>,
    pub bytes_transferred: u64,
    pub log_lines: u64,
}

/// Thread-safe registry of open sessions keyed by serial number.
#[derive(Clone, Default)]
pub struct LiveSessions {
    inner: Arc<RwLock<HashMap<String, LiveEntry>>>,
}

impl LiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(
        &self,
        serial_number: &str,
        mount_id: &str,
        display_name: &str,
        insertion_time: DateTime<Local>,
        stats: Arc<MonitorStats>,
    ) {
        let mut map = self.inner.write().await;
        map.insert(
            serial_number.to_string(),
            LiveEntry {
                serial_number: serial_number.to_string(),
                mount_id: mount_id.to_string(),
                display_name: display_name.to_string(),
                insertion_time,
                stats,
            },
        );
    }

    pub async fn close(&self, serial_number: &str) {
        let mut map = self.inner.write().await;
        map.remove(serial_number);
    }

    pub async fn get(&self, serial_number: &str) -> Option<LiveSession> {
        let map = self.inner.read().await;
        map.get(serial_number).map(snapshot)
    }

    /// All open sessions, oldest first.
    pub async fn get_all(&self) -> Vec<LiveSession> {
        let map = self.inner.read().await;
        let mut sessions: Vec<LiveSession> = map.values().map(snapshot).collect();
        sessions.sort_by(|a, b| a.insertion_time.cmp(&b.insertion_time));
        sessions
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}

fn snapshot(entry: &LiveEntry) -> LiveSession {
    LiveSession {
        serial_number: entry.serial_number.clone(),
        mount_id: entry.mount_id.clone(),
        display_name: entry.display_name.clone(),
        insertion_time: entry.insertion_time,
        bytes_transferred: entry.stats.bytes_transferred(),
        log_lines: entry.stats.log_lines(),
    }
}
