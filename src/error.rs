//! Error taxonomy for the session tracking core.
//!
//! Every failure is contained at the reconciliation-pass boundary: the
//! orchestrator logs it and moves on, nothing here is retried automatically.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Listing devices or volumes failed. Treated as "no change" for that poll.
    #[error("failed to enumerate {what}: {reason}")]
    Enumeration { what: &'static str, reason: String },

    /// A subtree could not be read while snapshotting. The snapshot degrades
    /// to a partial tree.
    #[error("unreadable subtree {path}: {reason}")]
    SnapshotPartial { path: PathBuf, reason: String },

    /// A device-change signal could not be paired with a concrete device and volume.
    #[error("could not correlate {0}")]
    Correlation(String),

    /// Monitor lifecycle misuse (stop twice, start after stop).
    #[error("monitor for {mount} is {state}, cannot {action}")]
    MonitorInvalidState {
        mount: String,
        state: &'static str,
        action: &'static str,
    },

    /// The persistence collaborator rejected an emitted event.
    #[error("persistence rejected {event} for {serial}: {reason}")]
    PersistenceHandoff {
        event: &'static str,
        serial: String,
        reason: String,
    },

    /// The OS watch on a volume could not be installed.
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("database error: {0}")]
    Database(String),
}

impl TrackerError {
    pub fn enumeration(what: &'static str, reason: impl ToString) -> Self {
        Self::Enumeration {
            what,
            reason: reason.to_string(),
        }
    }

    pub fn handoff(event: &'static str, serial: &str, reason: impl ToString) -> Self {
        Self::PersistenceHandoff {
            event,
            serial: serial.to_string(),
            reason: reason.to_string(),
        }
    }
}
