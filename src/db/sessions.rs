//! Session persistence over sqlite.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::rusqlite::types::Value;
use tokio_rusqlite::{Connection, params, rusqlite};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::inventory::DeviceIdentity;
use crate::core::session::{DeviceDetected, DeviceRemoved, SessionRecord, SessionStore};
use crate::error::{Result, TrackerError};

const SESSION_COLUMNS: &str = "id, serial_number, device, tree, insertion_time, removal_time, logs, is_registered";

/// Row as stored, before JSON and timestamp decoding.
struct SessionRow {
    id: String,
    serial_number: String,
    device: String,
    tree: String,
    insertion_time: String,
    removal_time: Option<String>,
    logs: Option<String>,
    is_registered: bool,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            serial_number: row.get(1)?,
            device: row.get(2)?,
            tree: row.get(3)?,
            insertion_time: row.get(4)?,
            removal_time: row.get(5)?,
            logs: row.get(6)?,
            is_registered: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<SessionRecord> {
        let device_snapshot: DeviceIdentity = serde_json::from_str(&self.device)
            .map_err(|e| TrackerError::Database(format!("bad device json in {}: {}", self.id, e)))?;
        let removal_time = self.removal_time.as_deref().map(parse_time).transpose()?;

        Ok(SessionRecord {
            insertion_time: parse_time(&self.insertion_time)?,
            id: self.id,
            serial_number: self.serial_number,
            device_snapshot,
            tree: self.tree,
            removal_time,
            activity_log: self.logs,
            is_registered: self.is_registered,
        })
    }
}

/// Stored in UTC at fixed width so timestamps sort as text whatever the
/// local offset was at the time.
fn timestamp(at: &DateTime<Local>) -> String {
    at.with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str) -> Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| TrackerError::Database(format!("bad timestamp {:?}: {}", value, e)))
}

fn db_error(e: impl std::fmt::Display) -> TrackerError {
    TrackerError::Database(e.to_string())
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(super::init(path).await?))
    }

    pub async fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(super::init_in_memory().await?))
    }

    async fn select(&self, sql: String, args: Vec<Value>) -> Result<Vec<SessionRecord>> {
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(args), SessionRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await
            .map_err(db_error)?;

        rows.into_iter().map(SessionRow::into_record).collect()
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn device_detected(&self, event: DeviceDetected) -> Result<String> {
        let device = serde_json::to_string(&event.device)
            .map_err(|e| TrackerError::handoff("device-detected", &event.serial_number, e))?;
        let serial = event.serial_number.clone();
        let id = Uuid::now_v7().to_string();
        let insertion_time = timestamp(&event.insertion_time);

        let session_id = id.clone();
        let stale = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;

                tx.execute(
                    "INSERT INTO connected_devices (serial_number, device, first_seen)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(serial_number) DO UPDATE SET device = excluded.device",
                    params![&event.serial_number, &device, &insertion_time],
                )?;

                // At most one open session per device
                let stale = tx.execute(
                    "UPDATE detected_devices SET removal_time = ?1, logs = ''
                     WHERE serial_number = ?2 AND removal_time IS NULL",
                    params![&insertion_time, &event.serial_number],
                )?;

                let is_registered: bool = tx.query_row(
                    "SELECT COALESCE(MAX(is_registered), 0) FROM detected_devices
                     WHERE serial_number = ?1",
                    params![&event.serial_number],
                    |row| row.get(0),
                )?;

                tx.execute(
                    "INSERT INTO detected_devices
                     (id, serial_number, device, tree, insertion_time, is_registered)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        &session_id,
                        &event.serial_number,
                        &device,
                        &event.tree,
                        &insertion_time,
                        is_registered
                    ],
                )?;

                tx.commit()?;
                Ok::<usize, rusqlite::Error>(stale)
            })
            .await
            .map_err(|e| TrackerError::handoff("device-detected", &serial, e))?;

        if stale > 0 {
            warn!(serial = %serial, "Closed a stale open session");
        }
        debug!(serial = %serial, session = %id, "Session opened");
        Ok(id)
    }

    async fn device_removed(&self, event: DeviceRemoved) -> Result<()> {
        let serial = event.serial_number.clone();
        let removal_time = timestamp(&event.removal_time);

        let closed = self
            .conn
            .call(move |c| {
                c.execute(
                    "UPDATE detected_devices SET removal_time = ?1, logs = ?2
                     WHERE serial_number = ?3 AND removal_time IS NULL",
                    params![&removal_time, &event.activity_log, &event.serial_number],
                )
            })
            .await
            .map_err(|e| TrackerError::handoff("device-removed", &serial, e))?;

        if closed == 0 {
            return Err(TrackerError::handoff(
                "device-removed",
                &serial,
                "no open session",
            ));
        }
        debug!(serial = %serial, "Session closed");
        Ok(())
    }

    async fn register(&self, serial_number: &str) -> Result<usize> {
        let serial = serial_number.to_string();
        self.conn
            .call(move |c| {
                c.execute(
                    "UPDATE detected_devices SET is_registered = 1 WHERE serial_number = ?1",
                    params![serial],
                )
            })
            .await
            .map_err(db_error)
    }

    async fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<SessionRecord>> {
        self.select(
            format!(
                "SELECT {SESSION_COLUMNS} FROM detected_devices
                 ORDER BY insertion_time DESC, id DESC
                 LIMIT ?1 OFFSET ?2"
            ),
            vec![Value::Integer(limit.into()), Value::Integer(offset.into())],
        )
        .await
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let id = id.to_string();
        let row = self
            .conn
            .call(move |c| {
                c.query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM detected_devices WHERE id = ?1"),
                    params![id],
                    SessionRow::from_row,
                )
                .optional()
            })
            .await
            .map_err(db_error)?;

        row.map(SessionRow::into_record).transpose()
    }

    async fn sessions_for_device(&self, serial_number: &str) -> Result<Vec<SessionRecord>> {
        self.select(
            format!(
                "SELECT {SESSION_COLUMNS} FROM detected_devices
                 WHERE serial_number = ?1
                 ORDER BY insertion_time DESC, id DESC"
            ),
            vec![Value::Text(serial_number.to_string())],
        )
        .await
    }

    async fn latest_per_device(&self) -> Result<Vec<SessionRecord>> {
        self.select(
            format!(
                "SELECT {SESSION_COLUMNS} FROM detected_devices d
                 WHERE d.id = (
                     SELECT x.id FROM detected_devices x
                     WHERE x.serial_number = d.serial_number
                     ORDER BY x.insertion_time DESC, x.id DESC
                     LIMIT 1
                 )
                 ORDER BY insertion_time DESC, id DESC"
            ),
            Vec::new(),
        )
        .await
    }
}
