use std::path::Path;

use anyhow::{Context, Result};
use tokio_rusqlite::Connection;

mod sessions;

pub use sessions::SqliteStore;

pub async fn init(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    prepare(&conn).await?;
    Ok(conn)
}

pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .await
        .context("Failed to open in-memory database")?;
    prepare(&conn).await?;
    Ok(conn)
}

async fn prepare(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        // Enable foreign keys (SQLite disables them by default!)
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await
    .context("Failed to apply database schema")?;

    Ok(())
}
