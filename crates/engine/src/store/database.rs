//! SQLite database holding the engine's durable state.
//!
//! Every dispatch opens its own connection. The database is put in WAL mode,
//! so readers never block the single writer. Writers queue on the write lock
//! for up to the configured busy timeout before reporting a conflict that the
//! dispatcher retries.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::Connection;

use crate::error::{EngineError, Result};

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Handle on the engine database file.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Open or create a database at the given path.
    ///
    /// If the database doesn't exist, it will be created and migrations will be run.
    /// If it exists, any pending migrations will be applied.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self {
            path: path.to_path_buf(),
            busy_timeout,
        };
        let mut conn = db.connect()?;
        migrate(&mut conn)?;

        tracing::debug!(path = %db.path.display(), "Engine database ready");
        Ok(db)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh connection.
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::debug!(mode = %mode, "WAL journal mode unavailable");
        }
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(conn)
    }
}

/// Get the schema version of a connection.
pub fn schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Run all pending migrations.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let current_version = schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if schema_version(conn)? != CURRENT_SCHEMA_VERSION {
        return Err(EngineError::invariant(format!(
            "unsupported schema version {}",
            schema_version(conn)?
        )));
    }

    Ok(())
}

/// Migration to version 1: Initial schema.
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS protocol_instances (
            owned_identity BLOB NOT NULL,
            protocol_id INTEGER NOT NULL,
            instance_uid BLOB NOT NULL,
            state_kind INTEGER NOT NULL,
            state_payload BLOB NOT NULL,
            version INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (owned_identity, protocol_id, instance_uid)
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS received_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owned_identity BLOB NOT NULL,
            protocol_id INTEGER NOT NULL,
            instance_uid BLOB NOT NULL,
            message_kind INTEGER NOT NULL,
            inputs BLOB NOT NULL,
            reception_channel BLOB NOT NULL,
            dialog_uuid TEXT,
            user_response BLOB,
            received_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_received_messages_instance
        ON received_messages(owned_identity, instance_uid)
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS channel_creation_instances (
            owned_identity BLOB NOT NULL,
            contact_identity BLOB NOT NULL,
            contact_device_uid BLOB NOT NULL,
            instance_uid BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (owned_identity, contact_identity, contact_device_uid)
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS ping_signatures_received (
            owned_identity BLOB NOT NULL,
            signature BLOB NOT NULL,
            received_at INTEGER NOT NULL,
            PRIMARY KEY (owned_identity, signature)
        )
        "#,
        [],
    )?;

    tx.execute(&format!("PRAGMA user_version = {}", 1), [])?;

    tx.commit()?;
    Ok(())
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) fn open_in_memory() -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    migrate(&mut conn).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn test_in_memory_migration() {
        let conn = open_in_memory();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        let tables = table_names(&conn);
        for table in [
            "channel_creation_instances",
            "ping_signatures_received",
            "protocol_instances",
            "received_messages",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing {table}");
        }
    }

    #[test]
    fn test_open_creates_directories_and_is_reopenable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("engine.sqlite");

        let db = Database::open(&path, Duration::from_millis(100)).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), path.as_path());

        let reopened = Database::open(&path, Duration::from_millis(100)).unwrap();
        let conn = reopened.connect().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_connections_use_wal() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("wal.sqlite"), Duration::from_millis(100))
            .unwrap();
        let conn = db.connect().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
