//! [`SqliteStore`]: SQLite-backed persistence.
//!
//! Two tables:
//! - `certificates`: one row per generated certificate, full JSON in
//!   `certificate_data`, at most one row with `active = 1`.
//! - `crypto_logs`: append-only operation log.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use common::OperationLogEntry;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::info;

use super::{Persistence, PersistenceError};
use crate::keys::Certificate;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS certificates (
    serial           TEXT PRIMARY KEY,
    certificate_data TEXT NOT NULL,
    created_at       INTEGER NOT NULL,
    valid_from       INTEGER NOT NULL,
    valid_to         INTEGER NOT NULL,
    active           INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_certificates_active ON certificates(active);

CREATE TABLE IF NOT EXISTS crypto_logs (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp          INTEGER NOT NULL,
    primitive_type     TEXT NOT NULL,
    operation          TEXT NOT NULL,
    table_name         TEXT NOT NULL,
    duration_ms        REAL NOT NULL,
    status             TEXT NOT NULL,
    crypto_algorithm   TEXT NOT NULL,
    certificate_serial TEXT NOT NULL
);
";

/// SQLite implementation of [`Persistence`].
///
/// The connection is guarded by a mutex so the store can be shared across
/// threads behind an `Arc`.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and initialise the schema.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the file cannot be opened or
    /// the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PersistenceError::Backend(e.to_string()))?;
            }
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        // journal_mode reports the resulting mode as a row.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        info!(path = %path.display(), "opened sqlite store");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn
            .lock()
            .map_err(|_| PersistenceError::Backend("sqlite connection lock poisoned".into()))
    }

    /// Number of rows in `crypto_logs`.
    pub fn log_count(&self) -> Result<u64, PersistenceError> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM crypto_logs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Number of rows in `certificates`, active or not.
    pub fn certificate_count(&self) -> Result<u64, PersistenceError> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM certificates", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

impl Persistence for SqliteStore {
    fn insert_log(&self, entry: &OperationLogEntry) -> Result<(), PersistenceError> {
        self.conn()?.execute(
            "INSERT INTO crypto_logs (timestamp, primitive_type, operation, table_name,
                 duration_ms, status, crypto_algorithm, certificate_serial)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.timestamp as i64,
                entry.primitive.as_str(),
                entry.operation.as_str(),
                entry.table,
                entry.duration_ms,
                entry.status.as_str(),
                entry.algorithm,
                entry.certificate_serial,
            ],
        )?;
        Ok(())
    }

    fn find_active_certificate(&self) -> Result<Option<Certificate>, PersistenceError> {
        let data: Option<String> = self
            .conn()?
            .query_row(
                "SELECT certificate_data FROM certificates
                 WHERE active = 1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn find_certificate(&self, serial: &str) -> Result<Option<Certificate>, PersistenceError> {
        let data: Option<String> = self
            .conn()?
            .query_row(
                "SELECT certificate_data FROM certificates WHERE serial = ?1",
                params![serial],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn insert_certificate(&self, cert: &Certificate) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(cert)?;
        self.conn()?.execute(
            "INSERT INTO certificates (serial, certificate_data, created_at, valid_from, valid_to, active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                cert.body.serial,
                json,
                cert.body.valid_from as i64,
                cert.body.valid_from as i64,
                cert.body.valid_to as i64,
            ],
        )?;
        Ok(())
    }

    fn deactivate_prior_certificates(&self) -> Result<(), PersistenceError> {
        self.conn()?
            .execute("UPDATE certificates SET active = 0 WHERE active = 1", [])?;
        Ok(())
    }
}
