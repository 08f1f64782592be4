//! The persistence collaborator: certificate storage and the operation log.
//!
//! The engine never owns a database. Hosts hand it an implementation of
//! [`Persistence`]; two are provided here:
//!
//! - [`MemoryStore`] keeps everything in process memory.
//! - [`SqliteStore`] persists to a SQLite file in WAL mode.
//!
//! # Invariants
//!
//! - Log rows are append-only: no implementation updates or deletes them.
//! - Certificates are never edited in place. Rotation deactivates prior rows
//!   and inserts a new one.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use common::{OperationLogEntry, SealError};
use thiserror::Error;

use crate::keys::Certificate;

/// Errors reported by a persistence backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The backend rejected or failed the operation.
    #[error("backend failure: {0}")]
    Backend(String),

    /// A stored row could not be encoded or decoded.
    #[error("stored data could not be (de)serialised: {0}")]
    Serialization(String),
}

impl From<PersistenceError> for SealError {
    fn from(e: PersistenceError) -> Self {
        SealError::Persistence(e.to_string())
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        PersistenceError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

/// Storage operations the engine needs from its host.
#[cfg_attr(test, mockall::automock)]
pub trait Persistence: Send + Sync {
    /// Append one operation log row.
    fn insert_log(&self, entry: &OperationLogEntry) -> Result<(), PersistenceError>;

    /// Return the single active certificate, if any.
    fn find_active_certificate(&self) -> Result<Option<Certificate>, PersistenceError>;

    /// Return the certificate with `serial`, active or not.
    fn find_certificate(&self, serial: &str) -> Result<Option<Certificate>, PersistenceError>;

    /// Store a new certificate and mark it active.
    fn insert_certificate(&self, cert: &Certificate) -> Result<(), PersistenceError>;

    /// Mark every stored certificate inactive.
    fn deactivate_prior_certificates(&self) -> Result<(), PersistenceError>;
}
