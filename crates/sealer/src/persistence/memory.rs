//! [`MemoryStore`]: process-local persistence for tests and embedding.

use std::sync::{Mutex, MutexGuard};

use common::OperationLogEntry;

use super::{Persistence, PersistenceError};
use crate::keys::Certificate;

#[derive(Debug, Clone)]
struct StoredCertificate {
    cert: Certificate,
    active: bool,
}

/// In-memory [`Persistence`] backed by mutex-guarded vectors.
#[derive(Debug, Default)]
pub struct MemoryStore {
    certificates: Mutex<Vec<StoredCertificate>>,
    logs: Mutex<Vec<OperationLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every log row in append order.
    pub fn logs(&self) -> Vec<OperationLogEntry> {
        lock(&self.logs).map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of certificates ever stored, active or not.
    pub fn certificate_count(&self) -> usize {
        lock(&self.certificates).map(|c| c.len()).unwrap_or(0)
    }

    /// Number of certificates currently marked active.
    pub fn active_certificate_count(&self) -> usize {
        lock(&self.certificates)
            .map(|c| c.iter().filter(|s| s.active).count())
            .unwrap_or(0)
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, PersistenceError> {
    m.lock()
        .map_err(|_| PersistenceError::Backend("memory store lock poisoned".into()))
}

impl Persistence for MemoryStore {
    fn insert_log(&self, entry: &OperationLogEntry) -> Result<(), PersistenceError> {
        lock(&self.logs)?.push(entry.clone());
        Ok(())
    }

    fn find_active_certificate(&self) -> Result<Option<Certificate>, PersistenceError> {
        Ok(lock(&self.certificates)?
            .iter()
            .rev()
            .find(|s| s.active)
            .map(|s| s.cert.clone()))
    }

    fn find_certificate(&self, serial: &str) -> Result<Option<Certificate>, PersistenceError> {
        Ok(lock(&self.certificates)?
            .iter()
            .find(|s| s.cert.body.serial == serial)
            .map(|s| s.cert.clone()))
    }

    fn insert_certificate(&self, cert: &Certificate) -> Result<(), PersistenceError> {
        lock(&self.certificates)?.push(StoredCertificate {
            cert: cert.clone(),
            active: true,
        });
        Ok(())
    }

    fn deactivate_prior_certificates(&self) -> Result<(), PersistenceError> {
        for stored in lock(&self.certificates)?.iter_mut() {
            stored.active = false;
        }
        Ok(())
    }
}
