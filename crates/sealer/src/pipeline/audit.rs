//! Best-effort operation log.

use std::sync::Arc;
use std::time::Duration;

use common::{Operation, OperationLogEntry, OperationStatus, Primitive};
use tracing::{debug, warn};

use crate::clock;
use crate::persistence::Persistence;

/// Appends [`OperationLogEntry`] rows through the persistence collaborator.
///
/// A failed append is reported through `tracing` and otherwise ignored: audit
/// is not transactional with the protected write.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn Persistence>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

/// One audit event before it is timestamped.
#[derive(Debug, Clone, Copy)]
pub struct AuditEvent<'a> {
    pub primitive: Primitive,
    pub operation: Operation,
    pub table: &'a str,
    pub elapsed: Duration,
    pub status: OperationStatus,
    pub algorithm: &'a str,
    pub certificate_serial: &'a str,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn Persistence>) -> Self {
        Self { sink }
    }

    /// Append one row. Never fails.
    pub fn record(&self, event: AuditEvent<'_>) -> OperationLogEntry {
        let entry = OperationLogEntry {
            timestamp: clock::unix_millis(),
            primitive: event.primitive,
            operation: event.operation,
            table: event.table.to_owned(),
            duration_ms: event.elapsed.as_secs_f64() * 1000.0,
            status: event.status,
            algorithm: event.algorithm.to_owned(),
            certificate_serial: event.certificate_serial.to_owned(),
        };
        debug!(
            table = %entry.table,
            primitive = entry.primitive.as_str(),
            operation = entry.operation.as_str(),
            status = entry.status.as_str(),
            duration_ms = entry.duration_ms,
            "crypto operation"
        );
        if let Err(e) = self.sink.insert_log(&entry) {
            warn!(
                error = %e,
                table = %entry.table,
                primitive = entry.primitive.as_str(),
                "audit log append failed; continuing"
            );
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, MockPersistence, PersistenceError};

    fn event(status: OperationStatus) -> AuditEvent<'static> {
        AuditEvent {
            primitive: Primitive::Authentication,
            operation: Operation::Sign,
            table: "personnel",
            elapsed: Duration::from_micros(1500),
            status,
            algorithm: "RSA-SHA256-PQ",
            certificate_serial: "RSG-1",
        }
    }

    #[test]
    fn appends_entry() {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditLog::new(store.clone());
        let entry = audit.record(event(OperationStatus::Success));
        assert!((entry.duration_ms - 1.5).abs() < 1e-9);
        assert_eq!(store.logs(), vec![entry]);
    }

    #[test]
    fn sink_failure_is_swallowed() {
        let mut mock = MockPersistence::new();
        mock.expect_insert_log()
            .times(1)
            .returning(|_| Err(PersistenceError::Backend("audit store down".into())));
        let audit = AuditLog::new(Arc::new(mock));
        let entry = audit.record(event(OperationStatus::Error));
        assert_eq!(entry.status, OperationStatus::Error);
    }
}
