//! Common types, envelope definitions, audit rows and errors shared across `sealer` crates.

pub mod audit;
pub mod error;
pub mod protocol;

pub use audit::{Operation, OperationLogEntry, OperationStatus, Primitive};
pub use error::SealError;
pub use protocol::{ProtectedRecord, Record, RevealStatus, VerificationStatus};
