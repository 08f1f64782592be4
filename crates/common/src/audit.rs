//! Append-only operation log rows.

use serde::{Deserialize, Serialize};

/// The protection a log entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Primitive {
    Confidentiality,
    Authentication,
    Integrity,
}

impl Primitive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Primitive::Confidentiality => "CONFIDENTIALITY",
            Primitive::Authentication => "AUTHENTICATION",
            Primitive::Integrity => "INTEGRITY",
        }
    }
}

/// The operation performed by a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Compute,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Encrypt => "ENCRYPT",
            Operation::Decrypt => "DECRYPT",
            Operation::Sign => "SIGN",
            Operation::Verify => "VERIFY",
            Operation::Compute => "COMPUTE",
        }
    }
}

/// Outcome recorded for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Success,
    /// A verification ran to completion and did not match.
    Failed,
    /// The step itself failed and was degraded to a passthrough.
    Error,
    /// An integrity check detected tampering.
    Compromised,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "SUCCESS",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Error => "ERROR",
            OperationStatus::Compromised => "COMPROMISED",
        }
    }
}

/// One audit row. Never updated or deleted once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    /// Unix milliseconds.
    pub timestamp: u64,
    pub primitive: Primitive,
    pub operation: Operation,
    /// Target table name.
    pub table: String,
    pub duration_ms: f64,
    pub status: OperationStatus,
    pub algorithm: String,
    pub certificate_serial: String,
}
