//! Common error types shared across crates.

use thiserror::Error;

/// Top-level error taxonomy for the sealing engine.
///
/// Variants map to short machine-readable codes recorded alongside failed
/// pipeline steps:
/// - [`SealError::KeyGeneration`] → `key_generation`
/// - [`SealError::Configuration`] → `configuration`
/// - [`SealError::Decoding`] → `decoding`
/// - [`SealError::Timeout`] → `timeout`
/// - [`SealError::Persistence`] → `persistence`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SealError {
    /// Key material could not be generated (bad primes, exhausted attempts).
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Configuration or key parameters violate an engine invariant.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A ciphertext payload or side-channel structure could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// No modular inverse exists for the requested operands.
    #[error("no modular inverse: {0}")]
    NoInverse(String),

    /// A primitive step exceeded its configured deadline.
    #[error("step `{step}` exceeded its deadline of {deadline_ms} ms")]
    Timeout { step: String, deadline_ms: u64 },

    /// The external persistence collaborator reported a failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A signature envelope is structurally invalid.
    #[error("malformed signature envelope: {0}")]
    MalformedSignature(String),

    /// A stored integrity record is structurally invalid.
    #[error("malformed integrity record: {0}")]
    MalformedIntegrityRecord(String),

    /// A persisted certificate failed verification and cannot be trusted.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
}

impl SealError {
    /// Returns the machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            SealError::KeyGeneration(_) => "key_generation",
            SealError::Configuration(_) => "configuration",
            SealError::Decoding(_) => "decoding",
            SealError::NoInverse(_) => "no_inverse",
            SealError::Timeout { .. } => "timeout",
            SealError::Persistence(_) => "persistence",
            SealError::MalformedSignature(_) => "malformed_signature",
            SealError::MalformedIntegrityRecord(_) => "malformed_integrity_record",
            SealError::InvalidCertificate(_) => "invalid_certificate",
        }
    }

    /// Returns `true` for errors that leave the engine without usable key
    /// material. These must reach the caller at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SealError::KeyGeneration(_)
                | SealError::Configuration(_)
                | SealError::NoInverse(_)
                | SealError::InvalidCertificate(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(SealError::KeyGeneration("x".into()).code(), "key_generation");
        assert_eq!(SealError::Decoding("x".into()).code(), "decoding");
        assert_eq!(
            SealError::Timeout {
                step: "integrity".into(),
                deadline_ms: 5
            }
            .code(),
            "timeout"
        );
        assert_eq!(SealError::Persistence("x".into()).code(), "persistence");
    }

    #[test]
    fn fatality() {
        assert!(SealError::KeyGeneration("x".into()).is_fatal());
        assert!(SealError::Configuration("x".into()).is_fatal());
        assert!(!SealError::Decoding("x".into()).is_fatal());
        assert!(!SealError::Persistence("x".into()).is_fatal());
    }

    #[test]
    fn display_includes_message() {
        let e = SealError::Configuration("modulus too small".into());
        assert!(e.to_string().contains("modulus too small"));
        let t = SealError::Timeout {
            step: "authentication".into(),
            deadline_ms: 10,
        };
        assert!(t.to_string().contains("authentication"));
    }
}
