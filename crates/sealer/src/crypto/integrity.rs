//! Tamper detection over a whole record.
//!
//! The digest input binds the algorithm, certificate serial and compute
//! timestamp together with the record:
//!
//! ```text
//! canonical("integrity") ‖ str(algorithm) ‖ str(serial) ‖ u64(timestamp) ‖ record
//! ```
//!
//! `record` excludes only the `integrity_record` field, so a stored ciphertext
//! bundle and signature envelope are covered too. Verification rebuilds the
//! input from the *stored* serial and timestamp.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use common::protocol::{IntegrityRecord, INTEGRITY_RECORD_FIELD};
use common::{Record, SealError};

use super::canonical::Canonical;
use crate::clock;
use crate::keys::CertificateBody;

type HmacSha256 = Hmac<Sha256>;

/// Algorithm tag for the plain digest mode.
pub const DIGEST_ALGORITHM: &str = "SHA-256";
/// Algorithm tag for the keyed mode.
pub const KEYED_ALGORITHM: &str = "HMAC-SHA-256";

const LABEL: &str = "integrity";
const DIGEST_LEN: usize = 32;

/// How the integrity digest is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMode {
    /// Plain SHA-256. Detects accidental or unkeyed modification.
    #[default]
    Digest,
    /// HMAC-SHA-256 keyed with the private exponent.
    Keyed,
}

impl IntegrityMode {
    pub fn algorithm(self) -> &'static str {
        match self {
            IntegrityMode::Digest => DIGEST_ALGORITHM,
            IntegrityMode::Keyed => KEYED_ALGORITHM,
        }
    }

    fn from_algorithm(tag: &str) -> Option<Self> {
        match tag {
            DIGEST_ALGORITHM => Some(IntegrityMode::Digest),
            KEYED_ALGORITHM => Some(IntegrityMode::Keyed),
            _ => None,
        }
    }
}

impl std::str::FromStr for IntegrityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "digest" => Ok(IntegrityMode::Digest),
            "keyed" => Ok(IntegrityMode::Keyed),
            other => Err(format!("unknown integrity mode {other:?}")),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    /// The stored integrity record is structurally invalid.
    #[error("malformed integrity record: {0}")]
    Malformed(String),

    /// The MAC key could not be constructed.
    #[error("integrity key unusable: {0}")]
    Key(String),
}

impl From<IntegrityError> for SealError {
    fn from(e: IntegrityError) -> Self {
        match e {
            IntegrityError::Malformed(_) => SealError::MalformedIntegrityRecord(e.to_string()),
            IntegrityError::Key(_) => SealError::Configuration(e.to_string()),
        }
    }
}

/// Compute an integrity record over `record` at the current time.
pub fn compute(
    record: &Record,
    mode: IntegrityMode,
    keys: &CertificateBody,
) -> Result<IntegrityRecord, IntegrityError> {
    let timestamp = clock::unix_millis();
    let algorithm = mode.algorithm();
    let input = digest_input(record, algorithm, &keys.serial, timestamp);
    let digest = match mode {
        IntegrityMode::Digest => Sha256::digest(&input).to_vec(),
        IntegrityMode::Keyed => mac(keys)?.chain_update(&input).finalize().into_bytes().to_vec(),
    };
    Ok(IntegrityRecord {
        digest: hex::encode(digest),
        algorithm: algorithm.into(),
        certificate_serial: keys.serial.clone(),
        timestamp,
    })
}

/// Recompute the digest of `record` with the metadata in `stored` and compare.
///
/// # Errors
///
/// Returns [`IntegrityError::Malformed`] for an unknown algorithm or a digest
/// that is not 32 bytes of hex.
pub fn verify(
    record: &Record,
    stored: &IntegrityRecord,
    keys: &CertificateBody,
) -> Result<bool, IntegrityError> {
    let mode = IntegrityMode::from_algorithm(&stored.algorithm).ok_or_else(|| {
        IntegrityError::Malformed(format!("unknown algorithm {:?}", stored.algorithm))
    })?;
    let expected = hex::decode(&stored.digest)
        .map_err(|e| IntegrityError::Malformed(format!("digest is not hex: {e}")))?;
    if expected.len() != DIGEST_LEN {
        return Err(IntegrityError::Malformed(format!(
            "digest has {} bytes, expected {DIGEST_LEN}",
            expected.len()
        )));
    }

    let input = digest_input(
        record,
        &stored.algorithm,
        &stored.certificate_serial,
        stored.timestamp,
    );
    Ok(match mode {
        IntegrityMode::Digest => Sha256::digest(&input).as_slice() == expected.as_slice(),
        IntegrityMode::Keyed => mac(keys)?.chain_update(&input).verify_slice(&expected).is_ok(),
    })
}

/// Deserialize a stored integrity record from its side-channel value.
pub fn parse_record(value: &Value) -> Result<IntegrityRecord, IntegrityError> {
    serde_json::from_value(value.clone()).map_err(|e| IntegrityError::Malformed(e.to_string()))
}

fn digest_input(record: &Record, algorithm: &str, serial: &str, timestamp: u64) -> Vec<u8> {
    let mut c = Canonical::new(LABEL);
    c.put_str(algorithm)
        .put_str(serial)
        .put_u64(timestamp)
        .put_record(record, &[INTEGRITY_RECORD_FIELD]);
    c.into_bytes()
}

fn mac(keys: &CertificateBody) -> Result<HmacSha256, IntegrityError> {
    HmacSha256::new_from_slice(&keys.private_key.exponent.to_bytes_be())
        .map_err(|e| IntegrityError::Key(e.to_string()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::keys::certificate::test_certificate;

    fn record() -> Record {
        let mut r = Record::new();
        r.insert("name".into(), json!("A"));
        r.insert("phone".into(), json!("[ENCRYPTED_PHONE]"));
        r.insert("age".into(), json!(41));
        r
    }

    #[test]
    fn digest_mode_verifies_with_stored_metadata() {
        let cert = test_certificate();
        let stored = compute(&record(), IntegrityMode::Digest, &cert.body).unwrap();
        assert_eq!(stored.algorithm, DIGEST_ALGORITHM);
        assert_eq!(stored.digest.len(), 64);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(verify(&record(), &stored, &cert.body).unwrap());
    }

    #[test]
    fn keyed_mode_verifies() {
        let cert = test_certificate();
        let stored = compute(&record(), IntegrityMode::Keyed, &cert.body).unwrap();
        assert_eq!(stored.algorithm, KEYED_ALGORITHM);
        assert!(verify(&record(), &stored, &cert.body).unwrap());
    }

    #[test]
    fn modes_produce_different_digests() {
        let cert = test_certificate();
        let a = compute(&record(), IntegrityMode::Digest, &cert.body).unwrap();
        let b = compute(&record(), IntegrityMode::Keyed, &cert.body).unwrap();
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn changed_field_is_detected() {
        let cert = test_certificate();
        let stored = compute(&record(), IntegrityMode::Digest, &cert.body).unwrap();
        let mut r = record();
        r.insert("age".into(), json!(42));
        assert!(!verify(&r, &stored, &cert.body).unwrap());
    }

    #[test]
    fn changed_metadata_is_detected() {
        let cert = test_certificate();
        let mut stored = compute(&record(), IntegrityMode::Digest, &cert.body).unwrap();
        stored.timestamp += 1;
        assert!(!verify(&record(), &stored, &cert.body).unwrap());
    }

    #[test]
    fn attached_integrity_field_is_ignored() {
        let cert = test_certificate();
        let stored = compute(&record(), IntegrityMode::Digest, &cert.body).unwrap();
        let mut r = record();
        r.insert(INTEGRITY_RECORD_FIELD.into(), serde_json::to_value(&stored).unwrap());
        assert!(verify(&r, &stored, &cert.body).unwrap());
    }

    #[test]
    fn flipped_digest_bit_fails() {
        let cert = test_certificate();
        let mut stored = compute(&record(), IntegrityMode::Digest, &cert.body).unwrap();
        let mut bytes = hex::decode(&stored.digest).unwrap();
        bytes[0] ^= 0x01;
        stored.digest = hex::encode(bytes);
        assert!(!verify(&record(), &stored, &cert.body).unwrap());
    }

    #[test]
    fn malformed_records_rejected() {
        let cert = test_certificate();
        let good = compute(&record(), IntegrityMode::Digest, &cert.body).unwrap();

        let mut bad = good.clone();
        bad.algorithm = "CRC32".into();
        assert!(matches!(verify(&record(), &bad, &cert.body), Err(IntegrityError::Malformed(_))));

        let mut bad = good.clone();
        bad.digest = "not-hex".into();
        assert!(verify(&record(), &bad, &cert.body).is_err());

        let mut bad = good;
        bad.digest = "abcd".into();
        let err: SealError = verify(&record(), &bad, &cert.body).unwrap_err().into();
        assert_eq!(err.code(), "malformed_integrity_record");

        assert!(parse_record(&json!({ "digest": "00" })).is_err());
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("KEYED".parse::<IntegrityMode>().unwrap(), IntegrityMode::Keyed);
        assert!("crc".parse::<IntegrityMode>().is_err());
    }

    proptest! {
        #[test]
        fn any_record_verifies_after_compute(
            fields in prop::collection::btree_map("[a-z_]{1,12}", "[ -~]{0,24}", 0..8),
            keyed in any::<bool>()
        ) {
            let cert = test_certificate();
            let record: Record = fields
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            let mode = if keyed { IntegrityMode::Keyed } else { IntegrityMode::Digest };
            let stored = compute(&record, mode, &cert.body).unwrap();
            prop_assert_eq!(verify(&record, &stored, &cert.body), Ok(true));
        }
    }
}
