//! Record and envelope types exchanged between the engine and its collaborators.
//!
//! These types are serialised as JSON inside the side-channel fields of a
//! protected record, which is what the persistence collaborator stores.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::audit::Primitive;
use crate::error::SealError;

/// A field-value mapping tagged by the caller with a table name.
///
/// Keys are kept in a [`BTreeMap`] so iteration order is stable.
pub type Record = BTreeMap<String, serde_json::Value>;

/// Side-channel field carrying the per-field ciphertext bundle.
pub const CIPHER_BUNDLE_FIELD: &str = "cipher_bundle";
/// Side-channel field carrying the record signature.
pub const SIGNATURE_ENVELOPE_FIELD: &str = "signature_envelope";
/// Side-channel field carrying the integrity digest.
pub const INTEGRITY_RECORD_FIELD: &str = "integrity_record";

/// All side-channel field names. None of them may be configured as a
/// sensitive field.
pub const SIDE_CHANNEL_FIELDS: [&str; 3] = [
    CIPHER_BUNDLE_FIELD,
    SIGNATURE_ENVELOPE_FIELD,
    INTEGRITY_RECORD_FIELD,
];

// ---------------------------------------------------------------------------
// Confidentiality
// ---------------------------------------------------------------------------

/// Which half of the key pair produced a ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExponentKind {
    /// Encrypted with the public exponent; decrypted with the private one.
    Public,
    /// Encrypted with the private exponent ("self" path); decrypted with the
    /// public one.
    Private,
}

/// Per-field ciphertext: one integer block per plaintext byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Format version, currently `"v1"`.
    pub version: String,
    /// Encoding of `data`, currently `"base64url-json"`.
    pub encoding: String,
    /// `base64url-no-pad` of a JSON array of decimal block strings.
    pub data: String,
    /// Number of blocks encoded in `data`.
    pub block_count: usize,
    /// Exponent used to produce the blocks.
    pub exponent: ExponentKind,
    /// Algorithm tag.
    pub algorithm: String,
    /// Serial of the certificate whose key produced the blocks.
    pub certificate_serial: String,
    /// Creation time, Unix milliseconds.
    pub timestamp: u64,
}

/// How an encrypted field value is restored after decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// The plaintext is the UTF-8 string itself.
    Text,
    /// The plaintext is the JSON text of a non-string scalar.
    Json,
}

/// One entry of a [`CipherBundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    /// Name of the field this ciphertext replaces.
    pub original_field: String,
    /// How to restore the decrypted bytes.
    pub value_kind: ValueKind,
    /// The ciphertext itself.
    pub payload: EncryptedPayload,
}

/// Per-record ciphertexts keyed by field name.
pub type CipherBundle = BTreeMap<String, BundleEntry>;

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Signature over a record, produced with the private exponent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    /// Signature integer as a decimal string.
    pub signature: String,
    /// First 32 bits of the SHA-256 digest, big-endian.
    pub truncated_digest: u32,
    /// Full hex SHA-256 digest of the signed bytes.
    pub digest: String,
    /// Algorithm tag.
    pub algorithm: String,
    /// Serial of the signing certificate.
    pub certificate_serial: String,
    /// Signing time, Unix milliseconds.
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// Integrity
// ---------------------------------------------------------------------------

/// Tamper-detection digest over a record.
///
/// `certificate_serial` and `timestamp` are part of the digest input, so
/// verification must reuse the stored values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    /// Lowercase hex digest.
    pub digest: String,
    /// Algorithm tag; selects plain or keyed digest on verify.
    pub algorithm: String,
    /// Serial of the certificate active at compute time.
    pub certificate_serial: String,
    /// Compute time, Unix milliseconds.
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// Protected record
// ---------------------------------------------------------------------------

/// The outward artifact of the sealing pipeline.
///
/// `fields` holds the original mapping with sensitive values replaced by
/// placeholders. The side channels are carried separately here and flattened
/// into the mapping by [`ProtectedRecord::into_record`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectedRecord {
    pub fields: Record,
    pub cipher_bundle: Option<CipherBundle>,
    pub signature_envelope: Option<SignatureEnvelope>,
    pub integrity_record: Option<IntegrityRecord>,
}

impl ProtectedRecord {
    /// Wrap an unprotected record with no side channels.
    pub fn passthrough(fields: Record) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Flatten into the field-value mapping handed to persistence.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Decoding`] if a side channel cannot be encoded as JSON.
    pub fn into_record(self) -> Result<Record, SealError> {
        let mut out = self.fields;
        if let Some(bundle) = self.cipher_bundle {
            out.insert(CIPHER_BUNDLE_FIELD.to_owned(), to_json(&bundle)?);
        }
        if let Some(envelope) = self.signature_envelope {
            out.insert(SIGNATURE_ENVELOPE_FIELD.to_owned(), to_json(&envelope)?);
        }
        if let Some(integrity) = self.integrity_record {
            out.insert(INTEGRITY_RECORD_FIELD.to_owned(), to_json(&integrity)?);
        }
        Ok(out)
    }

    /// Split a stored mapping back into fields and side channels.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Decoding`] if any present side channel is malformed.
    pub fn from_record(mut record: Record) -> Result<Self, SealError> {
        let cipher_bundle = take_side_channel(&mut record, CIPHER_BUNDLE_FIELD)?;
        let signature_envelope = take_side_channel(&mut record, SIGNATURE_ENVELOPE_FIELD)?;
        let integrity_record = take_side_channel(&mut record, INTEGRITY_RECORD_FIELD)?;
        Ok(Self {
            fields: record,
            cipher_bundle,
            signature_envelope,
            integrity_record,
        })
    }
}

/// Parse a side-channel field of `record` without removing it.
///
/// Returns `None` when the field is absent.
pub fn parse_side_channel<T: DeserializeOwned>(
    record: &Record,
    field: &str,
) -> Option<Result<T, serde_json::Error>> {
    record
        .get(field)
        .map(|value| serde_json::from_value(value.clone()))
}

fn take_side_channel<T: DeserializeOwned>(
    record: &mut Record,
    field: &str,
) -> Result<Option<T>, SealError> {
    match record.remove(field) {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| SealError::Decoding(format!("{field}: {e}"))),
        None => Ok(None),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, SealError> {
    serde_json::to_value(value).map_err(|e| SealError::Decoding(e.to_string()))
}

// ---------------------------------------------------------------------------
// Reveal status
// ---------------------------------------------------------------------------

/// Outcome of a read-side verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Verified,
    /// The integrity digest does not match the current record.
    Compromised,
    /// The signature does not match the current record.
    Invalid,
    /// The check passed but finished after the step deadline.
    TimedOut,
}

/// Status flags attached to a revealed record.
///
/// `None` means the corresponding side channel was absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealStatus {
    pub integrity: Option<VerificationStatus>,
    pub signature: Option<VerificationStatus>,
    /// Fields whose ciphertext could not be decrypted; they keep their placeholder.
    pub undecrypted_fields: Vec<String>,
    /// Steps that overran the deadline, in execution order.
    #[serde(default)]
    pub timed_out: Vec<Primitive>,
}

impl RevealStatus {
    /// `true` when every present check verified and every field was restored.
    pub fn is_trusted(&self) -> bool {
        let ok = |s: Option<VerificationStatus>| {
            matches!(s, None | Some(VerificationStatus::Verified))
        };
        ok(self.integrity) && ok(self.signature) && self.undecrypted_fields.is_empty()
    }
}
