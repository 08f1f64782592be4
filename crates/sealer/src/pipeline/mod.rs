//! The sealing pipeline: confidentiality, then authentication, then integrity.
//!
//! # Write path
//!
//! ```text
//! RAW → CONFIDENTIALITY_APPLIED → AUTHENTICATED → INTEGRITY_SEALED
//! ```
//!
//! [`Sealer::apply`] runs the three primitives in that fixed order. A step
//! that fails (or overruns the configured deadline) is degraded to a
//! passthrough and logged as `ERROR`; the other steps still run, so a
//! partially protected record can be persisted.
//!
//! # Read path
//!
//! [`Sealer::reveal`] verifies integrity, then the signature, then decrypts.
//! Verification outcomes are status values, never errors. A malformed side
//! channel, or one naming an unknown certificate, is reported as a failed
//! check. A check that passes after the deadline is reported as `TIMED_OUT`,
//! never as a mismatch; decrypted values are kept and the overrun is listed in
//! [`RevealStatus::timed_out`].
//!
//! # Digest inputs
//!
//! - Signature: the record without any side-channel field.
//! - Integrity: the record without `integrity_record` only, so ciphertext and
//!   signature are covered.

pub mod audit;

pub use audit::{AuditEvent, AuditLog};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, warn};

use common::protocol::{
    BundleEntry, CipherBundle, ExponentKind, ProtectedRecord, ValueKind, CIPHER_BUNDLE_FIELD,
    INTEGRITY_RECORD_FIELD, SIDE_CHANNEL_FIELDS, SIGNATURE_ENVELOPE_FIELD,
};
use common::{
    Operation, OperationStatus, Primitive, Record, RevealStatus, SealError, VerificationStatus,
};

use crate::crypto::{canonical, cipher, integrity, signature, IntegrityMode};
use crate::keys::{Certificate, CertificateBody, KeyError, KeyManager};
use crate::schema::TableRegistry;

/// Domain label of the signature input.
const SIGNATURE_LABEL: &str = "signature";

/// Visible value left in place of an encrypted field.
pub fn placeholder(field: &str) -> String {
    format!("[ENCRYPTED_{}]", field.to_uppercase())
}

/// Tunables for [`Sealer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    pub integrity_mode: IntegrityMode,
    /// Upper bound on each primitive step. `None` disables the check.
    pub step_deadline: Option<Duration>,
}

/// Outcome of one write-path step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub primitive: Primitive,
    pub status: OperationStatus,
    pub duration_ms: f64,
    /// Why the step degraded to a passthrough.
    pub error: Option<SealError>,
}

/// Result of [`Sealer::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct Sealed {
    pub record: ProtectedRecord,
    /// One entry per step in execution order; empty for unprotected tables.
    pub steps: Vec<StepReport>,
}

impl Sealed {
    /// `true` when every step succeeded.
    pub fn is_fully_protected(&self) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|s| s.status == OperationStatus::Success)
    }

    /// Flatten into the mapping handed to persistence.
    pub fn into_record(self) -> Result<Record, SealError> {
        self.record.into_record()
    }
}

/// Result of [`Sealer::reveal`].
#[derive(Debug, Clone, PartialEq)]
pub struct Revealed {
    /// Restored fields, side channels removed.
    pub record: Record,
    pub status: RevealStatus,
}

/// Table currently being processed plus the serial that signs for it.
struct StepContext<'a> {
    table: &'a str,
    serial: &'a str,
}

/// The pipeline orchestrator.
///
/// Cheap to clone; clones share the key cache and the table map.
#[derive(Debug, Clone)]
pub struct Sealer {
    keys: KeyManager,
    tables: TableRegistry,
    audit: AuditLog,
    options: PipelineOptions,
}

impl Sealer {
    /// Build a sealer and load (or create) the active certificate.
    ///
    /// # Errors
    ///
    /// Any certificate failure is returned; nothing can be sealed without
    /// valid key material.
    pub fn new(
        keys: KeyManager,
        tables: TableRegistry,
        options: PipelineOptions,
    ) -> Result<Self, SealError> {
        let cert = keys.load_or_create()?;
        debug!(serial = %cert.body.serial, "sealer ready");
        let audit = AuditLog::new(keys.persistence().clone());
        Ok(Self {
            keys,
            tables,
            audit,
            options,
        })
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    pub fn options(&self) -> PipelineOptions {
        self.options
    }

    /// Protect `record` destined for `table`.
    ///
    /// Records of unprotected tables are returned unchanged with no steps.
    /// Side-channel fields supplied by the caller are discarded first.
    ///
    /// # Errors
    ///
    /// Only certificate failures are returned. Step failures are reported in
    /// [`Sealed::steps`].
    pub fn apply(&self, table: &str, mut record: Record) -> Result<Sealed, SealError> {
        let Some(sensitive) = self.tables.sensitive_fields(table) else {
            debug!(table, "table not protected; passing through");
            return Ok(Sealed {
                record: ProtectedRecord::passthrough(record),
                steps: Vec::new(),
            });
        };
        let cert = self.keys.load_or_create()?;
        let keys = &cert.body;
        let ctx = StepContext {
            table,
            serial: &keys.serial,
        };
        strip_side_channels(table, &mut record);

        let mut steps = Vec::with_capacity(3);
        let mut protected = ProtectedRecord::passthrough(Record::new());

        // Confidentiality: all sensitive fields or none.
        match self.seal_step(
            &ctx,
            Primitive::Confidentiality,
            Operation::Encrypt,
            cipher::ALGORITHM,
            &mut steps,
            || encrypt_fields(&record, sensitive, keys),
        ) {
            Some((fields, bundle)) => {
                protected.fields = fields;
                protected.cipher_bundle = (!bundle.is_empty()).then_some(bundle);
            }
            None => protected.fields = record,
        }

        protected.signature_envelope = self.seal_step(
            &ctx,
            Primitive::Authentication,
            Operation::Sign,
            signature::ALGORITHM,
            &mut steps,
            || {
                let data =
                    canonical::encode_record(SIGNATURE_LABEL, &protected.fields, &SIDE_CHANNEL_FIELDS);
                Ok(signature::sign(&data, keys)?)
            },
        );

        let mode = self.options.integrity_mode;
        protected.integrity_record = self.seal_step(
            &ctx,
            Primitive::Integrity,
            Operation::Compute,
            mode.algorithm(),
            &mut steps,
            || {
                let flat = protected.clone().into_record()?;
                Ok(integrity::compute(&flat, mode, keys)?)
            },
        );

        Ok(Sealed {
            record: protected,
            steps,
        })
    }

    /// Verify and decrypt a stored record of `table`.
    ///
    /// `record` is the flat mapping produced by [`Sealed::into_record`]. Each
    /// side channel is checked with the certificate it names, so records sealed
    /// before a rotation stay readable.
    ///
    /// # Errors
    ///
    /// Only certificate storage failures are returned. Verification outcomes,
    /// including deadline overruns, are in [`Revealed::status`].
    pub fn reveal(&self, table: &str, mut record: Record) -> Result<Revealed, SealError> {
        let Some(sensitive) = self.tables.sensitive_fields(table) else {
            return Ok(Revealed {
                record,
                status: RevealStatus::default(),
            });
        };
        let active = self.keys.load_or_create()?;
        let ctx = StepContext {
            table,
            serial: &active.body.serial,
        };
        let mut status = RevealStatus::default();

        if let Some(value) = record.get(INTEGRITY_RECORD_FIELD) {
            let stored = integrity::parse_record(value);
            let (algorithm, serial) = match &stored {
                Ok(s) => (s.algorithm.clone(), s.certificate_serial.clone()),
                Err(_) => (
                    self.options.integrity_mode.algorithm().to_owned(),
                    active.body.serial.clone(),
                ),
            };
            let check = StepContext {
                table,
                serial: &serial,
            };
            let cert = self.resolve(&check)?;
            let outcome = measure(|| -> Result<bool, SealError> {
                let stored = stored?;
                let cert = cert.ok_or_else(|| unknown_certificate(&serial))?;
                Ok(integrity::verify(&record, &stored, &cert.body)?)
            });
            let verdict = self.conclude(
                &check,
                Primitive::Integrity,
                &algorithm,
                outcome,
                (VerificationStatus::Compromised, OperationStatus::Compromised),
                &mut status,
            );
            status.integrity = Some(verdict);
        }

        if let Some(value) = record.get(SIGNATURE_ENVELOPE_FIELD) {
            let envelope = signature::parse_envelope(value);
            let serial = match &envelope {
                Ok(e) => e.certificate_serial.clone(),
                Err(_) => active.body.serial.clone(),
            };
            let check = StepContext {
                table,
                serial: &serial,
            };
            let cert = self.resolve(&check)?;
            let outcome = measure(|| -> Result<bool, SealError> {
                let envelope = envelope?;
                let cert = cert.ok_or_else(|| unknown_certificate(&serial))?;
                let data = canonical::encode_record(SIGNATURE_LABEL, &record, &SIDE_CHANNEL_FIELDS);
                Ok(signature::verify(&data, &envelope, &cert.body)?)
            });
            let verdict = self.conclude(
                &check,
                Primitive::Authentication,
                signature::ALGORITHM,
                outcome,
                (VerificationStatus::Invalid, OperationStatus::Failed),
                &mut status,
            );
            status.signature = Some(verdict);
        }

        let bundle = record.remove(CIPHER_BUNDLE_FIELD);
        record.remove(SIGNATURE_ENVELOPE_FIELD);
        record.remove(INTEGRITY_RECORD_FIELD);

        if let Some(value) = bundle {
            let parsed: Result<CipherBundle, SealError> = serde_json::from_value(value)
                .map_err(|e| SealError::Decoding(format!("{CIPHER_BUNDLE_FIELD}: {e}")));
            let mut certs = BTreeMap::new();
            if let Ok(bundle) = &parsed {
                for entry in bundle.values() {
                    let serial = &entry.payload.certificate_serial;
                    if !certs.contains_key(serial) {
                        let check = StepContext { table, serial };
                        certs.insert(serial.clone(), self.resolve(&check)?);
                    }
                }
            }
            let (result, elapsed) =
                measure(|| parsed.map(|bundle| decrypt_fields(table, &record, &bundle, &certs)));
            let overran = self.note_overrun(&ctx, Primitive::Confidentiality, elapsed, &mut status);
            match result {
                Ok((restored, failed)) => {
                    record = restored;
                    status.undecrypted_fields = failed;
                }
                Err(e) => {
                    error!(
                        table,
                        code = e.code(),
                        error = %e,
                        "cipher bundle unusable; fields keep their placeholders"
                    );
                    status.undecrypted_fields = sensitive
                        .iter()
                        .filter(|f| {
                            record.get(f.as_str()).and_then(Value::as_str)
                                == Some(placeholder(f).as_str())
                        })
                        .cloned()
                        .collect();
                }
            }
            self.audit.record(AuditEvent {
                primitive: Primitive::Confidentiality,
                operation: Operation::Decrypt,
                table,
                elapsed,
                status: if status.undecrypted_fields.is_empty() && !overran {
                    OperationStatus::Success
                } else {
                    OperationStatus::Error
                },
                algorithm: cipher::ALGORITHM,
                certificate_serial: ctx.serial,
            });
        }

        if !status.is_trusted() || !status.timed_out.is_empty() {
            warn!(
                table,
                integrity = ?status.integrity,
                signature = ?status.signature,
                undecrypted = status.undecrypted_fields.len(),
                timed_out = status.timed_out.len(),
                "record failed verification"
            );
        }
        Ok(Revealed { record, status })
    }

    /// The timeout a step earned by running past the deadline, if any.
    fn overrun(&self, primitive: Primitive, elapsed: Duration) -> Option<SealError> {
        let deadline = self.options.step_deadline?;
        (elapsed > deadline).then(|| SealError::Timeout {
            step: primitive.as_str().to_owned(),
            deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Run `f`, then turn an overrun of the step deadline into a timeout.
    fn timed<T>(
        &self,
        primitive: Primitive,
        f: impl FnOnce() -> Result<T, SealError>,
    ) -> (Result<T, SealError>, Duration) {
        let (result, elapsed) = measure(f);
        match (result, self.overrun(primitive, elapsed)) {
            (Ok(_), Some(timeout)) => (Err(timeout), elapsed),
            (result, _) => (result, elapsed),
        }
    }

    /// Run one write-path step, log it and record its report.
    ///
    /// Returns `None` when the step degraded to a passthrough.
    fn seal_step<T>(
        &self,
        ctx: &StepContext<'_>,
        primitive: Primitive,
        operation: Operation,
        algorithm: &str,
        steps: &mut Vec<StepReport>,
        f: impl FnOnce() -> Result<T, SealError>,
    ) -> Option<T> {
        let (result, elapsed) = self.timed(primitive, f);
        let status = match result {
            Ok(_) => OperationStatus::Success,
            Err(_) => OperationStatus::Error,
        };
        let entry = self.audit.record(AuditEvent {
            primitive,
            operation,
            table: ctx.table,
            elapsed,
            status,
            algorithm,
            certificate_serial: ctx.serial,
        });
        let (value, error) = match result {
            Ok(value) => (Some(value), None),
            Err(e) => {
                error!(
                    table = ctx.table,
                    primitive = primitive.as_str(),
                    code = e.code(),
                    error = %e,
                    "step failed; passing record through"
                );
                (None, Some(e))
            }
        };
        steps.push(StepReport {
            primitive,
            status,
            duration_ms: entry.duration_ms,
            error,
        });
        value
    }

    /// Note a read-side deadline overrun in `status`; returns whether one happened.
    fn note_overrun(
        &self,
        ctx: &StepContext<'_>,
        primitive: Primitive,
        elapsed: Duration,
        status: &mut RevealStatus,
    ) -> bool {
        let Some(timeout) = self.overrun(primitive, elapsed) else {
            return false;
        };
        error!(
            table = ctx.table,
            primitive = primitive.as_str(),
            code = timeout.code(),
            error = %timeout,
            "step overran its deadline"
        );
        status.timed_out.push(primitive);
        true
    }

    /// Turn one read-side check into its status flag and audit row.
    ///
    /// A mismatch or an unusable side channel yields `failed`. A check that
    /// passed after the deadline yields [`VerificationStatus::TimedOut`].
    fn conclude(
        &self,
        ctx: &StepContext<'_>,
        primitive: Primitive,
        algorithm: &str,
        (result, elapsed): (Result<bool, SealError>, Duration),
        failed: (VerificationStatus, OperationStatus),
        status: &mut RevealStatus,
    ) -> VerificationStatus {
        let overran = self.note_overrun(ctx, primitive, elapsed, status);
        let (verdict, outcome) = match result {
            Ok(true) if overran => (VerificationStatus::TimedOut, OperationStatus::Error),
            Ok(true) => (VerificationStatus::Verified, OperationStatus::Success),
            Ok(false) => failed,
            Err(e) => {
                warn!(
                    table = ctx.table,
                    primitive = primitive.as_str(),
                    code = e.code(),
                    error = %e,
                    "verification could not run; treating as failed"
                );
                failed
            }
        };
        self.audit.record(AuditEvent {
            primitive,
            operation: Operation::Verify,
            table: ctx.table,
            elapsed,
            status: outcome,
            algorithm,
            certificate_serial: ctx.serial,
        });
        verdict
    }

    /// Certificate named by a side channel; `None` if it is unknown or invalid.
    fn resolve(&self, ctx: &StepContext<'_>) -> Result<Option<Arc<Certificate>>, SealError> {
        match self.keys.certificate(ctx.serial) {
            Ok(cert) => Ok(cert),
            Err(KeyError::InvalidCertificate(reason)) => {
                warn!(
                    table = ctx.table,
                    serial = ctx.serial,
                    reason = %reason,
                    "side channel names an invalid certificate"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn measure<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let out = f();
    (out, start.elapsed())
}

fn unknown_certificate(serial: &str) -> SealError {
    SealError::InvalidCertificate(format!("{serial}: no such certificate"))
}

fn strip_side_channels(table: &str, record: &mut Record) {
    for field in SIDE_CHANNEL_FIELDS {
        if record.remove(field).is_some() {
            warn!(table, field, "discarding caller-supplied side-channel field");
        }
    }
}

/// Encrypt every non-empty sensitive field; returns the visible fields and the bundle.
fn encrypt_fields(
    record: &Record,
    sensitive: &[String],
    keys: &CertificateBody,
) -> Result<(Record, CipherBundle), SealError> {
    let mut fields = record.clone();
    let mut bundle = CipherBundle::new();
    for name in sensitive {
        let (plaintext, value_kind) = match record.get(name) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) if s.is_empty() => continue,
            Some(Value::String(s)) => (s.as_bytes().to_vec(), ValueKind::Text),
            Some(other) => (
                serde_json::to_vec(other).map_err(|e| SealError::Decoding(e.to_string()))?,
                ValueKind::Json,
            ),
        };
        let payload = cipher::encrypt(&plaintext, ExponentKind::Public, keys)?;
        bundle.insert(
            name.clone(),
            BundleEntry {
                original_field: name.clone(),
                value_kind,
                payload,
            },
        );
        fields.insert(name.clone(), Value::String(placeholder(name)));
    }
    Ok((fields, bundle))
}

/// Restore every bundled field with the certificate its payload names.
///
/// Returns the restored record and the fields that failed.
fn decrypt_fields(
    table: &str,
    record: &Record,
    bundle: &CipherBundle,
    certs: &BTreeMap<String, Option<Arc<Certificate>>>,
) -> (Record, Vec<String>) {
    let mut out = record.clone();
    let mut failed = Vec::new();
    for (field, entry) in bundle {
        let serial = &entry.payload.certificate_serial;
        let restored = match certs.get(serial) {
            Some(Some(cert)) => restore_value(entry, &cert.body),
            _ => Err(unknown_certificate(serial)),
        };
        match restored {
            Ok(value) => {
                out.insert(field.clone(), value);
            }
            Err(e) => {
                warn!(table, field = %field, code = e.code(), "field could not be decrypted");
                failed.push(field.clone());
            }
        }
    }
    (out, failed)
}

fn restore_value(entry: &BundleEntry, keys: &CertificateBody) -> Result<Value, SealError> {
    let bytes = cipher::decrypt(&entry.payload, keys)?;
    match entry.value_kind {
        ValueKind::Text => String::from_utf8(bytes)
            .map(Value::String)
            .map_err(|e| SealError::Decoding(format!("decrypted text is not UTF-8: {e}"))),
        ValueKind::Json => serde_json::from_slice(&bytes)
            .map_err(|e| SealError::Decoding(format!("decrypted value is not JSON: {e}"))),
    }
}
