//! Configuration loading and validation for the sealing engine.
//!
//! All values are read from environment variables at startup. Bootstrapping
//! fails with a clear error message if any required variable is missing or
//! invalid.

use std::time::Duration;

use anyhow::{Context, Result};
use num_bigint::BigUint;
use serde::Deserialize;

use crate::crypto::{arith, IntegrityMode};
use crate::keys::certificate::{MAX_MODULUS_BITS, MIN_MODULUS_BITS};
use crate::keys::{CertificateParams, KeySource};

/// Validated engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SealerConfig {
    /// Path to the YAML table map. **Required.**
    pub tables_file: String,

    /// `generated` (random primes) or `fixed` (explicit primes).
    #[serde(default = "default_key_source")]
    pub key_source: String,

    /// Modulus size for generated keys.
    #[serde(default = "default_modulus_bits")]
    pub modulus_bits: u64,

    /// Decimal prime `p` for the `fixed` key source.
    #[serde(default)]
    pub fixed_prime_p: Option<String>,

    /// Decimal prime `q` for the `fixed` key source.
    #[serde(default)]
    pub fixed_prime_q: Option<String>,

    /// Lifetime of generated certificates.
    #[serde(default = "default_validity_days")]
    pub validity_days: u64,

    #[serde(default = "default_certificate_subject")]
    pub certificate_subject: String,

    #[serde(default = "default_certificate_issuer")]
    pub certificate_issuer: String,

    /// `digest` (SHA-256) or `keyed` (HMAC-SHA-256).
    #[serde(default = "default_integrity_mode")]
    pub integrity_mode: String,

    /// Per-step deadline in milliseconds; unset means no deadline.
    #[serde(default)]
    pub step_deadline_ms: Option<u64>,

    /// SQLite database file. Unset keeps everything in memory.
    #[serde(default)]
    pub database_path: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_key_source() -> String {
    "generated".into()
}
fn default_modulus_bits() -> u64 {
    1024
}
fn default_validity_days() -> u64 {
    5 * 365
}
fn default_certificate_subject() -> String {
    "Sealer-Application-Server".into()
}
fn default_certificate_issuer() -> String {
    "Sealer-Certificate-Authority".into()
}
fn default_integrity_mode() -> String {
    "digest".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl SealerConfig {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: SealerConfig = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.tables_file, "TABLES_FILE")?;
        ensure_non_empty(&self.certificate_subject, "CERTIFICATE_SUBJECT")?;
        ensure_non_empty(&self.certificate_issuer, "CERTIFICATE_ISSUER")?;

        if self.validity_days == 0 {
            anyhow::bail!("VALIDITY_DAYS must be > 0");
        }
        if self.step_deadline_ms == Some(0) {
            anyhow::bail!("STEP_DEADLINE_MS must be > 0 when set");
        }
        if let Some(path) = &self.database_path {
            ensure_non_empty(path, "DATABASE_PATH")?;
        }
        self.integrity_mode()?;
        self.key_source()?;
        Ok(())
    }

    /// The configured integrity mode.
    pub fn integrity_mode(&self) -> Result<IntegrityMode> {
        self.integrity_mode
            .parse::<IntegrityMode>()
            .map_err(|e| anyhow::anyhow!("INTEGRITY_MODE: {e}"))
    }

    /// The configured per-step deadline.
    pub fn step_deadline(&self) -> Option<Duration> {
        self.step_deadline_ms.map(Duration::from_millis)
    }

    /// The configured key material source.
    pub fn key_source(&self) -> Result<KeySource> {
        match self.key_source.to_ascii_lowercase().as_str() {
            "generated" => {
                if !(MIN_MODULUS_BITS..=MAX_MODULUS_BITS).contains(&self.modulus_bits) {
                    anyhow::bail!(
                        "MODULUS_BITS must be within {MIN_MODULUS_BITS}..={MAX_MODULUS_BITS}, got {}",
                        self.modulus_bits
                    );
                }
                Ok(KeySource::Generated {
                    modulus_bits: self.modulus_bits,
                })
            }
            "fixed" => match (&self.fixed_prime_p, &self.fixed_prime_q) {
                (None, None) => Ok(KeySource::demonstration()),
                (Some(p), Some(q)) => Ok(KeySource::Fixed {
                    p: parse_prime(p, "FIXED_PRIME_P")?,
                    q: parse_prime(q, "FIXED_PRIME_Q")?,
                }),
                _ => anyhow::bail!("FIXED_PRIME_P and FIXED_PRIME_Q must be set together"),
            },
            other => anyhow::bail!("KEY_SOURCE must be `generated` or `fixed`, got {other:?}"),
        }
    }

    /// Certificate generation parameters derived from this configuration.
    pub fn certificate_params(&self) -> Result<CertificateParams> {
        Ok(CertificateParams {
            subject: self.certificate_subject.clone(),
            issuer: self.certificate_issuer.clone(),
            validity_days: self.validity_days,
            key_source: self.key_source()?,
            miller_rabin_rounds: arith::DEFAULT_MR_ROUNDS,
            ..CertificateParams::default()
        })
    }
}

fn parse_prime(value: &str, name: &str) -> Result<BigUint> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        anyhow::bail!("{name} must be a decimal integer");
    }
    BigUint::parse_bytes(value.as_bytes(), 10)
        .with_context(|| format!("{name} must be a decimal integer"))
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
