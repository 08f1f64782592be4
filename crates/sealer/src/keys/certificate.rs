//! Self-signed certificate: key pair, descriptive metadata and validity window.

use std::fmt;

use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use common::protocol::SignatureEnvelope;

use super::KeyError;
use crate::clock;
use crate::crypto::{arith, canonical::Canonical, signature};

/// Fixed public exponent.
pub const PUBLIC_EXPONENT: u32 = 65_537;

/// Demonstration prime `p` (smallest prime above 2^32).
pub const DEMO_PRIME_P: u64 = 4_294_967_311;
/// Demonstration prime `q`.
pub const DEMO_PRIME_Q: u64 = 4_294_967_357;

/// Smallest and largest accepted generated modulus sizes.
pub const MIN_MODULUS_BITS: u64 = 64;
pub const MAX_MODULUS_BITS: u64 = 4096;

/// Prime-pair draws before generation gives up.
const MAX_KEYGEN_ATTEMPTS: usize = 16;

const CERTIFICATE_VERSION: u8 = 3;
const KEY_ALGORITHM: &str = "RSA-PQ";
const SIGNATURE_ALGORITHM: &str = "SHA256withRSA-PQ";
const SERIAL_PREFIX: &str = "RSG-";
const MILLIS_PER_DAY: u64 = 86_400_000;

/// Decimal-string serde for [`BigUint`].
mod decimal {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &BigUint, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&n.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(d)?;
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(de::Error::custom("expected a decimal integer string"));
        }
        BigUint::parse_bytes(s.as_bytes(), 10)
            .ok_or_else(|| de::Error::custom("expected a decimal integer string"))
    }
}

/// Where the primes of a new key pair come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Random primes of `modulus_bits / 2` bits each.
    Generated { modulus_bits: u64 },
    /// Explicit primes. Only suitable for demonstrations and tests.
    Fixed { p: BigUint, q: BigUint },
}

impl KeySource {
    /// The built-in demonstration pair.
    pub fn demonstration() -> Self {
        KeySource::Fixed {
            p: BigUint::from(DEMO_PRIME_P),
            q: BigUint::from(DEMO_PRIME_Q),
        }
    }
}

/// Inputs to certificate generation.
#[derive(Debug, Clone)]
pub struct CertificateParams {
    pub subject: String,
    pub issuer: String,
    pub validity_days: u64,
    /// Informational tag only.
    pub resistance_level: String,
    pub key_source: KeySource,
    pub miller_rabin_rounds: usize,
}

impl Default for CertificateParams {
    fn default() -> Self {
        Self {
            subject: "Sealer-Application-Server".into(),
            issuer: "Sealer-Certificate-Authority".into(),
            validity_days: 5 * 365,
            resistance_level: "DEMONSTRATION".into(),
            key_source: KeySource::Generated { modulus_bits: 1024 },
            miller_rabin_rounds: arith::DEFAULT_MR_ROUNDS,
        }
    }
}

/// Public half of the key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(with = "decimal")]
    pub exponent: BigUint,
    #[serde(with = "decimal")]
    pub modulus: BigUint,
    pub key_size_bits: u64,
}

/// Private half of the key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKey {
    #[serde(with = "decimal")]
    pub exponent: BigUint,
    #[serde(with = "decimal")]
    pub modulus: BigUint,
    #[serde(with = "decimal")]
    pub prime_p: BigUint,
    #[serde(with = "decimal")]
    pub prime_q: BigUint,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        f.write_str("PrivateKey([REDACTED])")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
    DataEncipherment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extensions {
    pub key_usage: Vec<KeyUsage>,
    pub resistance_level: String,
}

/// Every certificate field except the self-signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBody {
    pub version: u8,
    pub serial: String,
    pub algorithm: String,
    pub issuer: String,
    pub subject: String,
    /// Unix milliseconds.
    pub valid_from: u64,
    /// Unix milliseconds, exclusive.
    pub valid_to: u64,
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
    pub extensions: Extensions,
    pub signature_algorithm: String,
    /// Hex SHA-256 of `"{modulus}:{exponent}"`.
    pub fingerprint: String,
}

/// A self-signed certificate. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    #[serde(flatten)]
    pub body: CertificateBody,
    pub self_signature: SignatureEnvelope,
}

impl CertificateBody {
    /// Derive the key pair from two primes and wrap it in an unsigned body.
    ///
    /// No size checks happen here; see [`validate_modulus`].
    pub(crate) fn assemble(
        p: &BigUint,
        q: &BigUint,
        params: &CertificateParams,
        now: u64,
    ) -> Result<Self, KeyError> {
        if p == q {
            return Err(KeyError::Generation("primes p and q must be distinct".into()));
        }
        let n = p * q;
        let phi = (p - 1u32) * (q - 1u32);
        let e = BigUint::from(PUBLIC_EXPONENT);
        let d = arith::mod_inverse(&e, &phi).map_err(|err| {
            KeyError::Generation(format!("public exponent unusable with these primes: {err}"))
        })?;

        Ok(Self {
            version: CERTIFICATE_VERSION,
            serial: new_serial(),
            algorithm: KEY_ALGORITHM.into(),
            issuer: params.issuer.clone(),
            subject: params.subject.clone(),
            valid_from: now,
            valid_to: now.saturating_add(params.validity_days.saturating_mul(MILLIS_PER_DAY)),
            fingerprint: fingerprint(&n, &e),
            public_key: PublicKey {
                exponent: e,
                modulus: n.clone(),
                key_size_bits: n.bits(),
            },
            private_key: PrivateKey {
                exponent: d,
                modulus: n,
                prime_p: p.clone(),
                prime_q: q.clone(),
            },
            extensions: Extensions {
                key_usage: vec![
                    KeyUsage::DigitalSignature,
                    KeyUsage::KeyEncipherment,
                    KeyUsage::DataEncipherment,
                ],
                resistance_level: params.resistance_level.clone(),
            },
            signature_algorithm: SIGNATURE_ALGORITHM.into(),
        })
    }

    /// The shared modulus.
    pub fn modulus(&self) -> &BigUint {
        &self.public_key.modulus
    }

    /// Canonical bytes covered by the self-signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, KeyError> {
        let value = serde_json::to_value(self)
            .map_err(|e| KeyError::Serialization(e.to_string()))?;
        let mut c = Canonical::new("certificate");
        c.put_value(&value);
        Ok(c.into_bytes())
    }
}

impl Certificate {
    /// Generate a new self-signed certificate.
    ///
    /// # Errors
    ///
    /// - [`KeyError::Generation`] if primes are not distinct, not prime, or
    ///   admit no private exponent (after bounded re-selection for generated keys).
    /// - [`KeyError::Configuration`] if the modulus is too small.
    pub fn generate(params: &CertificateParams) -> Result<Self, KeyError> {
        let now = clock::unix_millis();
        let body = match &params.key_source {
            KeySource::Fixed { p, q } => {
                let mut rng = rand::thread_rng();
                for prime in [p, q] {
                    if !arith::is_probable_prime(prime, params.miller_rabin_rounds, &mut rng) {
                        return Err(KeyError::Generation(format!("{prime} is not prime")));
                    }
                }
                CertificateBody::assemble(p, q, params, now)?
            }
            KeySource::Generated { modulus_bits } => generate_body(*modulus_bits, params, now)?,
        };
        validate_modulus(body.modulus())?;

        let self_signature = signature::sign(&body.signing_bytes()?, &body)
            .map_err(|e| KeyError::Generation(format!("self-signature failed: {e}")))?;
        Ok(Self {
            body,
            self_signature,
        })
    }

    /// Check the key invariants, fingerprint and self-signature.
    ///
    /// Time is not considered; see [`Certificate::is_expired`].
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidCertificate`] naming the first failed check.
    pub fn verify(&self) -> Result<(), KeyError> {
        let b = &self.body;
        let public = &b.public_key;
        let private = &b.private_key;
        let invalid = |why: &str| Err(KeyError::InvalidCertificate(format!("{}: {why}", b.serial)));

        if public.modulus != private.modulus {
            return invalid("public and private moduli differ");
        }
        if private.prime_p < BigUint::from(2u32) || private.prime_q < BigUint::from(2u32) {
            return invalid("primes must be at least 2");
        }
        if &private.prime_p * &private.prime_q != public.modulus {
            return invalid("modulus is not p * q");
        }
        let phi = (&private.prime_p - 1u32) * (&private.prime_q - 1u32);
        if !((&public.exponent * &private.exponent) % &phi).is_one() {
            return invalid("exponents are not inverse modulo phi");
        }
        if b.fingerprint != fingerprint(&public.modulus, &public.exponent) {
            return invalid("fingerprint mismatch");
        }
        if b.valid_to <= b.valid_from {
            return invalid("empty validity window");
        }
        if self.self_signature.certificate_serial != b.serial {
            return invalid("self-signature names another certificate");
        }
        let bytes = b.signing_bytes()?;
        match signature::verify(&bytes, &self.self_signature, b) {
            Ok(true) => Ok(()),
            Ok(false) => invalid("self-signature does not match"),
            Err(e) => invalid(&format!("self-signature malformed: {e}")),
        }
    }

    /// `true` once `now` (Unix ms) reaches `valid_to`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.body.valid_to
    }

    /// `true` while `now` (Unix ms) precedes `valid_from`.
    pub fn is_not_yet_valid(&self, now: u64) -> bool {
        now < self.body.valid_from
    }
}

/// Reject moduli that cannot carry a byte or a truncated digest.
///
/// # Errors
///
/// Returns [`KeyError::Configuration`] when `modulus <= 255` (distinct bytes
/// would alias) or `modulus <= 2^32 - 1` (the 32-bit truncated digest would
/// be reduced and never verify).
pub fn validate_modulus(modulus: &BigUint) -> Result<(), KeyError> {
    if *modulus <= BigUint::from(u8::MAX) {
        return Err(KeyError::Configuration(format!(
            "modulus {modulus} must exceed 255 for byte-wise encryption"
        )));
    }
    if *modulus <= BigUint::from(u32::MAX) {
        return Err(KeyError::Configuration(format!(
            "modulus {modulus} must exceed 2^32 - 1 to hold a truncated digest"
        )));
    }
    Ok(())
}

fn generate_body(
    modulus_bits: u64,
    params: &CertificateParams,
    now: u64,
) -> Result<CertificateBody, KeyError> {
    if !(MIN_MODULUS_BITS..=MAX_MODULUS_BITS).contains(&modulus_bits) {
        return Err(KeyError::Configuration(format!(
            "modulus_bits must be within {MIN_MODULUS_BITS}..={MAX_MODULUS_BITS}, got {modulus_bits}"
        )));
    }
    let rounds = params.miller_rabin_rounds;
    let p_bits = modulus_bits / 2;
    let q_bits = modulus_bits - p_bits;
    let e = BigUint::from(PUBLIC_EXPONENT);
    let mut rng = rand::thread_rng();

    for _ in 0..MAX_KEYGEN_ATTEMPTS {
        let p = arith::generate_prime(p_bits, rounds, &mut rng).map_err(KeyError::from_arith)?;
        let q = arith::generate_prime(q_bits, rounds, &mut rng).map_err(KeyError::from_arith)?;
        if p == q {
            continue;
        }
        let phi = (&p - 1u32) * (&q - 1u32);
        if !arith::coprime(&e, &phi) {
            continue;
        }
        return CertificateBody::assemble(&p, &q, params, now);
    }
    Err(KeyError::Generation(format!(
        "no usable prime pair after {MAX_KEYGEN_ATTEMPTS} attempts"
    )))
}

fn fingerprint(modulus: &BigUint, exponent: &BigUint) -> String {
    hex::encode(Sha256::digest(format!("{modulus}:{exponent}").as_bytes()))
}

fn new_serial() -> String {
    format!("{SERIAL_PREFIX}{}", Uuid::new_v4().simple())
}

/// Certificate over the demonstration primes, for tests across the crate.
#[cfg(test)]
pub(crate) fn test_certificate() -> Certificate {
    let params = CertificateParams {
        key_source: KeySource::demonstration(),
        ..CertificateParams::default()
    };
    Certificate::generate(&params).expect("demonstration certificate")
}

/// Unsigned body over arbitrary primes, bypassing size checks.
#[cfg(test)]
pub(crate) fn test_body(p: u64, q: u64) -> CertificateBody {
    CertificateBody::assemble(
        &BigUint::from(p),
        &BigUint::from(q),
        &CertificateParams::default(),
        clock::unix_millis(),
    )
    .expect("test body")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demonstration_certificate_is_consistent() {
        let cert = test_certificate();
        let b = &cert.body;
        assert_eq!(b.version, 3);
        assert!(b.serial.starts_with("RSG-"));
        assert_eq!(b.serial.len(), 4 + 32);
        assert_eq!(b.public_key.exponent, BigUint::from(PUBLIC_EXPONENT));
        assert_eq!(
            b.public_key.modulus,
            BigUint::from(DEMO_PRIME_P) * BigUint::from(DEMO_PRIME_Q)
        );
        assert_eq!(b.private_key.exponent, BigUint::from(161_282_703_455_311_913u64));
        assert_eq!(b.valid_to - b.valid_from, 5 * 365 * MILLIS_PER_DAY);
        assert!(cert.verify().is_ok());
    }

    #[test]
    fn generated_certificate_verifies() {
        let params = CertificateParams {
            key_source: KeySource::Generated { modulus_bits: 128 },
            ..CertificateParams::default()
        };
        let cert = Certificate::generate(&params).unwrap();
        assert!(cert.body.public_key.key_size_bits >= 127);
        assert!(cert.verify().is_ok());
    }

    #[test]
    fn serials_are_unique() {
        assert_ne!(test_certificate().body.serial, test_certificate().body.serial);
    }

    #[test]
    fn historical_small_primes_are_rejected() {
        let params = CertificateParams {
            key_source: KeySource::Fixed {
                p: BigUint::from(1009u32),
                q: BigUint::from(1013u32),
            },
            ..CertificateParams::default()
        };
        let err = Certificate::generate(&params).unwrap_err();
        assert!(matches!(err, KeyError::Configuration(_)), "{err:?}");
    }

    #[test]
    fn equal_primes_are_rejected() {
        let params = CertificateParams {
            key_source: KeySource::Fixed {
                p: BigUint::from(DEMO_PRIME_P),
                q: BigUint::from(DEMO_PRIME_P),
            },
            ..CertificateParams::default()
        };
        assert!(matches!(
            Certificate::generate(&params),
            Err(KeyError::Generation(_))
        ));
    }

    #[test]
    fn composite_is_rejected() {
        let params = CertificateParams {
            key_source: KeySource::Fixed {
                p: BigUint::from(4_294_967_297u64),
                q: BigUint::from(DEMO_PRIME_Q),
            },
            ..CertificateParams::default()
        };
        assert!(matches!(
            Certificate::generate(&params),
            Err(KeyError::Generation(_))
        ));
    }

    #[test]
    fn no_inverse_surfaces_as_generation_error() {
        // p - 1 = 6 * 65537, so the public exponent divides phi.
        let err = CertificateBody::assemble(
            &BigUint::from(393_223u32),
            &BigUint::from(DEMO_PRIME_Q),
            &CertificateParams::default(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, KeyError::Generation(_)));
    }

    #[test]
    fn out_of_range_modulus_bits_rejected() {
        let params = CertificateParams {
            key_source: KeySource::Generated { modulus_bits: 32 },
            ..CertificateParams::default()
        };
        assert!(matches!(
            Certificate::generate(&params),
            Err(KeyError::Configuration(_))
        ));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let mut cert = test_certificate();
        cert.body.subject = "someone-else".into();
        assert!(matches!(cert.verify(), Err(KeyError::InvalidCertificate(_))));
    }

    #[test]
    fn tampered_exponent_fails_verification() {
        let mut cert = test_certificate();
        cert.body.private_key.exponent += 2u32;
        assert!(matches!(cert.verify(), Err(KeyError::InvalidCertificate(_))));
    }

    #[test]
    fn degenerate_primes_fail_verification() {
        let mut cert = test_certificate();
        cert.body.private_key.prime_p = BigUint::from(0u32);
        cert.body.private_key.modulus = BigUint::from(0u32);
        cert.body.public_key.modulus = BigUint::from(0u32);
        assert!(matches!(cert.verify(), Err(KeyError::InvalidCertificate(_))));

        let mut cert = test_certificate();
        let q = cert.body.private_key.prime_q.clone();
        cert.body.private_key.prime_p = BigUint::from(1u32);
        cert.body.private_key.modulus = q.clone();
        cert.body.public_key.modulus = q;
        assert!(matches!(cert.verify(), Err(KeyError::InvalidCertificate(_))));
    }

    #[test]
    fn json_round_trip_preserves_signature_validity() {
        let cert = test_certificate();
        let json = serde_json::to_string(&cert).unwrap();
        let back: Certificate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cert);
        assert!(back.verify().is_ok());
    }

    #[test]
    fn private_key_is_redacted() {
        let cert = test_certificate();
        let dbg = format!("{cert:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("161282703455311913"));
    }

    #[test]
    fn expiry_window() {
        let cert = test_certificate();
        assert!(!cert.is_expired(cert.body.valid_from));
        assert!(cert.is_expired(cert.body.valid_to));
        assert!(cert.is_not_yet_valid(cert.body.valid_from - 1));
    }

    #[test]
    fn modulus_limits() {
        assert!(validate_modulus(&BigUint::from(255u32)).is_err());
        assert!(validate_modulus(&BigUint::from(1_022_117u32)).is_err());
        assert!(validate_modulus(&(BigUint::from(u32::MAX) + 1u32)).is_ok());
    }
}
