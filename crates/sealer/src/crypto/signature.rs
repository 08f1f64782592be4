//! Digest-then-sign over arbitrary bytes.
//!
//! The SHA-256 digest is truncated to its first 32 bits (big-endian) before
//! exponentiation, so the modulus must exceed `2^32 - 1`. Sign and verify
//! apply the identical truncation rule.

use num_bigint::BigUint;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use common::protocol::SignatureEnvelope;
use common::SealError;

use super::arith::{self, ArithError};
use crate::clock;
use crate::keys::CertificateBody;

/// Algorithm tag carried in every envelope.
pub const ALGORITHM: &str = "RSA-SHA256-PQ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The envelope is structurally invalid.
    #[error("malformed signature envelope: {0}")]
    Malformed(String),

    /// The modulus cannot hold a truncated digest.
    #[error("modulus {0} cannot hold a 32-bit digest")]
    ModulusTooSmall(String),

    #[error(transparent)]
    Arith(#[from] ArithError),
}

impl From<SignatureError> for SealError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::Malformed(_) => SealError::MalformedSignature(e.to_string()),
            SignatureError::ModulusTooSmall(_) => SealError::Configuration(e.to_string()),
            SignatureError::Arith(a) => a.into(),
        }
    }
}

/// First 32 bits of `SHA-256(data)`, big-endian.
pub fn truncated_digest(data: &[u8]) -> u32 {
    truncate(&Sha256::digest(data))
}

fn truncate(digest: &[u8]) -> u32 {
    let mut head = [0u8; 4];
    head.copy_from_slice(&digest[..4]);
    u32::from_be_bytes(head)
}

/// Sign `data` with the private exponent of `keys`.
///
/// # Errors
///
/// Returns [`SignatureError::ModulusTooSmall`] if `n <= 2^32 - 1`.
pub fn sign(data: &[u8], keys: &CertificateBody) -> Result<SignatureEnvelope, SignatureError> {
    let modulus = keys.modulus();
    if *modulus <= BigUint::from(u32::MAX) {
        return Err(SignatureError::ModulusTooSmall(modulus.to_string()));
    }
    let digest = Sha256::digest(data);
    let truncated = truncate(&digest);
    let signature = arith::mod_pow(
        &BigUint::from(truncated),
        &keys.private_key.exponent,
        modulus,
    )?;
    Ok(SignatureEnvelope {
        signature: signature.to_str_radix(10),
        truncated_digest: truncated,
        digest: hex::encode(digest),
        algorithm: ALGORITHM.into(),
        certificate_serial: keys.serial.clone(),
        timestamp: clock::unix_millis(),
    })
}

/// Check `envelope` against `data` using the public exponent of `keys`.
///
/// A well-formed signature that does not match returns `Ok(false)`.
///
/// # Errors
///
/// Returns [`SignatureError::Malformed`] for an unknown algorithm, a
/// non-decimal or out-of-range signature, or an inconsistent digest pair.
pub fn verify(
    data: &[u8],
    envelope: &SignatureEnvelope,
    keys: &CertificateBody,
) -> Result<bool, SignatureError> {
    let modulus = keys.modulus();
    let signature = check_envelope(envelope, modulus)?;
    let recovered = arith::mod_pow(&signature, &keys.public_key.exponent, modulus)?;
    Ok(recovered == BigUint::from(truncated_digest(data)))
}

/// Deserialize an envelope from a side-channel value.
///
/// # Errors
///
/// Returns [`SignatureError::Malformed`] if fields are missing or mistyped.
pub fn parse_envelope(value: &Value) -> Result<SignatureEnvelope, SignatureError> {
    serde_json::from_value(value.clone()).map_err(|e| SignatureError::Malformed(e.to_string()))
}

fn check_envelope(envelope: &SignatureEnvelope, modulus: &BigUint) -> Result<BigUint, SignatureError> {
    if envelope.algorithm != ALGORITHM {
        return Err(SignatureError::Malformed(format!(
            "unknown algorithm {:?}",
            envelope.algorithm
        )));
    }
    let s = &envelope.signature;
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SignatureError::Malformed("signature is not a decimal integer".into()));
    }
    let signature = BigUint::parse_bytes(s.as_bytes(), 10)
        .ok_or_else(|| SignatureError::Malformed("signature is not a decimal integer".into()))?;
    if signature >= *modulus {
        return Err(SignatureError::Malformed("signature not below modulus".into()));
    }
    let digest = hex::decode(&envelope.digest)
        .map_err(|e| SignatureError::Malformed(format!("digest is not hex: {e}")))?;
    if digest.len() != 32 {
        return Err(SignatureError::Malformed(format!(
            "digest has {} bytes, expected 32",
            digest.len()
        )));
    }
    if truncate(&digest) != envelope.truncated_digest {
        return Err(SignatureError::Malformed(
            "truncated digest disagrees with full digest".into(),
        ));
    }
    Ok(signature)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::keys::certificate::{test_body, test_certificate};

    #[test]
    fn truncation_takes_leading_bytes() {
        // SHA-256("abc") = ba7816bf 8f01cfea ...
        assert_eq!(truncated_digest(b"abc"), 0xba78_16bf);
    }

    #[test]
    fn sign_then_verify() {
        let cert = test_certificate();
        let env = sign(b"payload", &cert.body).unwrap();
        assert_eq!(env.algorithm, ALGORITHM);
        assert_eq!(env.certificate_serial, cert.body.serial);
        assert!(verify(b"payload", &env, &cert.body).unwrap());
    }

    #[test]
    fn different_data_does_not_verify() {
        let cert = test_certificate();
        let env = sign(b"payload-1", &cert.body).unwrap();
        assert!(!verify(b"payload-2", &env, &cert.body).unwrap());
    }

    #[test]
    fn other_key_does_not_verify() {
        let a = test_certificate();
        let b = test_certificate();
        let env = sign(b"payload", &a.body).unwrap();
        // Same demonstration modulus and exponents, so only the serial differs.
        assert!(verify(b"payload", &env, &b.body).unwrap());

        // A larger modulus keeps the foreign signature in range, so the
        // mismatch is a clean `false` rather than a malformed envelope.
        let params = crate::keys::CertificateParams {
            key_source: crate::keys::KeySource::Generated { modulus_bits: 128 },
            ..Default::default()
        };
        let c = crate::keys::Certificate::generate(&params).unwrap();
        assert!(c.body.modulus() > a.body.modulus());
        assert_eq!(verify(b"payload", &env, &c.body), Ok(false));
    }

    #[test]
    fn small_modulus_cannot_sign() {
        let body = test_body(1009, 1013);
        let err = sign(b"x", &body).unwrap_err();
        assert!(matches!(err, SignatureError::ModulusTooSmall(_)));
    }

    #[test]
    fn malformed_envelopes_rejected() {
        let cert = test_certificate();
        let good = sign(b"x", &cert.body).unwrap();

        let mut bad = good.clone();
        bad.algorithm = "MD5".into();
        assert!(matches!(verify(b"x", &bad, &cert.body), Err(SignatureError::Malformed(_))));

        let mut bad = good.clone();
        bad.signature = "-12".into();
        assert!(verify(b"x", &bad, &cert.body).is_err());

        let mut bad = good.clone();
        bad.signature = cert.body.modulus().to_string();
        assert!(verify(b"x", &bad, &cert.body).is_err());

        let mut bad = good.clone();
        bad.digest = "zz".into();
        assert!(verify(b"x", &bad, &cert.body).is_err());

        let mut bad = good;
        bad.truncated_digest ^= 1;
        let err: SealError = verify(b"x", &bad, &cert.body).unwrap_err().into();
        assert_eq!(err.code(), "malformed_signature");
    }

    #[test]
    fn parse_envelope_requires_fields() {
        let cert = test_certificate();
        let env = sign(b"x", &cert.body).unwrap();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(parse_envelope(&value).unwrap(), env);
        assert!(parse_envelope(&serde_json::json!({ "signature": "1" })).is_err());
    }

    proptest! {
        #[test]
        fn any_data_verifies_under_its_own_signature(
            data in prop::collection::vec(any::<u8>(), 0..256)
        ) {
            let cert = test_certificate();
            let env = sign(&data, &cert.body).unwrap();
            prop_assert_eq!(verify(&data, &env, &cert.body), Ok(true));
        }

        #[test]
        fn signature_does_not_carry_to_other_data(
            d1 in prop::collection::vec(any::<u8>(), 0..64),
            d2 in prop::collection::vec(any::<u8>(), 0..64)
        ) {
            prop_assume!(truncated_digest(&d1) != truncated_digest(&d2));
            let cert = test_certificate();
            let env = sign(&d1, &cert.body).unwrap();
            prop_assert_eq!(verify(&d2, &env, &cert.body), Ok(false));
        }
    }
}
