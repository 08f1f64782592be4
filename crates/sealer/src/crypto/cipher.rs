//! Byte-wise modular-exponentiation encryption of individual field values.
//!
//! **No authenticated encryption.** Decrypting with the wrong key does not
//! fail: every block still maps to some byte, so the output is garbage.
//! Tamper detection is the job of the signature and integrity primitives.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use num_bigint::BigUint;
use thiserror::Error;

use common::protocol::{EncryptedPayload, ExponentKind};
use common::SealError;

use super::arith::{self, ArithError};
use crate::clock;
use crate::keys::CertificateBody;

/// Payload format version.
pub const VERSION: &str = "v1";

/// Encoding of [`EncryptedPayload::data`].
pub const ENCODING: &str = "base64url-json";

/// Algorithm tag carried in every payload.
pub const ALGORITHM: &str = "RSA-PQ-BYTEWISE";

/// Errors produced by the cipher layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The modulus cannot represent every byte value distinctly.
    #[error("modulus {0} must exceed 255")]
    ModulusTooSmall(String),

    /// The payload does not match the expected structure.
    #[error("invalid encrypted payload: {0}")]
    InvalidFormat(String),

    /// The payload was encrypted under another certificate.
    #[error("payload belongs to certificate {payload}, not {keys}")]
    CertificateMismatch { payload: String, keys: String },

    #[error(transparent)]
    Arith(#[from] ArithError),
}

impl From<CipherError> for SealError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::ModulusTooSmall(_) => SealError::Configuration(e.to_string()),
            CipherError::InvalidFormat(_) | CipherError::CertificateMismatch { .. } => {
                SealError::Decoding(e.to_string())
            }
            CipherError::Arith(a) => a.into(),
        }
    }
}

/// Encrypt `plaintext` one byte at a time: `block_i = b_i ^ exponent mod n`.
///
/// `ExponentKind::Public` is the ordinary encryption path;
/// `ExponentKind::Private` is the "self" path that only the public exponent
/// reverses.
///
/// # Errors
///
/// Returns [`CipherError::ModulusTooSmall`] if `n <= 255`.
pub fn encrypt(
    plaintext: &[u8],
    exponent: ExponentKind,
    keys: &CertificateBody,
) -> Result<EncryptedPayload, CipherError> {
    let modulus = keys.modulus();
    check_modulus(modulus)?;
    let e = match exponent {
        ExponentKind::Public => &keys.public_key.exponent,
        ExponentKind::Private => &keys.private_key.exponent,
    };

    let blocks = plaintext
        .iter()
        .map(|&b| arith::mod_pow(&BigUint::from(b), e, modulus).map(|c| c.to_str_radix(10)))
        .collect::<Result<Vec<String>, _>>()?;
    let json = serde_json::to_vec(&blocks)
        .map_err(|e| CipherError::InvalidFormat(format!("block encoding failed: {e}")))?;

    Ok(EncryptedPayload {
        version: VERSION.into(),
        encoding: ENCODING.into(),
        data: URL_SAFE_NO_PAD.encode(json),
        block_count: blocks.len(),
        exponent,
        algorithm: ALGORITHM.into(),
        certificate_serial: keys.serial.clone(),
        timestamp: clock::unix_millis(),
    })
}

/// Invert [`encrypt`] with the complementary exponent.
///
/// Each recovered integer is mapped back to a byte by its low 8 bits.
///
/// # Errors
///
/// - [`CipherError::CertificateMismatch`] if `payload` names another serial.
/// - [`CipherError::InvalidFormat`] for an unknown version or encoding,
///   undecodable data, a block count mismatch, or a block not below the modulus.
pub fn decrypt(payload: &EncryptedPayload, keys: &CertificateBody) -> Result<Vec<u8>, CipherError> {
    if payload.certificate_serial != keys.serial {
        return Err(CipherError::CertificateMismatch {
            payload: payload.certificate_serial.clone(),
            keys: keys.serial.clone(),
        });
    }
    if payload.version != VERSION {
        return Err(CipherError::InvalidFormat(format!(
            "unsupported version {:?}",
            payload.version
        )));
    }
    if payload.encoding != ENCODING {
        return Err(CipherError::InvalidFormat(format!(
            "unsupported encoding {:?}",
            payload.encoding
        )));
    }
    let modulus = keys.modulus();
    check_modulus(modulus)?;

    let blocks = decode_blocks(&payload.data)?;
    if blocks.len() != payload.block_count {
        return Err(CipherError::InvalidFormat(format!(
            "expected {} blocks, found {}",
            payload.block_count,
            blocks.len()
        )));
    }
    let d = match payload.exponent {
        ExponentKind::Public => &keys.private_key.exponent,
        ExponentKind::Private => &keys.public_key.exponent,
    };

    blocks
        .iter()
        .map(|block| {
            if block >= modulus {
                return Err(CipherError::InvalidFormat("block not below modulus".into()));
            }
            let m = arith::mod_pow(block, d, modulus)?;
            Ok(m.to_bytes_le().first().copied().unwrap_or(0))
        })
        .collect()
}

/// Decode `data` into its integer blocks without decrypting them.
///
/// # Errors
///
/// Returns [`CipherError::InvalidFormat`] if `data` is not base64url of a JSON
/// array of decimal strings.
pub fn decode_blocks(data: &str) -> Result<Vec<BigUint>, CipherError> {
    let json = URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| CipherError::InvalidFormat(format!("bad base64: {e}")))?;
    let strings: Vec<String> = serde_json::from_slice(&json)
        .map_err(|e| CipherError::InvalidFormat(format!("bad block list: {e}")))?;
    strings
        .iter()
        .map(|s| {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CipherError::InvalidFormat(format!("non-integer block {s:?}")));
            }
            BigUint::parse_bytes(s.as_bytes(), 10)
                .ok_or_else(|| CipherError::InvalidFormat(format!("non-integer block {s:?}")))
        })
        .collect()
}

fn check_modulus(modulus: &BigUint) -> Result<(), CipherError> {
    if *modulus <= BigUint::from(u8::MAX) {
        return Err(CipherError::ModulusTooSmall(modulus.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::keys::certificate::{test_body, test_certificate};

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cert = test_certificate();
        let payload = encrypt(b"555-0100", ExponentKind::Public, &cert.body).unwrap();
        assert_eq!(payload.block_count, 8);
        assert_eq!(payload.certificate_serial, cert.body.serial);
        assert_eq!(decrypt(&payload, &cert.body).unwrap(), b"555-0100");
    }

    #[test]
    fn every_byte_value_survives() {
        let cert = test_certificate();
        let all: Vec<u8> = (0..=255).collect();
        let payload = encrypt(&all, ExponentKind::Public, &cert.body).unwrap();
        assert_eq!(decrypt(&payload, &cert.body).unwrap(), all);
    }

    #[test]
    fn private_path_round_trips() {
        let cert = test_certificate();
        let payload = encrypt("héllo".as_bytes(), ExponentKind::Private, &cert.body).unwrap();
        assert_eq!(payload.exponent, ExponentKind::Private);
        assert_eq!(decrypt(&payload, &cert.body).unwrap(), "héllo".as_bytes());
    }

    #[test]
    fn small_modulus_above_255_still_round_trips() {
        let body = test_body(1009, 1013);
        let payload = encrypt(b"abc", ExponentKind::Public, &body).unwrap();
        assert_eq!(decrypt(&payload, &body).unwrap(), b"abc");
    }

    #[test]
    fn wrong_key_yields_garbage_not_error() {
        let a = test_certificate();
        let b = test_body(1009, 1013);
        let mut payload = encrypt(b"secret", ExponentKind::Public, &a.body).unwrap();
        payload.certificate_serial = b.serial.clone();
        // Blocks exceed the smaller modulus, so this is rejected structurally.
        assert!(matches!(decrypt(&payload, &b), Err(CipherError::InvalidFormat(_))));

        let c = test_body(1019, 1021);
        let mut small = encrypt(b"secret", ExponentKind::Public, &b).unwrap();
        small.certificate_serial = c.serial.clone();
        let garbage = decrypt(&small, &c).unwrap();
        assert_eq!(garbage.len(), 6);
        assert_ne!(garbage, b"secret");
    }

    #[test]
    fn payload_of_another_certificate_is_refused() {
        let a = test_certificate();
        let b = test_certificate();
        let payload = encrypt(b"secret", ExponentKind::Public, &a.body).unwrap();
        let err = decrypt(&payload, &b.body).unwrap_err();
        assert!(matches!(err, CipherError::CertificateMismatch { .. }));
        assert_eq!(SealError::from(err).code(), "decoding");
    }

    #[test]
    fn modulus_at_most_255_rejected() {
        let body = test_body(11, 13);
        assert!(matches!(
            encrypt(b"x", ExponentKind::Public, &body),
            Err(CipherError::ModulusTooSmall(_))
        ));
        let err: SealError = encrypt(b"x", ExponentKind::Public, &body).unwrap_err().into();
        assert_eq!(err.code(), "configuration");
    }

    #[test]
    fn malformed_payloads_rejected() {
        let cert = test_certificate();
        let good = encrypt(b"hi", ExponentKind::Public, &cert.body).unwrap();

        let mut bad = good.clone();
        bad.version = "v2".into();
        assert!(decrypt(&bad, &cert.body).is_err());

        let mut bad = good.clone();
        bad.data = "!!!".into();
        assert!(decrypt(&bad, &cert.body).is_err());

        let mut bad = good.clone();
        bad.block_count = 3;
        assert!(decrypt(&bad, &cert.body).is_err());

        let mut bad = good.clone();
        bad.data = URL_SAFE_NO_PAD.encode(br#"["12","x7"]"#);
        let err: SealError = decrypt(&bad, &cert.body).unwrap_err().into();
        assert_eq!(err.code(), "decoding");

        let mut bad = good;
        bad.data = URL_SAFE_NO_PAD.encode(br#"[12, 7]"#);
        assert!(decrypt(&bad, &cert.body).is_err());
    }

    #[test]
    fn empty_plaintext_has_no_blocks() {
        let cert = test_certificate();
        let payload = encrypt(b"", ExponentKind::Public, &cert.body).unwrap();
        assert_eq!(payload.block_count, 0);
        assert!(decrypt(&payload, &cert.body).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn any_bytes_round_trip(
            plaintext in prop::collection::vec(any::<u8>(), 0..128),
            private in any::<bool>()
        ) {
            let cert = test_certificate();
            let exponent = if private { ExponentKind::Private } else { ExponentKind::Public };
            let payload = encrypt(&plaintext, exponent, &cert.body).unwrap();
            prop_assert_eq!(payload.block_count, plaintext.len());
            prop_assert_eq!(decrypt(&payload, &cert.body).unwrap(), plaintext);
        }
    }
}
