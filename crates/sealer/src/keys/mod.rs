//! Certificate lifecycle: load the active certificate, or create one.
//!
//! # Lifecycle
//!
//! 1. On first use, [`KeyManager::load_or_create`] asks persistence for the
//!    active certificate.
//! 2. A stored certificate is verified (key invariants, fingerprint and
//!    self-signature). A certificate that fails verification is fatal.
//! 3. If none is stored, or the stored one has expired, a new certificate is
//!    generated, prior rows are deactivated and the new one is inserted.
//! 4. The result is cached in a [`KeyStore`]; later calls never touch
//!    persistence until [`KeyManager::reset`].
//! 5. Records sealed before a rotation name their certificate by serial;
//!    [`KeyManager::certificate`] resolves retired certificates on demand.
//!
//! # Security invariants
//!
//! - Private key material is never logged; [`PrivateKey`] redacts itself in
//!   `Debug` output.
//! - At most one certificate is active at any time.

pub mod certificate;
pub mod store;

pub use certificate::{
    Certificate, CertificateBody, CertificateParams, KeySource, PrivateKey, PublicKey,
};
pub use store::KeyStore;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use common::SealError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock;
use crate::crypto::arith::ArithError;
use crate::persistence::{Persistence, PersistenceError};

/// Errors produced by the key layer.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Prime selection or exponent derivation failed.
    #[error("key generation failed: {0}")]
    Generation(String),

    /// Key parameters are unusable (modulus too small, bit length out of range).
    #[error("invalid key configuration: {0}")]
    Configuration(String),

    /// A stored certificate failed verification or is not yet valid.
    #[error("invalid certificate {0}")]
    InvalidCertificate(String),

    /// The certificate could not be serialised for signing.
    #[error("certificate serialisation failed: {0}")]
    Serialization(String),

    /// The persistence collaborator failed.
    #[error("certificate storage failed: {0}")]
    Persistence(String),

    /// No certificate has been loaded yet.
    #[error("certificate not yet initialised")]
    NotInitialised,
}

impl KeyError {
    pub(crate) fn from_arith(e: ArithError) -> Self {
        match e {
            ArithError::ZeroModulus => KeyError::Configuration(e.to_string()),
            _ => KeyError::Generation(e.to_string()),
        }
    }
}

impl From<PersistenceError> for KeyError {
    fn from(e: PersistenceError) -> Self {
        KeyError::Persistence(e.to_string())
    }
}

impl From<KeyError> for SealError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Generation(m) => SealError::KeyGeneration(m),
            KeyError::Configuration(m) => SealError::Configuration(m),
            KeyError::InvalidCertificate(m) => SealError::InvalidCertificate(m),
            KeyError::Serialization(m) | KeyError::Persistence(m) => SealError::Persistence(m),
            KeyError::NotInitialised => SealError::Configuration(e.to_string()),
        }
    }
}

/// Owns the certificate cache and knows how to fill it.
#[derive(Clone)]
pub struct KeyManager {
    store: KeyStore,
    retired: Arc<Mutex<HashMap<String, Arc<Certificate>>>>,
    persistence: Arc<dyn Persistence>,
    params: CertificateParams,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("ready", &self.store.is_ready())
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    pub fn new(persistence: Arc<dyn Persistence>, params: CertificateParams) -> Self {
        Self {
            store: KeyStore::new(),
            retired: Arc::default(),
            persistence,
            params,
        }
    }

    /// Return the active certificate, loading or creating it on first use.
    ///
    /// Idempotent: repeated calls return the same certificate.
    ///
    /// # Errors
    ///
    /// - [`KeyError::InvalidCertificate`] if the stored certificate fails
    ///   verification or is not yet valid.
    /// - [`KeyError::Generation`] / [`KeyError::Configuration`] if a new
    ///   certificate cannot be generated.
    /// - [`KeyError::Persistence`] if storage fails.
    pub fn load_or_create(&self) -> Result<Arc<Certificate>, KeyError> {
        self.store.get_or_try_init(|| self.load_from_persistence())
    }

    /// Cached certificate without touching persistence.
    pub fn current(&self) -> Result<Arc<Certificate>, KeyError> {
        self.store.current()
    }

    /// Forget the cached certificate; the next [`load_or_create`](Self::load_or_create)
    /// consults persistence again.
    pub fn reset(&self) {
        self.store.reset();
        if let Ok(mut retired) = self.retired.lock() {
            retired.clear();
        }
    }

    /// Resolve the certificate a stored side channel names.
    ///
    /// The active certificate comes from the cache. Any other serial is looked
    /// up in persistence, verified and cached. Expired and inactive
    /// certificates are accepted: they still open what they sealed.
    ///
    /// Returns `Ok(None)` when no certificate with `serial` is stored.
    ///
    /// # Errors
    ///
    /// - [`KeyError::InvalidCertificate`] if the stored certificate fails
    ///   verification.
    /// - [`KeyError::Persistence`] if storage fails.
    pub fn certificate(&self, serial: &str) -> Result<Option<Arc<Certificate>>, KeyError> {
        let active = self.load_or_create()?;
        if active.body.serial == serial {
            return Ok(Some(active));
        }
        if let Some(cert) = self.retired()?.get(serial) {
            return Ok(Some(Arc::clone(cert)));
        }
        let Some(cert) = self.persistence.find_certificate(serial)? else {
            return Ok(None);
        };
        if cert.body.serial != serial {
            return Err(KeyError::InvalidCertificate(format!(
                "{serial}: stored row names {}",
                cert.body.serial
            )));
        }
        cert.verify()?;
        let cert = Arc::new(cert);
        self.retired()?.insert(serial.to_owned(), Arc::clone(&cert));
        debug!(serial, "loaded retired certificate");
        Ok(Some(cert))
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    fn retired(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<Certificate>>>, KeyError> {
        self.retired
            .lock()
            .map_err(|_| KeyError::Persistence("retired certificate cache lock poisoned".into()))
    }

    fn load_from_persistence(&self) -> Result<Certificate, KeyError> {
        let now = clock::unix_millis();
        match self.persistence.find_active_certificate()? {
            Some(cert) => {
                cert.verify()?;
                if cert.is_not_yet_valid(now) {
                    return Err(KeyError::InvalidCertificate(format!(
                        "{}: not valid before {}",
                        cert.body.serial, cert.body.valid_from
                    )));
                }
                if cert.is_expired(now) {
                    warn!(
                        serial = %cert.body.serial,
                        valid_to = cert.body.valid_to,
                        "active certificate expired; rotating"
                    );
                    return self.create();
                }
                info!(serial = %cert.body.serial, "loaded active certificate");
                Ok(cert)
            }
            None => self.create(),
        }
    }

    fn create(&self) -> Result<Certificate, KeyError> {
        let cert = Certificate::generate(&self.params)?;
        self.persistence.deactivate_prior_certificates()?;
        self.persistence.insert_certificate(&cert)?;
        info!(
            serial = %cert.body.serial,
            key_size_bits = cert.body.public_key.key_size_bits,
            fingerprint = %cert.body.fingerprint,
            "generated new certificate"
        );
        Ok(cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::certificate::test_certificate;
    use crate::persistence::{MemoryStore, MockPersistence};

    fn demo_params() -> CertificateParams {
        CertificateParams {
            key_source: KeySource::demonstration(),
            ..CertificateParams::default()
        }
    }

    #[test]
    fn creates_once_and_reuses() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeyManager::new(store.clone(), demo_params());
        let first = keys.load_or_create().unwrap();
        let second = keys.load_or_create().unwrap();
        assert_eq!(first.body.serial, second.body.serial);
        assert_eq!(store.certificate_count(), 1);
    }

    #[test]
    fn loads_existing_after_reset() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeyManager::new(store.clone(), demo_params());
        let first = keys.load_or_create().unwrap();
        keys.reset();
        assert!(keys.current().is_err());
        let again = keys.load_or_create().unwrap();
        assert_eq!(first.body.serial, again.body.serial);
        assert_eq!(store.certificate_count(), 1);
    }

    #[test]
    fn expired_certificate_is_rotated() {
        let store = Arc::new(MemoryStore::new());
        let mut old = test_certificate();
        old.body.valid_from = 1_000;
        old.body.valid_to = 2_000;
        // Re-sign so the expired certificate is otherwise valid.
        old.self_signature =
            crate::crypto::signature::sign(&old.body.signing_bytes().unwrap(), &old.body).unwrap();
        store.insert_certificate(&old).unwrap();

        let keys = KeyManager::new(store.clone(), demo_params());
        let cert = keys.load_or_create().unwrap();
        assert_ne!(cert.body.serial, old.body.serial);
        assert_eq!(store.certificate_count(), 2);
        assert_eq!(store.active_certificate_count(), 1);
    }

    #[test]
    fn retired_certificate_resolves_by_serial() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeyManager::new(store.clone(), demo_params());
        let old = keys.load_or_create().unwrap();

        let new = test_certificate();
        store.deactivate_prior_certificates().unwrap();
        store.insert_certificate(&new).unwrap();
        keys.reset();

        assert_eq!(keys.load_or_create().unwrap().body.serial, new.body.serial);
        let resolved = keys.certificate(&old.body.serial).unwrap().unwrap();
        assert_eq!(*resolved, *old);
        assert_eq!(
            keys.certificate(&new.body.serial).unwrap().unwrap().body.serial,
            new.body.serial
        );
        assert!(keys.certificate("RSG-missing").unwrap().is_none());
    }

    #[test]
    fn tampered_retired_certificate_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut forged = test_certificate();
        forged.body.subject = "forged".into();
        store.insert_certificate(&forged).unwrap();
        store.deactivate_prior_certificates().unwrap();

        let keys = KeyManager::new(store, demo_params());
        let err = keys.certificate(&forged.body.serial).unwrap_err();
        assert!(matches!(err, KeyError::InvalidCertificate(_)));
    }

    #[test]
    fn tampered_certificate_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let mut cert = test_certificate();
        cert.body.issuer = "forged".into();
        store.insert_certificate(&cert).unwrap();

        let keys = KeyManager::new(store, demo_params());
        let err = keys.load_or_create().unwrap_err();
        assert!(matches!(err, KeyError::InvalidCertificate(_)));
        assert!(SealError::from(err).is_fatal());
    }

    #[test]
    fn stored_certificate_with_degenerate_primes_is_rejected() {
        for p in [0u32, 1] {
            let store = Arc::new(MemoryStore::new());
            let mut cert = test_certificate();
            let modulus = num_bigint::BigUint::from(p) * &cert.body.private_key.prime_q;
            cert.body.private_key.prime_p = num_bigint::BigUint::from(p);
            cert.body.private_key.modulus = modulus.clone();
            cert.body.public_key.modulus = modulus;
            store.insert_certificate(&cert).unwrap();

            let keys = KeyManager::new(store, demo_params());
            let err = keys.load_or_create().unwrap_err();
            assert!(matches!(err, KeyError::InvalidCertificate(_)), "p = {p}: {err:?}");
        }
    }

    #[test]
    fn storage_failure_is_reported() {
        let mut mock = MockPersistence::new();
        mock.expect_find_active_certificate()
            .returning(|| Err(PersistenceError::Backend("disk gone".into())));
        let keys = KeyManager::new(Arc::new(mock), demo_params());
        let err = keys.load_or_create().unwrap_err();
        assert!(matches!(err, KeyError::Persistence(_)));
    }

    #[test]
    fn insert_happens_after_deactivation() {
        let mut seq = mockall::Sequence::new();
        let mut mock = MockPersistence::new();
        mock.expect_find_active_certificate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(None));
        mock.expect_deactivate_prior_certificates()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_insert_certificate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let keys = KeyManager::new(Arc::new(mock), demo_params());
        keys.load_or_create().unwrap();
        keys.load_or_create().unwrap();
    }
}
