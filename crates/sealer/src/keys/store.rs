//! [`KeyStore`]: lock-free cache of the active certificate.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;

use super::{Certificate, KeyError};

/// Thread-safe holder for the active [`Certificate`].
///
/// Reads go through an `ArcSwapOption`, so every sealing operation gets a
/// consistent snapshot without locking. Initialisation is serialised by a
/// separate mutex: concurrent first callers run the initialiser once and all
/// observe the same certificate.
#[derive(Clone, Debug, Default)]
pub struct KeyStore {
    inner: Arc<ArcSwapOption<Certificate>>,
    init: Arc<Mutex<()>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once a certificate is cached.
    pub fn is_ready(&self) -> bool {
        self.inner.load().is_some()
    }

    /// Snapshot of the cached certificate.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotInitialised`] if nothing has been cached yet.
    pub fn current(&self) -> Result<Arc<Certificate>, KeyError> {
        self.inner.load_full().ok_or(KeyError::NotInitialised)
    }

    /// Return the cached certificate, running `init` first if there is none.
    ///
    /// `init` runs at most once per empty period even under concurrent calls.
    /// If it fails nothing is cached and the next caller tries again.
    pub fn get_or_try_init<F>(&self, init: F) -> Result<Arc<Certificate>, KeyError>
    where
        F: FnOnce() -> Result<Certificate, KeyError>,
    {
        if let Some(cert) = self.inner.load_full() {
            return Ok(cert);
        }
        let _guard = self
            .init
            .lock()
            .map_err(|_| KeyError::Persistence("key store init lock poisoned".into()))?;
        // Another caller may have finished while we waited.
        if let Some(cert) = self.inner.load_full() {
            return Ok(cert);
        }
        let cert = Arc::new(init()?);
        self.inner.store(Some(Arc::clone(&cert)));
        Ok(cert)
    }

    /// Drop the cached certificate so the next access reloads it.
    pub fn reset(&self) {
        self.inner.store(None);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::keys::certificate::test_certificate;

    #[test]
    fn initially_not_ready() {
        let store = KeyStore::new();
        assert!(!store.is_ready());
        assert!(matches!(store.current(), Err(KeyError::NotInitialised)));
    }

    #[test]
    fn init_runs_once() {
        let store = KeyStore::new();
        let calls = AtomicUsize::new(0);
        let first = store
            .get_or_try_init(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(test_certificate())
            })
            .unwrap();
        let second = store
            .get_or_try_init(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(test_certificate())
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.body.serial, second.body.serial);
        assert!(store.is_ready());
    }

    #[test]
    fn failed_init_caches_nothing() {
        let store = KeyStore::new();
        let err = store
            .get_or_try_init(|| Err(KeyError::Generation("boom".into())))
            .unwrap_err();
        assert!(matches!(err, KeyError::Generation(_)));
        assert!(!store.is_ready());
        assert!(store.get_or_try_init(|| Ok(test_certificate())).is_ok());
    }

    #[test]
    fn concurrent_first_callers_share_one_certificate() {
        let store = KeyStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    store
                        .get_or_try_init(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(test_certificate())
                        })
                        .unwrap()
                        .body
                        .serial
                        .clone()
                })
            })
            .collect();
        let serials: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(serials.iter().all(|s| s == &serials[0]));
    }

    #[test]
    fn reset_clears_cache() {
        let store = KeyStore::new();
        store.get_or_try_init(|| Ok(test_certificate())).unwrap();
        store.reset();
        assert!(!store.is_ready());
    }
}
