//! `sealer`: record sealing engine.
//!
//! Applies confidentiality (per-field encryption), authentication (a record
//! signature) and integrity (a record digest) before a record is persisted,
//! and verifies and reverses them on read.
//!
//! Startup sequence for a host:
//! 1. Load and validate [`SealerConfig`] from environment variables.
//! 2. Initialise structured logging.
//! 3. Load the table map.
//! 4. Open the persistence backend.
//! 5. Load or create the active certificate and build the [`Sealer`].

pub mod clock;
pub mod config;
pub mod crypto;
pub mod keys;
pub mod persistence;
pub mod pipeline;
pub mod schema;
pub mod telemetry;

pub use config::SealerConfig;
pub use keys::{Certificate, KeyManager};
pub use persistence::{MemoryStore, Persistence, SqliteStore};
pub use pipeline::{PipelineOptions, Revealed, Sealed, Sealer};
pub use schema::TableRegistry;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

/// Run the full startup sequence from environment variables.
///
/// # Errors
///
/// Returns an error if configuration is invalid or key material cannot be
/// loaded or created.
pub fn start_from_env() -> Result<Sealer> {
    let cfg = SealerConfig::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;
    telemetry::init(&cfg.log_level)?;
    bootstrap(&cfg)
}

/// Build a [`Sealer`] from an already validated configuration.
///
/// # Errors
///
/// Returns an error if the table map cannot be loaded, the database cannot be
/// opened, or the certificate cannot be loaded or created.
pub fn bootstrap(cfg: &SealerConfig) -> Result<Sealer> {
    info!(version = env!("CARGO_PKG_VERSION"), "sealer starting");

    let tables = schema::load_file(&cfg.tables_file)?;

    let store: Arc<dyn Persistence> = match &cfg.database_path {
        Some(path) => Arc::new(
            SqliteStore::open(path).with_context(|| format!("failed to open database {path}"))?,
        ),
        None => {
            info!("no DATABASE_PATH set; certificates and logs kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let keys = KeyManager::new(store, cfg.certificate_params()?);
    let options = PipelineOptions {
        integrity_mode: cfg.integrity_mode()?,
        step_deadline: cfg.step_deadline(),
    };
    let sealer =
        Sealer::new(keys, tables, options).context("failed to initialise key material")?;

    let cert = sealer.keys().current()?;
    info!(
        serial = %cert.body.serial,
        key_size_bits = cert.body.public_key.key_size_bits,
        integrity_mode = options.integrity_mode.algorithm(),
        tables = sealer.tables().len(),
        "sealer ready"
    );
    Ok(sealer)
}
