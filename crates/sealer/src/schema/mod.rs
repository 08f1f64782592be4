//! Table configuration: which tables are protected and which fields are sensitive.
//!
//! # Module invariants
//!
//! - **No crypto dependencies.** This module must not import anything from
//!   `crate::crypto` or `crate::keys`.
//! - The registry is loaded once at startup and is immutable afterwards.

pub mod registry;

pub use registry::{SchemaError, TableName, TableRegistry};

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Read and validate the YAML table map at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or fails validation.
pub fn load_file(path: impl AsRef<Path>) -> Result<TableRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read table map {}", path.display()))?;
    let registry = TableRegistry::from_yaml_str(&text)
        .with_context(|| format!("invalid table map {}", path.display()))?;

    if registry.is_empty() {
        warn!(path = %path.display(), "table map declares no protected tables");
    }
    info!(
        path = %path.display(),
        tables = ?registry.table_names(),
        "loaded table map"
    );
    Ok(registry)
}
