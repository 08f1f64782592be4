//! Immutable table → sensitive-field registry.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use common::protocol::SIDE_CHANNEL_FIELDS;
use common::SealError;

/// Errors from building a [`TableRegistry`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("table map is not valid YAML: {0}")]
    Parse(String),

    #[error("invalid table name {0:?}: must be non-empty [A-Za-z0-9_]")]
    InvalidTableName(String),

    #[error("table {0} is declared more than once")]
    DuplicateTable(String),

    #[error("table {table}: field {field:?} {reason}")]
    InvalidField {
        table: String,
        field: String,
        reason: &'static str,
    },
}

impl From<SchemaError> for SealError {
    fn from(e: SchemaError) -> Self {
        SealError::Configuration(e.to_string())
    }
}

/// A validated table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName(String);

impl TableName {
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidTableName`] unless `name` is non-empty
    /// ASCII alphanumerics and underscores.
    pub fn parse(name: &str) -> Result<Self, SchemaError> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(SchemaError::InvalidTableName(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TablesDocument {
    #[serde(default)]
    tables: Vec<TableEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableEntry {
    name: String,
    #[serde(default)]
    sensitive_fields: Vec<String>,
}

/// Which tables are protected and which of their fields are encrypted.
///
/// Built once at startup and never mutated; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: Arc<HashMap<TableName, Vec<String>>>,
}

impl TableRegistry {
    /// Parse the YAML table map.
    ///
    /// ```yaml
    /// tables:
    ///   - name: personnel
    ///     sensitive_fields: [name, phone]
    /// ```
    pub fn from_yaml_str(text: &str) -> Result<Self, SchemaError> {
        let doc: TablesDocument =
            serde_yaml::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))?;
        Self::from_entries(doc.tables.into_iter().map(|t| (t.name, t.sensitive_fields)))
    }

    /// Build from `(table, sensitive fields)` pairs. Field order is kept.
    pub fn from_entries<I, S, F>(entries: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = (S, F)>,
        S: AsRef<str>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let mut tables = HashMap::new();
        for (name, fields) in entries {
            let name = TableName::parse(name.as_ref())?;
            let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
            validate_fields(&name, &fields)?;
            if tables.insert(name.clone(), fields).is_some() {
                return Err(SchemaError::DuplicateTable(name.0));
            }
        }
        Ok(Self {
            tables: Arc::new(tables),
        })
    }

    /// `true` if records of `table` pass through the sealing pipeline.
    pub fn is_protected(&self, table: &str) -> bool {
        self.sensitive_fields(table).is_some()
    }

    /// Sensitive fields of a protected table, in configured order.
    pub fn sensitive_fields(&self, table: &str) -> Option<&[String]> {
        let name = TableName::parse(table).ok()?;
        self.tables.get(&name).map(Vec::as_slice)
    }

    /// Protected table names, sorted.
    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(TableName::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn validate_fields(table: &TableName, fields: &[String]) -> Result<(), SchemaError> {
    let invalid = |field: &str, reason| SchemaError::InvalidField {
        table: table.0.clone(),
        field: field.to_owned(),
        reason,
    };
    let mut seen = HashSet::new();
    for field in fields {
        if field.is_empty() {
            return Err(invalid(field, "is empty"));
        }
        if SIDE_CHANNEL_FIELDS.contains(&field.as_str()) {
            return Err(invalid(field, "is a reserved side-channel name"));
        }
        if !seen.insert(field.as_str()) {
            return Err(invalid(field, "is listed twice"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = "
tables:
  - name: personnel
    sensitive_fields: [name, phone]
  - name: audit_trail
";

    #[test]
    fn parses_yaml() {
        let reg = TableRegistry::from_yaml_str(YAML).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.is_protected("personnel"));
        assert!(reg.is_protected("audit_trail"));
        assert!(!reg.is_protected("visitors"));
        assert_eq!(
            reg.sensitive_fields("personnel").unwrap(),
            &["name".to_string(), "phone".to_string()]
        );
        assert!(reg.sensitive_fields("audit_trail").unwrap().is_empty());
        assert_eq!(reg.table_names(), vec!["audit_trail", "personnel"]);
    }

    #[test]
    fn rejects_bad_table_names() {
        assert!(matches!(
            TableRegistry::from_entries([("bad-name", ["x"])]),
            Err(SchemaError::InvalidTableName(_))
        ));
        assert!(TableName::parse("").is_err());
        assert!(!TableRegistry::default().is_protected("../etc"));
    }

    #[test]
    fn rejects_duplicate_tables() {
        let err = TableRegistry::from_entries([("t", vec!["a"]), ("t", vec!["b"])]).unwrap_err();
        assert_eq!(err, SchemaError::DuplicateTable("t".into()));
    }

    #[test]
    fn rejects_reserved_empty_and_repeated_fields() {
        for fields in [vec!["cipher_bundle"], vec![""], vec!["a", "a"]] {
            let err = TableRegistry::from_entries([("t", fields)]).unwrap_err();
            assert!(matches!(err, SchemaError::InvalidField { .. }), "{err}");
        }
    }

    #[test]
    fn rejects_unknown_keys_and_bad_yaml() {
        assert!(TableRegistry::from_yaml_str("tables: [{name: t, secret: [x]}]").is_err());
        let err = TableRegistry::from_yaml_str("tables: {").unwrap_err();
        assert_eq!(SealError::from(err).code(), "configuration");
    }

    #[test]
    fn empty_document_has_no_tables() {
        assert!(TableRegistry::from_yaml_str("tables: []").unwrap().is_empty());
    }
}
