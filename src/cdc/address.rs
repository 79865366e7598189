//! Stream addressing: (table, primary key) -> entity stream id
//!
//! Every source row gets its own append-only stream named
//! `{table}-{primaryKeyValue}`. Configured table names may not contain `-`,
//! so the first `-` in a stream id always separates table from key and the
//! mapping is injective.

use crate::cdc::error::{DecodeError, Document, LookupError, RecordError};
use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Separator between table and primary key in a stream id
pub const STREAM_SEPARATOR: char = '-';

/// Identifier of one entity stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(table: &str, primary_key_value: &str) -> Self {
        StreamId(format!("{}{}{}", table, STREAM_SEPARATOR, primary_key_value))
    }

    /// Wrap an existing identifier (e.g. one read back from the log)
    pub fn from_raw(id: impl Into<String>) -> Self {
        StreamId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Table part (the stream's category)
    pub fn table(&self) -> &str {
        self.0
            .split_once(STREAM_SEPARATOR)
            .map(|(table, _)| table)
            .unwrap_or(&self.0)
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.0.split_once(STREAM_SEPARATOR).map(|(_, pk)| pk)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Static table -> primary-key field mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKeyMap {
    tables: BTreeMap<String, String>,
}

impl PrimaryKeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert; validation happens in [`PrimaryKeyMap::validate`]
    pub fn with(mut self, table: impl Into<String>, field: impl Into<String>) -> Self {
        self.tables.insert(table.into(), field.into());
        self
    }

    pub fn insert(&mut self, table: impl Into<String>, field: impl Into<String>) {
        self.tables.insert(table.into(), field.into());
    }

    pub fn field_for(&self, table: &str) -> Result<&str, LookupError> {
        self.tables
            .get(table)
            .map(String::as_str)
            .ok_or_else(|| LookupError {
                table: table.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables.iter().map(|(t, f)| (t.as_str(), f.as_str()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (table, field) in &self.tables {
            if table.is_empty() || table.contains(STREAM_SEPARATOR) {
                return Err(ConfigError::InvalidTableName(table.clone()));
            }
            if field.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "primary-key field for table `{}` is empty",
                    table
                )));
            }
        }
        Ok(())
    }
}

/// Derives target stream ids from decoded records
#[derive(Debug, Clone)]
pub struct StreamAddressor {
    primary_keys: PrimaryKeyMap,
}

impl StreamAddressor {
    pub fn new(primary_keys: PrimaryKeyMap) -> Self {
        StreamAddressor { primary_keys }
    }

    pub fn primary_keys(&self) -> &PrimaryKeyMap {
        &self.primary_keys
    }

    /// Name of the primary-key field configured for `table`
    pub fn primary_key_field(&self, table: &str) -> Result<&str, LookupError> {
        self.primary_keys.field_for(table)
    }

    /// Look up the table's key field, extract it from the key document
    /// (`payload.<field>`) and build the stream id.
    pub fn address(&self, table: &str, key_document: &Value) -> Result<StreamId, RecordError> {
        let field = self.primary_key_field(table)?;
        let value = primary_key_value(key_document, field)?;
        Ok(StreamId::new(table, &value))
    }
}

/// Extract `payload.<field>` from a key document as a non-empty string
pub fn primary_key_value(key_document: &Value, field: &str) -> Result<String, DecodeError> {
    let path = format!("payload.{}", field);
    let payload = key_document
        .get("payload")
        .ok_or_else(|| DecodeError::missing(Document::Key, "payload"))?;
    let raw = payload
        .get(field)
        .ok_or_else(|| DecodeError::missing(Document::Key, path.clone()))?;

    let value = match raw {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => return Err(DecodeError::invalid(Document::Key, path, "null")),
        Value::Array(_) | Value::Object(_) => {
            return Err(DecodeError::invalid(Document::Key, path, "not a scalar"))
        }
    };

    if value.is_empty() {
        return Err(DecodeError::invalid(Document::Key, path, "empty"));
    }
    Ok(value)
}
