//! Envelope decoding
//!
//! A `ChangeEnvelope` is one raw notification from the replication feed
//! (key + value bytes plus transport metadata). Decoding validates both
//! documents against an explicit required-field schema and produces a typed
//! `ChangeRecord`; any missing or mistyped field is a single `DecodeError`.
//!
//! Value document layout:
//!
//! ```text
//! { "payload": { "op": "c|u|d|r|..",
//!                "source": { "table": .., "db": .., "gtid": .. } } }
//! ```
//!
//! Key document layout: `{ "payload": { "<pk field>": .. } }`.

use crate::cdc::address::{primary_key_value, StreamAddressor};
use crate::cdc::classify::{classify, EventType};
use crate::cdc::correlation::correlation_id;
use crate::cdc::error::{DecodeError, Document, RecordError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Where a message sits in the source feed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Raw change notification as delivered by the message source
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEnvelope {
    pub key: Option<Bytes>,
    /// `None` for a compaction tombstone
    pub value: Option<Bytes>,
    pub topic: String,
    pub partition: i32,
    /// Monotonically increasing within (topic, partition)
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEnvelope {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        timestamp: DateTime<Utc>,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Self {
        ChangeEnvelope {
            key,
            value,
            topic: topic.into(),
            partition,
            offset,
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Required string fields of the value document, as (path, json pointer)
const VALUE_SCHEMA: [(&str, &str); 3] = [
    ("payload.op", "/payload/op"),
    ("payload.source.table", "/payload/source/table"),
    ("payload.source.db", "/payload/source/db"),
];

/// Decoded, validated change record
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub table: String,
    pub database: String,
    /// Raw operation code (`c`, `u`, `d`, `r`, or anything else)
    pub operation: String,
    pub primary_key_value: String,
    /// Global transaction id; empty only for snapshot records
    pub transaction_id: String,
    pub raw_key: Value,
    pub raw_value: Value,
    pub position: SourcePosition,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn event_type(&self) -> EventType {
        classify(&self.operation)
    }
}

/// Parse a payload as a JSON document
pub fn parse_document(document: Document, bytes: Option<&Bytes>) -> Result<Value, DecodeError> {
    let bytes = bytes.ok_or(DecodeError::MissingPayload(document))?;
    let value: Value = serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed {
        document,
        reason: e.to_string(),
    })?;
    if !value.is_object() {
        return Err(DecodeError::Malformed {
            document,
            reason: "top level is not an object".to_string(),
        });
    }
    Ok(value)
}

fn required_str(value: &Value, path: &str, pointer: &str) -> Result<String, DecodeError> {
    match value.pointer(pointer) {
        None | Some(Value::Null) => Err(DecodeError::missing(Document::Value, path)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(DecodeError::invalid(Document::Value, path, "not a string")),
    }
}

/// Decode an envelope into a `ChangeRecord`.
///
/// The table's primary-key field comes from the addressor, so a table
/// without one fails with `LookupError` and no record is produced.
pub fn decode(
    envelope: &ChangeEnvelope,
    addressor: &StreamAddressor,
) -> Result<ChangeRecord, RecordError> {
    let raw_value = parse_document(Document::Value, envelope.value.as_ref())?;

    let [operation, table, database] =
        VALUE_SCHEMA.map(|(path, pointer)| required_str(&raw_value, path, pointer));
    let (operation, table, database) = (operation?, table?, database?);

    // Initial-load records carry no transaction id
    let transaction_id = match correlation_id(&raw_value) {
        Ok(id) => id,
        Err(DecodeError::MissingField { .. }) if classify(&operation) == EventType::Snapshot => {
            String::new()
        }
        Err(e) => return Err(e.into()),
    };

    let field = addressor.primary_key_field(&table)?;
    let raw_key = parse_document(Document::Key, envelope.key.as_ref())?;
    let primary_key_value = primary_key_value(&raw_key, field)?;

    Ok(ChangeRecord {
        table,
        database,
        operation,
        primary_key_value,
        transaction_id,
        raw_key,
        raw_value,
        position: envelope.position(),
        timestamp: envelope.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::address::PrimaryKeyMap;
    use crate::cdc::error::LookupError;
    use serde_json::json;

    fn addressor() -> StreamAddressor {
        StreamAddressor::new(PrimaryKeyMap::new().with("customers", "id"))
    }

    fn envelope(key: Value, value: Value) -> ChangeEnvelope {
        ChangeEnvelope::new(
            "dbserver1.inventory.customers",
            0,
            42,
            Utc::now(),
            Some(Bytes::from(key.to_string())),
            Some(Bytes::from(value.to_string())),
        )
    }

    fn value_doc(op: &str, gtid: Value) -> Value {
        json!({"payload": {
            "before": null,
            "after": {"id": 7, "first_name": "Anne"},
            "op": op,
            "source": {"table": "customers", "db": "inventory", "gtid": gtid}
        }})
    }

    #[test]
    fn test_decode_insert() {
        let env = envelope(json!({"payload": {"id": 7}}), value_doc("c", json!("abc-1")));
        let record = decode(&env, &addressor()).unwrap();

        assert_eq!(record.table, "customers");
        assert_eq!(record.database, "inventory");
        assert_eq!(record.operation, "c");
        assert_eq!(record.event_type(), EventType::Insert);
        assert_eq!(record.primary_key_value, "7");
        assert_eq!(record.transaction_id, "abc-1");
        assert_eq!(record.position.offset, 42);
        assert_eq!(record.raw_value["payload"]["after"]["first_name"], "Anne");
    }

    #[test]
    fn test_missing_required_fields() {
        for pointer in ["op", "table", "db"] {
            let mut value = value_doc("u", json!("g"));
            match pointer {
                "op" => value["payload"].as_object_mut().unwrap().remove("op"),
                other => value["payload"]["source"].as_object_mut().unwrap().remove(other),
            };
            let err = decode(&envelope(json!({"payload": {"id": 1}}), value), &addressor())
                .unwrap_err();
            assert!(
                matches!(err, RecordError::Decode(DecodeError::MissingField { .. })),
                "removing {} gave {:?}",
                pointer,
                err
            );
        }
    }

    #[test]
    fn test_missing_gtid_rejected_for_live_ops() {
        let env = envelope(json!({"payload": {"id": 7}}), value_doc("u", Value::Null));
        assert!(matches!(
            decode(&env, &addressor()),
            Err(RecordError::Decode(DecodeError::MissingField { .. }))
        ));
    }

    #[test]
    fn test_snapshot_without_gtid_has_empty_correlation() {
        let env = envelope(json!({"payload": {"id": 7}}), value_doc("r", Value::Null));
        let record = decode(&env, &addressor()).unwrap();
        assert_eq!(record.event_type(), EventType::Snapshot);
        assert!(record.transaction_id.is_empty());
    }

    #[test]
    fn test_malformed_payloads() {
        let mut env = envelope(json!({"payload": {"id": 7}}), value_doc("c", json!("g")));
        env.value = Some(Bytes::from_static(b"{not json"));
        assert!(matches!(
            decode(&env, &addressor()),
            Err(RecordError::Decode(DecodeError::Malformed { document: Document::Value, .. }))
        ));

        let mut env = envelope(json!({"payload": {"id": 7}}), value_doc("c", json!("g")));
        env.key = Some(Bytes::from_static(b"[1,2]"));
        assert!(matches!(
            decode(&env, &addressor()),
            Err(RecordError::Decode(DecodeError::Malformed { document: Document::Key, .. }))
        ));

        let mut env = envelope(json!({"payload": {"id": 7}}), value_doc("c", json!("g")));
        env.key = None;
        assert_eq!(
            decode(&env, &addressor()),
            Err(RecordError::Decode(DecodeError::MissingPayload(Document::Key)))
        );
    }

    #[test]
    fn test_unknown_table_is_lookup_error() {
        let mut value = value_doc("c", json!("g"));
        value["payload"]["source"]["table"] = json!("unknown_table");
        let env = envelope(json!({"payload": {"id": 7}}), value);
        assert_eq!(
            decode(&env, &addressor()),
            Err(RecordError::Lookup(LookupError {
                table: "unknown_table".to_string()
            }))
        );
    }

    #[test]
    fn test_tombstone_detection() {
        let mut env = envelope(json!({"payload": {"id": 7}}), value_doc("d", json!("g")));
        assert!(!env.is_tombstone());
        env.value = None;
        assert!(env.is_tombstone());
        assert_eq!(env.position().to_string(), "dbserver1.inventory.customers/0@42");
    }
}
