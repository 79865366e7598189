//! Outbound event construction

use crate::cdc::classify::EventType;
use crate::cdc::envelope::{ChangeRecord, SourcePosition};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event metadata document
///
/// Serialized as
/// `{"offset": .., "timestamp": "..", "$correlationId": "..", "topic": .., "partition": ..}`.
/// `(topic, partition, offset)` identifies the source message and can be
/// used downstream to deduplicate redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub offset: i64,
    /// RFC 3339 source timestamp
    pub timestamp: String,
    #[serde(rename = "$correlationId")]
    pub correlation_id: String,
    pub topic: String,
    pub partition: i32,
}

impl EventMetadata {
    pub fn idempotency_key(&self) -> SourcePosition {
        SourcePosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "offset": self.offset,
            "timestamp": self.timestamp,
            "$correlationId": self.correlation_id,
            "topic": self.topic,
            "partition": self.partition,
        })
    }
}

/// One event ready to be appended; immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendableEvent {
    pub event_type: EventType,
    /// `{"key": <key document>, "value": <value document>}` as JSON bytes
    pub payload: Bytes,
    pub metadata: EventMetadata,
}

impl AppendableEvent {
    pub fn new(event_type: EventType, payload: Bytes, metadata: EventMetadata) -> Self {
        AppendableEvent {
            event_type,
            payload,
            metadata,
        }
    }

    /// Build the event for a decoded record
    pub fn from_record(record: &ChangeRecord) -> Self {
        let payload = serde_json::json!({
            "key": &record.raw_key,
            "value": &record.raw_value,
        });

        AppendableEvent {
            event_type: record.event_type(),
            payload: Bytes::from(payload.to_string()),
            metadata: EventMetadata {
                offset: record.position.offset,
                timestamp: record.timestamp.to_rfc3339(),
                correlation_id: record.transaction_id.clone(),
                topic: record.position.topic.clone(),
                partition: record.position.partition,
            },
        }
    }

    pub fn payload_json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.payload)
    }
}
