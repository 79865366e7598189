//! Correlation extraction
//!
//! The source's global transaction id (`payload.source.gtid`) becomes the
//! `$correlationId` of every event produced by that transaction, so
//! otherwise unrelated per-row events can be regrouped downstream.
//!
//! The id is assumed unique and stable for the lifetime of the data it
//! groups. Nothing here verifies that (e.g. across a replica promotion).

use crate::cdc::error::{DecodeError, Document};
use serde_json::Value;

pub const GTID_PATH: &str = "payload.source.gtid";

/// Extract the transaction id from a decoded value document
pub fn correlation_id(value_document: &Value) -> Result<String, DecodeError> {
    let raw = value_document
        .get("payload")
        .and_then(|p| p.get("source"))
        .and_then(|s| s.get("gtid"))
        .ok_or_else(|| DecodeError::missing(Document::Value, GTID_PATH))?;

    match raw {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::String(_) => Err(DecodeError::invalid(Document::Value, GTID_PATH, "empty")),
        Value::Null => Err(DecodeError::missing(Document::Value, GTID_PATH)),
        _ => Err(DecodeError::invalid(
            Document::Value,
            GTID_PATH,
            "not a string",
        )),
    }
}
