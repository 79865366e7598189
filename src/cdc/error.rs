//! Per-message error types
//!
//! Both kinds are recoverable at message granularity: the bridge logs the
//! message and moves on.

use std::fmt;

/// Which half of a change notification a decode error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    Key,
    Value,
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Document::Key => write!(f, "key"),
            Document::Value => write!(f, "value"),
        }
    }
}

/// Malformed or incomplete inbound message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message has no {0} payload")]
    MissingPayload(Document),
    #[error("{document} payload is not a JSON document: {reason}")]
    Malformed { document: Document, reason: String },
    #[error("{document} document is missing required field `{path}`")]
    MissingField { document: Document, path: String },
    #[error("{document} field `{path}` is invalid: {reason}")]
    InvalidField {
        document: Document,
        path: String,
        reason: String,
    },
}

impl DecodeError {
    pub(crate) fn missing(document: Document, path: impl Into<String>) -> Self {
        DecodeError::MissingField {
            document,
            path: path.into(),
        }
    }

    pub(crate) fn invalid(
        document: Document,
        path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DecodeError::InvalidField {
            document,
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Table has no configured primary-key field
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no primary-key field configured for table `{table}`")]
pub struct LookupError {
    pub table: String,
}

/// Anything that stops one message from becoming an appendable event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_document_and_path() {
        let err = DecodeError::missing(Document::Value, "payload.source.gtid");
        assert_eq!(
            err.to_string(),
            "value document is missing required field `payload.source.gtid`"
        );
    }

    #[test]
    fn test_lookup_error_display() {
        let err = LookupError {
            table: "unknown_table".to_string(),
        };
        assert!(err.to_string().contains("unknown_table"));
    }
}
