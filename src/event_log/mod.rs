//! Durable Event Log
//!
//! Append-only log of events grouped into entity streams. Implementations:
//! - `InMemoryEventLog`: `memory://` endpoint, tests and DST
//! - `FileEventLog`: `file://<dir>` endpoint, checksummed segment files
//! - `SimulatedEventLog`: fault-injecting wrapper around either
//!
//! ## Read views
//!
//! ```text
//! read_stream("customers-7")     one entity stream, append order
//! read_by_table("customers")     every customers-* stream, global order
//! read_by_correlation("tx-9")    every event of one source transaction
//! read_by_event_type(Delete)     every event of one type
//! read_all(from, limit)          global append order
//! ```

pub mod file;
pub mod index;
pub mod memory;
pub mod segment;
pub mod simulated;

pub use file::FileEventLog;
pub use index::LogIndex;
pub use memory::InMemoryEventLog;
pub use segment::SegmentError;
pub use simulated::{SimulatedEventLog, SimulatedLogConfig, SimulatedLogStats};

use crate::cdc::{AppendableEvent, EventMetadata, EventType, StreamId};
use crate::config::{EventLogConfig, LogEndpoint};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

/// A persisted event as read back from the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub stream_id: StreamId,
    /// 0-based position within the stream
    pub stream_position: u64,
    /// 0-based position across the whole log
    pub global_position: u64,
    pub event_type: EventType,
    pub payload: Bytes,
    pub metadata: EventMetadata,
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    pub fn table(&self) -> &str {
        self.stream_id.table()
    }

    pub fn correlation_id(&self) -> &str {
        &self.metadata.correlation_id
    }
}

/// Optimistic-concurrency check applied to an append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedVersion {
    /// No check
    #[default]
    Any,
    /// The stream must not exist yet
    NoStream,
    /// The stream's last event must be at this position
    Exact(u64),
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::NoStream => write!(f, "no stream"),
            ExpectedVersion::Exact(v) => write!(f, "{}", v),
        }
    }
}

/// Outcome of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Stream position of the last appended event
    pub next_expected_version: u64,
    pub first_global_position: u64,
    pub last_global_position: u64,
}

/// Event log errors
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event log unavailable: {0}")]
    Unavailable(String),
    #[error("event log operation timed out")]
    Timeout,
    #[error("wrong expected version for stream {stream}: expected {expected}, current {current:?}")]
    WrongExpectedVersion {
        stream: StreamId,
        expected: ExpectedVersion,
        current: Option<u64>,
    },
    #[error("append to stream {0} carries no events")]
    EmptyAppend(StreamId),
    #[error("event log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("event log connection is closed")]
    Closed,
    #[error("invalid event log endpoint: {0}")]
    InvalidEndpoint(String),
}

impl EventLogError {
    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EventLogError::Unavailable(_)
                | EventLogError::Timeout
                | EventLogError::Io(_)
                | EventLogError::Segment(SegmentError::Io(_))
        )
    }
}

pub type LogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventLogError>> + Send + 'a>>;

/// Append-only event log connection
pub trait EventLog: Send + Sync {
    /// Append events to one stream atomically: all of them persist, or none
    fn append<'a>(
        &'a self,
        stream: &'a StreamId,
        expected: ExpectedVersion,
        events: Vec<AppendableEvent>,
    ) -> LogFuture<'a, AppendResult>;

    /// Events of one stream in append order (empty if the stream does not exist)
    fn read_stream<'a>(&'a self, stream: &'a StreamId) -> LogFuture<'a, Vec<RecordedEvent>>;

    /// Events of every stream of `table`, in global order
    fn read_by_table<'a>(&'a self, table: &'a str) -> LogFuture<'a, Vec<RecordedEvent>>;

    /// Events carrying `correlation_id`, in global order
    fn read_by_correlation<'a>(
        &'a self,
        correlation_id: &'a str,
    ) -> LogFuture<'a, Vec<RecordedEvent>>;

    fn read_by_event_type(&self, event_type: EventType) -> LogFuture<'_, Vec<RecordedEvent>>;

    /// Up to `limit` events starting at global position `from`
    fn read_all(&self, from: u64, limit: usize) -> LogFuture<'_, Vec<RecordedEvent>>;

    /// Release the connection; later calls fail with `Closed`
    fn close(&self) -> LogFuture<'_, ()>;
}

/// Group events by transaction.
///
/// Snapshot events and events without a correlation id come from the
/// initial bulk load, not a live transaction, and are left out.
pub fn transaction_groups(events: &[RecordedEvent]) -> BTreeMap<&str, Vec<&RecordedEvent>> {
    let mut groups: BTreeMap<&str, Vec<&RecordedEvent>> = BTreeMap::new();
    for event in events {
        if !event.event_type.has_transaction_grouping() || event.correlation_id().is_empty() {
            continue;
        }
        groups.entry(event.correlation_id()).or_default().push(event);
    }
    groups
}

/// Open the log named by the configured endpoint
pub fn connect(config: &EventLogConfig) -> Result<Arc<dyn EventLog>, EventLogError> {
    let endpoint = config
        .endpoint()
        .map_err(|e| EventLogError::InvalidEndpoint(e.to_string()))?;
    match endpoint {
        LogEndpoint::Memory => Ok(Arc::new(InMemoryEventLog::new())),
        LogEndpoint::File(dir) => Ok(Arc::new(FileEventLog::open(&dir, config)?)),
    }
}
