//! In-memory event log (`memory://`)

use super::{AppendResult, EventLog, EventLogError, ExpectedVersion, LogFuture, LogIndex, RecordedEvent};
use crate::cdc::{AppendableEvent, EventType, StreamId};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-memory log. Clones share the same events but each clone is its own
/// connection: closing one leaves the others usable.
#[derive(Debug)]
pub struct InMemoryEventLog {
    index: Arc<RwLock<LogIndex>>,
    closed: AtomicBool,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        InMemoryEventLog {
            index: Arc::new(RwLock::new(LogIndex::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Total number of events
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), EventLogError> {
        if self.is_closed() {
            Err(EventLogError::Closed)
        } else {
            Ok(())
        }
    }

    fn read_with<F>(&self, f: F) -> Result<Vec<RecordedEvent>, EventLogError>
    where
        F: FnOnce(&LogIndex) -> Vec<RecordedEvent>,
    {
        self.ensure_open()?;
        Ok(f(&*self.index.read()))
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for InMemoryEventLog {
    fn clone(&self) -> Self {
        InMemoryEventLog {
            index: self.index.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

impl EventLog for InMemoryEventLog {
    fn append<'a>(
        &'a self,
        stream: &'a StreamId,
        expected: ExpectedVersion,
        events: Vec<AppendableEvent>,
    ) -> LogFuture<'a, AppendResult> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut index = self.index.write();
            let batch = index.prepare(stream, expected, events, Utc::now())?;
            Ok(index.apply(batch))
        })
    }

    fn read_stream<'a>(&'a self, stream: &'a StreamId) -> LogFuture<'a, Vec<RecordedEvent>> {
        Box::pin(async move { self.read_with(|index| index.read_stream(stream)) })
    }

    fn read_by_table<'a>(&'a self, table: &'a str) -> LogFuture<'a, Vec<RecordedEvent>> {
        Box::pin(async move { self.read_with(|index| index.read_by_table(table)) })
    }

    fn read_by_correlation<'a>(
        &'a self,
        correlation_id: &'a str,
    ) -> LogFuture<'a, Vec<RecordedEvent>> {
        Box::pin(async move { self.read_with(|index| index.read_by_correlation(correlation_id)) })
    }

    fn read_by_event_type(&self, event_type: EventType) -> LogFuture<'_, Vec<RecordedEvent>> {
        Box::pin(async move { self.read_with(|index| index.read_by_event_type(event_type)) })
    }

    fn read_all(&self, from: u64, limit: usize) -> LogFuture<'_, Vec<RecordedEvent>> {
        Box::pin(async move { self.read_with(|index| index.read_all(from, limit)) })
    }

    fn close(&self) -> LogFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }
}
