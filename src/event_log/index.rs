//! In-process log index
//!
//! Holds every recorded event in global order plus secondary indexes by
//! stream, table, correlation id and event type. Appends go through two
//! steps so durable backends can persist between them:
//!
//! 1. `prepare` checks the expected version and assigns ids and positions
//!    without touching the index
//! 2. `apply` makes the prepared events visible
//!
//! `FileEventLog` rebuilds the index on open by replaying segments through
//! `apply`.

use super::{AppendResult, EventLogError, ExpectedVersion, RecordedEvent};
use crate::cdc::{AppendableEvent, EventType, StreamId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct LogIndex {
    /// All events; index == global position
    events: Vec<RecordedEvent>,
    streams: HashMap<StreamId, Vec<usize>>,
    tables: HashMap<String, Vec<usize>>,
    correlations: HashMap<String, Vec<usize>>,
    event_types: HashMap<EventType, Vec<usize>>,
}

impl LogIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events in the log
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Position of the stream's last event, `None` if the stream does not exist
    pub fn current_version(&self, stream: &StreamId) -> Option<u64> {
        self.streams
            .get(stream)
            .map(|positions| positions.len() as u64 - 1)
    }

    pub fn check_expected(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
    ) -> Result<(), EventLogError> {
        let current = self.current_version(stream);
        let ok = match expected {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current.is_none(),
            ExpectedVersion::Exact(v) => current == Some(v),
        };
        if ok {
            Ok(())
        } else {
            Err(EventLogError::WrongExpectedVersion {
                stream: stream.clone(),
                expected,
                current,
            })
        }
    }

    /// Turn a batch into recorded events without making them visible
    pub fn prepare(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<AppendableEvent>,
        recorded_at: DateTime<Utc>,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        if events.is_empty() {
            return Err(EventLogError::EmptyAppend(stream.clone()));
        }
        self.check_expected(stream, expected)?;

        let first_stream_position = self.current_version(stream).map_or(0, |v| v + 1);
        let first_global_position = self.events.len() as u64;

        Ok(events
            .into_iter()
            .enumerate()
            .map(|(i, event)| RecordedEvent {
                event_id: Uuid::new_v4(),
                stream_id: stream.clone(),
                stream_position: first_stream_position + i as u64,
                global_position: first_global_position + i as u64,
                event_type: event.event_type,
                payload: event.payload,
                metadata: event.metadata,
                recorded_at,
            })
            .collect())
    }

    /// Make prepared events visible
    pub fn apply(&mut self, batch: Vec<RecordedEvent>) -> AppendResult {
        debug_assert!(!batch.is_empty(), "Precondition: batch must not be empty");

        let first_global_position = self.events.len() as u64;
        let mut next_expected_version = 0;

        for event in batch {
            let slot = self.events.len();
            debug_assert_eq!(
                event.global_position, slot as u64,
                "Invariant: global positions are dense"
            );

            let stream = self.streams.entry(event.stream_id.clone()).or_default();
            debug_assert_eq!(
                event.stream_position,
                stream.len() as u64,
                "Invariant: stream positions are dense"
            );
            stream.push(slot);
            next_expected_version = event.stream_position;

            self.tables
                .entry(event.table().to_string())
                .or_default()
                .push(slot);
            if !event.correlation_id().is_empty() {
                self.correlations
                    .entry(event.correlation_id().to_string())
                    .or_default()
                    .push(slot);
            }
            self.event_types
                .entry(event.event_type)
                .or_default()
                .push(slot);

            self.events.push(event);
        }

        AppendResult {
            next_expected_version,
            first_global_position,
            last_global_position: self.events.len() as u64 - 1,
        }
    }

    fn collect(&self, slots: Option<&Vec<usize>>) -> Vec<RecordedEvent> {
        slots
            .map(|slots| slots.iter().map(|&i| self.events[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn read_stream(&self, stream: &StreamId) -> Vec<RecordedEvent> {
        self.collect(self.streams.get(stream))
    }

    pub fn read_by_table(&self, table: &str) -> Vec<RecordedEvent> {
        self.collect(self.tables.get(table))
    }

    pub fn read_by_correlation(&self, correlation_id: &str) -> Vec<RecordedEvent> {
        self.collect(self.correlations.get(correlation_id))
    }

    pub fn read_by_event_type(&self, event_type: EventType) -> Vec<RecordedEvent> {
        self.collect(self.event_types.get(&event_type))
    }

    pub fn read_all(&self, from: u64, limit: usize) -> Vec<RecordedEvent> {
        let start = (from as usize).min(self.events.len());
        self.events[start..].iter().take(limit).cloned().collect()
    }
}
