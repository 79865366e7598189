//! File-backed event log (`file://<dir>`)
//!
//! Every append batch is written as one checksummed segment entry and made
//! visible only after the write (and fsync, when enabled) succeeded. The
//! in-memory index is rebuilt from the segments on open.
//!
//! A fresh segment is started on every open. A failed write is cut back
//! off the segment; if that fails too the next write starts a new segment.
//! Either way a rewrite of the same global position can follow the failed
//! entry, and replay keeps the later one.

use super::segment::{list_segments, SegmentEntry, SegmentError, SegmentReader, SegmentWriter, SEGMENT_HEADER_SIZE};
use super::{AppendResult, EventLog, EventLogError, ExpectedVersion, LogFuture, LogIndex, RecordedEvent};
use crate::cdc::{AppendableEvent, EventType, StreamId};
use crate::config::EventLogConfig;
use chrono::Utc;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

struct FileLogState {
    index: LogIndex,
    writer: Option<SegmentWriter>,
    next_sequence: u64,
    closed: bool,
}

pub struct FileEventLog {
    dir: PathBuf,
    segment_max_bytes: u64,
    fsync: bool,
    state: RwLock<FileLogState>,
}

impl FileEventLog {
    /// Open (or create) the log in `dir` and replay its segments
    pub fn open(dir: &Path, config: &EventLogConfig) -> Result<Self, EventLogError> {
        std::fs::create_dir_all(dir)?;

        let mut index = LogIndex::new();
        let segments = list_segments(dir)?;
        let next_sequence = segments.last().map_or(1, |(sequence, _)| sequence + 1);

        for batch in replay_batches(&segments)? {
            index.apply(batch);
        }

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            events = index.len(),
            streams = index.stream_count(),
            "Opened file event log"
        );

        Ok(FileEventLog {
            dir: dir.to_path_buf(),
            segment_max_bytes: config.segment_max_bytes.max(SEGMENT_HEADER_SIZE as u64 + 1),
            fsync: config.fsync,
            state: RwLock::new(FileLogState {
                index,
                writer: None,
                next_sequence,
                closed: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Total number of events
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_sync(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<AppendableEvent>,
    ) -> Result<AppendResult, EventLogError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(EventLogError::Closed);
        }

        let batch = state.index.prepare(stream, expected, events, Utc::now())?;
        let entry = SegmentEntry::from_batch(&batch)?;

        let needs_new_segment = match &state.writer {
            None => true,
            Some(writer) => writer.size() >= self.segment_max_bytes,
        };
        if needs_new_segment {
            let sequence = state.next_sequence;
            state.writer = None;
            state.writer = Some(SegmentWriter::create(&self.dir, sequence)?);
            state.next_sequence = sequence + 1;
            debug!(sequence, "Started new segment");
        }

        let fsync = self.fsync;
        let Some(writer) = state.writer.as_mut() else {
            return Err(EventLogError::Closed);
        };
        let mark = writer.mark();
        let written = writer.append_entry(&entry).and_then(|()| {
            if fsync {
                writer.sync()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(truncate_err) = writer.truncate_to(mark) {
                warn!(sequence = writer.sequence(), error = %truncate_err, "Cannot roll back failed write, starting a new segment");
                state.writer = None;
            }
            return Err(e.into());
        }

        Ok(state.index.apply(batch))
    }

    fn read_with<F>(&self, f: F) -> Result<Vec<RecordedEvent>, EventLogError>
    where
        F: FnOnce(&LogIndex) -> Vec<RecordedEvent>,
    {
        let state = self.state.read();
        if state.closed {
            return Err(EventLogError::Closed);
        }
        Ok(f(&state.index))
    }
}

/// Decoded batches of every segment, in global order.
///
/// An entry whose first global position is at or below one already seen is
/// a rewrite after a failed, unacknowledged write: it replaces the earlier
/// entries from that position on. A gap is corruption.
fn replay_batches(segments: &[(u64, PathBuf)]) -> Result<Vec<Vec<RecordedEvent>>, EventLogError> {
    let mut batches: Vec<Vec<RecordedEvent>> = Vec::new();
    let mut next_position = 0u64;

    for (sequence, path) in segments {
        let reader = match SegmentReader::open(path) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(segment = %path.display(), error = %e, "Skipping unreadable segment");
                continue;
            }
        };
        for entry in reader.entries() {
            let first = entry.first_global_position;
            if first > next_position {
                return Err(SegmentError::Corruption(format!(
                    "segment {} entry starts at global position {}, expected {}",
                    sequence, first, next_position
                ))
                .into());
            }
            if first < next_position {
                let kept = batches.partition_point(|batch| {
                    batch.first().is_some_and(|event| event.global_position < first)
                });
                let kept_end = batches[..kept]
                    .last()
                    .and_then(|batch| batch.last())
                    .map_or(0, |event| event.global_position + 1);
                if kept_end != first {
                    return Err(SegmentError::Corruption(format!(
                        "segment {} entry at global position {} overlaps an earlier entry",
                        sequence, first
                    ))
                    .into());
                }
                warn!(
                    segment = sequence,
                    global_position = first,
                    replaced = batches.len() - kept,
                    "Entry rewritten after a failed write, keeping the later one"
                );
                batches.truncate(kept);
            }

            let batch = entry.to_batch()?;
            next_position = first + batch.len() as u64;
            batches.push(batch);
        }
    }

    Ok(batches)
}

impl EventLog for FileEventLog {
    fn append<'a>(
        &'a self,
        stream: &'a StreamId,
        expected: ExpectedVersion,
        events: Vec<AppendableEvent>,
    ) -> LogFuture<'a, AppendResult> {
        Box::pin(async move { self.append_sync(stream, expected, events) })
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
            let mut state = self.state.write();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            if let Some(mut writer) = state.writer.take() {
                writer.sync()?;
            }
            info!(dir = %self.dir.display(), events = state.index.len(), "Closed file event log");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::EventMetadata;
    use bytes::Bytes;

    fn event(offset: i64) -> AppendableEvent {
        AppendableEvent::new(
            EventType::Insert,
            Bytes::from(format!("{{\"key\":{{\"payload\":{{\"id\":{}}}}}}}", offset)),
            EventMetadata {
                offset,
                timestamp: "2024-08-21T12:00:00+00:00".to_string(),
                correlation_id: format!("gtid:{}", offset),
                topic: "dbserver1.inventory.customers".to_string(),
                partition: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::open(dir.path(), &EventLogConfig::file(dir.path())).unwrap();
        let stream = StreamId::new("customers", "1");

        let result = log
            .append(&stream, ExpectedVersion::Any, vec![event(0), event(1)])
            .await
            .unwrap();
        assert_eq!(result.next_expected_version, 1);
        assert_eq!(log.read_stream(&stream).await.unwrap().len(), 2);
        assert_eq!(log.read_by_correlation("gtid:1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EventLogConfig::file(dir.path());
        config.segment_max_bytes = 64;
        config.fsync = false;

        let log = FileEventLog::open(dir.path(), &config).unwrap();
        for i in 0..4 {
            log.append(&StreamId::new("customers", &i.to_string()), ExpectedVersion::Any, vec![event(i)])
                .await
                .unwrap();
        }
        log.close().await.unwrap();

        assert_eq!(list_segments(dir.path()).unwrap().len(), 4);

        let reopened = FileEventLog::open(dir.path(), &config).unwrap();
        assert_eq!(reopened.len(), 4);
        assert_eq!(reopened.read_by_table("customers").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_closed_log_rejects_calls() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::open(dir.path(), &EventLogConfig::file(dir.path())).unwrap();
        log.close().await.unwrap();
        log.close().await.unwrap();

        let stream = StreamId::new("customers", "1");
        assert!(matches!(
            log.append(&stream, ExpectedVersion::Any, vec![event(0)]).await,
            Err(EventLogError::Closed)
        ));
        assert!(matches!(log.read_all(0, 1).await, Err(EventLogError::Closed)));
    }
}
