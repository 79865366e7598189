//! Dead-letter destination for messages whose append could not succeed
//!
//! Each dead letter is logged at error level and, when a path is
//! configured, appended to a JSON-lines file.

use crate::cdc::{AppendableEvent, EventMetadata, EventType, SourcePosition, StreamId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub position: SourcePosition,
    pub stream: StreamId,
    pub event_type: EventType,
    /// Event payload as JSON text
    pub payload: String,
    pub metadata: EventMetadata,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        stream: &StreamId,
        event: &AppendableEvent,
        error: String,
        attempts: u32,
    ) -> Self {
        DeadLetter {
            position: event.metadata.idempotency_key(),
            stream: stream.clone(),
            event_type: event.event_type,
            payload: String::from_utf8_lossy(&event.payload).into_owned(),
            metadata: event.metadata.clone(),
            error,
            attempts,
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    path: Option<PathBuf>,
    written: u64,
}

impl DeadLetterQueue {
    pub fn new(path: Option<PathBuf>) -> Self {
        DeadLetterQueue { path, written: 0 }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn write(&mut self, letter: &DeadLetter) -> std::io::Result<()> {
        error!(
            stream = %letter.stream,
            topic = %letter.position.topic,
            partition = letter.position.partition,
            offset = letter.position.offset,
            attempts = letter.attempts,
            error = %letter.error,
            "Dead-lettering message"
        );

        if let Some(path) = &self.path {
            let mut line = serde_json::to_vec(letter)?;
            line.push(b'\n');
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(&line)?;
            file.sync_data()?;
        }

        self.written += 1;
        Ok(())
    }

    /// Read back every dead letter in a JSON-lines file
    pub fn read_all(path: &Path) -> std::io::Result<Vec<DeadLetter>> {
        let text = std::fs::read_to_string(path)?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(std::io::Error::from))
            .collect()
    }
}
