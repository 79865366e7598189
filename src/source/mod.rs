//! Message Source
//!
//! Where change envelopes come from. The bridge owns its source exclusively
//! and polls it one message at a time.
//!
//! Implementations:
//! - `InMemorySource`: fed through an `InMemorySourceHandle` (tests, DST)
//! - `KafkaSource`: consumer over `rskafka` (feature `kafka`)

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod offsets;

#[cfg(feature = "kafka")]
pub use kafka::KafkaSource;
pub use memory::{InMemorySource, InMemorySourceHandle, SimulatedSourceConfig};
pub use offsets::{CommittedOffsets, OffsetStore};

pub use crate::cdc::{ChangeEnvelope, SourcePosition};

use crate::config::{SourceConfig, SourceKind};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::warn;

/// Message source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot connect to message source: {0}")]
    Connect(String),
    #[error("poll failed: {0}")]
    Poll(String),
    #[error("commit of {position} failed: {reason}")]
    Commit {
        position: SourcePosition,
        reason: String,
    },
    #[error("offset store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("offset store is corrupt: {0}")]
    OffsetStore(String),
    #[error("message source is closed")]
    Closed,
}

pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

/// Connection to the change feed
pub trait MessageSource: Send {
    /// Wait up to `timeout` for the next message; `Ok(None)` when none arrived
    fn poll(&mut self, timeout: Duration) -> SourceFuture<'_, Option<ChangeEnvelope>>;

    /// Mark `position` as processed; the next session resumes after it
    fn commit<'a>(&'a mut self, position: &'a SourcePosition) -> SourceFuture<'a, ()>;

    /// Release the connection
    fn close(&mut self) -> SourceFuture<'_, ()>;
}

/// Open the configured source.
///
/// A `memory` source has no producer attached; use
/// `InMemorySource::new` directly to get a handle for feeding it.
pub async fn connect(config: &SourceConfig) -> Result<Box<dyn MessageSource>, SourceError> {
    match config.kind {
        SourceKind::Memory => {
            warn!("Memory source has no producer attached; it will only ever time out");
            let (source, _handle) = InMemorySource::new();
            Ok(Box::new(source))
        }
        #[cfg(feature = "kafka")]
        SourceKind::Kafka => Ok(Box::new(KafkaSource::connect(config).await?)),
        #[cfg(not(feature = "kafka"))]
        SourceKind::Kafka => Err(SourceError::Connect(
            "built without the `kafka` feature".to_string(),
        )),
    }
}
