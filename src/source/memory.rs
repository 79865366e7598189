//! In-memory message source
//!
//! An unbounded channel stands in for the change feed. The producer side
//! (`InMemorySourceHandle`) assigns offsets per (topic, partition) and
//! observes what the consumer committed. Optional buggify faults make
//! polls fail or come back empty, driven by a seeded RNG.

use super::{CommittedOffsets, MessageSource, SourceError, SourceFuture};
use crate::buggify::faults::source as faults;
use crate::cdc::{ChangeEnvelope, SourcePosition};
use crate::io::SimulatedRng;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Fault probabilities for a simulated feed
#[derive(Debug, Clone)]
pub struct SimulatedSourceConfig {
    pub poll_error_prob: f64,
    pub spurious_empty_prob: f64,
}

impl Default for SimulatedSourceConfig {
    fn default() -> Self {
        SimulatedSourceConfig {
            poll_error_prob: 0.02,      // 2%
            spurious_empty_prob: 0.05,  // 5%
        }
    }
}

impl SimulatedSourceConfig {
    pub fn no_faults() -> Self {
        SimulatedSourceConfig {
            poll_error_prob: 0.0,
            spurious_empty_prob: 0.0,
        }
    }
}

enum Delivery {
    Message(ChangeEnvelope),
    Error(String),
}

#[derive(Default)]
struct SharedState {
    committed: CommittedOffsets,
    commits: Vec<SourcePosition>,
    next_offsets: HashMap<(String, i32), i64>,
    polled: u64,
    closed: bool,
}

/// Consumer side, owned by the bridge
pub struct InMemorySource {
    rx: mpsc::UnboundedReceiver<Delivery>,
    shared: Arc<Mutex<SharedState>>,
    faults: Option<(SimulatedRng, SimulatedSourceConfig)>,
}

/// Producer side
#[derive(Clone)]
pub struct InMemorySourceHandle {
    tx: mpsc::UnboundedSender<Delivery>,
    shared: Arc<Mutex<SharedState>>,
}

impl InMemorySource {
    pub fn new() -> (Self, InMemorySourceHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(SharedState::default()));
        (
            InMemorySource {
                rx,
                shared: shared.clone(),
                faults: None,
            },
            InMemorySourceHandle { tx, shared },
        )
    }

    /// Inject poll faults drawn from `rng`
    pub fn with_faults(mut self, rng: SimulatedRng, config: SimulatedSourceConfig) -> Self {
        self.faults = Some((rng, config));
        self
    }
}

impl MessageSource for InMemorySource {
    fn poll(&mut self, timeout: Duration) -> SourceFuture<'_, Option<ChangeEnvelope>> {
        Box::pin(async move {
            if self.shared.lock().closed {
                return Err(SourceError::Closed);
            }

            if let Some((rng, config)) = self.faults.as_mut() {
                if crate::buggify!(rng, faults::POLL_ERROR, config.poll_error_prob) {
                    return Err(SourceError::Poll("simulated poll error".to_string()));
                }
                if crate::buggify!(rng, faults::SPURIOUS_EMPTY, config.spurious_empty_prob) {
                    return Ok(None);
                }
            }

            match tokio::time::timeout(timeout, self.rx.recv()).await {
                Err(_elapsed) => Ok(None),
                Ok(Some(Delivery::Message(envelope))) => {
                    self.shared.lock().polled += 1;
                    Ok(Some(envelope))
                }
                Ok(Some(Delivery::Error(reason))) => Err(SourceError::Poll(reason)),
                Ok(None) => {
                    // Every producer is gone; behave like an idle feed
                    tokio::time::sleep(timeout).await;
                    Ok(None)
                }
            }
        })
    }

    fn commit<'a>(&'a mut self, position: &'a SourcePosition) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            let mut shared = self.shared.lock();
            if shared.closed {
                return Err(SourceError::Closed);
            }
            shared.committed.commit(position);
            shared.commits.push(position.clone());
            Ok(())
        })
    }

    fn close(&mut self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            self.rx.close();
            self.shared.lock().closed = true;
            Ok(())
        })
    }
}

impl InMemorySourceHandle {
    pub fn send(&self, envelope: ChangeEnvelope) -> Result<(), SourceError> {
        self.tx
            .send(Delivery::Message(envelope))
            .map_err(|_| SourceError::Closed)
    }

    /// Send raw key/value payloads on partition 0 of `topic`, assigning the
    /// next offset
    pub fn send_raw(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<SourcePosition, SourceError> {
        let offset = {
            let mut shared = self.shared.lock();
            let next = shared
                .next_offsets
                .entry((topic.to_string(), 0))
                .or_insert(0);
            let offset = *next;
            *next += 1;
            offset
        };
        let envelope = ChangeEnvelope::new(topic, 0, offset, Utc::now(), key, value);
        let position = envelope.position();
        self.send(envelope)?;
        Ok(position)
    }

    pub fn send_json(
        &self,
        topic: &str,
        key: Option<&Value>,
        value: Option<&Value>,
    ) -> Result<SourcePosition, SourceError> {
        self.send_raw(
            topic,
            key.map(|k| Bytes::from(k.to_string())),
            value.map(|v| Bytes::from(v.to_string())),
        )
    }

    /// Make the next poll fail
    pub fn send_error(&self, reason: &str) -> Result<(), SourceError> {
        self.tx
            .send(Delivery::Error(reason.to_string()))
            .map_err(|_| SourceError::Closed)
    }

    /// Close the feed from the producer side; later polls fail with `Closed`
    pub fn close(&self) {
        self.shared.lock().closed = true;
    }

    /// Next offset the consumer would resume from
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.shared.lock().committed.next_offset(topic, partition)
    }

    /// Every commit, in order
    pub fn commits(&self) -> Vec<SourcePosition> {
        self.shared.lock().commits.clone()
    }

    /// Messages handed to the consumer so far
    pub fn polled(&self) -> u64 {
        self.shared.lock().polled
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOPIC: &str = "dbserver1.inventory.customers";

    #[tokio::test]
    async fn test_offsets_assigned_in_order() {
        let (mut source, handle) = InMemorySource::new();
        for i in 0..3 {
            let position = handle
                .send_json(TOPIC, Some(&json!({"payload": {"id": i}})), Some(&json!({})))
                .unwrap();
            assert_eq!(position.offset, i);
        }

        for i in 0..3 {
            let envelope = source.poll(Duration::from_millis(10)).await.unwrap().unwrap();
            assert_eq!(envelope.offset, i);
            assert_eq!(envelope.topic, TOPIC);
        }
        assert!(source.poll(Duration::from_millis(10)).await.unwrap().is_none());
        assert_eq!(handle.polled(), 3);
    }

    #[tokio::test]
    async fn test_commit_visible_to_handle() {
        let (mut source, handle) = InMemorySource::new();
        let position = handle.send_json(TOPIC, None, None).unwrap();
        let envelope = source.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(envelope.is_tombstone());

        assert_eq!(handle.committed(TOPIC, 0), None);
        source.commit(&position).await.unwrap();
        assert_eq!(handle.committed(TOPIC, 0), Some(1));
        assert_eq!(handle.commits(), vec![position]);
    }

    #[tokio::test]
    async fn test_injected_error_then_message() {
        let (mut source, handle) = InMemorySource::new();
        handle.send_error("broker went away").unwrap();
        handle.send_json(TOPIC, Some(&json!({})), Some(&json!({}))).unwrap();

        assert!(matches!(
            source.poll(Duration::from_millis(10)).await,
            Err(SourceError::Poll(_))
        ));
        assert!(source.poll(Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close() {
        let (mut source, handle) = InMemorySource::new();
        source.close().await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            source.poll(Duration::from_millis(10)).await,
            Err(SourceError::Closed)
        ));
        assert!(handle.send_json(TOPIC, None, None).is_err());
    }

    #[tokio::test]
    async fn test_faults_do_not_lose_messages() {
        let (source, handle) = InMemorySource::new();
        let config = SimulatedSourceConfig {
            poll_error_prob: 0.3,
            spurious_empty_prob: 0.3,
        };
        let mut source = source.with_faults(SimulatedRng::new(9), config);
        for _ in 0..20 {
            handle.send_json(TOPIC, Some(&json!({})), Some(&json!({}))).unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..500 {
            if let Ok(Some(envelope)) = source.poll(Duration::from_millis(1)).await {
                received.push(envelope.offset);
            }
            if received.len() == 20 {
                break;
            }
        }
        assert_eq!(received, (0..20).collect::<Vec<_>>());
    }
}
