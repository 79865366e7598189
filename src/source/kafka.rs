//! Kafka message source
//!
//! Reads the configured topics and partitions with the pure-Rust `rskafka`
//! client. rskafka has no consumer-group coordination, so the group's
//! committed positions live in an `OffsetStore` file keyed by `group_id`
//! and are advanced only through `commit`.
//!
//! Partitions are fetched round-robin; one fetch may return a batch, which
//! is buffered and handed out one message per poll.

use super::{CommittedOffsets, MessageSource, OffsetStore, SourceError, SourceFuture};
use crate::cdc::{ChangeEnvelope, SourcePosition};
use crate::config::{OffsetReset, SourceConfig};
use bytes::Bytes;
use rskafka::client::partition::{OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::ClientBuilder;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

struct PartitionReader {
    topic: String,
    partition: i32,
    client: PartitionClient,
    /// Next offset to fetch (may run ahead of the committed offset)
    next_offset: i64,
}

pub struct KafkaSource {
    readers: Vec<PartitionReader>,
    cursor: usize,
    buffered: VecDeque<ChangeEnvelope>,
    offsets: CommittedOffsets,
    store: OffsetStore,
    fetch_max_bytes: i32,
    closed: bool,
}

impl KafkaSource {
    pub async fn connect(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = tokio::time::timeout(
            config.connect_timeout,
            ClientBuilder::new(config.brokers.clone()).build(),
        )
        .await
        .map_err(|_| SourceError::Connect("timed out connecting to brokers".to_string()))?
        .map_err(|e| SourceError::Connect(e.to_string()))?;

        let store = OffsetStore::new(&config.offset_dir, &config.group_id);
        let offsets = store.load()?;

        let mut readers = Vec::with_capacity(config.topics.len() * config.partitions.len());
        for topic in &config.topics {
            for &partition in &config.partitions {
                let partition_client = client
                    .partition_client(topic.as_str(), partition, UnknownTopicHandling::Error)
                    .await
                    .map_err(|e| {
                        SourceError::Connect(format!("{}/{}: {}", topic, partition, e))
                    })?;

                let next_offset = match offsets.next_offset(topic, partition) {
                    Some(offset) => offset,
                    None => {
                        let at = match config.offset_reset {
                            OffsetReset::Earliest => OffsetAt::Earliest,
                            OffsetReset::Latest => OffsetAt::Latest,
                        };
                        partition_client.get_offset(at).await.map_err(|e| {
                            SourceError::Connect(format!("{}/{}: {}", topic, partition, e))
                        })?
                    }
                };

                info!(topic = %topic, partition, offset = next_offset, "Partition assigned");
                readers.push(PartitionReader {
                    topic: topic.clone(),
                    partition,
                    client: partition_client,
                    next_offset,
                });
            }
        }

        info!(
            brokers = ?config.brokers,
            group_id = %config.group_id,
            partitions = readers.len(),
            "Connected to Kafka"
        );

        Ok(KafkaSource {
            readers,
            cursor: 0,
            buffered: VecDeque::new(),
            offsets,
            store,
            fetch_max_bytes: config.fetch_max_bytes.max(2),
            closed: false,
        })
    }

    async fn fetch(&mut self, timeout: Duration) -> Result<(), SourceError> {
        if self.readers.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(());
        }

        let per_partition_ms = (timeout.as_millis() as usize / self.readers.len()).max(1);
        let max_wait_ms = i32::try_from(per_partition_ms).unwrap_or(i32::MAX);

        for _ in 0..self.readers.len() {
            let idx = self.cursor;
            self.cursor = (self.cursor + 1) % self.readers.len();
            let reader = &mut self.readers[idx];

            let (records, high_watermark) = reader
                .client
                .fetch_records(reader.next_offset, 1..self.fetch_max_bytes, max_wait_ms)
                .await
                .map_err(|e| {
                    SourceError::Poll(format!("{}/{}: {}", reader.topic, reader.partition, e))
                })?;

            let start = reader.next_offset;
            for record_and_offset in records {
                // Compressed batches may start before the requested offset
                if record_and_offset.offset < start {
                    continue;
                }
                let record = record_and_offset.record;
                reader.next_offset = record_and_offset.offset + 1;
                self.buffered.push_back(ChangeEnvelope::new(
                    reader.topic.clone(),
                    reader.partition,
                    record_and_offset.offset,
                    record.timestamp,
                    record.key.map(Bytes::from),
                    record.value.map(Bytes::from),
                ));
            }

            if !self.buffered.is_empty() {
                debug!(
                    topic = %reader.topic,
                    partition = reader.partition,
                    fetched = self.buffered.len(),
                    high_watermark,
                    "Fetched records"
                );
                return Ok(());
            }
        }
        Ok(())
    }
}

impl MessageSource for KafkaSource {
    fn poll(&mut self, timeout: Duration) -> SourceFuture<'_, Option<ChangeEnvelope>> {
        Box::pin(async move {
            if self.closed {
                return Err(SourceError::Closed);
            }
            if self.buffered.is_empty() {
                self.fetch(timeout).await?;
            }
            Ok(self.buffered.pop_front())
        })
    }

    fn commit<'a>(&'a mut self, position: &'a SourcePosition) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            if self.closed {
                return Err(SourceError::Closed);
            }
            self.offsets.commit(position);
            self.store
                .save(&self.offsets)
                .map_err(|e| SourceError::Commit {
                    position: position.clone(),
                    reason: e.to_string(),
                })
        })
    }

    fn close(&mut self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            self.buffered.clear();
            self.readers.clear();
            info!(offsets = %self.store.path().display(), "Kafka source closed");
            Ok(())
        })
    }
}
