//! Bridge Loop
//!
//! Single sequential worker that moves change messages from the source into
//! the event log, one message at a time:
//!
//! ```text
//!            ┌──── timeout / poll error ────┐
//!            ▼                              │
//!  ──► WAITING ── message ──► PROCESSING ───┤ decode/lookup error (skip)
//!            ▲                    │         │
//!            │                    ▼         │
//!            └──── appended ── APPENDING ───┘ retries exhausted (dead letter)
//!
//!  any state ── cancel ──► STOPPED (connections released)
//! ```
//!
//! Cancellation is observed at the top of each iteration, while waiting on
//! the source, and during retry backoff. An append already in flight is
//! allowed to finish.
//!
//! A dead letter that cannot be written holds its partition: later messages
//! on it are still processed, but nothing on it is committed until the
//! dead letter has been written on a later iteration.

pub mod dead_letter;
pub mod retry;

pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use retry::RetryPolicy;

use crate::cdc::{self, AppendableEvent, DecodeError, LookupError, RecordError, StreamAddressor, StreamId};
use crate::config::{BridgeConfig, CommitMode, ConfigError};
use crate::event_log::{self, AppendResult, EventLog, EventLogError, ExpectedVersion};
use crate::source::{self, ChangeEnvelope, MessageSource, SourceError, SourcePosition};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Bridge loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Blocked on poll
    Waiting,
    /// Decode, classify, address, correlate
    Processing,
    /// Appending (including retries)
    Appending,
    /// Terminal
    Stopped,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Waiting => "WAITING",
            BridgeState::Processing => "PROCESSING",
            BridgeState::Appending => "APPENDING",
            BridgeState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Counters kept by the bridge loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub polls: u64,
    pub empty_polls: u64,
    pub poll_errors: u64,
    pub appended_events: u64,
    pub decode_skips: u64,
    pub lookup_skips: u64,
    pub tombstones: u64,
    pub append_retries: u64,
    pub dead_letters: u64,
    /// Dead letters that could not be written when first attempted
    pub unacknowledged: u64,
    pub commit_errors: u64,
    /// Messages dropped uncommitted by cancellation during backoff
    pub abandoned: u64,
}

impl BridgeStats {
    /// Messages taken off the source
    pub fn messages(&self) -> u64 {
        self.polls - self.empty_polls - self.poll_errors
    }
}

/// What to do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Log, commit past the message, continue
    Skip,
    /// Try again (append backoff, or simply the next poll/commit)
    Retry,
    /// Stop the bridge
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("append failed: {0}")]
    Append(#[source] EventLogError),
    #[error("poll failed: {0}")]
    Poll(#[source] SourceError),
    #[error("commit failed: {0}")]
    Commit(#[source] SourceError),
    #[error("dead-letter write failed: {0}")]
    DeadLetter(#[source] std::io::Error),
    #[error("cannot connect to message source: {0}")]
    SourceConnect(#[source] SourceError),
    #[error("cannot open event log: {0}")]
    LogConnect(#[source] EventLogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<RecordError> for BridgeError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::Decode(e) => BridgeError::Decode(e),
            RecordError::Lookup(e) => BridgeError::Lookup(e),
        }
    }
}

impl BridgeError {
    pub fn recovery(&self) -> Recovery {
        match self {
            BridgeError::Decode(_) | BridgeError::Lookup(_) => Recovery::Skip,
            BridgeError::Append(e) if e.is_retryable() => Recovery::Retry,
            BridgeError::Append(_) => Recovery::Skip,
            BridgeError::Poll(SourceError::Closed) => Recovery::Fatal,
            BridgeError::Poll(_) | BridgeError::Commit(_) => Recovery::Retry,
            // Rewritten on later steps; its partition is not committed meanwhile
            BridgeError::DeadLetter(_) => Recovery::Retry,
            BridgeError::SourceConnect(_) | BridgeError::LogConnect(_) | BridgeError::Config(_) => {
                Recovery::Fatal
            }
        }
    }
}

/// Result of one loop iteration
#[derive(Debug)]
pub enum Step {
    /// Poll timed out without a message
    Idle,
    /// Transient poll error, logged
    PollFailed,
    /// Null-value message, committed and ignored
    Tombstone(SourcePosition),
    /// Decode or lookup failure, committed and ignored
    Skipped {
        position: SourcePosition,
        error: BridgeError,
    },
    Appended {
        position: SourcePosition,
        stream: StreamId,
        result: AppendResult,
    },
    /// Append gave up; message written to the dead-letter queue
    DeadLettered {
        position: SourcePosition,
        stream: StreamId,
    },
    /// Append gave up and the dead letter could not be written yet; the
    /// partition is held uncommitted
    Unacknowledged {
        position: SourcePosition,
        error: BridgeError,
    },
    /// Cancellation observed
    Stopped,
}

/// Loop settings
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub poll_timeout: Duration,
    pub commit_mode: CommitMode,
    pub retry: RetryPolicy,
}

impl BridgeOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        BridgeOptions {
            poll_timeout: config.source.poll_timeout,
            commit_mode: config.source.commit_mode,
            retry: config.retry.clone(),
        }
    }

    pub fn test() -> Self {
        BridgeOptions {
            poll_timeout: Duration::from_millis(10),
            commit_mode: CommitMode::AfterAppend,
            retry: RetryPolicy::test(),
        }
    }
}

/// Commits withheld on one partition until its dead letters are written
#[derive(Debug)]
struct HeldPartition {
    letters: VecDeque<DeadLetter>,
    /// Highest position processed on the partition since the hold began
    last_processed: SourcePosition,
}

impl HeldPartition {
    fn advance(&mut self, position: &SourcePosition) {
        if position.offset > self.last_processed.offset {
            self.last_processed = position.clone();
        }
    }
}

type PartitionKey = (String, i32);

fn partition_key(position: &SourcePosition) -> PartitionKey {
    (position.topic.clone(), position.partition)
}

enum AppendOutcome {
    Appended(AppendResult),
    Exhausted { error: EventLogError, attempts: u32 },
    Cancelled,
}

/// Owns the source and log connections for their whole lifetime
pub struct Bridge {
    source: Box<dyn MessageSource>,
    log: Arc<dyn EventLog>,
    addressor: StreamAddressor,
    options: BridgeOptions,
    dead_letters: DeadLetterQueue,
    held: BTreeMap<PartitionKey, HeldPartition>,
    state: BridgeState,
    stats: BridgeStats,
}

impl Bridge {
    pub fn new(
        source: Box<dyn MessageSource>,
        log: Arc<dyn EventLog>,
        addressor: StreamAddressor,
        options: BridgeOptions,
        dead_letters: DeadLetterQueue,
    ) -> Self {
        Bridge {
            source,
            log,
            addressor,
            options,
            dead_letters,
            held: BTreeMap::new(),
            state: BridgeState::Waiting,
            stats: BridgeStats::default(),
        }
    }

    /// Open both connections. Any failure here is fatal.
    pub async fn connect(config: &BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let log = event_log::connect(&config.event_log).map_err(BridgeError::LogConnect)?;
        info!(endpoint = %config.event_log.endpoint, "Event log connected");

        let source = match source::connect(&config.source).await {
            Ok(source) => source,
            Err(e) => {
                if let Err(close_err) = log.close().await {
                    warn!(error = %close_err, "Failed to close event log");
                }
                return Err(BridgeError::SourceConnect(e));
            }
        };
        info!(topics = ?config.source.topics, commit_mode = ?config.source.commit_mode, "Message source connected");

        Ok(Bridge::new(
            source,
            log,
            StreamAddressor::new(config.primary_keys.clone()),
            BridgeOptions::from_config(config),
            DeadLetterQueue::new(config.dead_letter.path.clone()),
        ))
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Partitions whose commits wait on an unwritten dead letter
    pub fn held_partitions(&self) -> usize {
        self.held.len()
    }

    fn transition(&mut self, next: BridgeState) {
        if self.state != next {
            trace!(from = %self.state, to = %next, "Bridge state transition");
            self.state = next;
        }
    }

    /// Run until cancelled, then release both connections
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<BridgeStats, BridgeError> {
        info!(
            poll_timeout_ms = self.options.poll_timeout.as_millis() as u64,
            tables = self.addressor.primary_keys().len(),
            "Bridge started"
        );

        let outcome = loop {
            match self.step(&cancel).await {
                Ok(Step::Stopped) => break Ok(()),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Bridge stopping on fatal error");
                    break Err(e);
                }
            }
        };

        self.shutdown().await;
        outcome.map(|()| self.stats.clone())
    }

    /// Poll and fully process at most one message.
    ///
    /// Only fatal errors are returned as `Err`; everything else is handled
    /// here and reported through the returned `Step`.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<Step, BridgeError> {
        if cancel.is_cancelled() || self.state == BridgeState::Stopped {
            return Ok(Step::Stopped);
        }
        self.transition(BridgeState::Waiting);
        self.release_held().await;

        let timeout = self.options.poll_timeout;
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Step::Stopped),
            polled = self.source.poll(timeout) => polled,
        };
        self.stats.polls += 1;

        match polled {
            Ok(Some(envelope)) => self.process(envelope, cancel).await,
            Ok(None) => {
                self.stats.empty_polls += 1;
                Ok(Step::Idle)
            }
            Err(e) => {
                let err = BridgeError::Poll(e);
                if err.recovery() == Recovery::Fatal {
                    return Err(err);
                }
                self.stats.poll_errors += 1;
                warn!(error = %err, "Poll failed");
                Ok(Step::PollFailed)
            }
        }
    }

    async fn process(
        &mut self,
        envelope: ChangeEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Step, BridgeError> {
        let position = envelope.position();
        if self.options.commit_mode == CommitMode::Auto {
            self.commit(&position).await;
        }

        if envelope.is_tombstone() {
            self.stats.tombstones += 1;
            debug!(position = %position, "Ignoring tombstone");
            self.commit_processed(&position).await;
            return Ok(Step::Tombstone(position));
        }

        self.transition(BridgeState::Processing);
        let (stream, event) = match cdc::prepare(&envelope, &self.addressor) {
            Ok(prepared) => prepared,
            Err(e) => {
                let error = BridgeError::from(e);
                match error {
                    BridgeError::Lookup(_) => self.stats.lookup_skips += 1,
                    _ => self.stats.decode_skips += 1,
                }
                warn!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    error = %error,
                    "Skipping message"
                );
                self.commit_processed(&position).await;
                return Ok(Step::Skipped { position, error });
            }
        };

        self.transition(BridgeState::Appending);
        match self.append_with_retry(&stream, &event, cancel).await {
            AppendOutcome::Appended(result) => {
                self.stats.appended_events += 1;
                debug!(
                    stream = %stream,
                    event_type = %event.event_type,
                    correlation_id = %event.metadata.correlation_id,
                    offset = position.offset,
                    stream_position = result.next_expected_version,
                    "Appended event"
                );
                self.commit_processed(&position).await;
                Ok(Step::Appended {
                    position,
                    stream,
                    result,
                })
            }
            AppendOutcome::Exhausted { error, attempts } => {
                let letter = DeadLetter::new(&stream, &event, error.to_string(), attempts);
                match self.dead_letters.write(&letter) {
                    Ok(()) => {
                        self.stats.dead_letters += 1;
                        self.commit_processed(&position).await;
                        Ok(Step::DeadLettered { position, stream })
                    }
                    Err(e) => {
                        let error = BridgeError::DeadLetter(e);
                        self.stats.unacknowledged += 1;
                        if self.options.commit_mode == CommitMode::AfterAppend {
                            error!(position = %position, error = %error, "Dead letter not written, holding partition commits");
                            self.hold(&position, letter);
                        } else {
                            error!(position = %position, error = %error, "Dead letter not written, message already committed");
                        }
                        Ok(Step::Unacknowledged { position, error })
                    }
                }
            }
            AppendOutcome::Cancelled => {
                self.stats.abandoned += 1;
                info!(position = %position, "Cancelled during append backoff, message left uncommitted");
                Ok(Step::Stopped)
            }
        }
    }

    async fn append_with_retry(
        &mut self,
        stream: &StreamId,
        event: &AppendableEvent,
        cancel: &CancellationToken,
    ) -> AppendOutcome {
        let mut attempt = 1;
        loop {
            let appended = self
                .log
                .append(stream, ExpectedVersion::Any, vec![event.clone()])
                .await;

            let error = match appended {
                Ok(result) => return AppendOutcome::Appended(result),
                Err(e) => e,
            };
            if !error.is_retryable() || attempt >= self.options.retry.max_attempts {
                return AppendOutcome::Exhausted {
                    error,
                    attempts: attempt,
                };
            }

            let backoff = self.options.retry.backoff_for(attempt);
            self.stats.append_retries += 1;
            warn!(
                stream = %stream,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Append failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return AppendOutcome::Cancelled,
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    /// Commit after the message was dealt with (at-least-once mode only)
    async fn commit_processed(&mut self, position: &SourcePosition) {
        if self.options.commit_mode != CommitMode::AfterAppend {
            return;
        }
        if let Some(held) = self.held.get_mut(&partition_key(position)) {
            held.advance(position);
            trace!(position = %position, "Partition held, commit deferred");
            return;
        }
        self.commit(position).await;
    }

    fn hold(&mut self, position: &SourcePosition, letter: DeadLetter) {
        let held = self
            .held
            .entry(partition_key(position))
            .or_insert_with(|| HeldPartition {
                letters: VecDeque::new(),
                last_processed: position.clone(),
            });
        held.advance(position);
        held.letters.push_back(letter);
    }

    /// Write pending dead letters; commit each partition that has none left
    async fn release_held(&mut self) {
        let keys: Vec<PartitionKey> = self.held.keys().cloned().collect();
        for key in keys {
            let Some(mut held) = self.held.remove(&key) else {
                continue;
            };

            while let Some(letter) = held.letters.front() {
                match self.dead_letters.write(letter) {
                    Ok(()) => {
                        self.stats.dead_letters += 1;
                        held.letters.pop_front();
                    }
                    Err(e) => {
                        warn!(
                            position = %letter.position,
                            error = %BridgeError::DeadLetter(e),
                            "Dead letter still not written"
                        );
                        break;
                    }
                }
            }

            if held.letters.is_empty() {
                info!(position = %held.last_processed, "Dead letters written, releasing partition");
                self.commit(&held.last_processed).await;
            } else {
                self.held.insert(key, held);
            }
        }
    }

    async fn commit(&mut self, position: &SourcePosition) {
        if let Err(e) = self.source.commit(position).await {
            self.stats.commit_errors += 1;
            warn!(position = %position, error = %BridgeError::Commit(e), "Commit failed");
        }
    }

    /// Release both connections; the bridge cannot be used afterwards
    pub async fn shutdown(&mut self) {
        if self.state == BridgeState::Stopped {
            return;
        }
        self.transition(BridgeState::Stopped);

        for held in self.held.values() {
            warn!(
                position = %held.last_processed,
                pending = held.letters.len(),
                "Partition left uncommitted with unwritten dead letters"
            );
        }

        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close message source");
        }
        if let Err(e) = self.log.close().await {
            warn!(error = %e, "Failed to close event log");
        }
        info!(stats = ?self.stats, "Bridge stopped, connections released");
    }
}
