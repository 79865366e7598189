//! Simulated Event Log with Fault Injection
//!
//! DST-compatible wrapper that injects faults using buggify.
//! Follows FoundationDB patterns for deterministic simulation testing.
//!
//! Faults:
//! - append failure / timeout: nothing is persisted
//! - lost acknowledgement: the batch IS persisted but the caller sees an
//!   error, so a retry produces a duplicate
//! - read failure

use crate::buggify::faults::event_log as faults;
use crate::cdc::{AppendableEvent, EventType, StreamId};
use crate::event_log::{AppendResult, EventLog, EventLogError, ExpectedVersion, LogFuture, RecordedEvent};
use crate::io::Rng;
use parking_lot::Mutex;
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedLogConfig {
    /// Probability of append failing before persisting
    pub append_fail_prob: f64,
    /// Probability of append timing out before persisting
    pub append_timeout_prob: f64,
    /// Probability of losing the acknowledgement of a persisted append
    pub ack_lost_prob: f64,
    /// Probability of any read failing
    pub read_fail_prob: f64,
}

impl Default for SimulatedLogConfig {
    fn default() -> Self {
        SimulatedLogConfig {
            append_fail_prob: 0.02,     // 2%
            append_timeout_prob: 0.01,  // 1%
            ack_lost_prob: 0.005,       // 0.5%
            read_fail_prob: 0.01,       // 1%
        }
    }
}

impl SimulatedLogConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedLogConfig {
            append_fail_prob: 0.15,
            append_timeout_prob: 0.05,
            ack_lost_prob: 0.05,
            read_fail_prob: 0.05,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedLogConfig {
            append_fail_prob: 0.0,
            append_timeout_prob: 0.0,
            ack_lost_prob: 0.0,
            read_fail_prob: 0.0,
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedLogStats {
    pub append_attempts: u64,
    pub append_failures: u64,
    pub timeouts: u64,
    pub acks_lost: u64,
    pub read_attempts: u64,
    pub read_failures: u64,
}

struct SimulatedLogInner<R: Rng> {
    rng: R,
    stats: SimulatedLogStats,
}

/// Wraps another log and injects faults
pub struct SimulatedEventLog<L: EventLog, R: Rng> {
    inner_log: L,
    config: SimulatedLogConfig,
    state: Arc<Mutex<SimulatedLogInner<R>>>,
}

impl<L: EventLog, R: Rng> SimulatedEventLog<L, R> {
    pub fn new(inner_log: L, rng: R, config: SimulatedLogConfig) -> Self {
        SimulatedEventLog {
            inner_log,
            config,
            state: Arc::new(Mutex::new(SimulatedLogInner {
                rng,
                stats: SimulatedLogStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedLogStats {
        self.state.lock().stats.clone()
    }

    pub fn inner_log(&self) -> &L {
        &self.inner_log
    }

    fn check_read(&self) -> Result<(), EventLogError> {
        let mut s = self.state.lock();
        s.stats.read_attempts += 1;
        if crate::buggify!(&mut s.rng, faults::READ_FAIL, self.config.read_fail_prob) {
            s.stats.read_failures += 1;
            return Err(EventLogError::Unavailable("simulated read failure".to_string()));
        }
        Ok(())
    }
}

impl<L: EventLog, R: Rng + 'static> EventLog for SimulatedEventLog<L, R> {
    fn append<'a>(
        &'a self,
        stream: &'a StreamId,
        expected: ExpectedVersion,
        events: Vec<AppendableEvent>,
    ) -> LogFuture<'a, AppendResult> {
        Box::pin(async move {
            // Draw every decision up front; the lock is not held across awaits
            let (timeout, fail, ack_lost) = {
                let mut s = self.state.lock();
                s.stats.append_attempts += 1;
                let timeout = crate::buggify!(
                    &mut s.rng,
                    faults::APPEND_TIMEOUT,
                    self.config.append_timeout_prob
                );
                let fail =
                    crate::buggify!(&mut s.rng, faults::APPEND_FAIL, self.config.append_fail_prob);
                let ack_lost =
                    crate::buggify!(&mut s.rng, faults::ACK_LOST, self.config.ack_lost_prob);
                (timeout, fail, ack_lost)
            };

            if timeout {
                self.state.lock().stats.timeouts += 1;
                return Err(EventLogError::Timeout);
            }
            if fail {
                self.state.lock().stats.append_failures += 1;
                return Err(EventLogError::Unavailable(
                    "simulated append failure".to_string(),
                ));
            }

            let result = self.inner_log.append(stream, expected, events).await?;

            if ack_lost {
                self.state.lock().stats.acks_lost += 1;
                return Err(EventLogError::Timeout);
            }
            Ok(result)
        })
    }

    fn read_stream<'a>(&'a self, stream: &'a StreamId) -> LogFuture<'a, Vec<RecordedEvent>> {
        Box::pin(async move {
            self.check_read()?;
            self.inner_log.read_stream(stream).await
        })
    }

    fn read_by_table<'a>(&'a self, table: &'a str) -> LogFuture<'a, Vec<RecordedEvent>> {
        Box::pin(async move {
            self.check_read()?;
            self.inner_log.read_by_table(table).await
        })
    }

    fn read_by_correlation<'a>(
        &'a self,
        correlation_id: &'a str,
    ) -> LogFuture<'a, Vec<RecordedEvent>> {
        Box::pin(async move {
            self.check_read()?;
            self.inner_log.read_by_correlation(correlation_id).await
        })
    }

    fn read_by_event_type(&self, event_type: EventType) -> LogFuture<'_, Vec<RecordedEvent>> {
        Box::pin(async move {
            self.check_read()?;
            self.inner_log.read_by_event_type(event_type).await
        })
    }

    fn read_all(&self, from: u64, limit: usize) -> LogFuture<'_, Vec<RecordedEvent>> {
        Box::pin(async move {
            self.check_read()?;
            self.inner_log.read_all(from, limit).await
        })
    }

    fn close(&self) -> LogFuture<'_, ()> {
        self.inner_log.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::EventMetadata;
    use crate::event_log::InMemoryEventLog;
    use crate::io::SimulatedRng;
    use bytes::Bytes;

    fn event(offset: i64) -> AppendableEvent {
        AppendableEvent::new(
            EventType::Insert,
            Bytes::from_static(b"{}"),
            EventMetadata {
                offset,
                timestamp: "2024-08-21T12:00:00+00:00".to_string(),
                correlation_id: "tx".to_string(),
                topic: "t".to_string(),
                partition: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_no_faults_passthrough() {
        let inner = InMemoryEventLog::new();
        let log = SimulatedEventLog::new(inner.clone(), SimulatedRng::new(1), SimulatedLogConfig::no_faults());
        let stream = StreamId::new("customers", "1");

        for i in 0..50 {
            log.append(&stream, ExpectedVersion::Any, vec![event(i)]).await.unwrap();
        }
        assert_eq!(inner.len(), 50);
        assert_eq!(log.read_stream(&stream).await.unwrap().len(), 50);

        let stats = log.stats();
        assert_eq!(stats.append_attempts, 50);
        assert_eq!(stats.append_failures + stats.timeouts + stats.acks_lost, 0);
    }

    #[tokio::test]
    async fn test_lost_ack_persists() {
        let inner = InMemoryEventLog::new();
        let config = SimulatedLogConfig {
            ack_lost_prob: 1.0,
            ..SimulatedLogConfig::no_faults()
        };
        let log = SimulatedEventLog::new(inner.clone(), SimulatedRng::new(7), config);
        let stream = StreamId::new("customers", "1");

        assert!(matches!(
            log.append(&stream, ExpectedVersion::Any, vec![event(0)]).await,
            Err(EventLogError::Timeout)
        ));
        assert_eq!(inner.len(), 1);
        assert_eq!(log.stats().acks_lost, 1);
    }

    #[tokio::test]
    async fn test_failures_persist_nothing() {
        let inner = InMemoryEventLog::new();
        let config = SimulatedLogConfig {
            append_fail_prob: 1.0,
            ..SimulatedLogConfig::no_faults()
        };
        let log = SimulatedEventLog::new(inner.clone(), SimulatedRng::new(7), config);
        let stream = StreamId::new("customers", "1");

        for i in 0..10 {
            let err = log.append(&stream, ExpectedVersion::Any, vec![event(i)]).await.unwrap_err();
            assert!(err.is_retryable());
        }
        assert!(inner.is_empty());
        assert_eq!(log.stats().append_failures, 10);
    }

    #[tokio::test]
    async fn test_deterministic_faults() {
        async fn run(seed: u64) -> (SimulatedLogStats, usize) {
            let inner = InMemoryEventLog::new();
            let log = SimulatedEventLog::new(inner.clone(), SimulatedRng::new(seed), SimulatedLogConfig::high_chaos());
            let stream = StreamId::new("customers", "1");
            for i in 0..200 {
                let _ = log.append(&stream, ExpectedVersion::Any, vec![event(i)]).await;
            }
            (log.stats(), inner.len())
        }

        let (a, len_a) = run(42).await;
        let (b, len_b) = run(42).await;
        assert_eq!(len_a, len_b);
        assert_eq!(a.append_failures, b.append_failures);
        assert_eq!(a.acks_lost, b.acks_lost);
        assert!(a.append_failures > 0, "high chaos should inject failures");
    }
}
