//! Deterministic Simulation Testing for the Bridge
//!
//! Drives a real `Bridge` with a seeded workload through an in-memory
//! source and a fault-injecting event log, then checks delivery invariants
//! against what was sent.
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = BridgeDSTHarness::new(BridgeDSTConfig::moderate(seed));
//!     harness.run().await;
//!     harness.check_invariants().await;   // violations carry the seed
//! }
//! ```
//!
//! Invariants:
//! - every valid message is persisted at least once or dead-lettered
//! - events within a stream keep source order
//! - skipped messages (malformed, unknown table, tombstone) are never persisted
//! - the committed position of each topic is its last offset + 1
//! - a by-transaction read returns only events of that transaction

use crate::bridge::{Bridge, BridgeOptions, BridgeStats, DeadLetterQueue, RetryPolicy, Step};
use crate::buggify::{self, BuggifyStats};
use crate::cdc::{PrimaryKeyMap, SourcePosition, StreamAddressor};
use crate::config::CommitMode;
use crate::event_log::{EventLog, InMemoryEventLog, RecordedEvent, SimulatedEventLog, SimulatedLogConfig, SimulatedLogStats};
use crate::io::{Rng, SimulatedRng};
use crate::source::{InMemorySource, InMemorySourceHandle, SimulatedSourceConfig};
use bytes::Bytes;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tables the workload writes to, with their primary-key field
const TABLES: [(&str, &str); 3] = [
    ("customers", "id"),
    ("orders", "id"),
    ("products_on_hand", "product_id"),
];
const UNKNOWN_TABLE: &str = "audit_log";
const DATABASE: &str = "inventory";
const SERVER_UUID: &str = "3E11FA47-71CA-11E1-9E33-C80AA9429562";

pub fn topic_for(table: &str) -> String {
    format!("dbserver1.{}.{}", DATABASE, table)
}

/// Configuration for bridge DST
#[derive(Debug, Clone)]
pub struct BridgeDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub log_config: SimulatedLogConfig,
    pub source_config: SimulatedSourceConfig,
    pub retry: RetryPolicy,
    /// Messages sent per run
    pub messages: usize,
    pub snapshot_prob: f64,
    pub malformed_prob: f64,
    pub unknown_table_prob: f64,
    pub tombstone_prob: f64,
    /// Rows touched by one transaction, at most
    pub max_transaction_size: u64,
    /// Distinct primary keys per table
    pub key_space: u64,
}

impl Default for BridgeDSTConfig {
    fn default() -> Self {
        BridgeDSTConfig {
            seed: 0,
            log_config: SimulatedLogConfig::default(),
            source_config: SimulatedSourceConfig::default(),
            retry: RetryPolicy::test(),
            messages: 200,
            snapshot_prob: 0.1,
            malformed_prob: 0.03,
            unknown_table_prob: 0.03,
            tombstone_prob: 0.05,
            max_transaction_size: 4,
            key_space: 20,
        }
    }
}

impl BridgeDSTConfig {
    pub fn new(seed: u64) -> Self {
        BridgeDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Calm mode - no fault injection
    pub fn calm(seed: u64) -> Self {
        BridgeDSTConfig {
            seed,
            log_config: SimulatedLogConfig::no_faults(),
            source_config: SimulatedSourceConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Moderate fault injection
    pub fn moderate(seed: u64) -> Self {
        Self::new(seed)
    }

    /// Chaos mode - aggressive fault injection
    pub fn chaos(seed: u64) -> Self {
        BridgeDSTConfig {
            seed,
            log_config: SimulatedLogConfig::high_chaos(),
            source_config: SimulatedSourceConfig {
                poll_error_prob: 0.1,
                spurious_empty_prob: 0.1,
            },
            ..Default::default()
        }
    }
}

/// One generated change message
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadMessage {
    /// Live change inside a transaction
    Change {
        table: &'static str,
        key: u64,
        op: &'static str,
        gtid: String,
    },
    /// Initial-load record without a transaction id
    Snapshot { table: &'static str, key: u64 },
    /// Value document that does not parse
    Malformed { table: &'static str },
    /// Table with no configured primary key
    UnknownTable { key: u64, gtid: String },
    Tombstone { table: &'static str, key: u64 },
}

impl WorkloadMessage {
    pub fn table(&self) -> &str {
        match self {
            WorkloadMessage::Change { table, .. }
            | WorkloadMessage::Snapshot { table, .. }
            | WorkloadMessage::Malformed { table }
            | WorkloadMessage::Tombstone { table, .. } => table,
            WorkloadMessage::UnknownTable { .. } => UNKNOWN_TABLE,
        }
    }

    /// Should end up in the log
    pub fn is_valid(&self) -> bool {
        matches!(
            self,
            WorkloadMessage::Change { .. } | WorkloadMessage::Snapshot { .. }
        )
    }

    pub fn gtid(&self) -> Option<&str> {
        match self {
            WorkloadMessage::Change { gtid, .. } => Some(gtid),
            _ => None,
        }
    }

    fn key_document(table: &str, key: u64) -> serde_json::Value {
        let field = TABLES
            .iter()
            .find(|(t, _)| *t == table)
            .map_or("id", |(_, f)| *f);
        json!({"payload": {field: key}})
    }

    fn value_document(table: &str, key: u64, op: &str, gtid: Option<&str>) -> serde_json::Value {
        json!({"payload": {
            "before": null,
            "after": {"id": key},
            "op": op,
            "source": {"table": table, "db": DATABASE, "gtid": gtid}
        }})
    }

    /// Raw key and value payloads as the feed would carry them
    pub fn payloads(&self) -> (Option<Bytes>, Option<Bytes>) {
        let encode = |v: serde_json::Value| Some(Bytes::from(v.to_string()));
        match self {
            WorkloadMessage::Change { table, key, op, gtid } => (
                encode(Self::key_document(table, *key)),
                encode(Self::value_document(table, *key, op, Some(gtid))),
            ),
            WorkloadMessage::Snapshot { table, key } => (
                encode(Self::key_document(table, *key)),
                encode(Self::value_document(table, *key, "r", None)),
            ),
            WorkloadMessage::Malformed { table } => (
                encode(Self::key_document(table, 0)),
                Some(Bytes::from_static(b"{\"payload\": {\"op\": \"c\", \"source\"")),
            ),
            WorkloadMessage::UnknownTable { key, gtid } => (
                encode(Self::key_document(UNKNOWN_TABLE, *key)),
                encode(Self::value_document(UNKNOWN_TABLE, *key, "c", Some(gtid))),
            ),
            WorkloadMessage::Tombstone { table, key } => {
                (encode(Self::key_document(table, *key)), None)
            }
        }
    }
}

/// Workload generator
pub struct BridgeWorkload {
    rng: SimulatedRng,
    config: BridgeDSTConfig,
    transaction: u64,
    remaining_in_transaction: u64,
}

impl BridgeWorkload {
    pub fn new(config: BridgeDSTConfig) -> Self {
        BridgeWorkload {
            rng: SimulatedRng::new(config.seed),
            config,
            transaction: 0,
            remaining_in_transaction: 0,
        }
    }

    fn pick_table(&mut self) -> &'static str {
        TABLES[self.rng.gen_range(0, TABLES.len() as u64) as usize].0
    }

    fn current_gtid(&mut self) -> String {
        if self.remaining_in_transaction == 0 {
            self.transaction += 1;
            self.remaining_in_transaction =
                self.rng.gen_range(1, self.config.max_transaction_size + 1);
        }
        self.remaining_in_transaction -= 1;
        format!("{}:{}", SERVER_UUID, self.transaction)
    }

    pub fn next_message(&mut self) -> WorkloadMessage {
        let roll = self.rng.next_u64() as f64 / u64::MAX as f64;
        let key = self.rng.gen_range(1, self.config.key_space + 1);
        let c = &self.config;

        let mut threshold = c.snapshot_prob;
        if roll < threshold {
            return WorkloadMessage::Snapshot {
                table: self.pick_table(),
                key,
            };
        }
        threshold += c.malformed_prob;
        if roll < threshold {
            return WorkloadMessage::Malformed {
                table: self.pick_table(),
            };
        }
        threshold += c.unknown_table_prob;
        if roll < threshold {
            return WorkloadMessage::UnknownTable {
                key,
                gtid: self.current_gtid(),
            };
        }
        threshold += c.tombstone_prob;
        if roll < threshold {
            return WorkloadMessage::Tombstone {
                table: self.pick_table(),
                key,
            };
        }

        let op = ["c", "u", "d"][self.rng.gen_range(0, 3) as usize];
        WorkloadMessage::Change {
            table: self.pick_table(),
            key,
            op,
            gtid: self.current_gtid(),
        }
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct BridgeDSTResult {
    pub seed: u64,
    pub messages_sent: u64,
    pub valid_messages: u64,
    pub steps: u64,
    pub persisted_events: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub bridge_stats: BridgeStats,
    pub log_stats: SimulatedLogStats,
    /// Fault checks and triggers seen during the run
    pub faults: BuggifyStats,
    pub invariant_violations: Vec<String>,
}

impl BridgeDSTResult {
    pub fn new(seed: u64) -> Self {
        BridgeDSTResult {
            seed,
            messages_sent: 0,
            valid_messages: 0,
            steps: 0,
            persisted_events: 0,
            duplicates: 0,
            dead_lettered: 0,
            bridge_stats: BridgeStats::default(),
            log_stats: SimulatedLogStats::default(),
            faults: BuggifyStats::new(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} sent ({} valid), {} persisted ({} duplicates), {} dead-lettered, {} retries, {} violations",
            self.seed,
            self.messages_sent,
            self.valid_messages,
            self.persisted_events,
            self.duplicates,
            self.dead_lettered,
            self.bridge_stats.append_retries,
            self.invariant_violations.len()
        )
    }

    /// `summary()` followed by the per-fault trigger counts
    pub fn detailed_summary(&self) -> String {
        format!("{}\n{}", self.summary(), self.faults.summary())
    }
}

type DSTLog = SimulatedEventLog<InMemoryEventLog, SimulatedRng>;

/// Main DST harness for the bridge
pub struct BridgeDSTHarness {
    config: BridgeDSTConfig,
    workload: BridgeWorkload,
    handle: InMemorySourceHandle,
    bridge: Bridge,
    simulated_log: Arc<DSTLog>,
    /// Independent connection for verification reads
    reader: InMemoryEventLog,
    sent: Vec<(SourcePosition, WorkloadMessage)>,
    dead_lettered: HashSet<SourcePosition>,
    result: BridgeDSTResult,
}

impl BridgeDSTHarness {
    pub fn new(config: BridgeDSTConfig) -> Self {
        let mut rng = SimulatedRng::new(config.seed.wrapping_add(1)); // Different seed from workload
        let inner_log = InMemoryEventLog::new();
        let reader = inner_log.clone();
        let simulated_log = Arc::new(SimulatedEventLog::new(
            inner_log,
            rng.fork(),
            config.log_config.clone(),
        ));

        let (source, handle) = InMemorySource::new();
        let source = source.with_faults(rng.fork(), config.source_config.clone());

        let primary_keys = TABLES
            .iter()
            .fold(PrimaryKeyMap::new(), |map, (table, field)| map.with(*table, *field));

        let options = BridgeOptions {
            poll_timeout: Duration::from_millis(5),
            commit_mode: CommitMode::AfterAppend,
            retry: config.retry.clone(),
        };

        let log: Arc<dyn EventLog> = simulated_log.clone();
        let bridge = Bridge::new(
            Box::new(source),
            log,
            StreamAddressor::new(primary_keys),
            options,
            DeadLetterQueue::default(),
        );

        BridgeDSTHarness {
            workload: BridgeWorkload::new(config.clone()),
            result: BridgeDSTResult::new(config.seed),
            config,
            handle,
            bridge,
            simulated_log,
            reader,
            sent: Vec::new(),
            dead_lettered: HashSet::new(),
        }
    }

    /// Send the whole workload and step the bridge until every message
    /// has been committed (or the step budget runs out)
    pub async fn run(&mut self) {
        // Buggify stats are thread-local; the harness runs on one thread
        buggify::reset_stats();
        for _ in 0..self.config.messages {
            let message = self.workload.next_message();
            let (key, value) = message.payloads();
            match self.handle.send_raw(&topic_for(message.table()), key, value) {
                Ok(position) => {
                    self.result.messages_sent += 1;
                    if message.is_valid() {
                        self.result.valid_messages += 1;
                    }
                    self.sent.push((position, message));
                }
                Err(e) => self
                    .result
                    .invariant_violations
                    .push(format!("send failed: {}", e)),
            }
        }

        let cancel = CancellationToken::new();
        let budget = self.config.messages as u64 * 20 + 100;
        while self.result.steps < budget && !self.all_committed() {
            self.result.steps += 1;
            match self.bridge.step(&cancel).await {
                Ok(Step::DeadLettered { position, .. }) => {
                    self.dead_lettered.insert(position);
                }
                Ok(_) => {}
                Err(e) => {
                    self.result
                        .invariant_violations
                        .push(format!("bridge failed: {}", e));
                    break;
                }
            }
        }

        self.bridge.shutdown().await;
        self.result.bridge_stats = self.bridge.stats().clone();
        self.result.log_stats = self.simulated_log.stats();
        self.result.faults = buggify::get_stats();
        self.result.dead_lettered = self.dead_lettered.len() as u64;
    }

    /// Last offset + 1 per topic
    fn expected_commits(&self) -> BTreeMap<String, i64> {
        let mut expected = BTreeMap::new();
        for (position, _) in &self.sent {
            let next = expected.entry(position.topic.clone()).or_insert(0);
            *next = (*next).max(position.offset + 1);
        }
        expected
    }

    fn all_committed(&self) -> bool {
        self.expected_commits()
            .iter()
            .all(|(topic, next)| self.handle.committed(topic, 0) == Some(*next))
    }

    pub async fn check_invariants(&mut self) {
        let events = match self.reader.read_all(0, usize::MAX).await {
            Ok(events) => events,
            Err(e) => {
                self.result
                    .invariant_violations
                    .push(format!("verification read failed: {}", e));
                return;
            }
        };
        self.result.persisted_events = events.len() as u64;

        let mut persisted: HashMap<SourcePosition, u64> = HashMap::new();
        for event in &events {
            *persisted.entry(event.metadata.idempotency_key()).or_insert(0) += 1;
        }
        self.result.duplicates = persisted.values().map(|n| n - 1).sum();

        let mut violations = Vec::new();

        // Delivery and skip invariants
        for (position, message) in &self.sent {
            let count = persisted.get(position).copied().unwrap_or(0);
            if message.is_valid() {
                if count == 0 && !self.dead_lettered.contains(position) {
                    violations.push(format!("{} lost: {:?}", position, message));
                }
            } else if count > 0 {
                violations.push(format!("{} should have been skipped: {:?}", position, message));
            }
        }

        // Per-stream source order
        let mut by_stream: BTreeMap<&str, Vec<&RecordedEvent>> = BTreeMap::new();
        for event in &events {
            by_stream.entry(event.stream_id.as_str()).or_default().push(event);
        }
        for (stream, stream_events) in &by_stream {
            for pair in stream_events.windows(2) {
                if pair[1].metadata.offset < pair[0].metadata.offset {
                    violations.push(format!(
                        "stream {} out of order: offset {} after {}",
                        stream, pair[1].metadata.offset, pair[0].metadata.offset
                    ));
                }
            }
        }

        // Committed positions
        for (topic, next) in self.expected_commits() {
            let committed = self.handle.committed(&topic, 0);
            if committed != Some(next) {
                violations.push(format!(
                    "topic {} committed {:?}, expected {}",
                    topic, committed, next
                ));
            }
        }

        // By-transaction view
        let gtids: HashSet<&str> = self.sent.iter().filter_map(|(_, m)| m.gtid()).collect();
        for gtid in gtids {
            let expected = events.iter().filter(|e| e.correlation_id() == gtid).count();
            match self.reader.read_by_correlation(gtid).await {
                Ok(view) => {
                    if view.iter().any(|e| e.correlation_id() != gtid) {
                        violations.push(format!("transaction view {} has foreign events", gtid));
                    }
                    if view.len() != expected {
                        violations.push(format!(
                            "transaction view {} has {} events, log has {}",
                            gtid,
                            view.len(),
                            expected
                        ));
                    }
                }
                Err(e) => violations.push(format!("transaction view {} failed: {}", gtid, e)),
            }
        }

        self.result.invariant_violations.extend(violations);
    }

    pub fn result(&self) -> &BridgeDSTResult {
        &self.result
    }

    pub fn into_result(self) -> BridgeDSTResult {
        self.result
    }
}

/// Run a batch of DST runs with consecutive seeds
pub async fn run_bridge_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> BridgeDSTConfig,
) -> Vec<BridgeDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let mut harness = BridgeDSTHarness::new(config_fn(base_seed + i as u64));
        harness.run().await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[BridgeDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let sent: u64 = results.iter().map(|r| r.messages_sent).sum();
    let persisted: u64 = results.iter().map(|r| r.persisted_events).sum();
    let dead: u64 = results.iter().map(|r| r.dead_lettered).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} sent, {} persisted, {} dead-lettered",
        passed, total, sent, persisted, dead
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}
