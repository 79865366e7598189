//! End-to-end bridge scenarios
//!
//! Each test feeds messages through an `InMemorySource`, steps the bridge,
//! and reads the result back through an independent log connection.

use cdc_bridge::bridge::{
    Bridge, BridgeError, BridgeOptions, BridgeState, DeadLetterQueue, RetryPolicy, Step,
};
use cdc_bridge::cdc::{
    AppendableEvent, EventMetadata, EventType, PrimaryKeyMap, SourcePosition, StreamAddressor, StreamId,
};
use cdc_bridge::config::CommitMode;
use cdc_bridge::event_log::{
    transaction_groups, AppendResult, EventLog, EventLogError, ExpectedVersion, InMemoryEventLog,
    LogFuture, RecordedEvent, SimulatedEventLog, SimulatedLogConfig,
};
use cdc_bridge::io::SimulatedRng;
use cdc_bridge::source::{InMemorySource, InMemorySourceHandle, SourceError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CUSTOMERS: &str = "dbserver1.inventory.customers";
const ORDERS: &str = "dbserver1.inventory.orders";

fn addressor() -> StreamAddressor {
    StreamAddressor::new(
        PrimaryKeyMap::new()
            .with("customers", "id")
            .with("orders", "id")
            .with("products_on_hand", "product_id"),
    )
}

fn key_doc(field: &str, id: i64) -> Value {
    json!({"schema": {"type": "struct"}, "payload": {field: id}})
}

fn value_doc(table: &str, op: &str, gtid: Value) -> Value {
    json!({"payload": {
        "before": null,
        "after": {"id": 1, "name": "row"},
        "op": op,
        "ts_ms": 1724241600000i64,
        "source": {"table": table, "db": "inventory", "gtid": gtid}
    }})
}

struct Fixture {
    bridge: Bridge,
    handle: InMemorySourceHandle,
    reader: InMemoryEventLog,
}

fn fixture(options: BridgeOptions) -> Fixture {
    let (source, handle) = InMemorySource::new();
    let log = InMemoryEventLog::new();
    let reader = log.clone();
    let bridge = Bridge::new(
        Box::new(source),
        Arc::new(log),
        addressor(),
        options,
        DeadLetterQueue::default(),
    );
    Fixture {
        bridge,
        handle,
        reader,
    }
}

async fn step(bridge: &mut Bridge) -> Step {
    bridge.step(&CancellationToken::new()).await.unwrap()
}

#[tokio::test]
async fn test_insert_lands_in_entity_stream() {
    let mut f = fixture(BridgeOptions::test());
    let sent = f
        .handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 7)),
            Some(&value_doc("customers", "c", json!("abc-1"))),
        )
        .unwrap();

    match step(&mut f.bridge).await {
        Step::Appended { position, stream, result } => {
            assert_eq!(position, sent);
            assert_eq!(stream.as_str(), "customers-7");
            assert_eq!(result.next_expected_version, 0);
        }
        other => panic!("expected append, got {:?}", other),
    }

    let events = f.reader.read_stream(&StreamId::from_raw("customers-7")).await.unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.event_type, EventType::Insert);
    assert_eq!(event.correlation_id(), "abc-1");
    assert_eq!(event.metadata.offset, sent.offset);
    assert_eq!(event.metadata.idempotency_key(), sent);

    let payload: Value = serde_json::from_slice(&event.payload).unwrap();
    assert_eq!(payload["key"]["payload"]["id"], 7);
    assert_eq!(payload["value"]["payload"]["op"], "c");
}

#[tokio::test]
async fn test_snapshot_excluded_from_transaction_groups() {
    let mut f = fixture(BridgeOptions::test());
    f.handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 1)),
            Some(&value_doc("customers", "r", Value::Null)),
        )
        .unwrap();
    f.handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 2)),
            Some(&value_doc("customers", "u", json!("tx-1"))),
        )
        .unwrap();

    for _ in 0..2 {
        assert!(matches!(step(&mut f.bridge).await, Step::Appended { .. }));
    }

    let snapshots = f.reader.read_by_event_type(EventType::Snapshot).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].correlation_id(), "");

    let all = f.reader.read_by_table("customers").await.unwrap();
    let groups = transaction_groups(&all);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups["tx-1"].len(), 1);
}

#[tokio::test]
async fn test_unknown_table_skipped_and_loop_continues() {
    let mut f = fixture(BridgeOptions::test());
    let unknown = f
        .handle
        .send_json(
            "dbserver1.inventory.unknown_table",
            Some(&key_doc("id", 1)),
            Some(&value_doc("unknown_table", "c", json!("tx-2"))),
        )
        .unwrap();
    f.handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 3)),
            Some(&value_doc("customers", "c", json!("tx-3"))),
        )
        .unwrap();

    match step(&mut f.bridge).await {
        Step::Skipped { position, .. } => assert_eq!(position, unknown),
        other => panic!("expected skip, got {:?}", other),
    }
    assert!(matches!(step(&mut f.bridge).await, Step::Appended { .. }));

    assert_eq!(f.bridge.stats().lookup_skips, 1);
    assert_eq!(f.bridge.stats().appended_events, 1);
    assert_eq!(f.reader.len(), 1);
    assert_eq!(
        f.handle.committed("dbserver1.inventory.unknown_table", 0),
        Some(1)
    );
    assert_ne!(f.bridge.state(), BridgeState::Stopped);
}

#[tokio::test]
async fn test_transaction_spanning_tables() {
    let mut f = fixture(BridgeOptions::test());
    f.handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 1)),
            Some(&value_doc("customers", "u", json!("tx-9"))),
        )
        .unwrap();
    f.handle
        .send_json(
            ORDERS,
            Some(&key_doc("id", 55)),
            Some(&value_doc("orders", "c", json!("tx-9"))),
        )
        .unwrap();

    for _ in 0..2 {
        assert!(matches!(step(&mut f.bridge).await, Step::Appended { .. }));
    }

    let tx = f.reader.read_by_correlation("tx-9").await.unwrap();
    let streams: Vec<&str> = tx.iter().map(|e| e.stream_id.as_str()).collect();
    assert_eq!(streams, vec!["customers-1", "orders-55"]);
    assert!(tx.iter().all(|e| e.correlation_id() == "tx-9"));
}

#[tokio::test]
async fn test_malformed_value_skipped() {
    let mut f = fixture(BridgeOptions::test());
    f.handle
        .send_raw(
            CUSTOMERS,
            Some(key_doc("id", 1).to_string().into()),
            Some(bytes::Bytes::from_static(b"{\"payload\":")),
        )
        .unwrap();
    f.handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 1)),
            Some(&json!({"payload": {"op": "c", "source": {"db": "inventory"}}})),
        )
        .unwrap();
    // Live change without a transaction id
    f.handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 1)),
            Some(&value_doc("customers", "u", Value::Null)),
        )
        .unwrap();
    // Value present, key absent
    f.handle
        .send_json(CUSTOMERS, None, Some(&value_doc("customers", "c", json!("tx-4"))))
        .unwrap();

    for _ in 0..4 {
        assert!(matches!(step(&mut f.bridge).await, Step::Skipped { .. }));
    }
    assert_eq!(f.bridge.stats().decode_skips, 4);
    assert!(f.reader.is_empty());
    assert_eq!(f.handle.committed(CUSTOMERS, 0), Some(4));
}

#[tokio::test]
async fn test_tombstone_committed_not_appended() {
    let mut f = fixture(BridgeOptions::test());
    let tombstone = f
        .handle
        .send_json(CUSTOMERS, Some(&key_doc("id", 9)), None)
        .unwrap();

    match step(&mut f.bridge).await {
        Step::Tombstone(position) => assert_eq!(position, tombstone),
        other => panic!("expected tombstone, got {:?}", other),
    }
    assert_eq!(f.bridge.stats().tombstones, 1);
    assert!(f.reader.is_empty());
    assert_eq!(f.handle.committed(CUSTOMERS, 0), Some(tombstone.offset + 1));
}

#[tokio::test]
async fn test_redelivery_duplicates_events() {
    let mut f = fixture(BridgeOptions::test());
    let value = value_doc("customers", "u", json!("tx-5"));
    for _ in 0..2 {
        f.handle
            .send_json(CUSTOMERS, Some(&key_doc("id", 4)), Some(&value))
            .unwrap();
    }

    step(&mut f.bridge).await;
    step(&mut f.bridge).await;

    let events = f.reader.read_stream(&StreamId::from_raw("customers-4")).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_ne!(events[0].event_id, events[1].event_id);
    assert_eq!(events[0].stream_position, 0);
    assert_eq!(events[1].stream_position, 1);
    assert_eq!(events[0].payload, events[1].payload);
}

#[tokio::test]
async fn test_append_read_round_trip() {
    let log = InMemoryEventLog::new();
    let stream = StreamId::new("orders", "10");
    let event = AppendableEvent::new(
        EventType::Update,
        bytes::Bytes::from_static(b"{\"key\":{},\"value\":{}}"),
        EventMetadata {
            offset: 99,
            timestamp: "2024-08-21T12:00:00+00:00".to_string(),
            correlation_id: "tx-7".to_string(),
            topic: ORDERS.to_string(),
            partition: 0,
        },
    );

    log.append(&stream, ExpectedVersion::Any, vec![event.clone()]).await.unwrap();
    let read = log.read_stream(&stream).await.unwrap();

    assert_eq!(read.len(), 1);
    assert_eq!(read[0].event_type, event.event_type);
    assert_eq!(read[0].payload, event.payload);
    assert_eq!(read[0].metadata, event.metadata);
}

#[tokio::test]
async fn test_append_exhaustion_dead_letters_and_commits() {
    let dir = tempfile::tempdir().unwrap();
    let dlq_path = dir.path().join("dead.jsonl");

    let (source, handle) = InMemorySource::new();
    let failing = SimulatedEventLog::new(
        InMemoryEventLog::new(),
        SimulatedRng::new(1),
        SimulatedLogConfig {
            append_fail_prob: 1.0,
            ..SimulatedLogConfig::no_faults()
        },
    );
    let mut bridge = Bridge::new(
        Box::new(source),
        Arc::new(failing),
        addressor(),
        BridgeOptions::test(),
        DeadLetterQueue::new(Some(dlq_path.clone())),
    );

    let sent = handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 8)),
            Some(&value_doc("customers", "d", json!("tx-6"))),
        )
        .unwrap();

    match step(&mut bridge).await {
        Step::DeadLettered { position, stream } => {
            assert_eq!(position, sent);
            assert_eq!(stream.as_str(), "customers-8");
        }
        other => panic!("expected dead letter, got {:?}", other),
    }
    assert_eq!(bridge.stats().append_retries, 2);
    assert_eq!(bridge.stats().dead_letters, 1);
    assert_eq!(handle.committed(CUSTOMERS, 0), Some(sent.offset + 1));

    let letters = DeadLetterQueue::read_all(&dlq_path).unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, RetryPolicy::test().max_attempts);
    assert_eq!(letters[0].event_type, EventType::Delete);
    assert_eq!(letters[0].metadata.correlation_id, "tx-6");
}

/// Rejects the first `failures` appends, then delegates
struct FailingFirstAppends {
    inner: InMemoryEventLog,
    remaining: AtomicU32,
}

impl FailingFirstAppends {
    fn new(inner: InMemoryEventLog, failures: u32) -> Self {
        FailingFirstAppends {
            inner,
            remaining: AtomicU32::new(failures),
        }
    }
}

impl EventLog for FailingFirstAppends {
    fn append<'a>(
        &'a self,
        stream: &'a StreamId,
        expected: ExpectedVersion,
        events: Vec<AppendableEvent>,
    ) -> LogFuture<'a, AppendResult> {
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Box::pin(async { Err(EventLogError::Unavailable("rejected".to_string())) });
        }
        self.inner.append(stream, expected, events)
    }

    fn read_stream<'a>(&'a self, stream: &'a StreamId) -> LogFuture<'a, Vec<RecordedEvent>> {
        self.inner.read_stream(stream)
    }

    fn read_by_table<'a>(&'a self, table: &'a str) -> LogFuture<'a, Vec<RecordedEvent>> {
        self.inner.read_by_table(table)
    }

    fn read_by_correlation<'a>(
        &'a self,
        correlation_id: &'a str,
    ) -> LogFuture<'a, Vec<RecordedEvent>> {
        self.inner.read_by_correlation(correlation_id)
    }

    fn read_by_event_type(&self, event_type: EventType) -> LogFuture<'_, Vec<RecordedEvent>> {
        self.inner.read_by_event_type(event_type)
    }

    fn read_all(&self, from: u64, limit: usize) -> LogFuture<'_, Vec<RecordedEvent>> {
        self.inner.read_all(from, limit)
    }

    fn close(&self) -> LogFuture<'_, ()> {
        self.inner.close()
    }
}

#[tokio::test]
async fn test_unwritable_dead_letter_holds_partition_commits() {
    let dir = tempfile::tempdir().unwrap();
    let dlq_dir = dir.path().join("missing");
    let dlq_path = dlq_dir.join("dead.jsonl");

    let (source, handle) = InMemorySource::new();
    let log = InMemoryEventLog::new();
    let reader = log.clone();
    let mut bridge = Bridge::new(
        Box::new(source),
        Arc::new(FailingFirstAppends::new(log, 1)),
        addressor(),
        BridgeOptions {
            retry: RetryPolicy::no_retry(),
            ..BridgeOptions::test()
        },
        DeadLetterQueue::new(Some(dlq_path.clone())),
    );

    let first = handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 8)),
            Some(&value_doc("customers", "c", json!("tx-8"))),
        )
        .unwrap();
    handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 9)),
            Some(&value_doc("customers", "c", json!("tx-9"))),
        )
        .unwrap();
    handle
        .send_json(
            ORDERS,
            Some(&key_doc("id", 1)),
            Some(&value_doc("orders", "c", json!("tx-10"))),
        )
        .unwrap();

    match step(&mut bridge).await {
        Step::Unacknowledged { position, .. } => assert_eq!(position, first),
        other => panic!("expected unacknowledged, got {:?}", other),
    }
    assert_eq!(handle.committed(CUSTOMERS, 0), None);
    assert_eq!(bridge.held_partitions(), 1);

    // Later messages on the held partition are appended but not committed
    assert!(matches!(step(&mut bridge).await, Step::Appended { .. }));
    assert_eq!(reader.len(), 1);
    assert_eq!(handle.committed(CUSTOMERS, 0), None);

    // Other partitions commit as usual
    assert!(matches!(step(&mut bridge).await, Step::Appended { .. }));
    assert_eq!(handle.committed(ORDERS, 0), Some(1));

    // Still unwritable: the hold stays
    assert!(matches!(step(&mut bridge).await, Step::Idle));
    assert_eq!(handle.committed(CUSTOMERS, 0), None);

    std::fs::create_dir_all(&dlq_dir).unwrap();
    assert!(matches!(step(&mut bridge).await, Step::Idle));
    assert_eq!(bridge.held_partitions(), 0);
    assert_eq!(handle.committed(CUSTOMERS, 0), Some(2));
    assert_eq!(bridge.stats().unacknowledged, 1);
    assert_eq!(bridge.stats().dead_letters, 1);

    let letters = DeadLetterQueue::read_all(&dlq_path).unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].position, first);
}

#[tokio::test]
async fn test_commit_modes() {
    // after_append: nothing is committed until the append went through
    let (source, handle) = InMemorySource::new();
    let failing = SimulatedEventLog::new(
        InMemoryEventLog::new(),
        SimulatedRng::new(3),
        SimulatedLogConfig {
            append_fail_prob: 1.0,
            ..SimulatedLogConfig::no_faults()
        },
    );
    let mut bridge = Bridge::new(
        Box::new(source),
        Arc::new(failing),
        addressor(),
        BridgeOptions {
            retry: RetryPolicy {
                initial_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(30),
                ..RetryPolicy::test()
            },
            ..BridgeOptions::test()
        },
        DeadLetterQueue::default(),
    );
    handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 1)),
            Some(&value_doc("customers", "c", json!("tx-1"))),
        )
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    assert!(matches!(bridge.step(&cancel).await.unwrap(), Step::Stopped));
    assert_eq!(bridge.stats().abandoned, 1);
    assert!(handle.commits().is_empty());

    // auto: committed as soon as it is polled, even if the append never lands
    let (source, handle) = InMemorySource::new();
    let failing = SimulatedEventLog::new(
        InMemoryEventLog::new(),
        SimulatedRng::new(4),
        SimulatedLogConfig {
            append_fail_prob: 1.0,
            ..SimulatedLogConfig::no_faults()
        },
    );
    let mut bridge = Bridge::new(
        Box::new(source),
        Arc::new(failing),
        addressor(),
        BridgeOptions {
            commit_mode: CommitMode::Auto,
            retry: RetryPolicy::no_retry(),
            ..BridgeOptions::test()
        },
        DeadLetterQueue::default(),
    );
    let sent = handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 1)),
            Some(&value_doc("customers", "c", json!("tx-1"))),
        )
        .unwrap();

    assert!(matches!(step(&mut bridge).await, Step::DeadLettered { .. }));
    assert_eq!(
        handle.commits(),
        vec![SourcePosition {
            topic: CUSTOMERS.to_string(),
            partition: 0,
            offset: sent.offset,
        }]
    );
}

#[tokio::test]
async fn test_run_until_cancelled_releases_connections() {
    let f = fixture(BridgeOptions::test());
    let Fixture {
        mut bridge,
        handle,
        reader,
    } = f;

    for id in 0..5 {
        handle
            .send_json(
                CUSTOMERS,
                Some(&key_doc("id", id)),
                Some(&value_doc("customers", "c", json!(format!("tx-{}", id)))),
            )
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = handle.clone();
    tokio::spawn(async move {
        while watcher.committed(CUSTOMERS, 0) != Some(5) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        trigger.cancel();
    });

    let stats = tokio::time::timeout(Duration::from_secs(10), bridge.run(cancel))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stats.appended_events, 5);
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert!(handle.is_closed());
    assert_eq!(reader.len(), 5);
    assert!(bridge.log().read_all(0, 10).await.is_err());
}

#[tokio::test]
async fn test_poll_error_logged_and_loop_continues() {
    let mut f = fixture(BridgeOptions::test());
    f.handle.send_error("broker connection reset").unwrap();
    f.handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 3)),
            Some(&value_doc("customers", "c", json!("tx-11"))),
        )
        .unwrap();

    assert!(matches!(step(&mut f.bridge).await, Step::PollFailed));
    assert_eq!(f.bridge.stats().poll_errors, 1);
    assert_eq!(f.bridge.state(), BridgeState::Waiting);

    assert!(matches!(step(&mut f.bridge).await, Step::Appended { .. }));
    assert_eq!(f.reader.len(), 1);
    assert_eq!(f.handle.committed(CUSTOMERS, 0), Some(1));
    assert_eq!(f.bridge.stats().messages(), 1);
}

#[tokio::test]
async fn test_closed_source_ends_run_with_error() {
    let Fixture {
        mut bridge,
        handle,
        reader,
    } = fixture(BridgeOptions::test());

    handle
        .send_json(
            CUSTOMERS,
            Some(&key_doc("id", 1)),
            Some(&value_doc("customers", "c", json!("tx-12"))),
        )
        .unwrap();
    assert!(matches!(step(&mut bridge).await, Step::Appended { .. }));

    handle.close();
    let outcome = tokio::time::timeout(Duration::from_secs(10), bridge.run(CancellationToken::new()))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        Err(BridgeError::Poll(SourceError::Closed))
    ));
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert_eq!(handle.committed(CUSTOMERS, 0), Some(1));
    assert!(bridge.log().read_all(0, 10).await.is_err());
    assert_eq!(reader.len(), 1);
}
