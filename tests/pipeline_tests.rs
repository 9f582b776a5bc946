//! End-to-end pipeline tests over the in-memory broker and store

mod common;

use std::sync::Arc;
use std::time::Duration;

use batch_relay::monitoring::{MonitoringConfig, RelayEventType};
use batch_relay::test::mocks::{CollectingNotifier, ScriptedStore};
use batch_relay::{InMemoryBatchStore, MemoryBroker, Relay, ScalarValue};
use bytes::Bytes;
use pretty_assertions::assert_eq;

use common::{event_body, fast_config, publish, relay, QUERY};

#[tokio::test]
async fn test_messages_flow_from_queue_to_store() {
    let broker = MemoryBroker::new();
    let store = InMemoryBatchStore::new();
    let relay = relay(&broker, &store, fast_config("msgs", 0));

    relay.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    for i in 0..10 {
        publish(&broker, "msgs", event_body(i, &format!("event-{}", i))).await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    relay.shutdown().await;

    let rows = store.rows(QUERY).await;
    assert_eq!(rows.len(), 10);
    assert_eq!(
        rows[0],
        vec![ScalarValue::Int(0), ScalarValue::Text("event-0".to_string())]
    );
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("msgs"), 0);
    assert_eq!(broker.queue_depth("failed"), 0);
}

#[tokio::test]
async fn test_undecodable_messages_reach_dead_letter_queue() {
    let broker = MemoryBroker::new();
    let store = InMemoryBatchStore::new();
    let relay = relay(&broker, &store, fast_config("msgs", 0));

    relay.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    publish(&broker, "msgs", event_body(1, "good")).await;
    publish(&broker, "msgs", Bytes::from_static(b"{truncated")).await;
    publish(&broker, "msgs", event_body(2, "also good")).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    relay.shutdown().await;

    assert_eq!(store.rows(QUERY).await.len(), 2);
    assert_eq!(broker.drain_queue("failed"), vec![Bytes::from_static(b"{truncated")]);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_failed_rows_are_isolated_from_the_batch() {
    let broker = MemoryBroker::new();
    let scripted = ScriptedStore::new();
    // Second row of the first batch fails; the rest lands
    scripted.script_execs(vec![None, Some("value out of range"), None]);
    let notifier = Arc::new(CollectingNotifier::new());

    let relay = Relay::new(
        Arc::new(broker.clone()),
        Arc::new(scripted.clone()),
        fast_config("msgs", 0),
    )
    .with_notifier(notifier.clone());

    relay.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    for i in 0..3 {
        publish(&broker, "msgs", event_body(i, "row")).await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    relay.shutdown().await;

    assert_eq!(scripted.rows(QUERY).len(), 2);
    assert_eq!(broker.queue_depth("failed"), 1);
    assert_eq!(broker.unacked_count(), 0);
    assert!(notifier.count() >= 1);
}

#[tokio::test]
async fn test_transient_commit_failure_is_retried() {
    let broker = MemoryBroker::new();
    let scripted = ScriptedStore::new();
    scripted.fail_next_commit("connection reset");

    let relay = Relay::new(
        Arc::new(broker.clone()),
        Arc::new(scripted.clone()),
        fast_config("msgs", 0),
    );

    relay.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    publish(&broker, "msgs", event_body(1, "retried")).await;
    publish(&broker, "msgs", event_body(2, "retried")).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    relay.shutdown().await;

    // Both rows landed on the second attempt; nothing was dead-lettered
    assert_eq!(scripted.rows(QUERY).len(), 2);
    assert!(scripted.begin_count() >= 2);
    assert_eq!(broker.queue_depth("failed"), 0);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_monitoring_events_are_emitted() {
    let broker = MemoryBroker::new();
    let store = InMemoryBatchStore::new();

    let (relay, events_rx) = Relay::new(
        Arc::new(broker.clone()),
        Arc::new(store.clone()),
        fast_config("msgs", 0),
    )
    .with_monitoring(MonitoringConfig {
        enabled: true,
        channel_size: 100,
    });
    let mut events_rx = events_rx.expect("monitoring was enabled");

    relay.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    publish(&broker, "msgs", event_body(1, "tracked")).await;
    publish(&broker, "msgs", Bytes::from_static(b"garbage")).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    relay.shutdown().await;

    let mut saw_flush = false;
    let mut saw_dead_letter = false;
    while let Ok(event) = events_rx.try_recv() {
        match event.event_type {
            RelayEventType::BatchFlushed { stored, failed, .. } => {
                saw_flush = true;
                assert_eq!(stored, 1);
                assert_eq!(failed, 0);
            }
            RelayEventType::DeadLettered { .. } => saw_dead_letter = true,
            RelayEventType::ConsumerRecovered { .. } | RelayEventType::TransportError { .. } => {}
        }
    }
    assert!(saw_flush, "expected a BatchFlushed event");
    assert!(saw_dead_letter, "expected a DeadLettered event");
}

#[tokio::test]
async fn test_batches_flush_separately_per_query() {
    let broker = MemoryBroker::new();
    let store = InMemoryBatchStore::new();
    let relay = relay(&broker, &store, fast_config("msgs", 0));

    relay.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let other = "INSERT INTO metrics (v) VALUES (?)";
    publish(&broker, "msgs", event_body(1, "a")).await;
    publish(
        &broker,
        "msgs",
        batch_relay::test::request_body(other, vec![serde_json::json!(3.5)]),
    )
    .await;
    publish(&broker, "msgs", event_body(2, "b")).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    relay.shutdown().await;

    assert_eq!(store.rows(QUERY).await.len(), 2);
    assert_eq!(
        store.rows(other).await,
        vec![vec![ScalarValue::Float(3.5)]]
    );
}

#[tokio::test]
async fn test_relay_is_accessible_with_live_collaborators() {
    let broker = MemoryBroker::new();
    let store = InMemoryBatchStore::new();
    let relay = relay(&broker, &store, fast_config("msgs", 0));
    assert!(relay.is_accessible().await);
}
