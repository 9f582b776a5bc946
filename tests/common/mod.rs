//! Shared helpers for integration tests

use std::sync::Arc;

use batch_relay::broker::{BrokerConnection, Publishing};
use batch_relay::test::request_body;
use batch_relay::{InMemoryBatchStore, MemoryBroker, Relay, RelayConfig};
use bytes::Bytes;
use serde_json::Value;

pub const QUERY: &str = "INSERT INTO events (id, name) VALUES (?, ?)";

/// Route component logs through the test harness; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Relay config tuned for test speed: short flush period, fast retries.
pub fn fast_config(queue: &str, max_shard: u32) -> RelayConfig {
    RelayConfig {
        queue: queue.to_string(),
        max_shard,
        batch_size: 100,
        flush_period_ms: 50,
        retry_intervals_ms: vec![20],
        ..Default::default()
    }
}

pub fn relay(broker: &MemoryBroker, store: &InMemoryBatchStore, config: RelayConfig) -> Relay {
    init_tracing();
    Relay::new(Arc::new(broker.clone()), Arc::new(store.clone()), config)
}

pub async fn publish(broker: &MemoryBroker, queue: &str, body: Bytes) {
    let channel = broker
        .open_channel()
        .await
        .expect("open publish channel");
    channel
        .publish(&Publishing::persistent(queue, body), true)
        .await
        .expect("publish test message");
}

pub fn event_body(id: i64, name: &str) -> Bytes {
    request_body(QUERY, vec![Value::from(id), Value::from(name)])
}
