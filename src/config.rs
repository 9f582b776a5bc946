//! Relay configuration
//!
//! One flat, deserializable configuration struct that maps onto the
//! per-component configs. Durations are expressed in milliseconds so the
//! struct stays trivially representable in any config format.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::consumer::ConsumerConfig;
use crate::broker::producer::ProducerConfig;
use crate::broker::{DeclareQueues, Destination, Source};
use crate::retry::RetryConfig;
use crate::writer::WriterConfig;

/// Top-level relay configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Broker transport URI, consumed by the deployment's connection factory
    pub broker_uri: String,
    /// Broker heartbeat interval in seconds
    pub heartbeat_secs: u64,
    /// Store URI, consumed by the deployment's store factory
    pub store_uri: String,
    /// Base name of the input queue
    pub queue: String,
    /// Queue undeliverable messages are forwarded to
    pub failed_queue: String,
    /// Highest shard index of the input queue; 0 means unsharded
    pub max_shard: u32,
    /// Base consumer tag
    pub consumer_name: String,
    /// Per-shard prefetch limit; must exceed `batch_size`
    pub prefetch_count: u16,
    /// Rows per query before a batch is flushed early
    pub batch_size: usize,
    /// Periodic flush interval in milliseconds
    pub flush_period_ms: u64,
    /// Backoff schedule in milliseconds, indexed by attempt
    pub retry_intervals_ms: Vec<u64>,
    /// Attempt bound for store writes; broker retries stay unbounded
    pub store_max_attempts: Option<u32>,
    /// Capacity of the producer's pending buffer
    pub pending_buffer_size: usize,
    /// Wait for broker publish confirmation
    pub publisher_confirm: bool,
    /// Surface unroutable publishes instead of dropping them
    pub mandatory: bool,
    /// Upper bound on each shutdown drain phase in milliseconds; past it,
    /// in-flight retries are aborted and remaining work is dead-lettered
    pub shutdown_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker_uri: "amqp://localhost:5672/".to_string(),
            heartbeat_secs: 10,
            store_uri: "http://localhost:8123/".to_string(),
            queue: "messages".to_string(),
            failed_queue: "failed".to_string(),
            max_shard: 0,
            consumer_name: "batch-relay".to_string(),
            prefetch_count: 10_000,
            batch_size: 1000,
            flush_period_ms: 1000,
            retry_intervals_ms: vec![5000],
            store_max_attempts: Some(3),
            pending_buffer_size: 1_000_000,
            publisher_confirm: true,
            mandatory: true,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl RelayConfig {
    fn schedule(&self) -> Vec<Duration> {
        self.retry_intervals_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    /// Retry policy for broker-facing operations: retried until stopped.
    pub fn broker_retry(&self) -> RetryConfig {
        RetryConfig::new(self.schedule(), None)
    }

    /// Retry policy for store writes: bounded so a poisoned batch cannot
    /// wedge the writer.
    pub fn store_retry(&self) -> RetryConfig {
        RetryConfig::new(self.schedule(), self.store_max_attempts)
    }

    pub fn source(&self) -> Source {
        Source::new(self.queue.clone(), self.max_shard).with_topology(Arc::new(DeclareQueues(
            vec![(self.queue.clone(), self.max_shard)],
        )))
    }

    pub fn failed_destination(&self) -> Destination {
        Destination::new(self.failed_queue.clone(), 0)
            .with_topology(Arc::new(DeclareQueues(vec![(self.failed_queue.clone(), 0)])))
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            consumer_name: self.consumer_name.clone(),
            prefetch_count: self.prefetch_count,
            ..Default::default()
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            destinations: vec![self.failed_destination()],
            mandatory: self.mandatory,
            confirm: self.publisher_confirm,
            pending_buffer_size: self.pending_buffer_size,
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.batch_size,
            flush_period: Duration::from_millis(self.flush_period_ms),
            failed_routing_key: self.failed_queue.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.broker_uri, "amqp://localhost:5672/");
        assert_eq!(config.heartbeat_secs, 10);
        assert_eq!(config.queue, "messages");
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.store_max_attempts, Some(3));
        assert!(config.publisher_confirm);
        assert_eq!(config.shutdown_timeout_ms, 30_000);
        // The consumer must always be able to fill a whole batch
        assert!((config.prefetch_count as usize) > config.batch_size);
    }

    #[test]
    fn test_deserialize_partial_overrides() {
        let config: RelayConfig = serde_json::from_str(
            r#"{
                "queue": "events",
                "max_shard": 3,
                "batch_size": 500,
                "retry_intervals_ms": [100, 200, 400],
                "store_max_attempts": 5
            }"#,
        )
        .unwrap();

        assert_eq!(config.queue, "events");
        assert_eq!(config.max_shard, 3);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.failed_queue, "failed");
        assert_eq!(config.store_max_attempts, Some(5));

        let source = config.source();
        assert_eq!(
            source.queue_names(),
            vec!["events.0", "events.1", "events.2", "events.3"]
        );
    }

    #[test]
    fn test_retry_policies_differ_in_bound() {
        let config = RelayConfig::default();
        assert_eq!(config.broker_retry().max_attempts, None);
        assert_eq!(config.store_retry().max_attempts, Some(3));
    }
}
