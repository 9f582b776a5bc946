//! Batch Relay - a sharded broker-to-store batching relay
//!
//! This crate consumes write requests from sharded broker queues, batches
//! them per destination query, and flushes each batch into an analytical
//! store in a single transaction. Undeliverable messages are forwarded to a
//! dead-letter destination instead of being lost.

pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod monitoring;
pub mod relay;
pub mod retry;
pub mod store;
pub mod writer;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use config::RelayConfig;
pub use error::{BrokerError, RelayError, Result, StoreError};
pub use message::{ScalarValue, WriteRequest};
pub use relay::Relay;
pub use retry::{Retrier, RetryConfig, RetrySchedule, RetryStatus};

// Re-export main traits
pub use crate::broker::{BrokerChannel, BrokerConnection, QueueTopology};
pub use crate::store::{BatchStore, StoreTransaction};

// Re-export implementations
pub use crate::broker::consumer::{ConsumerConfig, ShardedConsumer};
pub use crate::broker::memory::MemoryBroker;
pub use crate::broker::producer::{ConfirmingProducer, ProducerConfig};
pub use crate::store::memory::InMemoryBatchStore;
pub use crate::writer::{BatchingWriter, WriterConfig};
