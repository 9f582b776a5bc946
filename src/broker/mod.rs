//! Broker boundary: connection/channel traits and queue topology types
//!
//! The broker wire protocol lives behind these traits; the crate only
//! assumes a networked collaborator that can declare durable queues, consume
//! with a prefetch limit, publish with routing verification, and notify on
//! channel close and server-side consumer cancellation.

pub mod consumer;
pub mod memory;
pub mod producer;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::error::BrokerError;

/// Sharded queue name: `<base>.<shard>`.
pub fn sharded_queue_name(base: &str, shard: u32) -> String {
    format!("{}.{}", base, shard)
}

/// Sharded consumer tag: `<name>.<shard>`.
pub fn sharded_consumer_name(name: &str, shard: u32) -> String {
    format!("{}.{}", name, shard)
}

/// Logical input queue
///
/// A `max_shard` of `S > 0` means `S + 1` physical queues named
/// `<queue>.0` through `<queue>.S`; a `max_shard` of 0 means a single
/// unsharded queue named `<queue>`.
#[derive(Clone)]
pub struct Source {
    pub queue: String,
    pub max_shard: u32,
    pub topology: Option<Arc<dyn QueueTopology>>,
}

impl Source {
    pub fn new(queue: impl Into<String>, max_shard: u32) -> Self {
        Self {
            queue: queue.into(),
            max_shard,
            topology: None,
        }
    }

    pub fn with_topology(mut self, topology: Arc<dyn QueueTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Physical queue names covered by this source, in shard order.
    pub fn queue_names(&self) -> Vec<String> {
        if self.max_shard > 0 {
            (0..=self.max_shard)
                .map(|i| sharded_queue_name(&self.queue, i))
                .collect()
        } else {
            vec![self.queue.clone()]
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("queue", &self.queue)
            .field("max_shard", &self.max_shard)
            .finish()
    }
}

/// Logical output target with its own shard topology
#[derive(Clone)]
pub struct Destination {
    pub routing_key: String,
    pub max_shard: u32,
    pub topology: Option<Arc<dyn QueueTopology>>,
}

impl Destination {
    pub fn new(routing_key: impl Into<String>, max_shard: u32) -> Self {
        Self {
            routing_key: routing_key.into(),
            max_shard,
            topology: None,
        }
    }

    pub fn with_topology(mut self, topology: Arc<dyn QueueTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Physical routing key for a given rotation counter.
    pub fn shard_key(&self, counter: u64) -> String {
        if self.max_shard > 0 {
            let shard = (counter % (self.max_shard as u64 + 1)) as u32;
            sharded_queue_name(&self.routing_key, shard)
        } else {
            self.routing_key.clone()
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("routing_key", &self.routing_key)
            .field("max_shard", &self.max_shard)
            .finish()
    }
}

/// Queue declaration capability
///
/// Implemented by whichever component needs custom topology; runs once per
/// channel lifetime, before the first consume or publish.
#[async_trait]
pub trait QueueTopology: Send + Sync {
    async fn declare(&self, channel: &dyn BrokerChannel) -> anyhow::Result<()>;
}

/// Declares a set of (base queue, max shard) pairs as durable queues.
pub struct DeclareQueues(pub Vec<(String, u32)>);

#[async_trait]
impl QueueTopology for DeclareQueues {
    async fn declare(&self, channel: &dyn BrokerChannel) -> anyhow::Result<()> {
        for (base, max_shard) in &self.0 {
            let source = Source::new(base.clone(), *max_shard);
            for name in source.queue_names() {
                channel.declare_queue(&name).await?;
            }
        }
        Ok(())
    }
}

/// One raw frame delivered by the broker
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub body: Bytes,
}

/// One outbound message
#[derive(Debug, Clone)]
pub struct Publishing {
    pub routing_key: String,
    pub body: Bytes,
    pub content_type: String,
    pub correlation_id: Option<String>,
    /// Persistent delivery mode: the broker stores the message durably.
    pub persistent: bool,
}

impl Publishing {
    pub fn persistent(routing_key: impl Into<String>, body: Bytes) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            content_type: "text/plain".to_string(),
            correlation_id: None,
            persistent: true,
        }
    }
}

/// Broker-level consume options. `no_wait` is always false at this boundary.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
}

/// One consumed message, parsed
///
/// Carries either the decoded payload or the decode error; decode errors are
/// surfaced to the writer so it can dead-letter them, never dropped here.
pub struct Delivery<T> {
    pub body: Bytes,
    parsed: anyhow::Result<T>,
    delivery_tag: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl<T> Delivery<T> {
    pub fn new(
        body: Bytes,
        parsed: anyhow::Result<T>,
        delivery_tag: u64,
        channel: Arc<dyn BrokerChannel>,
    ) -> Self {
        Self {
            body,
            parsed,
            delivery_tag,
            channel,
        }
    }

    pub fn parsed(&self) -> Result<&T, &anyhow::Error> {
        self.parsed.as_ref()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledge this delivery. Consumes the handle, so a delivery is
    /// acknowledged at most once.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.channel.ack(self.delivery_tag).await
    }
}

impl<T> fmt::Debug for Delivery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("parsed_ok", &self.parsed.is_ok())
            .finish()
    }
}

/// One logical channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue. Idempotent on the broker side.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Set the per-consumer prefetch limit for this channel.
    async fn qos(&self, prefetch: u16) -> Result<(), BrokerError>;

    /// Start a broker-level consume; deliveries arrive on the returned
    /// channel, bounded by the prefetch limit.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<mpsc::Receiver<RawDelivery>, BrokerError>;

    /// Cancel a named consumer.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Publish one message. With `mandatory`, unroutable messages are
    /// surfaced as [`BrokerError::Unroutable`] instead of silently dropped.
    /// In confirm mode the call resolves only after broker acknowledgment.
    async fn publish(&self, publishing: &Publishing, mandatory: bool) -> Result<(), BrokerError>;

    /// Put the channel in confirm mode for all subsequent publishes.
    async fn confirm_mode(&self) -> Result<(), BrokerError>;

    /// Acknowledge a delivery by tag.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Notification stream for transport-level channel closure.
    fn on_close(&self) -> broadcast::Receiver<String>;

    /// Notification stream for server-side consumer cancellation; yields the
    /// canceled consumer tag.
    fn on_cancel(&self) -> broadcast::Receiver<String>;

    /// Close the channel.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// One physical transport connection to the broker
///
/// Performs no retrying itself; it fails fast and lets the owning
/// consumer/producer decide through their retriers.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Notification stream for transport-level connection loss.
    fn on_close(&self) -> broadcast::Receiver<String>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharded_source_queue_names() {
        let source = Source::new("messages", 2);
        assert_eq!(
            source.queue_names(),
            vec!["messages.0", "messages.1", "messages.2"]
        );
    }

    #[test]
    fn test_unsharded_source_single_queue() {
        let source = Source::new("messages", 0);
        assert_eq!(source.queue_names(), vec!["messages"]);
    }

    #[test]
    fn test_destination_shard_rotation() {
        let dest = Destination::new("failed", 1);
        assert_eq!(dest.shard_key(0), "failed.0");
        assert_eq!(dest.shard_key(1), "failed.1");
        assert_eq!(dest.shard_key(2), "failed.0");

        let flat = Destination::new("failed", 0);
        assert_eq!(flat.shard_key(7), "failed");
    }
}
