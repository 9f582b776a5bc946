//! Confirm-aware producer with a bounded pending buffer
//!
//! Publishes [`Publishing`] values to declared destinations through a single
//! publisher task fed by a bounded buffer. `send` waits for buffer space
//! once the buffer is full; that wait is the system's admission control
//! against a stalled store or broker. Destinations are declared lazily, once
//! per channel lifetime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrokerChannel, BrokerConnection, Destination, Publishing};
use crate::error::{BrokerError, RelayError};
use crate::monitoring::ErrorNotifier;
use crate::retry::{Retrier, RetryConfig, RetryStatus};

/// Configuration for a confirming producer
#[derive(Clone)]
pub struct ProducerConfig {
    /// Destinations this producer may publish to
    pub destinations: Vec<Destination>,
    /// Request broker-side routing verification per publish
    pub mandatory: bool,
    /// Wait for broker acknowledgment per publish
    pub confirm: bool,
    /// Bounded pending buffer size; sized to absorb store outages
    pub pending_buffer_size: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            mandatory: false,
            confirm: false,
            pending_buffer_size: 1_000_000,
        }
    }
}

struct PublishState {
    channel: Option<Arc<dyn BrokerChannel>>,
    declared: HashSet<String>,
    shard_counters: HashMap<String, u64>,
}

struct Inner {
    config: ProducerConfig,
    connection: Arc<dyn BrokerConnection>,
    retrier: Retrier,
    notifier: Arc<dyn ErrorNotifier>,
    state: tokio::sync::Mutex<PublishState>,
}

/// Producer with bounded pending buffer and per-publish confirmation
pub struct ConfirmingProducer {
    tx: Mutex<Option<mpsc::Sender<Publishing>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    inner: Arc<Inner>,
}

impl ConfirmingProducer {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        config: ProducerConfig,
        retry_config: RetryConfig,
        notifier: Arc<dyn ErrorNotifier>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.pending_buffer_size.max(1));

        let inner = Arc::new(Inner {
            config,
            connection,
            retrier: Retrier::new(retry_config),
            notifier,
            state: tokio::sync::Mutex::new(PublishState {
                channel: None,
                declared: HashSet::new(),
                shard_counters: HashMap::new(),
            }),
        });

        let handle = tokio::spawn(Inner::publish_loop(inner.clone(), rx));

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            inner,
        }
    }

    /// Hand a message to the publisher. Waits for space once the pending
    /// buffer is full, so callers are intentionally backpressured here.
    pub async fn send(&self, publishing: Publishing) -> crate::Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| RelayError::Other(anyhow!("producer is closed")))?;

        tx.send(publishing)
            .await
            .map_err(|_| RelayError::Shutdown)
    }

    /// Messages currently waiting in the pending buffer.
    pub fn pending(&self) -> usize {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }

    /// Close the producer: the pending buffer is drained, then the publisher
    /// task and its channel are shut down. Idempotent.
    pub async fn close(&self) {
        self.tx.lock().take();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Producer closed");
    }

    /// Abort in-flight publish retries; used when a drain cannot complete
    /// because the broker is gone.
    pub fn stop(&self) {
        self.inner.retrier.stop();
    }
}

impl Inner {
    async fn publish_loop(inner: Arc<Self>, mut rx: mpsc::Receiver<Publishing>) {
        while let Some(publishing) = rx.recv().await {
            inner.publish_with_retry(publishing).await;
        }

        let channel = inner.state.lock().await.channel.take();
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        debug!("Publisher drained and exited");
    }

    async fn publish_with_retry(self: &Arc<Self>, publishing: Publishing) {
        let result = self
            .retrier
            .run(|| {
                let inner = self.clone();
                let publishing = publishing.clone();
                async move { inner.try_publish(publishing).await }
            })
            .await;

        if let Err(e) = result {
            self.notifier.notify(anyhow!(
                "publish to {} abandoned: {}",
                publishing.routing_key,
                e
            ));
        }
    }

    async fn try_publish(&self, mut publishing: Publishing) -> RetryStatus {
        let mut state = self.state.lock().await;

        if state.channel.is_none() {
            match self.connection.open_channel().await {
                Ok(channel) => {
                    if self.config.confirm {
                        if let Err(e) = channel.confirm_mode().await {
                            self.notifier.notify(e.into());
                            return RetryStatus::NeedRetry;
                        }
                    }
                    // Fresh channel: destinations must be re-declared
                    state.declared.clear();
                    state.channel = Some(channel);
                }
                Err(e) => {
                    self.notifier.notify(e.into());
                    return RetryStatus::NeedRetry;
                }
            }
        }

        let channel = match state.channel.clone() {
            Some(channel) => channel,
            None => return RetryStatus::NeedRetry,
        };

        let destination = self
            .config
            .destinations
            .iter()
            .find(|d| d.routing_key == publishing.routing_key)
            .cloned();

        if let Some(dest) = &destination {
            if !state.declared.contains(&dest.routing_key) {
                if let Some(topology) = &dest.topology {
                    if let Err(e) = topology.declare(channel.as_ref()).await {
                        self.notifier.notify(e);
                        state.channel = None;
                        return RetryStatus::NeedRetry;
                    }
                }
                state.declared.insert(dest.routing_key.clone());
            }

            if dest.max_shard > 0 {
                let counter = state
                    .shard_counters
                    .entry(dest.routing_key.clone())
                    .or_insert(0);
                publishing.routing_key = dest.shard_key(*counter);
                *counter += 1;
            }
        }

        match channel.publish(&publishing, self.config.mandatory).await {
            Ok(()) => RetryStatus::Succeed,
            Err(BrokerError::Unroutable(key)) => {
                // Mandatory routing verification failed; retrying cannot help
                self.notifier
                    .notify(anyhow!("message unroutable for {}", key));
                RetryStatus::Failed
            }
            Err(e) => {
                warn!(routing_key = %publishing.routing_key, error = %e, "Publish failed, resetting channel");
                self.notifier.notify(e.into());
                state.channel = None;
                RetryStatus::NeedRetry
            }
        }
    }
}
