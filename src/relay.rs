//! Relay assembly
//!
//! Wires the sharded consumer, the batching writer, and the confirming
//! producer into one running pipeline with an ordered graceful shutdown:
//! cancel the consumer first so its merged stream closes, let the writer
//! flush and exit, then tear down the producer and the connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::consumer::ShardedConsumer;
use crate::broker::producer::ConfirmingProducer;
use crate::broker::BrokerConnection;
use crate::config::RelayConfig;
use crate::message::WriteRequest;
use crate::monitoring::{
    ErrorNotifier, EventEmittingNotifier, MonitoringConfig, RelayEvent, TracingNotifier,
};
use crate::store::BatchStore;
use crate::writer::BatchingWriter;
use crate::RelayError;

struct Running {
    consumer: Arc<ShardedConsumer<WriteRequest>>,
    producer: Arc<ConfirmingProducer>,
    writer: Arc<BatchingWriter>,
    writer_handle: JoinHandle<()>,
}

/// The assembled relay pipeline
pub struct Relay {
    config: RelayConfig,
    connection: Arc<dyn BrokerConnection>,
    store: Arc<dyn BatchStore>,
    notifier: Arc<dyn ErrorNotifier>,
    events_tx: Option<mpsc::Sender<RelayEvent>>,
    running: Mutex<Option<Running>>,
}

impl Relay {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        store: Arc<dyn BatchStore>,
        config: RelayConfig,
    ) -> Self {
        Self {
            config,
            connection,
            store,
            notifier: Arc::new(TracingNotifier),
            events_tx: None,
            running: Mutex::new(None),
        }
    }

    /// Replace the default tracing-backed notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn ErrorNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Emit monitoring events on the given channel.
    pub fn with_events(mut self, tx: mpsc::Sender<RelayEvent>) -> Self {
        self.events_tx = Some(tx);
        self
    }

    /// Enable monitoring per `config`; returns the event stream when
    /// monitoring is enabled.
    pub fn with_monitoring(
        mut self,
        config: MonitoringConfig,
    ) -> (Self, Option<mpsc::Receiver<RelayEvent>>) {
        if !config.enabled {
            return (self, None);
        }
        let (tx, rx) = mpsc::channel(config.channel_size.max(1));
        self.events_tx = Some(tx);
        (self, Some(rx))
    }

    /// Start consuming and relaying. Fails if the relay is already running.
    pub async fn start(&self) -> crate::Result<()> {
        if self.running.lock().is_some() {
            return Err(RelayError::Other(anyhow!("relay is already running")));
        }

        // With monitoring on, transport errors double as events
        let notifier: Arc<dyn ErrorNotifier> = match &self.events_tx {
            Some(tx) => Arc::new(EventEmittingNotifier::new(
                self.notifier.clone(),
                tx.clone(),
            )),
            None => self.notifier.clone(),
        };

        let producer = Arc::new(ConfirmingProducer::new(
            self.connection.clone(),
            self.config.producer_config(),
            self.config.broker_retry(),
            notifier.clone(),
        ));

        let mut writer = BatchingWriter::new(
            self.store.clone(),
            producer.clone(),
            self.config.writer_config(),
            self.config.store_retry(),
            notifier.clone(),
        );
        if let Some(tx) = &self.events_tx {
            writer = writer.with_events(tx.clone());
        }
        let writer = Arc::new(writer);

        let mut consumer = ShardedConsumer::new(
            self.connection.clone(),
            self.config.source(),
            self.config.consumer_config(),
            self.config.broker_retry(),
            notifier.clone(),
            Arc::new(|body: &[u8]| WriteRequest::decode(body)),
        );
        if let Some(tx) = &self.events_tx {
            consumer = consumer.with_events(tx.clone());
        }
        let consumer = Arc::new(consumer);

        let stream = consumer.consume().await?;
        let writer_handle = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.run(stream).await })
        };

        *self.running.lock() = Some(Running {
            consumer,
            producer,
            writer,
            writer_handle,
        });
        info!(queue = %self.config.queue, shards = self.config.max_shard, "Relay started");
        Ok(())
    }

    /// Graceful shutdown. Unflushed batches are written out and every
    /// in-flight delivery resolves to an ack before the transport goes away.
    /// Each drain phase is bounded by `shutdown_timeout_ms`; past it the
    /// retriers are aborted so shutdown latency stays bounded even with the
    /// store or broker unreachable. Idempotent.
    pub async fn shutdown(&self) {
        let running = match self.running.lock().take() {
            Some(running) => running,
            None => return,
        };
        let drain = Duration::from_millis(self.config.shutdown_timeout_ms);

        // Closing the consumer's merged stream is the writer's drain signal
        running.consumer.cancel().await;

        let mut writer_handle = running.writer_handle;
        match tokio::time::timeout(drain, &mut writer_handle).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("Writer task panicked during drain"),
            Err(_) => {
                warn!("Writer drain timed out, aborting store retries");
                running.writer.stop();
                if writer_handle.await.is_err() {
                    warn!("Writer task panicked during drain");
                }
            }
        }

        running.consumer.close().await;

        if tokio::time::timeout(drain, running.producer.close())
            .await
            .is_err()
        {
            warn!("Producer drain timed out, abandoning pending publishes");
            running.producer.stop();
        }
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Connection close failed");
        }
        info!("Relay stopped");
    }

    /// Probe both collaborators before relying on the pipeline.
    pub async fn is_accessible(&self) -> bool {
        let broker_ok = match self.connection.open_channel().await {
            Ok(channel) => {
                let _ = channel.close().await;
                true
            }
            Err(e) => {
                warn!(error = %e, "Broker accessibility check failed");
                false
            }
        };
        if !broker_ok {
            return false;
        }
        crate::store::is_accessible(&self.store, 10, Duration::from_secs(1)).await
    }
}
