//! Sharded, reconnecting consumer
//!
//! Consumes one logical queue split across shards and merges every shard's
//! deliveries into a single stream. The consumer survives channel loss
//! (re-initializes through its retrier) and server-side consumer
//! cancellation (re-declares the topology and re-consumes the canceled
//! shard). Each frame is parsed with a caller-supplied decode function and
//! wrapped as a [`Delivery`] carrying either the parsed value or the decode
//! error, so malformed messages reach the writer for dead-lettering instead
//! of disappearing here.

use std::sync::Arc;

use anyhow::anyhow;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    sharded_consumer_name, sharded_queue_name, BrokerChannel, BrokerConnection, ConsumeOptions,
    Delivery, Source,
};
use crate::error::{BrokerError, RelayError};
use crate::monitoring::{emit, ErrorNotifier, RelayEvent};
use crate::retry::{Retrier, RetryConfig, RetryError, RetryStatus};

/// Decode function applied to every delivered frame.
pub type DecodeFn<T> = Arc<dyn Fn(&[u8]) -> anyhow::Result<T> + Send + Sync>;

/// Configuration for a sharded consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Base consumer tag; shard consumers append `.<shard>`
    pub consumer_name: String,
    /// Prefetch limit; must exceed the writer's batch size to avoid
    /// self-inflicted stalls
    pub prefetch_count: u16,
    /// Broker-level consume options
    pub options: ConsumeOptions,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_name: "batch-relay".to_string(),
            prefetch_count: 10_000,
            options: ConsumeOptions::default(),
        }
    }
}

struct ConsumerState {
    channel: Option<Arc<dyn BrokerChannel>>,
    declared: bool,
    canceled: bool,
    closed: bool,
}

struct Inner<T> {
    source: Source,
    config: ConsumerConfig,
    connection: Arc<dyn BrokerConnection>,
    retrier: Retrier,
    notifier: Arc<dyn ErrorNotifier>,
    decode: DecodeFn<T>,
    state: tokio::sync::Mutex<ConsumerState>,
    events_tx: Mutex<Option<mpsc::Sender<RelayEvent>>>,
    merged_tx: Mutex<Option<mpsc::Sender<Delivery<T>>>>,
    stop_tx: watch::Sender<bool>,
    cancels_tx: mpsc::Sender<u32>,
    closes_tx: mpsc::Sender<()>,
    fanin_handles: Mutex<Vec<JoinHandle<()>>>,
    listener_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Shard-aware consumer over one logical queue
pub struct ShardedConsumer<T> {
    inner: Arc<Inner<T>>,
    cancels_rx: Mutex<Option<mpsc::Receiver<u32>>>,
    closes_rx: Mutex<Option<mpsc::Receiver<()>>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ShardedConsumer<T> {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        source: Source,
        config: ConsumerConfig,
        retry_config: RetryConfig,
        notifier: Arc<dyn ErrorNotifier>,
        decode: DecodeFn<T>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (cancels_tx, cancels_rx) = mpsc::channel(8);
        let (closes_tx, closes_rx) = mpsc::channel(8);

        Self {
            inner: Arc::new(Inner {
                source,
                config,
                connection,
                retrier: Retrier::new(retry_config),
                notifier,
                decode,
                state: tokio::sync::Mutex::new(ConsumerState {
                    channel: None,
                    declared: false,
                    canceled: false,
                    closed: false,
                }),
                events_tx: Mutex::new(None),
                merged_tx: Mutex::new(None),
                stop_tx,
                cancels_tx,
                closes_tx,
                fanin_handles: Mutex::new(Vec::new()),
                listener_handles: Mutex::new(Vec::new()),
            }),
            cancels_rx: Mutex::new(Some(cancels_rx)),
            closes_rx: Mutex::new(Some(closes_rx)),
            run_handle: Mutex::new(None),
        }
    }

    /// Emit monitoring events on the given channel.
    pub fn with_events(self, tx: mpsc::Sender<RelayEvent>) -> Self {
        *self.inner.events_tx.lock() = Some(tx);
        self
    }

    /// Start delivering queued messages. Returns the single merged stream;
    /// it is closed exactly once, after `cancel` has drained every shard
    /// fan-in task.
    pub async fn consume(&self) -> crate::Result<mpsc::Receiver<Delivery<T>>> {
        let (tx, rx) = mpsc::channel(self.inner.config.prefetch_count.max(1) as usize);

        {
            let mut slot = self.inner.merged_tx.lock();
            if slot.is_some() {
                return Err(RelayError::Other(anyhow!(
                    "consumer is already consuming"
                )));
            }
            *slot = Some(tx);
        }

        let cancels_rx = self
            .cancels_rx
            .lock()
            .take()
            .ok_or_else(|| RelayError::Other(anyhow!("consumer was already started")))?;
        let closes_rx = self
            .closes_rx
            .lock()
            .take()
            .ok_or_else(|| RelayError::Other(anyhow!("consumer was already started")))?;

        let inner = self.inner.clone();
        let handle = tokio::spawn(Inner::run(inner, cancels_rx, closes_rx));
        *self.run_handle.lock() = Some(handle);

        info!(queue = %self.inner.source.queue, shards = self.inner.source.max_shard, "Consumer started");
        Ok(rx)
    }

    /// Stop deliveries to the merged stream and drain in-flight shard
    /// fan-in tasks. Idempotent.
    pub async fn cancel(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.canceled {
                return;
            }
            state.canceled = true;
        }

        // The run task may not have subscribed yet; send_replace stores the
        // stop regardless of live receivers
        self.inner.stop_tx.send_replace(true);
        self.inner.retrier.stop();

        let run_handle = self.run_handle.lock().take();
        if let Some(handle) = run_handle {
            let _ = handle.await;
        }

        let fanins: Vec<JoinHandle<()>> = self.inner.fanin_handles.lock().drain(..).collect();
        join_all(fanins).await;

        // Dropping the last sender closes the merged stream exactly once
        self.inner.merged_tx.lock().take();
        debug!(queue = %self.inner.source.queue, "Consumer canceled");
    }

    /// Perform a full closure of the consumer: cancel, close the underlying
    /// channel, and wait for the close/cancel listener tasks. Idempotent.
    pub async fn close(&self) {
        self.cancel().await;

        let channel = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.channel.take()
        };

        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Channel close failed");
            }
        }

        let listeners: Vec<JoinHandle<()>> =
            self.inner.listener_handles.lock().drain(..).collect();
        join_all(listeners).await;
        info!(queue = %self.inner.source.queue, "Consumer closed");
    }

    /// Liveness probe: can a channel be opened on the broker right now?
    pub async fn is_accessible(&self) -> bool {
        match self.inner.connection.open_channel().await {
            Ok(channel) => {
                let _ = channel.close().await;
                true
            }
            Err(e) => {
                warn!(error = %e, "Broker accessibility check failed");
                false
            }
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    async fn run(
        inner: Arc<Self>,
        mut cancels_rx: mpsc::Receiver<u32>,
        mut closes_rx: mpsc::Receiver<()>,
    ) {
        let mut stop_rx = inner.stop_tx.subscribe();
        let mut reconsume_shard: Option<u32> = None;
        let mut recovering = false;

        loop {
            let shard = reconsume_shard.take();
            let result = inner
                .retrier
                .run(|| {
                    let inner = inner.clone();
                    async move {
                        match inner.consume_once(shard).await {
                            Ok(()) => RetryStatus::Succeed,
                            Err(e) => {
                                inner.notifier.notify(anyhow::Error::new(e));
                                RetryStatus::NeedRetry
                            }
                        }
                    }
                })
                .await;

            match result {
                Ok(()) if recovering => {
                    recovering = false;
                    let events = inner.events_tx.lock().clone();
                    emit(
                        &events,
                        RelayEvent::consumer_recovered(inner.source.queue.clone()),
                    );
                }
                Err(RetryError::Stopped) => debug!("Consumer retry loop stopped"),
                _ => {}
            }

            // The stop may have landed before this subscription saw it
            if *stop_rx.borrow() {
                inner.cancel_consumers().await;
                return;
            }

            tokio::select! {
                _ = stop_rx.changed() => {
                    inner.cancel_consumers().await;
                    return;
                }
                Some(shard) = cancels_rx.recv() => {
                    // Server-side cancel: re-declare and re-consume the shard
                    reconsume_shard = Some(shard);
                    recovering = true;
                }
                Some(()) = closes_rx.recv() => {
                    // Channel lost: re-initialize from scratch
                    recovering = true;
                }
            }
        }
    }

    async fn consume_once(self: &Arc<Self>, reconsume_shard: Option<u32>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.canceled || state.closed {
            return Ok(());
        }

        if state.channel.is_none() {
            let channel = self.connection.open_channel().await?;
            channel.qos(self.config.prefetch_count).await?;
            self.spawn_close_listener(channel.on_close());
            self.spawn_cancel_listener(channel.on_cancel());
            state.channel = Some(channel);
        }

        let channel = match state.channel.clone() {
            Some(channel) => channel,
            None => {
                return Err(BrokerError::ChannelClosed(
                    "channel lost during initialization".to_string(),
                ))
            }
        };

        if !state.declared {
            if let Some(topology) = &self.source.topology {
                topology.declare(channel.as_ref()).await.map_err(|e| {
                    BrokerError::DeclareFailed {
                        queue: self.source.queue.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
            state.declared = true;
        }

        self.listen_messages(&channel, reconsume_shard).await
    }

    async fn listen_messages(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        reconsume_shard: Option<u32>,
    ) -> Result<(), BrokerError> {
        let mut consumes: Vec<(String, String)> = Vec::new();

        if self.source.max_shard > 0 {
            if let Some(shard) = reconsume_shard {
                consumes.push((
                    sharded_queue_name(&self.source.queue, shard),
                    sharded_consumer_name(&self.config.consumer_name, shard),
                ));
            } else {
                for shard in 0..=self.source.max_shard {
                    consumes.push((
                        sharded_queue_name(&self.source.queue, shard),
                        sharded_consumer_name(&self.config.consumer_name, shard),
                    ));
                }
            }
        } else {
            consumes.push((self.source.queue.clone(), self.config.consumer_name.clone()));
        }

        for (queue, tag) in consumes {
            let rx = channel.consume(&queue, &tag, &self.config.options).await?;
            self.spawn_fanin(queue, rx, channel.clone());
        }

        Ok(())
    }

    fn spawn_fanin(
        &self,
        queue: String,
        mut rx: mpsc::Receiver<super::RawDelivery>,
        channel: Arc<dyn BrokerChannel>,
    ) {
        let merged = match self.merged_tx.lock().clone() {
            Some(tx) => tx,
            None => return,
        };
        let decode = self.decode.clone();

        let handle = tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                let parsed = (decode)(&raw.body);
                let delivery = Delivery::new(raw.body, parsed, raw.delivery_tag, channel.clone());
                if merged.send(delivery).await.is_err() {
                    break;
                }
            }
            debug!(queue = %queue, "Shard fan-in exited");
        });

        self.fanin_handles.lock().push(handle);
    }

    /// Shard index for one of this consumer's tags; `None` for foreign tags.
    fn parse_consumer_tag(&self, tag: &str) -> Option<u32> {
        if self.source.max_shard == 0 {
            return (tag == self.config.consumer_name).then_some(0);
        }
        let prefix = format!("{}.", self.config.consumer_name);
        tag.strip_prefix(&prefix)
            .and_then(|token| token.parse().ok())
            .filter(|shard| *shard <= self.source.max_shard)
    }

    fn spawn_close_listener(self: &Arc<Self>, mut closes: broadcast::Receiver<String>) {
        let inner = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            if *stop_rx.borrow() {
                return;
            }
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    received = closes.recv() => match received {
                        Ok(reason) => {
                            inner.notifier.notify(anyhow!("channel closed: {}", reason));
                            inner.abort().await;
                        }
                        Err(_) => return,
                    },
                }
            }
        });

        self.listener_handles.lock().push(handle);
    }

    fn spawn_cancel_listener(self: &Arc<Self>, mut cancels: broadcast::Receiver<String>) {
        let inner = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            if *stop_rx.borrow() {
                return;
            }
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    received = cancels.recv() => match received {
                        Ok(tag) => match inner.parse_consumer_tag(&tag) {
                            Some(shard) => {
                                let mut state = inner.state.lock().await;
                                if state.closed {
                                    return;
                                }
                                // Topology must be re-declared before re-consuming
                                state.declared = false;
                                drop(state);
                                let _ = inner.cancels_tx.try_send(shard);
                            }
                            None => {
                                // A tag we never issued; re-initialize rather
                                // than guess which shard it was
                                warn!(consumer_tag = %tag, "Unrecognized canceled consumer tag, re-initializing");
                                inner.abort().await;
                            }
                        },
                        Err(_) => return,
                    },
                }
            }
        });

        self.listener_handles.lock().push(handle);
    }

    /// Channel-level transport loss: discard the channel and wake the run
    /// loop to re-initialize.
    async fn abort(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.channel = None;
        state.declared = false;
        let _ = self.closes_tx.try_send(());
    }

    /// Broker-side cancel of every shard consumer, issued during graceful
    /// drain so the fan-in streams terminate.
    async fn cancel_consumers(&self) {
        let channel = {
            let state = self.state.lock().await;
            state.channel.clone()
        };

        let channel = match channel {
            Some(channel) => channel,
            None => return,
        };

        if self.source.max_shard > 0 {
            for shard in 0..=self.source.max_shard {
                let tag = sharded_consumer_name(&self.config.consumer_name, shard);
                if let Err(e) = channel.cancel(&tag).await {
                    warn!(consumer_tag = %tag, error = %e, "Consumer cancel failed");
                }
            }
        } else if let Err(e) = channel.cancel(&self.config.consumer_name).await {
            warn!(consumer_tag = %self.config.consumer_name, error = %e, "Consumer cancel failed");
        }
    }
}
