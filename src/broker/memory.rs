//! In-memory broker implementation
//!
//! A process-local implementation of the broker traits, functional enough to
//! exercise the whole pipeline: durable queue declaration, prefetch-bounded
//! delivery, mandatory routing verification, unacked-message tracking with
//! redelivery after a severed transport, and server-side consumer
//! cancellation injection for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use super::{BrokerChannel, BrokerConnection, ConsumeOptions, Publishing, RawDelivery};
use crate::error::BrokerError;

const DEFAULT_PREFETCH: usize = 16;

struct ConsumerSeat {
    tag: String,
    tx: mpsc::Sender<RawDelivery>,
    cancel_tx: broadcast::Sender<String>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(u64, Bytes)>,
    consumer: Option<ConsumerSeat>,
}

struct ChannelHandle {
    closed: Arc<AtomicBool>,
    close_tx: broadcast::Sender<String>,
}

struct BrokerCore {
    queues: Mutex<HashMap<String, QueueState>>,
    unacked: Mutex<HashMap<u64, (String, Bytes)>>,
    tag_seq: AtomicU64,
    channels: Mutex<Vec<ChannelHandle>>,
    conn_close_tx: broadcast::Sender<String>,
    confirmed: AtomicU64,
}

impl BrokerCore {
    /// Move pending messages to the queue's consumer, up to its prefetch
    /// capacity. Messages handed over become unacked until `ack`.
    fn pump(&self, queue: &str) {
        let mut queues = self.queues.lock();
        let state = match queues.get_mut(queue) {
            Some(state) => state,
            None => return,
        };

        while let Some(seat) = &state.consumer {
            let (tag, body) = match state.pending.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            let delivery = RawDelivery {
                delivery_tag: tag,
                body: body.clone(),
            };

            match seat.tx.try_send(delivery) {
                Ok(()) => {
                    self.unacked.lock().insert(tag, (queue.to_string(), body));
                    trace!(queue = %queue, delivery_tag = tag, "Delivered message");
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Prefetch window full; redeliver once capacity frees
                    state.pending.push_front((tag, body));
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    state.pending.push_front((tag, body));
                    state.consumer = None;
                }
            }
        }
    }

    /// Requeue every unacked message at the front of its queue, preserving
    /// delivery order.
    fn requeue_unacked(&self) {
        let mut unacked: Vec<(u64, (String, Bytes))> =
            self.unacked.lock().drain().collect();
        unacked.sort_by_key(|(tag, _)| *tag);

        let mut queues = self.queues.lock();
        for (tag, (queue, body)) in unacked.into_iter().rev() {
            if let Some(state) = queues.get_mut(&queue) {
                state.pending.push_front((tag, body));
            }
        }
    }
}

/// In-process broker; implements [`BrokerConnection`]
#[derive(Clone)]
pub struct MemoryBroker {
    core: Arc<BrokerCore>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (conn_close_tx, _) = broadcast::channel(8);
        Self {
            core: Arc::new(BrokerCore {
                queues: Mutex::new(HashMap::new()),
                unacked: Mutex::new(HashMap::new()),
                tag_seq: AtomicU64::new(1),
                channels: Mutex::new(Vec::new()),
                conn_close_tx,
                confirmed: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate transport loss: every open channel is closed, consumers are
    /// dropped, and unacked messages are requeued for redelivery.
    pub fn sever(&self, reason: &str) {
        debug!(reason = %reason, "Severing broker transport");

        for handle in self.core.channels.lock().drain(..) {
            handle.closed.store(true, Ordering::SeqCst);
            let _ = handle.close_tx.send(reason.to_string());
        }

        {
            let mut queues = self.core.queues.lock();
            for state in queues.values_mut() {
                state.consumer = None;
            }
        }

        self.core.requeue_unacked();
        let _ = self.core.conn_close_tx.send(reason.to_string());
    }

    /// Simulate a server-side consumer cancellation for one queue.
    pub fn cancel_consumer(&self, queue: &str) {
        let seat = {
            let mut queues = self.core.queues.lock();
            queues.get_mut(queue).and_then(|state| state.consumer.take())
        };

        if let Some(seat) = seat {
            debug!(queue = %queue, consumer_tag = %seat.tag, "Server-side consumer cancel");
            let _ = seat.cancel_tx.send(seat.tag);
        }
    }

    /// Simulate a server-side cancellation that reports an arbitrary
    /// consumer tag, as a misbehaving broker might.
    pub fn cancel_consumer_as(&self, queue: &str, tag: &str) {
        let seat = {
            let mut queues = self.core.queues.lock();
            queues.get_mut(queue).and_then(|state| state.consumer.take())
        };

        if let Some(seat) = seat {
            debug!(queue = %queue, consumer_tag = %tag, "Server-side consumer cancel with foreign tag");
            let _ = seat.cancel_tx.send(tag.to_string());
        }
    }

    /// Messages waiting in a queue (pending, not yet delivered).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.core
            .queues
            .lock()
            .get(queue)
            .map(|state| state.pending.len())
            .unwrap_or(0)
    }

    /// Drain and return the bodies currently pending in a queue.
    pub fn drain_queue(&self, queue: &str) -> Vec<Bytes> {
        let mut queues = self.core.queues.lock();
        match queues.get_mut(queue) {
            Some(state) => state.pending.drain(..).map(|(_, body)| body).collect(),
            None => Vec::new(),
        }
    }

    pub fn declared_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.core.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn unacked_count(&self) -> usize {
        self.core.unacked.lock().len()
    }

    pub fn confirmed_count(&self) -> u64 {
        self.core.confirmed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let (close_tx, _) = broadcast::channel(8);
        let (cancel_tx, _) = broadcast::channel(8);
        let closed = Arc::new(AtomicBool::new(false));

        self.core.channels.lock().push(ChannelHandle {
            closed: closed.clone(),
            close_tx: close_tx.clone(),
        });

        Ok(Arc::new(MemoryChannel {
            core: self.core.clone(),
            closed,
            close_tx,
            cancel_tx,
            prefetch: AtomicUsize::new(DEFAULT_PREFETCH),
            confirming: AtomicBool::new(false),
        }))
    }

    fn on_close(&self) -> broadcast::Receiver<String> {
        self.core.conn_close_tx.subscribe()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        for handle in self.core.channels.lock().drain(..) {
            handle.closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryChannel {
    core: Arc<BrokerCore>,
    closed: Arc<AtomicBool>,
    close_tx: broadcast::Sender<String>,
    cancel_tx: broadcast::Sender<String>,
    prefetch: AtomicUsize,
    confirming: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed("channel is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default();
        trace!(queue = %queue, "Declared queue");
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.prefetch
            .store((prefetch as usize).max(1), Ordering::SeqCst);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: &ConsumeOptions,
    ) -> Result<mpsc::Receiver<RawDelivery>, BrokerError> {
        self.ensure_open()?;

        let capacity = self.prefetch.load(Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(capacity);

        {
            let mut queues = self.core.queues.lock();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    reason: "no such queue".to_string(),
                })?;
            state.consumer = Some(ConsumerSeat {
                tag: consumer_tag.to_string(),
                tx,
                cancel_tx: self.cancel_tx.clone(),
            });
        }

        self.core.pump(queue);
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer registered");
        Ok(rx)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut queues = self.core.queues.lock();
        for state in queues.values_mut() {
            let matches = state
                .consumer
                .as_ref()
                .map(|seat| seat.tag == consumer_tag)
                .unwrap_or(false);
            if matches {
                state.consumer = None;
            }
        }
        Ok(())
    }

    async fn publish(&self, publishing: &Publishing, mandatory: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let routable = {
            let mut queues = self.core.queues.lock();
            match queues.get_mut(&publishing.routing_key) {
                Some(state) => {
                    let tag = self.core.tag_seq.fetch_add(1, Ordering::SeqCst);
                    state.pending.push_back((tag, publishing.body.clone()));
                    true
                }
                None => false,
            }
        };

        if !routable {
            if mandatory {
                return Err(BrokerError::Unroutable(publishing.routing_key.clone()));
            }
            return Ok(());
        }

        self.core.pump(&publishing.routing_key);

        if self.confirming.load(Ordering::SeqCst) {
            self.core.confirmed.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    async fn confirm_mode(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.confirming.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::AckFailed {
                delivery_tag,
                reason: "channel is closed".to_string(),
            });
        }

        let queue = self
            .core
            .unacked
            .lock()
            .remove(&delivery_tag)
            .map(|(queue, _)| queue);

        match queue {
            Some(queue) => {
                // An ack frees a slot in the prefetch window
                self.core.pump(&queue);
                Ok(())
            }
            None => Err(BrokerError::AckFailed {
                delivery_tag,
                reason: "unknown delivery tag".to_string(),
            }),
        }
    }

    fn on_close(&self) -> broadcast::Receiver<String> {
        self.close_tx.subscribe()
    }

    fn on_cancel(&self) -> broadcast::Receiver<String> {
        self.cancel_tx.subscribe()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
