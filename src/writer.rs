//! Batching writer: the consume side of the relay
//!
//! Accumulates decoded write requests into per-query batches and flushes
//! each batch inside one store transaction, either when it reaches the
//! configured size or when the flush timer fires. Rows that fail to execute
//! are isolated and dead-lettered; the rest of the batch still commits.
//! Every delivery is acknowledged exactly once, after its batch resolves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::broker::producer::ConfirmingProducer;
use crate::broker::{Delivery, Publishing};
use crate::message::{ScalarValue, WriteRequest};
use crate::monitoring::{emit, ErrorNotifier, RelayEvent};
use crate::retry::{Retrier, RetryConfig, RetryStatus};
use crate::store::{BatchStore, StoreTransaction};

/// Configuration for the batching writer
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush a query's batch once it holds this many rows
    pub batch_size: usize,
    /// Flush every accumulated batch at this period regardless of size
    pub flush_period: Duration,
    /// Routing key undeliverable messages are forwarded to
    pub failed_routing_key: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_period: Duration::from_secs(1),
            failed_routing_key: "failed".to_string(),
        }
    }
}

/// Writer that drains a delivery stream into the store in batches
pub struct BatchingWriter {
    config: WriterConfig,
    store: Arc<dyn BatchStore>,
    producer: Arc<ConfirmingProducer>,
    retrier: Retrier,
    notifier: Arc<dyn ErrorNotifier>,
    events_tx: Option<mpsc::Sender<RelayEvent>>,
}

impl BatchingWriter {
    pub fn new(
        store: Arc<dyn BatchStore>,
        producer: Arc<ConfirmingProducer>,
        config: WriterConfig,
        retry_config: RetryConfig,
        notifier: Arc<dyn ErrorNotifier>,
    ) -> Self {
        Self {
            config,
            store,
            producer,
            retrier: Retrier::new(retry_config),
            notifier,
            events_tx: None,
        }
    }

    /// Emit monitoring events on the given channel.
    pub fn with_events(mut self, tx: mpsc::Sender<RelayEvent>) -> Self {
        self.events_tx = Some(tx);
        self
    }

    /// Abort in-flight store retries, letting `run` wind down even when the
    /// store is unreachable.
    pub fn stop(&self) {
        self.retrier.stop();
    }

    /// Probe the store before relying on it.
    pub async fn is_accessible(&self) -> bool {
        crate::store::is_accessible(&self.store, 10, Duration::from_secs(1)).await
    }

    /// Drain the delivery stream until it closes. The stream closing is the
    /// shutdown signal: remaining batches are flushed before returning.
    pub async fn run(&self, mut deliveries: mpsc::Receiver<Delivery<WriteRequest>>) {
        let mut batches: HashMap<String, Vec<Delivery<WriteRequest>>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.flush_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = deliveries.recv() => match maybe {
                    Some(delivery) => self.handle(&mut batches, delivery).await,
                    None => {
                        self.flush_all(&mut batches).await;
                        break;
                    }
                },
                _ = ticker.tick() => self.flush_all(&mut batches).await,
            }
        }
        info!("Writer drained and exited");
    }

    async fn handle(
        &self,
        batches: &mut HashMap<String, Vec<Delivery<WriteRequest>>>,
        delivery: Delivery<WriteRequest>,
    ) {
        let query = match delivery.parsed() {
            Ok(request) => request.query.clone(),
            Err(e) => {
                let reason = e.to_string();
                debug!(error = %reason, "Undecodable message, dead-lettering");
                self.dead_letter(&delivery, &reason).await;
                self.ack(delivery).await;
                return;
            }
        };

        let batch = batches.entry(query.clone()).or_default();
        batch.push(delivery);
        if batch.len() >= self.config.batch_size {
            let entries = batches.remove(&query).unwrap_or_default();
            self.flush_query(&query, entries).await;
        }
    }

    async fn flush_all(&self, batches: &mut HashMap<String, Vec<Delivery<WriteRequest>>>) {
        for (query, entries) in batches.drain() {
            self.flush_query(&query, entries).await;
        }
    }

    /// Flush one query's batch in a single transaction.
    ///
    /// Rows already marked failed are skipped on retry, so a commit retry
    /// only replays the rows that have a chance of landing.
    async fn flush_query(&self, query: &str, entries: Vec<Delivery<WriteRequest>>) {
        if entries.is_empty() {
            return;
        }
        let start = Instant::now();

        let rows: Arc<Vec<Vec<ScalarValue>>> = Arc::new(
            entries
                .iter()
                .map(|d| d.parsed().map(|r| r.store_args()).unwrap_or_default())
                .collect(),
        );
        let failed: Arc<Vec<AtomicBool>> =
            Arc::new((0..entries.len()).map(|_| AtomicBool::new(false)).collect());

        let store = self.store.clone();
        let notifier = self.notifier.clone();
        let query_owned = query.to_string();

        let result = self
            .retrier
            .run(|| {
                let store = store.clone();
                let rows = rows.clone();
                let failed = failed.clone();
                let notifier = notifier.clone();
                let query = query_owned.clone();
                async move { Self::exec_batch(store, &query, &rows, &failed, notifier).await }
            })
            .await;

        if let Err(e) = result {
            // Retries exhausted or stopped: nothing landed, everything goes
            // to the dead-letter destination
            self.notifier
                .notify(anyhow!("batch for {} abandoned: {}", query, e));
            for mark in failed.iter() {
                mark.store(true, Ordering::SeqCst);
            }
        }

        let mut stored = 0;
        let mut dead = 0;
        for (i, delivery) in entries.into_iter().enumerate() {
            if failed[i].load(Ordering::SeqCst) {
                dead += 1;
                self.dead_letter(&delivery, "store write failed").await;
            } else {
                stored += 1;
            }
            self.ack(delivery).await;
        }

        debug!(
            query = %query,
            stored,
            failed = dead,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch flushed"
        );
        emit(
            &self.events_tx,
            RelayEvent::batch_flushed(query.to_string(), stored, dead, start.elapsed()),
        );
    }

    async fn exec_batch(
        store: Arc<dyn BatchStore>,
        query: &str,
        rows: &[Vec<ScalarValue>],
        failed: &[AtomicBool],
        notifier: Arc<dyn ErrorNotifier>,
    ) -> RetryStatus {
        let mut tx: Box<dyn StoreTransaction> = match store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                notifier.notify(e.into());
                return RetryStatus::NeedRetry;
            }
        };

        if let Err(e) = tx.prepare(query).await {
            // A statement the store cannot prepare will never succeed;
            // the whole batch is undeliverable
            notifier.notify(e.into());
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Rollback after failed prepare");
            }
            for mark in failed {
                mark.store(true, Ordering::SeqCst);
            }
            return RetryStatus::Failed;
        }

        for (i, row) in rows.iter().enumerate() {
            if failed[i].load(Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = tx.exec(row).await {
                notifier.notify(e.into());
                failed[i].store(true, Ordering::SeqCst);
            }
        }

        if failed.iter().all(|mark| mark.load(Ordering::SeqCst)) {
            // Nothing survived; an empty commit would only hide that
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Rollback of fully failed batch");
            }
            return RetryStatus::Succeed;
        }

        match tx.commit().await {
            Ok(()) => RetryStatus::Succeed,
            Err(e) => {
                notifier.notify(e.into());
                RetryStatus::NeedRetry
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery<WriteRequest>, reason: &str) {
        let publishing =
            Publishing::persistent(self.config.failed_routing_key.clone(), delivery.body.clone());
        if let Err(e) = self.producer.send(publishing).await {
            self.notifier
                .notify(anyhow!("dead-letter forward failed: {}", e));
        }
        emit(&self.events_tx, RelayEvent::dead_lettered(reason.to_string()));
    }

    /// Acknowledge a delivery, tolerating ack failures. An un-acked message
    /// is redelivered after reconnect, which at-least-once semantics allow.
    async fn ack(&self, delivery: Delivery<WriteRequest>) {
        let tag = delivery.delivery_tag();
        if let Err(e) = delivery.ack().await {
            warn!(delivery_tag = tag, error = %e, "Ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::producer::ProducerConfig;
    use crate::broker::{
        BrokerChannel, BrokerConnection, ConsumeOptions, DeclareQueues, Destination,
    };
    use crate::store::memory::InMemoryBatchStore;
    use crate::test::mocks::{CollectingNotifier, ScriptedStore};
    use crate::test::request_body;
    use bytes::Bytes;
    use serde_json::json;

    const QUERY: &str = "INSERT INTO events VALUES (?, ?)";

    fn fast_retry(max_attempts: Option<u32>) -> RetryConfig {
        RetryConfig::new(vec![Duration::from_millis(10)], max_attempts)
    }

    fn test_producer(broker: &MemoryBroker) -> Arc<ConfirmingProducer> {
        let config = ProducerConfig {
            destinations: vec![Destination::new("failed", 0)
                .with_topology(Arc::new(DeclareQueues(vec![("failed".to_string(), 0)])))],
            mandatory: true,
            ..Default::default()
        };
        Arc::new(ConfirmingProducer::new(
            Arc::new(broker.clone()),
            config,
            fast_retry(None),
            Arc::new(CollectingNotifier::new()),
        ))
    }

    fn writer(
        store: Arc<dyn BatchStore>,
        producer: Arc<ConfirmingProducer>,
        config: WriterConfig,
        notifier: Arc<dyn ErrorNotifier>,
    ) -> Arc<BatchingWriter> {
        Arc::new(BatchingWriter::new(
            store,
            producer,
            config,
            fast_retry(Some(3)),
            notifier,
        ))
    }

    /// Publish bodies into a queue and consume them back as parsed
    /// deliveries, so acks go against real broker delivery tags.
    async fn deliveries(
        broker: &MemoryBroker,
        queue: &str,
        bodies: Vec<Bytes>,
    ) -> Vec<Delivery<WriteRequest>> {
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue(queue).await.unwrap();
        channel.qos(100).await.unwrap();
        let count = bodies.len();
        for body in bodies {
            channel
                .publish(&Publishing::persistent(queue, body), true)
                .await
                .unwrap();
        }
        let mut raw = channel
            .consume(queue, "test", &ConsumeOptions::default())
            .await
            .unwrap();

        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let r = raw.recv().await.unwrap();
            let parsed = WriteRequest::decode(&r.body);
            out.push(Delivery::new(r.body, parsed, r.delivery_tag, channel.clone()));
        }
        out
    }

    fn spawn_writer(
        w: Arc<BatchingWriter>,
    ) -> (
        mpsc::Sender<Delivery<WriteRequest>>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let handle = tokio::spawn(async move { w.run(rx).await });
        (tx, handle)
    }

    #[tokio::test]
    async fn test_flushes_when_batch_size_reached() {
        let broker = MemoryBroker::new();
        let store = InMemoryBatchStore::new();
        let producer = test_producer(&broker);
        let w = writer(
            Arc::new(store.clone()),
            producer.clone(),
            WriterConfig {
                batch_size: 2,
                flush_period: Duration::from_secs(60),
                ..Default::default()
            },
            Arc::new(CollectingNotifier::new()),
        );

        let bodies = vec![
            request_body(QUERY, vec![json!(1), json!("a")]),
            request_body(QUERY, vec![json!(2), json!("b")]),
        ];
        let (tx, handle) = spawn_writer(w);
        for d in deliveries(&broker, "in", bodies).await {
            tx.send(d).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        producer.close().await;

        assert_eq!(store.rows(QUERY).await.len(), 2);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("in"), 0);
    }

    #[tokio::test]
    async fn test_timer_flush_without_reaching_batch_size() {
        let broker = MemoryBroker::new();
        let store = InMemoryBatchStore::new();
        let producer = test_producer(&broker);
        let w = writer(
            Arc::new(store.clone()),
            producer.clone(),
            WriterConfig {
                batch_size: 100,
                flush_period: Duration::from_millis(50),
                ..Default::default()
            },
            Arc::new(CollectingNotifier::new()),
        );

        let bodies = vec![
            request_body(QUERY, vec![json!(1), json!("a")]),
            request_body(QUERY, vec![json!(2), json!("b")]),
            request_body(QUERY, vec![json!(3), json!("c")]),
        ];
        let (tx, handle) = spawn_writer(w);
        for d in deliveries(&broker, "in", bodies).await {
            tx.send(d).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.rows(QUERY).await.len(), 3);

        drop(tx);
        handle.await.unwrap();
        producer.close().await;
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_ticks_open_no_transactions() {
        let broker = MemoryBroker::new();
        let store = InMemoryBatchStore::new();
        let producer = test_producer(&broker);
        let w = writer(
            Arc::new(store.clone()),
            producer.clone(),
            WriterConfig {
                flush_period: Duration::from_millis(20),
                ..Default::default()
            },
            Arc::new(CollectingNotifier::new()),
        );

        let (tx, handle) = spawn_writer(w);
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(tx);
        handle.await.unwrap();
        producer.close().await;

        assert_eq!(store.begin_count(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_dead_lettered_and_acked() {
        let broker = MemoryBroker::new();
        let store = InMemoryBatchStore::new();
        let producer = test_producer(&broker);
        let w = writer(
            Arc::new(store.clone()),
            producer.clone(),
            WriterConfig::default(),
            Arc::new(CollectingNotifier::new()),
        );

        let bodies = vec![Bytes::from_static(b"not json at all")];
        let (tx, handle) = spawn_writer(w);
        for d in deliveries(&broker, "in", bodies).await {
            tx.send(d).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        producer.close().await;

        assert_eq!(broker.queue_depth("failed"), 1);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(store.begin_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_isolates_bad_rows() {
        let broker = MemoryBroker::new();
        let store = ScriptedStore::new();
        store.script_execs(vec![None, Some("type mismatch"), None]);
        let producer = test_producer(&broker);
        let notifier = Arc::new(CollectingNotifier::new());
        let w = writer(
            Arc::new(store.clone()),
            producer.clone(),
            WriterConfig::default(),
            notifier.clone(),
        );

        let bodies = vec![
            request_body(QUERY, vec![json!(1), json!("a")]),
            request_body(QUERY, vec![json!(2), json!("b")]),
            request_body(QUERY, vec![json!(3), json!("c")]),
        ];
        let (tx, handle) = spawn_writer(w);
        for d in deliveries(&broker, "in", bodies).await {
            tx.send(d).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        producer.close().await;

        // Two rows landed, one went to the dead-letter queue, all acked
        assert_eq!(store.rows(QUERY).len(), 2);
        assert_eq!(broker.queue_depth("failed"), 1);
        assert_eq!(broker.unacked_count(), 0);
        assert!(notifier.count() >= 1);
    }

    #[tokio::test]
    async fn test_prepare_failure_dead_letters_whole_batch_without_retry() {
        let broker = MemoryBroker::new();
        let store = ScriptedStore::new();
        store.fail_next_prepare("syntax error");
        let producer = test_producer(&broker);
        let w = writer(
            Arc::new(store.clone()),
            producer.clone(),
            WriterConfig::default(),
            Arc::new(CollectingNotifier::new()),
        );

        let bodies = vec![
            request_body(QUERY, vec![json!(1), json!("a")]),
            request_body(QUERY, vec![json!(2), json!("b")]),
        ];
        let (tx, handle) = spawn_writer(w);
        for d in deliveries(&broker, "in", bodies).await {
            tx.send(d).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        producer.close().await;

        assert_eq!(store.total_rows(), 0);
        // One transaction only: a prepare failure is not retried
        assert_eq!(store.begin_count(), 1);
        assert_eq!(broker.queue_depth("failed"), 2);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_retry_replays_surviving_rows() {
        let broker = MemoryBroker::new();
        let store = ScriptedStore::new();
        store.fail_next_commit("timeout");
        let producer = test_producer(&broker);
        let w = writer(
            Arc::new(store.clone()),
            producer.clone(),
            WriterConfig::default(),
            Arc::new(CollectingNotifier::new()),
        );

        let bodies = vec![
            request_body(QUERY, vec![json!(1), json!("a")]),
            request_body(QUERY, vec![json!(2), json!("b")]),
        ];
        let (tx, handle) = spawn_writer(w);
        for d in deliveries(&broker, "in", bodies).await {
            tx.send(d).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        producer.close().await;

        // Second attempt commits both rows
        assert_eq!(store.rows(QUERY).len(), 2);
        assert_eq!(store.begin_count(), 2);
        assert_eq!(broker.queue_depth("failed"), 0);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_everything() {
        let broker = MemoryBroker::new();
        let store = ScriptedStore::new();
        for _ in 0..5 {
            store.fail_next_commit("store down");
        }
        let producer = test_producer(&broker);
        let w = writer(
            Arc::new(store.clone()),
            producer.clone(),
            WriterConfig::default(),
            Arc::new(CollectingNotifier::new()),
        );

        let bodies = vec![
            request_body(QUERY, vec![json!(1), json!("a")]),
            request_body(QUERY, vec![json!(2), json!("b")]),
        ];
        let (tx, handle) = spawn_writer(w);
        for d in deliveries(&broker, "in", bodies).await {
            tx.send(d).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        producer.close().await;

        assert_eq!(store.total_rows(), 0);
        assert_eq!(store.begin_count(), 3);
        assert_eq!(broker.queue_depth("failed"), 2);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_batches_are_per_query() {
        let broker = MemoryBroker::new();
        let store = InMemoryBatchStore::new();
        let producer = test_producer(&broker);
        let w = writer(
            Arc::new(store.clone()),
            producer.clone(),
            WriterConfig::default(),
            Arc::new(CollectingNotifier::new()),
        );

        let other = "INSERT INTO metrics VALUES (?)";
        let bodies = vec![
            request_body(QUERY, vec![json!(1), json!("a")]),
            request_body(other, vec![json!(9)]),
            request_body(QUERY, vec![json!(2), json!("b")]),
        ];
        let (tx, handle) = spawn_writer(w);
        for d in deliveries(&broker, "in", bodies).await {
            tx.send(d).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        producer.close().await;

        assert_eq!(store.rows(QUERY).await.len(), 2);
        assert_eq!(store.rows(other).await.len(), 1);
    }
}
