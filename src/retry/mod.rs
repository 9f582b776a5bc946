//! Retry executor used by every broker operation and every store write
//!
//! A [`Retrier`] runs a unit of work repeatedly until it reports success, a
//! permanent failure, attempt exhaustion, or the retrier is stopped. Waits
//! between attempts are drawn from a jittered [`RetrySchedule`] and always
//! race the stop signal, so shutdown latency stays bounded.

mod backoff;
mod error;

pub use backoff::RetrySchedule;
pub use error::RetryError;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Outcome reported by a retried unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    /// The operation succeeded.
    Succeed,
    /// The operation failed transiently and should be repeated.
    NeedRetry,
    /// The operation failed permanently; do not repeat it.
    Failed,
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (None for unbounded)
    pub max_attempts: Option<u32>,
    /// Ordered backoff schedule
    pub schedule: RetrySchedule,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            schedule: RetrySchedule::default(),
        }
    }
}

impl RetryConfig {
    pub fn new(schedule: Vec<Duration>, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            schedule: RetrySchedule::new(schedule),
        }
    }
}

/// Retry executor
///
/// Many independent sessions may run concurrently on one retrier; each has
/// an isolated attempt counter. `stop()` broadcast-aborts every in-flight
/// wait and makes subsequent `run` calls fail fast.
pub struct Retrier {
    config: RetryConfig,
    id_seq: AtomicU64,
    attempts: Mutex<HashMap<u64, u32>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            id_seq: AtomicU64::new(1),
            attempts: Mutex::new(HashMap::new()),
            stop_tx,
            stop_rx,
        }
    }

    /// Execute `work` until it reports [`RetryStatus::Succeed`], a terminal
    /// failure, attempt exhaustion, or the retrier is stopped.
    pub async fn run<F, Fut>(&self, mut work: F) -> Result<(), RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RetryStatus>,
    {
        if *self.stop_rx.borrow() {
            return Err(RetryError::Stopped);
        }

        let id = self.id_seq.fetch_add(1, Ordering::Relaxed);

        loop {
            let status = work().await;

            let attempt = {
                let mut attempts = self.attempts.lock();
                let counter = attempts.entry(id).or_insert(0);
                *counter += 1;
                *counter
            };

            trace!(session = id, attempt = attempt, status = ?status, "Attempt finished");

            match status {
                RetryStatus::Succeed => {
                    self.clear_session(id);
                    debug!(session = id, attempts = attempt, "Operation succeeded");
                    return Ok(());
                }
                RetryStatus::Failed => {
                    self.clear_session(id);
                    return Err(RetryError::Failed(
                        "operation reported a permanent failure".to_string(),
                    ));
                }
                RetryStatus::NeedRetry => {
                    if let Some(max) = self.config.max_attempts {
                        if attempt >= max {
                            self.clear_session(id);
                            warn!(session = id, attempts = attempt, "Attempts exhausted");
                            return Err(RetryError::MaxAttempts(attempt));
                        }
                    }

                    let delay = self.config.schedule.jittered_delay(attempt);
                    let mut stop = self.stop_rx.clone();

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => {
                            self.clear_session(id);
                            debug!(session = id, "Retry wait interrupted by stop signal");
                            return Err(RetryError::Stopped);
                        }
                    }
                }
            }
        }
    }

    /// Stop all retries. Idempotent; in-flight waits abort immediately and
    /// subsequent `run` calls fail fast with [`RetryError::Stopped`].
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Number of sessions currently holding an attempt counter.
    pub fn active_sessions(&self) -> usize {
        self.attempts.lock().len()
    }

    fn clear_session(&self, id: u64) {
        self.attempts.lock().remove(&id);
    }
}
