//! Analytical store boundary
//!
//! The writer talks to the store exclusively through these traits: begin a
//! transaction, prepare one parameterized statement, execute it once per
//! row, commit. Per-row execute failures must not poison the transaction;
//! implementations are expected to keep accepting `exec` calls after a
//! failed one so the remaining rows in a batch can still land.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;
use crate::message::ScalarValue;

/// Batch-oriented analytical store
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Liveness probe against the store.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Open a new transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// One open store transaction
///
/// Holds exactly one prepared statement at a time; `commit` and `rollback`
/// consume the transaction.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Prepare the parameterized statement all subsequent `exec` calls use.
    async fn prepare(&mut self, query: &str) -> Result<(), StoreError>;

    /// Execute the prepared statement with one row of arguments.
    async fn exec(&mut self, args: &[ScalarValue]) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Probe the store with a fixed number of pings before declaring it
/// unreachable. Used at startup and by health checks.
pub async fn is_accessible(store: &Arc<dyn BatchStore>, attempts: u32, interval: Duration) -> bool {
    for attempt in 1..=attempts.max(1) {
        match store.ping().await {
            Ok(()) => return true,
            Err(e) => {
                debug!(attempt, error = %e, "Store ping failed");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    false
}
