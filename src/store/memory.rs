//! In-memory store implementation
//!
//! Functional stand-in for a real analytical store, used in tests and local
//! runs. Committed rows are kept per query text, so tests can assert on
//! exactly which statement a row landed under.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use super::{BatchStore, StoreTransaction};
use crate::error::StoreError;
use crate::message::ScalarValue;

#[derive(Default)]
struct StoreCore {
    tables: RwLock<HashMap<String, Vec<Vec<ScalarValue>>>>,
    begin_count: AtomicUsize,
    commit_count: AtomicUsize,
    unreachable: AtomicBool,
}

/// In-memory [`BatchStore`] with inspection helpers for tests
#[derive(Clone, Default)]
pub struct InMemoryBatchStore {
    core: Arc<StoreCore>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose pings always fail.
    pub fn unreachable() -> Self {
        let store = Self::default();
        store.core.unreachable.store(true, Ordering::SeqCst);
        store
    }

    /// Rows committed under the given query text.
    pub async fn rows(&self, query: &str) -> Vec<Vec<ScalarValue>> {
        self.core
            .tables
            .read()
            .await
            .get(query)
            .cloned()
            .unwrap_or_default()
    }

    /// Total rows committed across all queries.
    pub async fn total_rows(&self) -> usize {
        self.core
            .tables
            .read()
            .await
            .values()
            .map(|rows| rows.len())
            .sum()
    }

    /// How many transactions have been opened.
    pub fn begin_count(&self) -> usize {
        self.core.begin_count.load(Ordering::SeqCst)
    }

    /// How many transactions have committed.
    pub fn commit_count(&self) -> usize {
        self.core.commit_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.core.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Ping("store unreachable".to_string()));
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        if self.core.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Begin("store unreachable".to_string()));
        }
        self.core.begin_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            core: self.core.clone(),
            query: None,
            staged: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    core: Arc<StoreCore>,
    query: Option<String>,
    staged: Vec<Vec<ScalarValue>>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn prepare(&mut self, query: &str) -> Result<(), StoreError> {
        if query.trim().is_empty() {
            return Err(StoreError::Prepare {
                query: query.to_string(),
                reason: "empty statement".to_string(),
            });
        }
        // Catches truncated statements like "INSERT INTO t VALUES (?"
        let open = query.matches('(').count();
        let close = query.matches(')').count();
        if open != close {
            return Err(StoreError::Prepare {
                query: query.to_string(),
                reason: "unbalanced parentheses".to_string(),
            });
        }
        self.query = Some(query.to_string());
        Ok(())
    }

    async fn exec(&mut self, args: &[ScalarValue]) -> Result<(), StoreError> {
        if self.query.is_none() {
            return Err(StoreError::Exec("no prepared statement".to_string()));
        }
        self.staged.push(args.to_vec());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let query = match self.query {
            Some(query) => query,
            None => return Ok(()),
        };
        let staged = self.staged;
        trace!(query = %query, rows = staged.len(), "Committing staged rows");
        self.core
            .tables
            .write()
            .await
            .entry(query)
            .or_default()
            .extend(staged);
        self.core.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
