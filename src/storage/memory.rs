use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::crawler::task::CrawlRequest;
use crate::storage::{QueueBackend, QueueStats};
use crate::storage::strategy::QueueStrategy;

/// Process-local request queue with the same semantics as the Redis backend.
///
/// Requests live in a flat map keyed by unique key; the ordered index only
/// references keys. State is lost on restart.
pub struct MemoryQueue {
    strategy: QueueStrategy,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    /// Pending and processing payloads by unique key
    requests: HashMap<String, CrawlRequest>,

    /// (score, insertion index) -> unique key, pending only
    index: BTreeMap<(i64, u64), String>,

    processing: HashSet<String>,
    completed: HashSet<String>,

    /// Failed keys with their last error
    failed: HashMap<String, String>,

    /// Monotonic insertion counter
    counter: u64,
}

impl MemoryState {
    fn seen(&self, key: &str) -> bool {
        self.requests.contains_key(key) || self.completed.contains(key) || self.failed.contains_key(key)
    }

    fn enqueue(&mut self, strategy: QueueStrategy, key: String) {
        let insertion = self.counter;
        self.counter += 1;
        self.index.insert((strategy.score(insertion), insertion), key);
    }

    /// Remove a key from whichever active set holds it
    fn deactivate(&mut self, key: &str) {
        if !self.processing.remove(key) {
            self.index.retain(|_, k| k.as_str() != key);
        }
        self.requests.remove(key);
    }
}

impl MemoryQueue {
    pub fn new(strategy: QueueStrategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn add_request(&self, request: CrawlRequest) -> Result<bool> {
        let mut state = self.state.lock().await;

        if state.seen(&request.unique_key) {
            debug!("Skipping already seen request: {}", request.unique_key);
            return Ok(false);
        }

        let key = request.unique_key.clone();
        state.requests.insert(key.clone(), request);
        state.enqueue(self.strategy, key);

        Ok(true)
    }

    async fn fetch_next(&self) -> Result<Option<CrawlRequest>> {
        let mut state = self.state.lock().await;

        while let Some((_, key)) = state.index.pop_first() {
            if let Some(request) = state.requests.get(&key).cloned() {
                state.processing.insert(key);
                return Ok(Some(request));
            }
        }

        Ok(None)
    }

    async fn reclaim_request(&self, request: CrawlRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = request.unique_key.clone();

        if !state.processing.remove(&key) {
            debug!("Reclaimed request was not in flight: {}", key);
            if state.seen(&key) {
                return Ok(());
            }
        }

        state.requests.insert(key.clone(), request);
        state.enqueue(self.strategy, key);

        Ok(())
    }

    async fn mark_completed(&self, unique_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.deactivate(unique_key);
        state.failed.remove(unique_key);
        state.completed.insert(unique_key.to_string());
        Ok(())
    }

    async fn mark_failed(&self, unique_key: &str, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.deactivate(unique_key);
        state.failed.insert(unique_key.to_string(), error.to_string());
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let keys: Vec<String> = state.processing.drain().collect();

        let mut recovered = 0;
        for key in keys {
            if state.requests.contains_key(&key) {
                debug!("Requeued interrupted request: {}", key);
                state.enqueue(self.strategy, key);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn was_already_processed(&self, unique_key: &str) -> Result<bool> {
        Ok(self.state.lock().await.seen(unique_key))
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let pending = state.index.len();
        let processing = state.processing.len();
        let completed = state.completed.len();
        let failed = state.failed.len();

        Ok(QueueStats {
            pending,
            processing,
            completed,
            failed,
            total: pending + processing + completed + failed,
        })
    }

    async fn clear(&self) -> Result<()> {
        *self.state.lock().await = MemoryState::default();
        Ok(())
    }
}
