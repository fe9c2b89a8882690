pub mod jobs;
pub mod memory;
pub mod queue;
pub mod strategy;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::cli::config::QueueSettings;
use crate::crawler::task::CrawlRequest;

// Re-export common types
pub use jobs::{JobStore, JobStoreFactory};
pub use memory::MemoryQueue;
pub use queue::RedisQueue;
pub use strategy::QueueStrategy;

/// Counts reported by a queue backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Storage contract shared by every request queue backend.
///
/// A unique key lives in exactly one of pending, processing, completed or
/// failed. Adding a key that is in any of them is a no-op.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short name used in logs
    fn backend_name(&self) -> &'static str;

    /// Insert a request; returns false when the key was already seen
    async fn add_request(&self, request: CrawlRequest) -> Result<bool>;

    /// Atomically remove and return the lowest-scored pending request
    async fn fetch_next(&self) -> Result<Option<CrawlRequest>>;

    /// Put an in-flight request back into the pending set with a new score
    async fn reclaim_request(&self, request: CrawlRequest) -> Result<()>;

    /// Move a key into the completed set
    async fn mark_completed(&self, unique_key: &str) -> Result<()>;

    /// Move a key into the failed set, recording the error message
    async fn mark_failed(&self, unique_key: &str, error: &str) -> Result<()>;

    /// Move every processing key back into the pending set with a new score.
    ///
    /// Called before dispatch starts, when nothing of this queue can be in
    /// flight. Returns how many requests were requeued.
    async fn recover_in_flight(&self) -> Result<usize>;

    /// Whether the key is pending, processing, completed or failed
    async fn was_already_processed(&self, unique_key: &str) -> Result<bool>;

    /// Current counts
    async fn get_stats(&self) -> Result<QueueStats>;

    /// Drop every entry for this queue
    async fn clear(&self) -> Result<()>;
}

/// Request queue handle used by the crawler; agnostic of the active backend
#[derive(Clone)]
pub struct RequestQueue {
    backend: Arc<dyn QueueBackend>,
}

impl RequestQueue {
    /// Wrap an existing backend
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// In-memory queue, mostly for tests and store-less environments
    pub fn in_memory(strategy: QueueStrategy) -> Self {
        Self::new(Arc::new(MemoryQueue::new(strategy)))
    }

    /// Open the configured queue, falling back to memory when Redis is unreachable
    pub async fn open(settings: &QueueSettings, queue_name: &str, strategy: QueueStrategy) -> Self {
        if settings.backend == "memory" {
            info!("Using in-memory request queue for {}", queue_name);
            return Self::in_memory(strategy);
        }

        match RedisQueue::connect(settings, queue_name, strategy).await {
            Ok(queue) => {
                info!("Using Redis request queue at {} for {}", settings.redis_url, queue_name);
                Self::new(Arc::new(queue))
            }
            Err(e) => {
                warn!("Redis queue unavailable ({:#}), falling back to in-memory queue", e);
                Self::in_memory(strategy)
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub async fn add_request(&self, request: CrawlRequest) -> Result<bool> {
        self.backend.add_request(request).await
    }

    /// Add a batch, returning how many were actually inserted
    pub async fn add_requests(&self, requests: Vec<CrawlRequest>) -> Result<usize> {
        let mut added = 0;
        for request in requests {
            if self.backend.add_request(request).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub async fn fetch_next(&self) -> Result<Option<CrawlRequest>> {
        self.backend.fetch_next().await
    }

    pub async fn reclaim_request(&self, request: CrawlRequest) -> Result<()> {
        self.backend.reclaim_request(request).await
    }

    pub async fn mark_completed(&self, unique_key: &str) -> Result<()> {
        self.backend.mark_completed(unique_key).await
    }

    pub async fn mark_failed(&self, unique_key: &str, error: &str) -> Result<()> {
        self.backend.mark_failed(unique_key, error).await
    }

    pub async fn recover_in_flight(&self) -> Result<usize> {
        self.backend.recover_in_flight().await
    }

    pub async fn was_already_processed(&self, unique_key: &str) -> Result<bool> {
        self.backend.was_already_processed(unique_key).await
    }

    pub async fn get_stats(&self) -> Result<QueueStats> {
        self.backend.get_stats().await
    }

    /// True when nothing is waiting to be dispatched
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.get_stats().await?.pending == 0)
    }

    /// True when nothing is waiting and nothing is in flight
    pub async fn is_finished(&self) -> Result<bool> {
        let stats = self.get_stats().await?;
        Ok(stats.pending == 0 && stats.processing == 0)
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }
}
