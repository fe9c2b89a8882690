use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, Context};
use async_trait::async_trait;
use redis::{Client, aio::MultiplexedConnection};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::QueueSettings;
use crate::crawler::task::CrawlRequest;
use crate::storage::{QueueBackend, QueueStats};
use crate::storage::strategy::QueueStrategy;

/// Redis key layout for one named queue
#[derive(Debug, Clone)]
struct QueueKeys {
    /// Sorted set of (score, serialized request)
    queue: String,
    /// Hash of unique key -> serialized request for pending and processing entries
    data: String,
    processing: String,
    completed: String,
    failed: String,
    /// Hash of unique key -> last error message
    errors: String,
    /// Monotonic insertion counter
    counter: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue_name: &str) -> Self {
        let base = format!("{}:{}", prefix, queue_name);
        Self {
            queue: format!("{}:queue", base),
            data: format!("{}:data", base),
            processing: format!("{}:processing", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
            errors: format!("{}:errors", base),
            counter: format!("{}:counter", base),
        }
    }

    fn all(&self) -> [&str; 7] {
        [
            &self.queue,
            &self.data,
            &self.processing,
            &self.completed,
            &self.failed,
            &self.errors,
            &self.counter,
        ]
    }
}

/// Durable request queue backed by Redis sorted sets.
///
/// Ordering survives restarts because both the scores and the insertion
/// counter live in Redis.
pub struct RedisQueue {
    /// Task TTL in seconds
    task_ttl: u64,

    /// Shared multiplexed connection
    conn_pool: Arc<Mutex<MultiplexedConnection>>,

    keys: QueueKeys,

    strategy: QueueStrategy,
}

impl RedisQueue {
    /// Connect to Redis and verify the connection with a PING
    pub async fn connect(config: &QueueSettings, queue_name: &str, strategy: QueueStrategy) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Invalid Redis URL {}", config.redis_url))?;

        let connect = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        };

        let conn = tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
            .await
            .context(format!("Timed out connecting to Redis at {}", config.redis_url))?
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        Ok(Self {
            task_ttl: config.task_ttl,
            conn_pool: Arc::new(Mutex::new(conn)),
            keys: QueueKeys::new(&config.key_prefix, queue_name),
            strategy,
        })
    }

    /// Set TTL on a key if not already set
    async fn ensure_ttl(&self, conn: &mut MultiplexedConnection, key: &str) -> Result<()> {
        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(conn)
            .await
            .unwrap_or(-1);

        if ttl == -1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(self.task_ttl)
                .query_async::<_, ()>(conn)
                .await
                .context(format!("Failed to set TTL on {}", key))?;
        }

        Ok(())
    }

    async fn is_terminal(&self, conn: &mut MultiplexedConnection, unique_key: &str) -> Result<bool> {
        let (completed, failed): (bool, bool) = redis::pipe()
            .cmd("SISMEMBER").arg(&self.keys.completed).arg(unique_key)
            .cmd("SISMEMBER").arg(&self.keys.failed).arg(unique_key)
            .query_async(conn)
            .await
            .context("Failed to check terminal sets")?;

        Ok(completed || failed)
    }

    /// Serialized request stored for a pending or processing key
    async fn stored_payload(&self, conn: &mut MultiplexedConnection, unique_key: &str) -> Result<Option<String>> {
        redis::cmd("HGET")
            .arg(&self.keys.data)
            .arg(unique_key)
            .query_async(conn)
            .await
            .context("Failed to read request payload")
    }

    async fn push_scored(&self, conn: &mut MultiplexedConnection, payload: &str) -> Result<()> {
        let insertion: u64 = redis::cmd("INCR")
            .arg(&self.keys.counter)
            .query_async(conn)
            .await
            .context("Failed to increment insertion counter")?;

        // INCR starts at 1, scores start at 0
        let score = self.strategy.score(insertion - 1);

        redis::cmd("ZADD")
            .arg(&self.keys.queue)
            .arg(score)
            .arg(payload)
            .query_async::<_, ()>(conn)
            .await
            .context("Failed to push request to Redis queue")?;

        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn add_request(&self, request: CrawlRequest) -> Result<bool> {
        let payload = serde_json::to_string(&request)
            .context("Failed to serialize request")?;

        let mut conn = self.conn_pool.lock().await;

        if self.is_terminal(&mut conn, &request.unique_key).await? {
            debug!("Skipping already processed request: {}", request.unique_key);
            return Ok(false);
        }

        // HSETNX is the dedup guard for pending and processing keys
        let inserted: bool = redis::cmd("HSETNX")
            .arg(&self.keys.data)
            .arg(&request.unique_key)
            .arg(&payload)
            .query_async(&mut *conn)
            .await
            .context("Failed to store request payload")?;

        if !inserted {
            debug!("Skipping request already queued: {}", request.unique_key);
            return Ok(false);
        }

        self.push_scored(&mut conn, &payload).await?;
        self.ensure_ttl(&mut conn, &self.keys.queue).await?;
        self.ensure_ttl(&mut conn, &self.keys.data).await?;

        debug!("Pushed request to queue: {}", request.url);

        Ok(true)
    }

    async fn fetch_next(&self) -> Result<Option<CrawlRequest>> {
        let mut conn = self.conn_pool.lock().await;

        loop {
            // ZPOPMIN replies with [member, score]
            let popped: Vec<String> = redis::cmd("ZPOPMIN")
                .arg(&self.keys.queue)
                .arg(1)
                .query_async(&mut *conn)
                .await
                .context("Failed to pop request from Redis queue")?;

            let Some(payload) = popped.into_iter().next() else {
                return Ok(None);
            };

            let request: CrawlRequest = serde_json::from_str(&payload)
                .context("Failed to deserialize request")?;

            // Entries completed while still pending leave a stale member behind
            let live: bool = redis::cmd("HEXISTS")
                .arg(&self.keys.data)
                .arg(&request.unique_key)
                .query_async(&mut *conn)
                .await
                .context("Failed to check request payload")?;

            if !live {
                debug!("Dropping stale queue entry: {}", request.unique_key);
                continue;
            }

            redis::cmd("SADD")
                .arg(&self.keys.processing)
                .arg(&request.unique_key)
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to add request to processing set")?;
            self.ensure_ttl(&mut conn, &self.keys.processing).await?;

            debug!("Popped request from queue: {}", request.url);

            return Ok(Some(request));
        }
    }

    async fn reclaim_request(&self, request: CrawlRequest) -> Result<()> {
        let payload = serde_json::to_string(&request)
            .context("Failed to serialize request")?;

        let mut conn = self.conn_pool.lock().await;

        let was_processing: bool = redis::cmd("SREM")
            .arg(&self.keys.processing)
            .arg(&request.unique_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to remove request from processing set")?;

        if !was_processing {
            debug!("Reclaimed request was not in flight: {}", request.unique_key);
            return Ok(());
        }

        redis::cmd("HSET")
            .arg(&self.keys.data)
            .arg(&request.unique_key)
            .arg(&payload)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to update request payload")?;

        self.push_scored(&mut conn, &payload).await?;

        debug!("Reclaimed request: {} (retry {})", request.url, request.retry_count);

        Ok(())
    }

    async fn mark_completed(&self, unique_key: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;
        let payload = self.stored_payload(&mut conn, unique_key).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(payload) = &payload {
            pipe.cmd("ZREM").arg(&self.keys.queue).arg(payload).ignore();
        }
        pipe.cmd("SREM").arg(&self.keys.processing).arg(unique_key).ignore()
            .cmd("HDEL").arg(&self.keys.data).arg(unique_key).ignore()
            .cmd("SREM").arg(&self.keys.failed).arg(unique_key).ignore()
            .cmd("SADD").arg(&self.keys.completed).arg(unique_key).ignore()
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to mark request as completed")?;

        self.ensure_ttl(&mut conn, &self.keys.completed).await?;

        debug!("Marked request as completed: {}", unique_key);

        Ok(())
    }

    async fn mark_failed(&self, unique_key: &str, error: &str) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;
        let payload = self.stored_payload(&mut conn, unique_key).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(payload) = &payload {
            pipe.cmd("ZREM").arg(&self.keys.queue).arg(payload).ignore();
        }
        pipe.cmd("SREM").arg(&self.keys.processing).arg(unique_key).ignore()
            .cmd("HDEL").arg(&self.keys.data).arg(unique_key).ignore()
            .cmd("SADD").arg(&self.keys.failed).arg(unique_key).ignore()
            .cmd("HSET").arg(&self.keys.errors).arg(unique_key).arg(error).ignore()
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to mark request as failed")?;

        self.ensure_ttl(&mut conn, &self.keys.failed).await?;
        self.ensure_ttl(&mut conn, &self.keys.errors).await?;

        debug!("Marked request as failed: {}", unique_key);

        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<usize> {
        let mut conn = self.conn_pool.lock().await;

        let keys: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&self.keys.processing)
            .query_async(&mut *conn)
            .await
            .context("Failed to list processing set")?;

        let mut recovered = 0;
        for unique_key in keys {
            let Some(payload) = self.stored_payload(&mut conn, &unique_key).await? else {
                // No payload left to requeue
                redis::cmd("SREM")
                    .arg(&self.keys.processing)
                    .arg(&unique_key)
                    .query_async::<_, ()>(&mut *conn)
                    .await
                    .context("Failed to remove request from processing set")?;
                continue;
            };

            let insertion: u64 = redis::cmd("INCR")
                .arg(&self.keys.counter)
                .query_async(&mut *conn)
                .await
                .context("Failed to increment insertion counter")?;

            redis::pipe()
                .atomic()
                .cmd("SREM").arg(&self.keys.processing).arg(&unique_key).ignore()
                .cmd("ZADD").arg(&self.keys.queue).arg(self.strategy.score(insertion - 1)).arg(&payload).ignore()
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to requeue in-flight request")?;

            debug!("Requeued interrupted request: {}", unique_key);
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn was_already_processed(&self, unique_key: &str) -> Result<bool> {
        let mut conn = self.conn_pool.lock().await;

        if self.is_terminal(&mut conn, unique_key).await? {
            return Ok(true);
        }

        let queued: bool = redis::cmd("HEXISTS")
            .arg(&self.keys.data)
            .arg(unique_key)
            .query_async(&mut *conn)
            .await
            .context("Failed to check request payload")?;

        Ok(queued)
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn_pool.lock().await;

        let (pending, processing, completed, failed): (usize, usize, usize, usize) = redis::pipe()
            .cmd("ZCARD").arg(&self.keys.queue)
            .cmd("SCARD").arg(&self.keys.processing)
            .cmd("SCARD").arg(&self.keys.completed)
            .cmd("SCARD").arg(&self.keys.failed)
            .query_async(&mut *conn)
            .await
            .context("Failed to get queue counts")?;

        Ok(QueueStats {
            pending,
            processing,
            completed,
            failed,
            total: pending + processing + completed + failed,
        })
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("DEL")
            .arg(&self.keys.all()[..])
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to delete queue keys")?;

        debug!("Cleared queue keys under {}", self.keys.queue);

        Ok(())
    }
}
