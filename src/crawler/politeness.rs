//! Per-domain rate limiting and request pacing.
//!
//! The sliding-window limiter never cleans itself up in the background on its
//! own: stale windows are dropped by `tick`, which tests call directly and
//! `start_gc` drives from an owned task that `GcHandle::stop` shuts down.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::cli::config::CrawlerSettings;

/// Verdict of the rate limiter for one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    WaitFor(Duration),
}

/// Sliding-window limit of requests per domain
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    domains: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn per_minute(max_requests: u32) -> Self {
        Self::with_window(max_requests, Duration::from_secs(60))
    }

    pub fn with_window(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1) as usize,
            window,
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `domain` at `now` if the window has room
    pub async fn check_at(&self, domain: &str, now: Instant) -> RateDecision {
        let mut domains = self.domains.lock().await;
        let hits = domains.entry(domain.to_string()).or_default();

        while hits.front().map_or(false, |&t| now.saturating_duration_since(t) >= self.window) {
            hits.pop_front();
        }

        if hits.len() < self.max_requests {
            hits.push_back(now);
            return RateDecision::Allowed;
        }

        let oldest = hits.front().copied().unwrap_or(now);
        RateDecision::WaitFor(self.window.saturating_sub(now.saturating_duration_since(oldest)))
    }

    /// Wait until `domain` has room, then record the request
    pub async fn acquire(&self, domain: &str) {
        loop {
            match self.check_at(domain, Instant::now()).await {
                RateDecision::Allowed => return,
                RateDecision::WaitFor(wait) => {
                    trace!("Rate limit for {}, waiting {:?}", domain, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Drop expired timestamps and forget idle domains. Returns how many
    /// domains were forgotten.
    pub async fn tick(&self, now: Instant) -> usize {
        let mut domains = self.domains.lock().await;
        let before = domains.len();

        domains.retain(|_, hits| {
            while hits.front().map_or(false, |&t| now.saturating_duration_since(t) >= self.window) {
                hits.pop_front();
            }
            !hits.is_empty()
        });

        before - domains.len()
    }

    pub async fn tracked_domains(&self) -> usize {
        self.domains.lock().await.len()
    }

    /// Run `tick` every `interval` until the returned handle is stopped
    pub fn start_gc(self: &Arc<Self>, interval: Duration) -> GcHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let limiter = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.tick(Instant::now()).await;
                        if removed > 0 {
                            debug!("Rate limiter forgot {} idle domains", removed);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        GcHandle { shutdown_tx, handle }
    }
}

/// Owned garbage-collection task of a `RateLimiter`
pub struct GcHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl GcHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Base delay plus a uniform random jitter in `[0, jitter]`
pub fn jittered_delay<R: Rng + ?Sized>(base: Duration, jitter: Duration, rng: &mut R) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    base + Duration::from_millis(rng.gen_range(0..=jitter.as_millis() as u64))
}

/// Pacing applied before every dispatch
pub struct Politeness {
    delay: Duration,
    jitter: Duration,
    limiter: Option<Arc<RateLimiter>>,
}

impl Politeness {
    pub fn new(settings: &CrawlerSettings) -> Self {
        Self {
            delay: Duration::from_millis(settings.politeness_delay),
            jitter: Duration::from_millis(settings.politeness_jitter),
            limiter: settings.max_requests_per_minute.map(|n| Arc::new(RateLimiter::per_minute(n))),
        }
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Sleep for the jittered politeness delay, then wait for the domain's rate limit
    pub async fn wait_turn(&self, domain: &str) {
        let delay = jittered_delay(self.delay, self.jitter, &mut rand::thread_rng());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(limiter) = &self.limiter {
            limiter.acquire(domain).await;
        }
    }
}
