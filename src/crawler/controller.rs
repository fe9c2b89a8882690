use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::autoscale::{AutoscaledPool, MemoryProbe, PoolHandle, PoolOptions, PoolTask};
use crate::browser::RemoteBrowserService;
use crate::cli::config::CrawlerConfig;
use crate::crawler::engine::{CrawlerEngine, EngineKind};
use crate::crawler::extract::payload_for;
use crate::crawler::fetcher::{BrowserFetcher, Fetcher, HttpFetcher};
use crate::crawler::job::{CrawlJob, JobStatus, JobType};
use crate::crawler::limiter::{JobResourceLimiter, JobStats, ResourceLimits};
use crate::crawler::links::{extract_links, LinkFilter};
use crate::crawler::politeness::Politeness;
use crate::crawler::task::{CrawlRequest, CrawlResult};
use crate::dataset::DatasetItem;
use crate::error::CrawlError;
use crate::proxy::ProxyManager;
use crate::stealth::{SessionPool, UserAgentPool};
use crate::storage::{JobStore, JobStoreFactory, QueueStrategy, RequestQueue};
use crate::utils::metrics::{Metrics, MetricsCollector, RequestOutcome};
use crate::utils::url::hostname;

/// Errors kept on a job record
const MAX_JOB_ERRORS: usize = 100;

/// Lifecycle notifications of running jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CrawlEvent {
    RequestStarted {
        job_id: String,
        url: String,
        depth: u32,
    },
    RequestCompleted {
        job_id: String,
        url: String,
        status_code: u16,
        bytes: u64,
        links_enqueued: usize,
    },
    RequestFailed {
        job_id: String,
        url: String,
        error: String,
        will_retry: bool,
    },
    CrawlFinished {
        job_id: String,
        status: JobStatus,
        stats: JobStats,
        reason: Option<String>,
    },
}

/// Fan-out of events to every live subscriber
#[derive(Clone, Default)]
struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<CrawlEvent>>>>,
}

impl EventBus {
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<CrawlEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        rx
    }

    async fn emit(&self, event: CrawlEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Serializes read-modify-write cycles on stored jobs
struct JobLedger {
    store: Arc<dyn JobStore>,
    lock: Mutex<()>,
}

impl JobLedger {
    async fn update<F>(&self, job_id: &str, apply: F) -> Result<CrawlJob>
    where
        F: FnOnce(&mut CrawlJob) -> Result<()>,
    {
        let _guard = self.lock.lock().await;
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .with_context(|| format!("Job {} not found", job_id))?;

        apply(&mut job)?;
        self.store.save_job(&job).await?;
        Ok(job)
    }
}

/// Pause and cancel flags of an active job
#[derive(Default)]
struct JobControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
    pool: Mutex<Option<PoolHandle>>,
}

impl JobControl {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn abort_pool(&self) {
        if let Some(pool) = self.pool.lock().await.as_ref() {
            pool.abort();
        }
    }
}

/// Creates, runs and steers crawl jobs
pub struct CrawlerController {
    config: CrawlerConfig,
    ledger: Arc<JobLedger>,
    engine: Arc<CrawlerEngine>,
    events: EventBus,
    active: Mutex<HashMap<String, Arc<JobControl>>>,
    job_metrics: Mutex<HashMap<String, MetricsCollector>>,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
}

/// Build the fetcher for the configured engine
pub fn build_fetcher(config: &CrawlerConfig, kind: EngineKind) -> Result<Arc<dyn Fetcher>> {
    match kind {
        EngineKind::Http => Ok(Arc::new(HttpFetcher::new())),
        EngineKind::Browser => {
            if !config.browser_service.enabled {
                anyhow::bail!("The browser engine needs browser_service.enabled");
            }
            let service = RemoteBrowserService::new(&config.browser_service, &config.browser)?;
            Ok(Arc::new(BrowserFetcher::new(Arc::new(service))))
        }
    }
}

/// Session pool with the configured fingerprints and proxies
pub fn build_sessions(config: &CrawlerConfig) -> Arc<SessionPool> {
    let proxies = if config.proxy.enabled {
        Some(Arc::new(Mutex::new(ProxyManager::new(config.proxy.clone()))))
    } else {
        None
    };

    Arc::new(SessionPool::new(
        config.session.clone(),
        UserAgentPool::with_configured(&config.browser.fingerprints),
        proxies,
    ))
}

impl CrawlerController {
    /// Create a controller with the configured store and engine
    pub async fn new(config: CrawlerConfig) -> Result<Self> {
        let store = JobStoreFactory::create(&config.storage.results)
            .await
            .context("Failed to open job store")?;
        let fetcher = build_fetcher(&config, config.crawler.engine)?;
        Ok(Self::with_parts(config, store, fetcher))
    }

    /// Create a controller from explicit parts
    pub fn with_parts(config: CrawlerConfig, store: Arc<dyn JobStore>, fetcher: Arc<dyn Fetcher>) -> Self {
        let engine = CrawlerEngine::new(
            fetcher,
            build_sessions(&config),
            Duration::from_millis(config.crawler.request_timeout_ms),
        );

        Self {
            config,
            ledger: Arc::new(JobLedger {
                store,
                lock: Mutex::new(()),
            }),
            engine: Arc::new(engine),
            events: EventBus::default(),
            active: Mutex::new(HashMap::new()),
            job_metrics: Mutex::new(HashMap::new()),
            memory_probe: None,
        }
    }

    /// Feed the autoscaler from `probe` instead of process memory
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.ledger.store
    }

    pub fn engine(&self) -> &Arc<CrawlerEngine> {
        &self.engine
    }

    /// Receive every event emitted from now on
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<CrawlEvent> {
        self.events.subscribe().await
    }

    /// Validate and persist a new pending job
    pub async fn create_job(&self, url: &str, job_type: &str) -> Result<CrawlJob> {
        let job_type = JobType::parse(job_type)?;
        let job = CrawlJob::new(url, job_type, self.config.crawler.max_retries)?;

        self.ledger.store.save_job(&job).await?;
        info!("Created {} job {} for {}", job.job_type, job.id, job.url);
        Ok(job)
    }

    /// All jobs, newest first
    pub async fn get_jobs(&self) -> Result<Vec<CrawlJob>> {
        self.ledger.store.list_jobs().await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<CrawlJob>> {
        self.ledger.store.get_job(job_id).await
    }

    pub async fn get_items(&self, job_id: &str) -> Result<Vec<DatasetItem>> {
        self.ledger.store.get_items(job_id).await
    }

    /// Metrics of the last run of a job in this process
    pub async fn job_metrics(&self, job_id: &str) -> Option<Metrics> {
        let collector = self.job_metrics.lock().await.get(job_id).cloned()?;
        Some(collector.get_metrics().await)
    }

    pub async fn is_active(&self, job_id: &str) -> bool {
        self.active.lock().await.contains_key(job_id)
    }

    /// Run a job to its end and return the final record.
    ///
    /// Pending and paused jobs start; a job left `Running` by a previous
    /// process resumes from its durable queue.
    pub async fn run_job(&self, job_id: &str) -> Result<CrawlJob> {
        if self.is_active(job_id).await {
            anyhow::bail!("Job {} is already running", job_id);
        }

        let job = self
            .ledger
            .update(job_id, |job| {
                match job.status {
                    JobStatus::Pending | JobStatus::Paused => {
                        job.transition(JobStatus::Running);
                    }
                    JobStatus::Running => {
                        info!("Resuming interrupted job {}", job.id);
                    }
                    status => anyhow::bail!("Job {} is already {}", job.id, status),
                }
                Ok(())
            })
            .await?;

        let strategy = self.config.crawler.strategy;
        let queue = RequestQueue::open(&self.config.storage.queue, &job.id, strategy).await;
        let recovered = queue.recover_in_flight().await?;
        if recovered > 0 {
            info!("Requeued {} interrupted requests of job {}", recovered, job.id);
        }
        let seed = CrawlRequest::new(&job.url)?;
        if !queue.add_request(seed).await? {
            debug!("Seed of job {} already known to the queue", job.id);
        }

        let metrics = MetricsCollector::new();
        metrics.set_custom_metric("queue_backend", queue.backend_name()).await;
        self.job_metrics.lock().await.insert(job.id.clone(), metrics.clone());

        let follow_links = match job.job_type {
            JobType::Url => true,
            JobType::Seo => self.config.crawler.seo_follow_links,
        };

        let control = Arc::new(JobControl::default());
        let politeness = Politeness::new(&self.config.crawler);
        let rate_gc = politeness.limiter().map(|limiter| limiter.start_gc(Duration::from_secs(60)));

        let run = Arc::new(JobRun {
            job_id: job.id.clone(),
            job_type: job.job_type,
            max_retries: job.max_retries,
            queue,
            engine: Arc::clone(&self.engine),
            links: LinkFilter::new(&self.config.crawler),
            follow_links,
            politeness,
            limiter: JobResourceLimiter::new(self.config.limits),
            ledger: Arc::clone(&self.ledger),
            metrics,
            events: self.events.clone(),
            control: Arc::clone(&control),
            started: Instant::now(),
            previous: job.stats,
            state: Mutex::new(RunState::default()),
        });

        let options = PoolOptions::from(&self.config.autoscale);
        let pool = match &self.memory_probe {
            Some(probe) => AutoscaledPool::with_probe(options, Arc::clone(probe)),
            None => AutoscaledPool::new(options, self.config.autoscale.max_memory_mb),
        };
        *control.pool.lock().await = Some(pool.handle());
        self.active.lock().await.insert(job.id.clone(), Arc::clone(&control));

        info!("Running job {} ({}, {:?} order) from {}", job.id, job.job_type, strategy, job.url);
        pool.run(run.clone() as Arc<dyn PoolTask>).await;

        if let Some(gc) = rate_gc {
            gc.stop().await;
        }
        self.active.lock().await.remove(&job.id);

        let finished = run.finish().await?;
        self.events
            .emit(CrawlEvent::CrawlFinished {
                job_id: finished.id.clone(),
                status: finished.status,
                stats: finished.stats,
                reason: finished.stop_reason.clone(),
            })
            .await;

        info!(
            "Job {} finished as {} ({} pages, {} bytes)",
            finished.id, finished.status, finished.stats.pages_crawled, finished.stats.bytes_downloaded
        );
        Ok(finished)
    }

    /// Stop dispatching new requests of a running job
    pub async fn pause_job(&self, job_id: &str) -> Result<CrawlJob> {
        let control = self.control_of(job_id).await?;
        let job = self
            .ledger
            .update(job_id, |job| {
                if !job.transition(JobStatus::Paused) {
                    anyhow::bail!("Cannot pause job {} in status {}", job.id, job.status);
                }
                Ok(())
            })
            .await?;

        control.paused.store(true, Ordering::SeqCst);
        info!("Paused job {}", job_id);
        Ok(job)
    }

    /// Continue a paused job that is still active in this process
    pub async fn resume_job(&self, job_id: &str) -> Result<CrawlJob> {
        let control = self.control_of(job_id).await?;
        let job = self
            .ledger
            .update(job_id, |job| {
                if job.status != JobStatus::Paused || !job.transition(JobStatus::Running) {
                    anyhow::bail!("Cannot resume job {} in status {}", job.id, job.status);
                }
                Ok(())
            })
            .await?;

        control.paused.store(false, Ordering::SeqCst);
        info!("Resumed job {}", job_id);
        Ok(job)
    }

    /// Cancel a job. Active jobs stop after their in-flight requests.
    pub async fn cancel_job(&self, job_id: &str) -> Result<CrawlJob> {
        let control = self.active.lock().await.get(job_id).cloned();

        if let Some(control) = control {
            control.cancelled.store(true, Ordering::SeqCst);
            control.abort_pool().await;
            info!("Cancelling job {}", job_id);
            return self
                .get_job(job_id)
                .await?
                .with_context(|| format!("Job {} not found", job_id));
        }

        self.ledger
            .update(job_id, |job| {
                if !job.transition(JobStatus::Cancelled) {
                    anyhow::bail!("Cannot cancel job {} in status {}", job.id, job.status);
                }
                Ok(())
            })
            .await
    }

    async fn control_of(&self, job_id: &str) -> Result<Arc<JobControl>> {
        self.active
            .lock()
            .await
            .get(job_id)
            .cloned()
            .with_context(|| format!("Job {} is not running", job_id))
    }
}

#[derive(Default)]
struct RunState {
    pages_crawled: u64,
    failed_requests: u64,
    in_flight: u64,
    stop_reason: Option<String>,
    errors: Vec<String>,
}

impl RunState {
    fn record_failure(&mut self, message: String) {
        self.failed_requests += 1;
        if self.errors.len() < MAX_JOB_ERRORS {
            self.errors.push(message);
        }
    }
}

/// One execution of a job, driven by the autoscaled pool
struct JobRun {
    job_id: String,
    job_type: JobType,
    max_retries: u32,
    queue: RequestQueue,
    engine: Arc<CrawlerEngine>,
    links: LinkFilter,
    follow_links: bool,
    politeness: Politeness,
    limiter: JobResourceLimiter,
    ledger: Arc<JobLedger>,
    metrics: MetricsCollector,
    events: EventBus,
    control: Arc<JobControl>,
    started: Instant,
    /// Stats accumulated by earlier runs of the same job
    previous: JobStats,
    state: Mutex<RunState>,
}

impl JobRun {
    async fn stats_with(&self, pages_crawled: u64) -> JobStats {
        JobStats {
            pages_crawled: self.previous.pages_crawled + pages_crawled,
            elapsed_ms: self.previous.elapsed_ms + self.started.elapsed().as_millis() as u64,
            bytes_downloaded: self.previous.bytes_downloaded + self.metrics.bytes_downloaded().await,
        }
    }

    /// Take the next request unless the job is paused, cancelled or at its limits
    async fn reserve(&self) -> Result<Option<CrawlRequest>> {
        if self.control.is_paused() || self.control.is_cancelled() {
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        if state.stop_reason.is_some() {
            return Ok(None);
        }

        if self.limits_reached(&mut state).await {
            return Ok(None);
        }

        let Some(request) = self.queue.fetch_next().await? else {
            return Ok(None);
        };
        state.in_flight += 1;
        Ok(Some(request))
    }

    /// Whether the limits forbid another dispatch; ends the run once nothing is in flight.
    ///
    /// In-flight requests count as pages so the page limit is never overshot.
    async fn limits_reached(&self, state: &mut RunState) -> bool {
        let projected = self.stats_with(state.pages_crawled + state.in_flight).await;
        let decision = self.limiter.should_stop(&projected);
        if !decision.stop {
            return false;
        }
        if state.in_flight == 0 && state.stop_reason.is_none() {
            state.stop_reason = decision.reason;
            self.control.abort_pool().await;
        }
        true
    }

    async fn process(&self, request: CrawlRequest) -> Result<()> {
        let host = hostname(&request.url).unwrap_or_default();
        self.politeness.wait_turn(&host).await;

        self.events
            .emit(CrawlEvent::RequestStarted {
                job_id: self.job_id.clone(),
                url: request.url.clone(),
                depth: request.depth,
            })
            .await;

        let timer = self.metrics.start_timer();
        let outcome = self.engine.handle_request(&request).await;
        let duration_ms = timer.end();

        match outcome {
            Ok(result) => self.on_success(&host, request, result, duration_ms).await,
            Err(e) => self.on_failure(&host, request, e, duration_ms).await,
        }
    }

    async fn on_success(&self, host: &str, request: CrawlRequest, result: CrawlResult, duration_ms: u64) -> Result<()> {
        let bytes = result.bytes();
        self.metrics
            .record_request(host, RequestOutcome {
                success: true,
                blocked: false,
                duration_ms,
                status_code: Some(result.status_code),
                bytes,
            })
            .await;

        let failure = match self.store_success(&request, &result).await {
            Ok(links_enqueued) => {
                debug!(
                    "Crawled {} ({}; {} bytes, {} new links)",
                    request.url, result.status_code, bytes, links_enqueued
                );
                self.events
                    .emit(CrawlEvent::RequestCompleted {
                        job_id: self.job_id.clone(),
                        url: request.url.clone(),
                        status_code: result.status_code,
                        bytes,
                        links_enqueued,
                    })
                    .await;
                None
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!("Giving up on {}: {}", request.url, message);
                self.settle_failed(&request, &message).await;
                self.emit_failed(&request, &message, false).await;
                Some(message)
            }
        };

        let mut state = self.state.lock().await;
        state.in_flight -= 1;
        match failure {
            None => state.pages_crawled += 1,
            Some(message) => state.record_failure(message),
        }
        self.after_request(state).await
    }

    /// Store the item of a fetched page, enqueue its links and complete its key
    async fn store_success(&self, request: &CrawlRequest, result: &CrawlResult) -> Result<usize> {
        let discovered = if result.is_html() {
            extract_links(&result.url, &result.body)
        } else {
            Vec::new()
        };

        let item = DatasetItem::new(&request.url, payload_for(self.job_type, result, discovered.len()));
        self.ledger
            .store
            .append_items(&self.job_id, &[item])
            .await
            .with_context(|| format!("Failed to store results of {}", request.url))?;

        let mut links_enqueued = 0;
        if self.follow_links {
            let children = self.links.filter_discovered_links(request, &discovered);
            links_enqueued = self.queue.add_requests(children).await?;
        }

        self.queue.mark_completed(&request.unique_key).await?;
        Ok(links_enqueued)
    }

    async fn on_failure(&self, host: &str, request: CrawlRequest, error: CrawlError, duration_ms: u64) -> Result<()> {
        let status_code = match &error {
            CrawlError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        };
        self.metrics
            .record_request(host, RequestOutcome {
                success: false,
                blocked: error.is_anti_bot(),
                duration_ms,
                status_code,
                bytes: 0,
            })
            .await;

        let mut will_retry = error.is_retryable() && request.retry_count < self.max_retries;
        let message = error.to_string();

        if will_retry {
            warn!(
                "Retrying {} (attempt {}/{}): {}",
                request.url,
                request.retry_count + 1,
                self.max_retries,
                message
            );
            self.metrics.record_retry().await;
            let mut retry = request.clone();
            retry.retry_count += 1;
            if let Err(e) = self.queue.reclaim_request(retry).await {
                error!("Could not requeue {}: {:#}", request.url, e);
                will_retry = false;
            }
        } else {
            error!("Giving up on {}: {}", request.url, message);
        }

        if !will_retry {
            self.settle_failed(&request, &message).await;
        }
        self.emit_failed(&request, &message, will_retry).await;

        let mut state = self.state.lock().await;
        state.in_flight -= 1;
        if !will_retry {
            state.record_failure(message);
        }
        self.after_request(state).await
    }

    /// Move a request into the failed set; a broken queue is only logged
    async fn settle_failed(&self, request: &CrawlRequest, message: &str) {
        if let Err(e) = self.queue.mark_failed(&request.unique_key, message).await {
            warn!("Could not mark {} as failed: {:#}", request.url, e);
        }
    }

    async fn emit_failed(&self, request: &CrawlRequest, message: &str, will_retry: bool) {
        self.events
            .emit(CrawlEvent::RequestFailed {
                job_id: self.job_id.clone(),
                url: request.url.clone(),
                error: message.to_string(),
                will_retry,
            })
            .await;
    }

    /// Persist progress and consult the limiter
    async fn after_request(&self, mut state: tokio::sync::MutexGuard<'_, RunState>) -> Result<()> {
        let stats = self.stats_with(state.pages_crawled).await;
        let decision = self.limiter.should_stop(&stats);

        let stop = decision.stop && state.stop_reason.is_none();
        if stop {
            info!("Job {} reached its limits: {}", self.job_id, decision.reason.as_deref().unwrap_or("limit"));
            state.stop_reason = decision.reason;
        }
        drop(state);

        if stop {
            self.control.abort_pool().await;
        }

        self.ledger
            .update(&self.job_id, |job| {
                job.stats = stats;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Settle the final status of the job
    async fn finish(&self) -> Result<CrawlJob> {
        let state = self.state.lock().await;
        let stats = self.stats_with(state.pages_crawled).await;
        let cancelled = self.control.is_cancelled();
        let stop_reason = state.stop_reason.clone();
        let failed_only = state.pages_crawled == 0 && state.failed_requests > 0;
        let errors = state.errors.clone();
        drop(state);

        self.ledger
            .update(&self.job_id, |job| {
                job.stats = stats;
                for e in errors {
                    if job.errors.len() < MAX_JOB_ERRORS {
                        job.errors.push(e);
                    }
                }

                let status = if cancelled {
                    JobStatus::Cancelled
                } else if stop_reason.is_some() {
                    job.stop_reason = stop_reason;
                    JobStatus::Stopped
                } else if failed_only {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };

                // A job paused at the moment it ran dry still finishes
                if job.status == JobStatus::Paused && status != JobStatus::Cancelled {
                    job.transition(JobStatus::Running);
                }
                if !job.transition(status) {
                    warn!("Job {} could not move from {} to {}", job.id, job.status, status);
                }
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl PoolTask for JobRun {
    async fn is_task_ready(&self) -> bool {
        if self.control.is_paused() || self.control.is_cancelled() {
            return false;
        }
        {
            let mut state = self.state.lock().await;
            if state.stop_reason.is_some() || self.limits_reached(&mut state).await {
                return false;
            }
        }
        match self.queue.is_empty().await {
            Ok(empty) => !empty,
            Err(e) => {
                error!("Queue of job {} unavailable: {:#}", self.job_id, e);
                false
            }
        }
    }

    async fn run_task(&self) -> Result<()> {
        match self.reserve().await? {
            Some(request) => self.process(request).await,
            None => Ok(()),
        }
    }

    async fn is_finished(&self) -> bool {
        if self.control.is_cancelled() {
            return true;
        }
        if self.control.is_paused() {
            return false;
        }

        let state = self.state.lock().await;
        if state.stop_reason.is_some() {
            return state.in_flight == 0;
        }
        if state.in_flight > 0 {
            return false;
        }
        drop(state);

        // With nothing in flight here, a key still marked processing could not be settled
        match self.queue.is_empty().await {
            Ok(empty) => empty,
            Err(e) => {
                error!("Queue of job {} unavailable: {:#}", self.job_id, e);
                true
            }
        }
    }

    async fn backlog(&self) -> usize {
        self.queue.get_stats().await.map_or(0, |stats| stats.pending)
    }
}

impl std::fmt::Debug for CrawlerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlerController")
            .field("engine", &self.engine.kind())
            .field("strategy", &self.config.crawler.strategy)
            .finish()
    }
}

/// Parse a queue order name, defaulting to breadth-first
pub fn parse_strategy(value: Option<&str>) -> Result<QueueStrategy> {
    match value {
        None => Ok(QueueStrategy::Bfs),
        Some(v) => QueueStrategy::parse(v).with_context(|| format!("Unknown queue strategy: {}", v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::{FetchContext, MockFetcher};
    use crate::storage::jobs::MemoryJobStore;
    use std::collections::BTreeMap;

    struct FixedProbe;

    impl MemoryProbe for FixedProbe {
        fn memory_ratio(&self) -> f64 {
            0.1
        }
    }

    fn test_config() -> CrawlerConfig {
        let mut config = CrawlerConfig::default();
        config.storage.queue.backend = "memory".to_string();
        config.storage.results.storage_type = "memory".to_string();
        config.crawler.politeness_delay = 0;
        config.crawler.politeness_jitter = 0;
        config.crawler.max_requests_per_minute = None;
        config.crawler.max_retries = 2;
        config.crawler.max_depth = 3;
        config.limits = ResourceLimits::default();
        config.autoscale.min_concurrency = 1;
        config.autoscale.max_concurrency = 2;
        config.autoscale.desired_concurrency = 2;
        config
    }

    fn page(links: &[&str]) -> String {
        let anchors: String = links.iter().map(|l| format!(r#"<a href="{}">x</a>"#, l)).collect();
        format!("<html><head><title>Page</title></head><body>{}</body></html>", anchors)
    }

    /// A tiny site: / links to /a and /b, /a links to /c, /b is a dead end
    fn site_body(url: &str) -> Option<String> {
        let path = url::Url::parse(url).ok()?.path().to_string();
        match path.as_str() {
            "/" | "" => Some(page(&["/a", "/b", "mailto:x@y.z"])),
            "/a" => Some(page(&["/c", "/"])),
            "/b" => Some(page(&[])),
            "/c" => Some(page(&["/a"])),
            _ => None,
        }
    }

    fn ok(request: &CrawlRequest, status: u16, body: String) -> CrawlResult {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());
        CrawlResult {
            url: request.url.clone(),
            status_code: status,
            body,
            headers,
            content_type: "text/html".to_string(),
            request: request.clone(),
        }
    }

    fn site_fetcher() -> MockFetcher {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_kind().return_const(EngineKind::Http);
        fetcher.expect_fetch().returning(|request: &CrawlRequest, _: &FetchContext| {
            Ok(match site_body(&request.url) {
                Some(body) => ok(request, 200, body),
                None => ok(request, 404, String::new()),
            })
        });
        fetcher
    }

    fn controller(config: CrawlerConfig, fetcher: MockFetcher) -> CrawlerController {
        CrawlerController::with_parts(config, Arc::new(MemoryJobStore::default()), Arc::new(fetcher))
            .with_memory_probe(Arc::new(FixedProbe))
    }

    /// Job store whose dataset writes always fail
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryJobStore,
    }

    #[async_trait]
    impl JobStore for FailingStore {
        async fn save_job(&self, job: &CrawlJob) -> Result<()> {
            self.inner.save_job(job).await
        }

        async fn get_job(&self, job_id: &str) -> Result<Option<CrawlJob>> {
            self.inner.get_job(job_id).await
        }

        async fn list_jobs(&self) -> Result<Vec<CrawlJob>> {
            self.inner.list_jobs().await
        }

        async fn append_items(&self, _job_id: &str, _items: &[DatasetItem]) -> Result<()> {
            anyhow::bail!("disk full")
        }

        async fn get_items(&self, job_id: &str) -> Result<Vec<DatasetItem>> {
            self.inner.get_items(job_id).await
        }

        async fn delete_job(&self, job_id: &str) -> Result<()> {
            self.inner.delete_job(job_id).await
        }
    }

    /// A run of a job that is never stored, for driving the pool callbacks by hand
    fn detached_run(config: &CrawlerConfig, queue: RequestQueue) -> JobRun {
        JobRun {
            job_id: "detached".to_string(),
            job_type: JobType::Url,
            max_retries: config.crawler.max_retries,
            queue,
            engine: Arc::new(CrawlerEngine::new(
                Arc::new(site_fetcher()),
                build_sessions(config),
                Duration::from_secs(5),
            )),
            links: LinkFilter::new(&config.crawler),
            follow_links: true,
            politeness: Politeness::new(&config.crawler),
            limiter: JobResourceLimiter::new(config.limits),
            ledger: Arc::new(JobLedger {
                store: Arc::new(MemoryJobStore::default()),
                lock: Mutex::new(()),
            }),
            metrics: MetricsCollector::new(),
            events: EventBus::default(),
            control: Arc::new(JobControl::default()),
            started: Instant::now(),
            previous: JobStats::default(),
            state: Mutex::new(RunState::default()),
        }
    }

    #[tokio::test]
    async fn test_create_job_validates_input() {
        let controller = controller(test_config(), site_fetcher());

        let error = controller.create_job("not a url", "url").await.unwrap_err();
        assert!(error.downcast_ref::<CrawlError>().map_or(false, |e| e.is_validation()));

        let error = controller.create_job("https://example.com", "images").await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<CrawlError>(),
            Some(CrawlError::UnsupportedJobType(_))
        ));

        assert!(controller.get_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_jobs_newest_first() {
        let controller = controller(test_config(), site_fetcher());
        let first = controller.create_job("https://example.com", "url").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = controller.create_job("https://example.org", "seo").await.unwrap();

        let jobs = controller.get_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, second.id);
        assert_eq!(jobs[1].id, first.id);
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_url_job_crawls_site() {
        let controller = controller(test_config(), site_fetcher());
        let mut events = controller.subscribe().await;
        let job = controller.create_job("https://example.com/", "url").await.unwrap();

        let finished = controller.run_job(&job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.stats.pages_crawled, 4);
        assert!(finished.started_at.is_some() && finished.finished_at.is_some());

        let mut urls: Vec<String> = controller
            .get_items(&job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.url)
            .collect();
        urls.sort();
        assert_eq!(urls, vec![
            "https://example.com/",
            "https://example.com/a",
            "https://example.com/b",
            "https://example.com/c",
        ]);

        let mut started = 0;
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CrawlEvent::RequestStarted { .. }) {
                started += 1;
            }
            last = Some(event);
        }
        assert_eq!(started, 4);
        assert!(matches!(
            last,
            Some(CrawlEvent::CrawlFinished { status: JobStatus::Completed, .. })
        ));

        let metrics = controller.job_metrics(&job.id).await.unwrap();
        assert_eq!(metrics.successful_requests, 4);
    }

    #[tokio::test]
    async fn test_seo_job_stays_on_start_page() {
        let controller = controller(test_config(), site_fetcher());
        let job = controller.create_job("https://example.com/", "seo").await.unwrap();

        let finished = controller.run_job(&job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.stats.pages_crawled, 1);

        let items = controller.get_items(&job.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].payload["issues"].is_array());
    }

    #[tokio::test]
    async fn test_page_limit_stops_job() {
        let mut config = test_config();
        config.limits.max_pages = Some(2);
        let controller = controller(config, site_fetcher());
        let job = controller.create_job("https://example.com/", "url").await.unwrap();

        let finished = controller.run_job(&job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Stopped);
        assert_eq!(finished.stats.pages_crawled, 2);
        assert!(finished.stop_reason.unwrap().starts_with("Page limit reached"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_kind().return_const(EngineKind::Http);
        let mut seq = mockall::Sequence::new();
        fetcher
            .expect_fetch()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|request: &CrawlRequest, _: &FetchContext| Ok(ok(request, 503, String::new())));
        fetcher
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|request: &CrawlRequest, _: &FetchContext| Ok(ok(request, 200, page(&[]))));

        let controller = controller(test_config(), fetcher);
        let job = controller.create_job("https://example.com/", "url").await.unwrap();

        let finished = controller.run_job(&job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.stats.pages_crawled, 1);

        let metrics = controller.job_metrics(&job.id).await.unwrap();
        assert_eq!(metrics.retried_requests, 2);
    }

    #[tokio::test]
    async fn test_blocked_request_retried_with_fresh_session() {
        let fingerprints = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut fetcher = MockFetcher::new();
        fetcher.expect_kind().return_const(EngineKind::Http);
        {
            let fingerprints = Arc::clone(&fingerprints);
            let calls = Arc::clone(&calls);
            fetcher.expect_fetch().times(2).returning(move |request: &CrawlRequest, context: &FetchContext| {
                fingerprints.lock().unwrap().push(context.fingerprint.id.clone());
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(ok(request, 403, "<html><body>Forbidden</body></html>".to_string()))
                } else {
                    Ok(ok(request, 200, page(&[])))
                }
            });
        }

        let controller = controller(test_config(), fetcher);
        let job = controller.create_job("https://example.com/", "url").await.unwrap();

        let finished = controller.run_job(&job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.stats.pages_crawled, 1);
        assert!(finished.errors.is_empty());

        let metrics = controller.job_metrics(&job.id).await.unwrap();
        assert_eq!(metrics.retried_requests, 1);

        let fingerprints = fingerprints.lock().unwrap();
        assert_eq!(fingerprints.len(), 2);
        assert_ne!(fingerprints[0], fingerprints[1]);
    }

    #[tokio::test]
    async fn test_failed_result_write_does_not_stall_job() {
        let controller = CrawlerController::with_parts(
            test_config(),
            Arc::new(FailingStore::default()),
            Arc::new(site_fetcher()),
        )
        .with_memory_probe(Arc::new(FixedProbe));
        let job = controller.create_job("https://example.com/", "url").await.unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), controller.run_job(&job.id))
            .await
            .expect("job should settle")
            .unwrap();

        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.stats.pages_crawled, 0);
        assert_eq!(finished.errors.len(), 1);
        assert!(finished.errors[0].contains("disk full"));
        assert!(!controller.is_active(&job.id).await);
    }

    #[tokio::test]
    async fn test_no_dispatch_once_in_flight_requests_fill_page_limit() {
        let mut config = test_config();
        config.limits.max_pages = Some(1);
        let queue = RequestQueue::in_memory(QueueStrategy::Bfs);
        queue
            .add_requests(vec![
                CrawlRequest::new("https://example.com/a").unwrap(),
                CrawlRequest::new("https://example.com/b").unwrap(),
            ])
            .await
            .unwrap();
        let run = detached_run(&config, queue);

        assert!(run.is_task_ready().await);
        assert!(run.reserve().await.unwrap().is_some());

        // The only page allowed is in flight
        assert!(!run.is_task_ready().await);
        assert!(run.reserve().await.unwrap().is_none());
        assert!(!run.is_finished().await);
        assert!(run.state.lock().await.stop_reason.is_none());
        assert_eq!(run.backlog().await, 1);
    }

    #[tokio::test]
    async fn test_page_limit_of_one_fetches_once() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_kind().return_const(EngineKind::Http);
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|request: &CrawlRequest, _: &FetchContext| Ok(ok(request, 200, page(&["/a", "/b", "/c"]))));

        let mut config = test_config();
        config.limits.max_pages = Some(1);
        let controller = controller(config, fetcher);
        let job = controller.create_job("https://example.com/", "url").await.unwrap();

        let finished = controller.run_job(&job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Stopped);
        assert_eq!(finished.stats.pages_crawled, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_job() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_kind().return_const(EngineKind::Http);
        fetcher
            .expect_fetch()
            .times(3)
            .returning(|request: &CrawlRequest, _: &FetchContext| Ok(ok(request, 500, String::new())));

        let controller = controller(test_config(), fetcher);
        let job = controller.create_job("https://example.com/", "url").await.unwrap();

        let finished = controller.run_job(&job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.errors.len(), 1);
        assert!(finished.errors[0].contains("500"));
    }

    #[tokio::test]
    async fn test_finished_job_cannot_rerun_or_cancel() {
        let controller = controller(test_config(), site_fetcher());
        let job = controller.create_job("https://example.com/b", "url").await.unwrap();
        controller.run_job(&job.id).await.unwrap();

        assert!(controller.run_job(&job.id).await.is_err());
        assert!(controller.cancel_job(&job.id).await.is_err());
        assert!(controller.pause_job(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let controller = controller(test_config(), site_fetcher());
        let job = controller.create_job("https://example.com", "url").await.unwrap();

        let cancelled = controller.cancel_job(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(controller.run_job(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_pause_resume_and_cancel_running_job() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_kind().return_const(EngineKind::Http);
        // Every page links to ten fresh pages, so the crawl never runs dry
        fetcher.expect_fetch().returning(|request: &CrawlRequest, _: &FetchContext| {
            let links: Vec<String> = (0..10).map(|i| format!("{}/{}", request.url.trim_end_matches('/'), i)).collect();
            let refs: Vec<&str> = links.iter().map(String::as_str).collect();
            std::thread::sleep(std::time::Duration::from_millis(1));
            Ok(ok(request, 200, page(&refs)))
        });

        let mut config = test_config();
        config.crawler.max_depth = 10;
        let controller = Arc::new(controller(config, fetcher));
        let job = controller.create_job("https://example.com", "url").await.unwrap();

        let runner = {
            let controller = Arc::clone(&controller);
            let id = job.id.clone();
            tokio::spawn(async move { controller.run_job(&id).await })
        };

        while !controller.is_active(&job.id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let paused = controller.pause_job(&job.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert!(controller.pause_job(&job.id).await.is_err());

        let resumed = controller.resume_job(&job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Running);

        controller.cancel_job(&job.id).await.unwrap();
        let finished = runner.await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert!(finished.stats.pages_crawled > 0);
        assert!(!controller.is_active(&job.id).await);
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(parse_strategy(None).unwrap(), QueueStrategy::Bfs);
        assert_eq!(parse_strategy(Some("dfs")).unwrap(), QueueStrategy::Dfs);
        assert!(parse_strategy(Some("random")).is_err());
    }

    #[test]
    fn test_build_fetcher_respects_browser_switch() {
        let mut config = test_config();
        assert_eq!(build_fetcher(&config, EngineKind::Http).unwrap().kind(), EngineKind::Http);
        assert_eq!(build_fetcher(&config, EngineKind::Browser).unwrap().kind(), EngineKind::Browser);

        config.browser_service.enabled = false;
        assert!(build_fetcher(&config, EngineKind::Browser).is_err());
    }
}
