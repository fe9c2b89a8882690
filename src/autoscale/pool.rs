//! Worker pool whose concurrency follows system load.
//!
//! The pool dispatches `PoolTask::run_task` while fewer than
//! `desired_concurrency` workers are active and the task reports work ready.
//! Every `autoscale_interval` the desired value moves by at most one step,
//! driven by the latest resource snapshot. Lowering it never interrupts
//! running workers; it only withholds new dispatches.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, error, info};

use crate::autoscale::snapshotter::{LoadThresholds, MemoryProbe, ResourceSnapshot, Snapshotter, SystemMemoryProbe};
use crate::cli::config::AutoscaleSettings;

/// Inputs of one scaling decision
#[derive(Debug, Clone, Copy)]
pub struct ScalingInput {
    pub current: usize,
    pub active: usize,
    pub backlog: usize,
    pub snapshot: ResourceSnapshot,
}

#[derive(Debug, Clone, Copy)]
pub struct ScalingLimits {
    pub min: usize,
    pub max: usize,
    pub thresholds: LoadThresholds,
}

/// Desired concurrency after one autoscale check.
///
/// Overload shrinks by one. Growth needs spare resources, pending work and
/// every current slot in use.
pub fn next_concurrency(input: &ScalingInput, limits: &ScalingLimits) -> usize {
    let min = limits.min.max(1);
    let max = limits.max.max(min);

    let next = if input.snapshot.is_overloaded(&limits.thresholds) {
        input.current.saturating_sub(1)
    } else if input.backlog > 0 && input.active >= input.current {
        input.current + 1
    } else {
        input.current
    };

    next.clamp(min, max)
}

/// Work source driven by the pool
#[async_trait]
pub trait PoolTask: Send + Sync + 'static {
    /// Whether a call to `run_task` would find work now
    async fn is_task_ready(&self) -> bool;

    /// Process one unit of work
    async fn run_task(&self) -> Result<()>;

    /// No work is left and none will appear
    async fn is_finished(&self) -> bool;

    /// Pending units of work, used for scale-up decisions
    async fn backlog(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub desired_concurrency: usize,
    pub autoscale_interval: Duration,
    pub snapshot_interval: Duration,
    /// How long to wait before polling an idle task again
    pub poll_interval: Duration,
    pub thresholds: LoadThresholds,
    pub history_size: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from(&AutoscaleSettings::default())
    }
}

impl From<&AutoscaleSettings> for PoolOptions {
    fn from(settings: &AutoscaleSettings) -> Self {
        Self {
            min_concurrency: settings.min_concurrency,
            max_concurrency: settings.max_concurrency,
            desired_concurrency: settings.desired_concurrency,
            autoscale_interval: Duration::from_millis(settings.autoscale_interval_ms),
            snapshot_interval: Duration::from_millis(settings.snapshot_interval_ms),
            poll_interval: Duration::from_millis(50),
            thresholds: LoadThresholds {
                max_event_loop_lag_ms: settings.max_event_loop_lag_ms,
                max_memory_ratio: settings.max_memory_ratio,
            },
            history_size: settings.history_size,
        }
    }
}

/// Cloneable control handle of a running pool
#[derive(Clone)]
pub struct PoolHandle {
    aborted: Arc<AtomicBool>,
    wake: Arc<Notify>,
    desired: Arc<AtomicUsize>,
}

impl PoolHandle {
    /// Stop dispatching; `run` returns once in-flight tasks finish
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn desired_concurrency(&self) -> usize {
        self.desired.load(Ordering::SeqCst)
    }
}

pub struct AutoscaledPool {
    options: PoolOptions,
    snapshotter: Arc<Snapshotter>,
    handle: PoolHandle,
    max_active: AtomicUsize,
}

impl AutoscaledPool {
    pub fn new(options: PoolOptions, max_memory_mb: Option<u64>) -> Self {
        Self::with_probe(options, Arc::new(SystemMemoryProbe::new(max_memory_mb)))
    }

    pub fn with_probe(options: PoolOptions, probe: Arc<dyn MemoryProbe>) -> Self {
        let min = options.min_concurrency.max(1);
        let max = options.max_concurrency.max(min);
        let desired = options.desired_concurrency.clamp(min, max);

        Self {
            snapshotter: Arc::new(Snapshotter::new(probe, options.history_size)),
            handle: PoolHandle {
                aborted: Arc::new(AtomicBool::new(false)),
                wake: Arc::new(Notify::new()),
                desired: Arc::new(AtomicUsize::new(desired)),
            },
            max_active: AtomicUsize::new(0),
            options: PoolOptions {
                min_concurrency: min,
                max_concurrency: max,
                desired_concurrency: desired,
                ..options
            },
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn desired_concurrency(&self) -> usize {
        self.handle.desired_concurrency()
    }

    /// Highest number of simultaneously running tasks seen so far
    pub fn max_active_seen(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn snapshotter(&self) -> &Arc<Snapshotter> {
        &self.snapshotter
    }

    fn limits(&self) -> ScalingLimits {
        ScalingLimits {
            min: self.options.min_concurrency,
            max: self.options.max_concurrency,
            thresholds: self.options.thresholds,
        }
    }

    /// Apply one autoscale check and return the new desired concurrency
    pub async fn autoscale(&self, active: usize, backlog: usize) -> usize {
        let snapshot = self.snapshotter.latest().await.unwrap_or_default();
        let current = self.desired_concurrency();
        let next = next_concurrency(
            &ScalingInput {
                current,
                active,
                backlog,
                snapshot,
            },
            &self.limits(),
        );

        if next != current {
            debug!(
                "Autoscale {} -> {} (active {}, backlog {}, lag {}ms, memory {:.2})",
                current, next, active, backlog, snapshot.event_loop_lag_ms, snapshot.memory_ratio
            );
            self.handle.desired.store(next, Ordering::SeqCst);
        }
        next
    }

    /// Drive `task` until it is finished or the pool is aborted.
    ///
    /// Failed task runs are logged and never stop the pool.
    pub async fn run(&self, task: Arc<dyn PoolTask>) {
        info!(
            "Autoscaled pool starting (concurrency {}..={}, desired {})",
            self.options.min_concurrency,
            self.options.max_concurrency,
            self.desired_concurrency()
        );

        self.snapshotter.tick(Duration::ZERO).await;
        let snapshots = self.snapshotter.start(self.options.snapshot_interval);
        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        let mut autoscale_tick = tokio::time::interval(self.options.autoscale_interval);
        autoscale_tick.tick().await;

        loop {
            if !self.handle.is_aborted() {
                while workers.len() < self.desired_concurrency() && task.is_task_ready().await {
                    let task = Arc::clone(&task);
                    workers.spawn(async move { task.run_task().await });
                    self.max_active.fetch_max(workers.len(), Ordering::SeqCst);
                }
            }

            if workers.is_empty() && (self.handle.is_aborted() || task.is_finished().await) {
                break;
            }

            tokio::select! {
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("Pool task failed: {:#}", e),
                        Err(e) => error!("Pool task panicked or was cancelled: {}", e),
                    }
                }
                _ = autoscale_tick.tick() => {
                    let backlog = task.backlog().await;
                    self.autoscale(workers.len(), backlog).await;
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = self.handle.wake.notified() => {}
            }
        }

        snapshots.stop().await;
        info!("Autoscaled pool finished (peak concurrency {})", self.max_active_seen());
    }
}
