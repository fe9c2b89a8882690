//! Resource snapshots feeding the autoscaled pool.
//!
//! Event-loop lag is measured as the drift of the sampling tick: a sleep of
//! `interval` that takes noticeably longer means the runtime is saturated.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Serialize, Deserialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// One sample of system load
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub event_loop_lag_ms: u64,
    /// Process memory divided by the memory budget
    pub memory_ratio: f64,
}

/// Limits past which a snapshot counts as overloaded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadThresholds {
    pub max_event_loop_lag_ms: u64,
    pub max_memory_ratio: f64,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            max_event_loop_lag_ms: 50,
            max_memory_ratio: 0.7,
        }
    }
}

impl ResourceSnapshot {
    pub fn is_overloaded(&self, thresholds: &LoadThresholds) -> bool {
        self.event_loop_lag_ms > thresholds.max_event_loop_lag_ms
            || self.memory_ratio > thresholds.max_memory_ratio
    }
}

/// Source of the memory ratio
pub trait MemoryProbe: Send + Sync {
    fn memory_ratio(&self) -> f64;
}

/// Process RSS against a fixed budget, read through sysinfo
pub struct SystemMemoryProbe {
    system: StdMutex<System>,
    pid: Option<Pid>,
    max_bytes: u64,
}

impl SystemMemoryProbe {
    /// Budget in megabytes; `None` uses a quarter of total system memory
    pub fn new(max_memory_mb: Option<u64>) -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let max_bytes = match max_memory_mb {
            Some(mb) => mb * 1024 * 1024,
            None => (system.total_memory() / 4).max(1),
        };

        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!("Could not determine current pid; memory ratio will read as 0");
        }

        Self {
            system: StdMutex::new(system),
            pid,
            max_bytes,
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn memory_ratio(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0.0;
        };

        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let used = system.process(pid).map_or(0, |process| process.memory());

        used as f64 / self.max_bytes as f64
    }
}

/// Bounded history of resource snapshots
pub struct Snapshotter {
    probe: Arc<dyn MemoryProbe>,
    history: RwLock<VecDeque<ResourceSnapshot>>,
    history_size: usize,
}

impl Snapshotter {
    pub fn new(probe: Arc<dyn MemoryProbe>, history_size: usize) -> Self {
        Self {
            probe,
            history: RwLock::new(VecDeque::new()),
            history_size: history_size.max(1),
        }
    }

    /// Take a sample with an externally measured lag
    pub async fn tick(&self, event_loop_lag: Duration) -> ResourceSnapshot {
        let snapshot = ResourceSnapshot {
            event_loop_lag_ms: event_loop_lag.as_millis() as u64,
            memory_ratio: self.probe.memory_ratio(),
        };

        let mut history = self.history.write().await;
        if history.len() == self.history_size {
            history.pop_front();
        }
        history.push_back(snapshot);

        trace!("Resource snapshot: {:?}", snapshot);
        snapshot
    }

    pub async fn latest(&self) -> Option<ResourceSnapshot> {
        self.history.read().await.back().copied()
    }

    pub async fn history(&self) -> Vec<ResourceSnapshot> {
        self.history.read().await.iter().copied().collect()
    }

    /// Sample every `interval` until the handle is stopped
    pub fn start(self: &Arc<Self>, interval: Duration) -> SnapshotterHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let snapshotter = Arc::clone(self);

        let handle = tokio::spawn(async move {
            debug!("Snapshotter started ({:?} interval)", interval);
            loop {
                let started = Instant::now();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let lag = started.elapsed().saturating_sub(interval);
                        snapshotter.tick(lag).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Snapshotter stopped");
        });

        SnapshotterHandle { shutdown_tx, handle }
    }
}

pub struct SnapshotterHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl SnapshotterHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(f64);

    impl MemoryProbe for FixedProbe {
        fn memory_ratio(&self) -> f64 {
            self.0
        }
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let snapshotter = Snapshotter::new(Arc::new(FixedProbe(0.25)), 3);
        for lag in 0..5u64 {
            snapshotter.tick(Duration::from_millis(lag)).await;
        }

        let history = snapshotter.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].event_loop_lag_ms, 2);

        let latest = snapshotter.latest().await.unwrap();
        assert_eq!(latest.event_loop_lag_ms, 4);
        assert_eq!(latest.memory_ratio, 0.25);
    }

    #[test]
    fn test_overload_thresholds() {
        let thresholds = LoadThresholds { max_event_loop_lag_ms: 50, max_memory_ratio: 0.7 };
        let idle = ResourceSnapshot { event_loop_lag_ms: 5, memory_ratio: 0.2 };
        let laggy = ResourceSnapshot { event_loop_lag_ms: 80, memory_ratio: 0.2 };
        let hungry = ResourceSnapshot { event_loop_lag_ms: 5, memory_ratio: 0.9 };

        assert!(!idle.is_overloaded(&thresholds));
        assert!(laggy.is_overloaded(&thresholds));
        assert!(hungry.is_overloaded(&thresholds));
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_snapshotter_samples_until_stopped() {
        let snapshotter = Arc::new(Snapshotter::new(Arc::new(FixedProbe(0.1)), 100));
        let handle = snapshotter.start(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(550)).await;
        handle.stop().await;

        let taken = snapshotter.history().await.len();
        assert!(taken >= 4, "only {} samples", taken);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(snapshotter.history().await.len(), taken);
    }

    #[test]
    fn test_system_probe_reads_a_ratio() {
        let probe = SystemMemoryProbe::new(Some(1024 * 1024));
        let ratio = probe.memory_ratio();
        assert!((0.0..1.0).contains(&ratio));
    }
}
