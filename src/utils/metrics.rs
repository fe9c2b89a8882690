use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Crawl metrics shared between workers
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub start_time: DateTime<Utc>,

    pub total_requests: usize,

    pub successful_requests: usize,

    pub failed_requests: usize,

    /// Requests that hit an anti-bot signal
    pub blocked_requests: usize,

    pub retried_requests: usize,

    /// Fetch durations per host, in milliseconds
    pub request_durations: HashMap<String, Vec<u64>>,

    /// Requests per started minute
    pub crawl_rate: Vec<(DateTime<Utc>, usize)>,

    pub bytes_downloaded: u64,

    pub current_rps: f64,

    pub peak_rps: f64,

    pub status_codes: BTreeMap<u16, usize>,

    pub custom_metrics: HashMap<String, serde_json::Value>,
}

/// One finished request as seen by the collector
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOutcome {
    pub success: bool,
    pub blocked: bool,
    pub duration_ms: u64,
    pub status_code: Option<u16>,
    pub bytes: u64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record a finished request against `host`
    pub async fn record_request(&self, host: &str, outcome: RequestOutcome) {
        let mut metrics = self.metrics.lock().await;

        metrics.total_requests += 1;
        if outcome.success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }
        if outcome.blocked {
            metrics.blocked_requests += 1;
        }

        metrics.bytes_downloaded += outcome.bytes;

        metrics.request_durations
            .entry(host.to_string())
            .or_default()
            .push(outcome.duration_ms);

        if let Some(code) = outcome.status_code {
            *metrics.status_codes.entry(code).or_default() += 1;
        }

        let now = Utc::now();
        match metrics.crawl_rate.last_mut() {
            Some((last_time, count)) if (now - *last_time).num_seconds() < 60 => *count += 1,
            _ => metrics.crawl_rate.push((now, 1)),
        }

        if let Some(&(first_time, _)) = metrics.crawl_rate.first() {
            let elapsed_seconds = (now - first_time).num_seconds().max(1) as f64;
            metrics.current_rps = metrics.total_requests as f64 / elapsed_seconds;
            metrics.peak_rps = metrics.peak_rps.max(metrics.current_rps);
        }
    }

    pub async fn record_retry(&self) {
        self.metrics.lock().await.retried_requests += 1;
    }

    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    pub async fn set_custom_metric<T: Serialize>(&self, name: &str, value: T) {
        let mut metrics = self.metrics.lock().await;

        if let Ok(json_value) = serde_json::to_value(value) {
            metrics.custom_metrics.insert(name.to_string(), json_value);
        }
    }

    pub async fn bytes_downloaded(&self) -> u64 {
        self.metrics.lock().await.bytes_downloaded
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    pub async fn reset(&self) {
        let mut metrics = self.metrics.lock().await;
        *metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };
    }
}

/// Measures one request
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// Elapsed milliseconds since the timer started
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_outcomes() {
        let collector = MetricsCollector::new();

        collector
            .record_request("example.com", RequestOutcome {
                success: true,
                duration_ms: 120,
                status_code: Some(200),
                bytes: 2048,
                ..Default::default()
            })
            .await;
        collector
            .record_request("example.com", RequestOutcome {
                blocked: true,
                duration_ms: 40,
                status_code: Some(403),
                bytes: 100,
                ..Default::default()
            })
            .await;
        collector.record_retry().await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.blocked_requests, 1);
        assert_eq!(metrics.retried_requests, 1);
        assert_eq!(metrics.bytes_downloaded, 2148);
        assert_eq!(metrics.status_codes[&403], 1);
        assert_eq!(metrics.request_durations["example.com"], vec![120, 40]);
        assert!(metrics.current_rps > 0.0);
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let collector = MetricsCollector::new();
        collector.record_request("a.com", RequestOutcome { success: true, ..Default::default() }).await;
        collector.set_custom_metric("queue_backend", "memory").await;

        collector.reset().await;
        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_requests, 0);
        assert!(metrics.custom_metrics.is_empty());
    }
}
