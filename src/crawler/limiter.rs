use serde::{Serialize, Deserialize};

/// Per-job ceilings. Any subset may be unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub max_pages: Option<u64>,
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

impl ResourceLimits {
    /// Overlay the set fields of `other` on top of these limits
    pub fn merge(&mut self, other: &ResourceLimits) {
        if other.max_pages.is_some() {
            self.max_pages = other.max_pages;
        }
        if other.max_duration_ms.is_some() {
            self.max_duration_ms = other.max_duration_ms;
        }
        if other.max_bytes.is_some() {
            self.max_bytes = other.max_bytes;
        }
    }
}

/// Live counters for a running job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pages_crawled: u64,
    pub elapsed_ms: u64,
    pub bytes_downloaded: u64,
}

/// Limiter verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopDecision {
    pub stop: bool,
    pub reason: Option<String>,
}

impl StopDecision {
    fn proceed() -> Self {
        Self { stop: false, reason: None }
    }

    fn halt(reason: String) -> Self {
        Self { stop: true, reason: Some(reason) }
    }
}

/// Enforces page, duration and byte ceilings for one job
#[derive(Debug, Clone, Default)]
pub struct JobResourceLimiter {
    limits: ResourceLimits,
}

impl JobResourceLimiter {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Merge new limits into the active ones
    pub fn set_limits(&mut self, limits: ResourceLimits) {
        self.limits.merge(&limits);
    }

    /// Check pages, then duration, then bytes; the first exceeded ceiling wins
    pub fn should_stop(&self, stats: &JobStats) -> StopDecision {
        if let Some(max) = self.limits.max_pages {
            if stats.pages_crawled >= max {
                return StopDecision::halt(format!(
                    "Page limit reached: {} of {} pages crawled",
                    stats.pages_crawled, max
                ));
            }
        }

        if let Some(max) = self.limits.max_duration_ms {
            if stats.elapsed_ms >= max {
                return StopDecision::halt(format!(
                    "Duration limit reached: {}ms elapsed, limit {}ms",
                    stats.elapsed_ms, max
                ));
            }
        }

        if let Some(max) = self.limits.max_bytes {
            if stats.bytes_downloaded >= max {
                return StopDecision::halt(format!(
                    "Download limit reached: {} bytes downloaded, limit {} bytes",
                    stats.bytes_downloaded, max
                ));
            }
        }

        StopDecision::proceed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pages: u64, elapsed_ms: u64, bytes: u64) -> JobStats {
        JobStats { pages_crawled: pages, elapsed_ms, bytes_downloaded: bytes }
    }

    #[test]
    fn test_page_ceiling_is_inclusive() {
        let limiter = JobResourceLimiter::new(ResourceLimits { max_pages: Some(100), ..Default::default() });
        assert!(limiter.should_stop(&stats(100, 0, 0)).stop);

        let limiter = JobResourceLimiter::new(ResourceLimits { max_pages: Some(101), ..Default::default() });
        assert!(!limiter.should_stop(&stats(100, 0, 0)).stop);
    }

    #[test]
    fn test_order_of_checks() {
        let limiter = JobResourceLimiter::new(ResourceLimits {
            max_pages: Some(10),
            max_duration_ms: Some(1_000),
            max_bytes: Some(500),
        });

        let decision = limiter.should_stop(&stats(10, 5_000, 5_000));
        assert!(decision.reason.unwrap().starts_with("Page limit"));

        let decision = limiter.should_stop(&stats(1, 5_000, 5_000));
        assert!(decision.reason.unwrap().starts_with("Duration limit"));

        let decision = limiter.should_stop(&stats(1, 10, 5_000));
        assert!(decision.reason.unwrap().starts_with("Download limit"));
    }

    #[test]
    fn test_unset_limits_never_stop() {
        let limiter = JobResourceLimiter::default();
        let decision = limiter.should_stop(&stats(u64::MAX, u64::MAX, u64::MAX));
        assert_eq!(decision, StopDecision { stop: false, reason: None });
    }

    #[test]
    fn test_set_limits_merges() {
        let mut limiter = JobResourceLimiter::new(ResourceLimits { max_pages: Some(5), ..Default::default() });
        limiter.set_limits(ResourceLimits { max_bytes: Some(10), ..Default::default() });

        assert_eq!(limiter.limits().max_pages, Some(5));
        assert_eq!(limiter.limits().max_bytes, Some(10));
        assert!(limiter.should_stop(&stats(0, 0, 10)).stop);
    }
}
