pub mod logging;
pub mod metrics;
pub mod url;

// Re-export common functions and types
pub use logging::{default_log_file, init_logging};
pub use metrics::{Metrics, MetricsCollector, RequestOutcome, RequestTimer};
pub use url::{normalize_unique_key, normalize_url};
