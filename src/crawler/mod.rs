pub mod controller;
pub mod detect;
pub mod engine;
pub mod extract;
pub mod fetcher;
pub mod job;
pub mod limiter;
pub mod links;
pub mod politeness;
pub mod task;

// Re-export common types
pub use controller::{CrawlEvent, CrawlerController};
pub use detect::BlockSignal;
pub use engine::{CrawlerEngine, HandledRequest};
pub use fetcher::{BrowserFetcher, EngineKind, FetchContext, Fetcher, HttpFetcher};
pub use job::{CrawlJob, JobStatus, JobType};
pub use limiter::{JobResourceLimiter, JobStats, ResourceLimits, StopDecision};
pub use links::{extract_links, LinkFilter};
pub use task::{CrawlRequest, CrawlResult, RequestState};
