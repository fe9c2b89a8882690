pub mod autoscale;
pub mod browser;
pub mod cli;
pub mod crawler;
pub mod dataset;
pub mod error;
pub mod platforms;
pub mod proxy;
pub mod stealth;
pub mod storage;
pub mod utils;

pub use crawler::{CrawlEvent, CrawlJob, CrawlerController, JobStatus, JobType};
pub use error::CrawlError;
