use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::crawler::limiter::JobStats;
use crate::error::CrawlError;
use crate::utils::url::normalize_url;

/// What a job extracts from the pages it visits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Url,
    Seo,
}

impl JobType {
    pub fn parse(value: &str) -> Result<Self, CrawlError> {
        match value.to_ascii_lowercase().as_str() {
            "url" => Ok(Self::Url),
            "seo" => Ok(Self::Seo),
            other => Err(CrawlError::UnsupportedJobType(other.to_string())),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url => write!(f, "url"),
            Self::Seo => write!(f, "seo"),
        }
    }
}

/// Job-level state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    /// Stopped early by the resource limiter
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Stopped)
    }

    /// Allowed transitions of the job lifecycle
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) => true,
            (Running, Cancelled) | (Running, Stopped) => true,
            (Paused, Running) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

/// A submitted crawl job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: String,
    pub url: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Human-readable reason for a limiter stop or failure
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stats: JobStats,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl CrawlJob {
    /// Validate the seed URL and build a pending job
    pub fn new(url: &str, job_type: JobType, max_retries: u32) -> Result<Self, CrawlError> {
        normalize_url(url)?;
        let now = Utc::now();

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            url: url.trim().to_string(),
            job_type,
            status: JobStatus::Pending,
            priority: 0,
            retry_count: 0,
            max_retries,
            user_id: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            stop_reason: None,
            stats: JobStats::default(),
            errors: Vec::new(),
        })
    }

    /// Move to `next` if the lifecycle allows it; returns whether it moved
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        let now = Utc::now();
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        true
    }
}
