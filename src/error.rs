use thiserror::Error;

use crate::crawler::detect::BlockSignal;

/// Errors raised while validating, fetching or scraping a request.
///
/// Every fetch-related variant carries the URL it was raised for so that
/// retry bookkeeping upstream never has to guess which request failed.
#[derive(Debug, Clone, Error)]
pub enum CrawlError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported job type: {0}")]
    UnsupportedJobType(String),

    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("{url} blocked by anti-bot protection: {signal}")]
    Blocked { url: String, signal: BlockSignal },

    #[error("failed to parse response from {url}: {message}")]
    Parse { url: String, message: String },

    #[error("{url} is not a {platform} URL")]
    UnsupportedPlatformUrl { url: String, platform: String },

    #[error("{platform}: all strategies failed (primary: {primary}; fallback: {fallback})")]
    StrategyChainExhausted {
        platform: String,
        primary: String,
        fallback: String,
    },
}

impl CrawlError {
    /// The URL this error relates to, if any
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::InvalidUrl { url, .. }
            | Self::Timeout { url, .. }
            | Self::Network { url, .. }
            | Self::HttpStatus { url, .. }
            | Self::Blocked { url, .. }
            | Self::Parse { url, .. }
            | Self::UnsupportedPlatformUrl { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Whether the failure means the identity used for the request is burned
    pub fn is_anti_bot(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => matches!(status, 403 | 429),
            Self::Blocked { .. } => true,
            _ => false,
        }
    }

    /// Whether the request is worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } | Self::Blocked { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || matches!(status, 403 | 408 | 429),
            _ => false,
        }
    }

    /// Whether this is a validation error rejected before anything is queued
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. }
                | Self::UnsupportedJobType(_)
                | Self::UnsupportedFormat(_)
                | Self::UnsupportedPlatformUrl { .. }
        )
    }
}
