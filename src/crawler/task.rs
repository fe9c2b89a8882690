use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};

use crate::error::CrawlError;
use crate::utils::url::{normalize_unique_key, normalize_url};

/// A single unit of crawl work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRequest {
    /// URL to crawl
    pub url: String,

    /// Normalized identity; two requests with the same key are the same work item
    pub unique_key: String,

    /// Current depth in the crawl tree (0 for seed URLs)
    pub depth: u32,

    /// Parent URL that led to this URL (None for seed URLs)
    #[serde(default)]
    pub parent_url: Option<String>,

    /// Free-form data carried along with the request
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Number of attempts that already failed
    #[serde(default)]
    pub retry_count: u32,
}

impl CrawlRequest {
    /// Create a seed request, rejecting malformed URLs
    pub fn new(url: &str) -> Result<Self, CrawlError> {
        let unique_key = normalize_url(url)?;

        Ok(Self {
            url: url.trim().to_string(),
            unique_key,
            depth: 0,
            parent_url: None,
            metadata: Map::new(),
            retry_count: 0,
        })
    }

    /// Create a request discovered on `parent`
    pub fn child_of(parent: &CrawlRequest, url: &str) -> Result<Self, CrawlError> {
        let mut request = Self::new(url)?;
        request.depth = parent.depth + 1;
        request.parent_url = Some(parent.url.clone());
        Ok(request)
    }

    /// Override the identity key
    pub fn with_unique_key(mut self, key: &str) -> Self {
        self.unique_key = normalize_unique_key(key);
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Send an extra header with this request, on top of the session's
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let headers = self
            .metadata
            .entry("headers")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(headers) = headers {
            headers.insert(name.to_string(), Value::String(value.to_string()));
        }
        self
    }

    /// Extra headers attached with `with_header`
    pub fn extra_headers(&self) -> BTreeMap<String, String> {
        self.metadata
            .get("headers")
            .and_then(Value::as_object)
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|(name, value)| value.as_str().map(|v| (name.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Outcome of a successful fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    /// Final URL that was fetched
    pub url: String,

    /// HTTP status code
    pub status_code: u16,

    /// Response body or the content extracted by the browser service
    pub body: String,

    /// Response headers, lowercased names
    pub headers: BTreeMap<String, String>,

    /// Content type of the response
    pub content_type: String,

    /// Request that produced this result
    pub request: CrawlRequest,
}

impl CrawlResult {
    /// Size of the body in bytes
    pub fn bytes(&self) -> u64 {
        self.body.len() as u64
    }

    /// Whether the response looks like an HTML document
    pub fn is_html(&self) -> bool {
        self.content_type.is_empty() || self.content_type.contains("html")
    }
}

/// Per-request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    InFlight,
    Succeeded,
    Failed,
}

impl RequestState {
    /// Advance the state machine; terminal states never move
    pub fn advance(self, success: Option<bool>) -> Self {
        match (self, success) {
            (Self::Queued, None) => Self::InFlight,
            (Self::InFlight, Some(true)) => Self::Succeeded,
            (Self::InFlight, Some(false)) => Self::Failed,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}
