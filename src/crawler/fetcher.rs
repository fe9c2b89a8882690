use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::browser::RemoteBrowserService;
use crate::crawler::task::{CrawlRequest, CrawlResult};
use crate::error::CrawlError;
use crate::stealth::Fingerprint;

/// Which transport performs the fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Http,
    Browser,
}

impl EngineKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "browser" => Some(Self::Browser),
            _ => None,
        }
    }
}

/// Identity and limits a single fetch runs under
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub headers: BTreeMap<String, String>,
    pub proxy_url: Option<String>,
    pub fingerprint: Fingerprint,
    pub timeout: Duration,
}

/// Transport seam shared by the HTTP and browser engines.
///
/// Implementations return any HTTP status as `Ok`; deciding what counts as a
/// failure is left to the engine so detectors can inspect error pages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn kind(&self) -> EngineKind;

    async fn fetch(&self, request: &CrawlRequest, context: &FetchContext) -> Result<CrawlResult, CrawlError>;
}

/// Direct HTTP fetches with one pooled client per proxy
pub struct HttpFetcher {
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, url: &str, proxy_url: Option<&str>) -> Result<Client, CrawlError> {
        let mut clients = self.clients.lock().await;
        let key = proxy_url.map(str::to_string);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy_url) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| CrawlError::Network {
                url: url.to_string(),
                message: format!("invalid proxy {}: {}", proxy_url, e),
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| CrawlError::Network {
            url: url.to_string(),
            message: format!("failed to build HTTP client: {}", e),
        })?;

        debug!("Created HTTP client for proxy {:?}", key);
        clients.insert(key, client.clone());

        Ok(client)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn kind(&self) -> EngineKind {
        EngineKind::Http
    }

    async fn fetch(&self, request: &CrawlRequest, context: &FetchContext) -> Result<CrawlResult, CrawlError> {
        let client = self.client_for(&request.url, context.proxy_url.as_deref()).await?;

        let mut builder = client.get(&request.url).timeout(context.timeout);
        for (name, value) in &context.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let map_error = |e: reqwest::Error| {
            if e.is_timeout() {
                CrawlError::Timeout {
                    url: request.url.clone(),
                    timeout_ms: context.timeout.as_millis() as u64,
                }
            } else {
                CrawlError::Network {
                    url: request.url.clone(),
                    message: e.to_string(),
                }
            }
        };

        let response = builder.send().await.map_err(map_error)?;

        let status_code = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect();
        let content_type = headers.get("content-type").cloned().unwrap_or_default();
        let final_url = response.url().to_string();

        let body = response.text().await.map_err(map_error)?;

        debug!("Fetched {} ({} bytes, HTTP {})", final_url, body.len(), status_code);

        Ok(CrawlResult {
            url: final_url,
            status_code,
            body,
            headers,
            content_type,
            request: request.clone(),
        })
    }
}

/// Fetches through the remote browser service using the session fingerprint
pub struct BrowserFetcher {
    service: Arc<RemoteBrowserService>,
}

impl BrowserFetcher {
    pub fn new(service: Arc<RemoteBrowserService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Fetcher for BrowserFetcher {
    fn kind(&self) -> EngineKind {
        EngineKind::Browser
    }

    async fn fetch(&self, request: &CrawlRequest, context: &FetchContext) -> Result<CrawlResult, CrawlError> {
        let response = self
            .service
            .crawl_url(
                &request.url,
                &context.fingerprint,
                &context.headers,
                context.proxy_url.as_deref(),
                context.timeout.as_millis() as u64,
            )
            .await
            .map_err(|e| CrawlError::Network {
                url: request.url.clone(),
                message: format!("{:#}", e),
            })?;

        let content_type = response
            .headers
            .get("content-type")
            .cloned()
            .unwrap_or_else(|| "text/html".to_string());

        Ok(CrawlResult {
            url: response.url,
            status_code: response.status_code.unwrap_or(200),
            body: response.content,
            headers: response.headers,
            content_type,
            request: request.clone(),
        })
    }
}
