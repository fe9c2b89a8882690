use anyhow::{Result, Context};
use reqwest::Client;
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error};

use crate::cli::config::{BrowserBehavior, BrowserServiceSettings, BrowserSettings};
use crate::stealth::Fingerprint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceRequest {
    pub url: String,
    pub browser_type: String,
    pub headless: bool,
    pub fingerprint: Fingerprint,
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<String>,
    pub behavior: BrowserBehavior,
    pub timeout_ms: u64,
    pub take_screenshot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceResponse {
    pub success: bool,
    pub url: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub links: Vec<String>,
    pub screenshot: Option<String>,
    pub error: Option<String>,
}

/// Client for the external browser-automation service
pub struct RemoteBrowserService {
    client: Client,
    base_url: String,
    browser_type: String,
    headless: bool,
    behavior: BrowserBehavior,
}

impl RemoteBrowserService {
    pub fn new(settings: &BrowserServiceSettings, browser: &BrowserSettings) -> Result<Self> {
        // Environment wins so containers can point at a sidecar
        let base_url = std::env::var("BROWSER_SERVICE_URL")
            .unwrap_or_else(|_| settings.url.clone());

        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            browser_type: browser.browser_type.clone(),
            headless: browser.headless,
            behavior: browser.behavior.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Render a page in the service's browser under the given identity
    pub async fn crawl_url(
        &self,
        url: &str,
        fingerprint: &Fingerprint,
        headers: &BTreeMap<String, String>,
        proxy: Option<&str>,
        timeout_ms: u64,
    ) -> Result<BrowserServiceResponse> {
        let endpoint = format!("{}/crawl", self.base_url);

        let request = BrowserServiceRequest {
            url: url.to_string(),
            browser_type: self.browser_type.clone(),
            headless: self.headless,
            fingerprint: fingerprint.clone(),
            headers: headers.clone(),
            proxy: proxy.map(str::to_string),
            behavior: self.behavior.clone(),
            timeout_ms,
            take_screenshot: false,
        };

        debug!("Sending request to browser service: {}", url);

        let response = self.client.post(&endpoint)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to browser service")?
            .json::<BrowserServiceResponse>()
            .await
            .context("Failed to parse browser service response")?;

        if !response.success {
            if let Some(error) = &response.error {
                error!("Browser service error: {}", error);
                anyhow::bail!("Browser service error: {}", error);
            } else {
                anyhow::bail!("Browser service crawl failed with unknown error");
            }
        }

        debug!("Successfully crawled URL: {}", url);

        Ok(response)
    }
}
