use anyhow::{Result, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Instant, Duration};
use tracing::{debug, warn, error};
use reqwest::Client;
use std::collections::HashMap;

use crate::cli::config::{ProxySettings, ProxyConfig};

/// When the active proxy changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    /// New proxy on every call
    Request,
    /// Keep the proxy until it fails
    Session,
    /// Rotate once the interval has elapsed
    Timed(Duration),
}

impl RotationStrategy {
    pub fn from_settings(settings: &ProxySettings) -> Self {
        match settings.rotation_strategy.as_str() {
            "request" => Self::Request,
            "session" => Self::Session,
            "timed" => Self::Timed(Duration::from_secs(settings.rotation_interval.unwrap_or(600))),
            other => {
                warn!("Unknown proxy rotation strategy '{}', rotating per request", other);
                Self::Request
            }
        }
    }
}

/// How the next proxy is picked among the working ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxySelection {
    Random,
    RoundRobin,
}

impl ProxyConfig {
    /// Proxy URL understood by reqwest and the browser service
    pub fn url(&self) -> Option<String> {
        let (scheme, default_port) = match self.proxy_type.as_str() {
            "http" => ("http", 8080),
            "https" => ("https", 8443),
            "socks5" => ("socks5", 1080),
            _ => return None,
        };
        let port = self.port.unwrap_or(default_port);

        Some(match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                format!("{}://{}:{}@{}:{}", scheme, username, password, self.address, port)
            }
            _ => format!("{}://{}:{}", scheme, self.address, port),
        })
    }
}

/// Proxy rotation and management
pub struct ProxyManager {
    /// Proxy configuration
    config: ProxySettings,

    strategy: RotationStrategy,

    selection: ProxySelection,

    /// Currently active proxy
    current_proxy: Option<ProxyConfig>,

    /// Last rotation time
    last_rotation: Instant,

    /// Proxy status map (address -> working status)
    proxy_status: HashMap<String, bool>,

    /// Next index for round-robin selection
    cursor: usize,

    rng: StdRng,
}

impl ProxyManager {
    /// Create a new proxy manager
    pub fn new(config: ProxySettings) -> Self {
        let strategy = RotationStrategy::from_settings(&config);
        let selection = match config.selection.as_str() {
            "round_robin" => ProxySelection::RoundRobin,
            _ => ProxySelection::Random,
        };

        Self {
            config,
            strategy,
            selection,
            current_proxy: None,
            last_rotation: Instant::now(),
            proxy_status: HashMap::new(),
            cursor: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic selection for tests
    pub fn with_seed(config: ProxySettings, seed: u64) -> Self {
        let mut manager = Self::new(config);
        manager.rng = StdRng::seed_from_u64(seed);
        manager
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.proxy_list.is_empty()
    }

    /// Get a proxy for use; None when proxies are disabled
    pub fn get_proxy(&mut self) -> Result<Option<ProxyConfig>> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let should_rotate = match self.strategy {
            RotationStrategy::Request => true,
            RotationStrategy::Timed(interval) => self.last_rotation.elapsed() >= interval,
            RotationStrategy::Session => false,
        };

        if should_rotate || self.current_proxy.is_none() {
            self.rotate_proxy()?;
        }

        Ok(self.current_proxy.clone())
    }

    /// Rotate to a new proxy
    pub fn rotate_proxy(&mut self) -> Result<()> {
        if self.config.proxy_list.is_empty() {
            anyhow::bail!("No proxies configured");
        }

        let mut working: Vec<&ProxyConfig> = self.config.proxy_list.iter()
            .filter(|p| *self.proxy_status.get(&p.address).unwrap_or(&true))
            .collect();

        if working.is_empty() {
            // Every proxy has failed; give them all another chance
            debug!("No working proxies found, resetting status");
            self.proxy_status.clear();
            working = self.config.proxy_list.iter().collect();
        }

        let index = match self.selection {
            ProxySelection::Random => self.rng.gen_range(0..working.len()),
            ProxySelection::RoundRobin => {
                let index = self.cursor % working.len();
                self.cursor = self.cursor.wrapping_add(1);
                index
            }
        };
        let new_proxy = working[index].clone();

        debug!("Rotated to proxy: {}", new_proxy.name);

        self.current_proxy = Some(new_proxy);
        self.last_rotation = Instant::now();

        Ok(())
    }

    /// Exclude a proxy from selection until every proxy has failed
    pub fn mark_failed(&mut self, address: &str) {
        debug!("Marking proxy as failed: {}", address);
        self.proxy_status.insert(address.to_string(), false);

        if self.current_proxy.as_ref().map_or(false, |p| p.address == address) {
            self.current_proxy = None;
        }
    }

    /// Mark the current proxy as failed and rotate away from it
    pub fn mark_current_failed(&mut self) -> Result<()> {
        if let Some(proxy) = self.current_proxy.clone() {
            self.mark_failed(&proxy.address);
            self.rotate_proxy()?;
        }

        Ok(())
    }

    /// Find the configured proxy behind a proxy URL
    pub fn find_by_url(&self, proxy_url: &str) -> Option<&ProxyConfig> {
        self.config.proxy_list.iter().find(|p| p.url().as_deref() == Some(proxy_url))
    }

    /// Test all proxies and update their status
    pub async fn test_all_proxies(&mut self) -> Result<()> {
        for proxy in &self.config.proxy_list {
            let working = Self::test_proxy(proxy).await;
            self.proxy_status.insert(proxy.address.clone(), working);

            if working {
                debug!("Proxy tested OK: {}", proxy.name);
            } else {
                warn!("Proxy test failed: {}", proxy.name);
            }
        }

        Ok(())
    }

    /// Test a single proxy
    async fn test_proxy(proxy: &ProxyConfig) -> bool {
        let Some(proxy_url) = proxy.url() else {
            error!("Unsupported proxy type: {}", proxy.proxy_type);
            return false;
        };

        let client = match Self::proxied_client(&proxy_url) {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to create proxy client for {}: {:#}", proxy.name, e);
                return false;
            }
        };

        // Test the proxy by making a request to a reliable endpoint
        match client.get("https://www.google.com").send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn proxied_client(proxy_url: &str) -> Result<Client> {
        let proxy = reqwest::Proxy::all(proxy_url)
            .context(format!("Invalid proxy URL {}", proxy_url))?;

        Client::builder()
            .timeout(Duration::from_secs(10))
            .proxy(proxy)
            .build()
            .context("Failed to create HTTP client")
    }
}
