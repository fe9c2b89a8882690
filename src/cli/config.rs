use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{info, debug, error};
use std::collections::HashMap;

use crate::crawler::fetcher::EngineKind;
use crate::crawler::limiter::ResourceLimits;
use crate::storage::QueueStrategy;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSettings,
    pub autoscale: AutoscaleSettings,
    pub session: SessionSettings,
    pub browser: BrowserSettings,
    pub proxy: ProxySettings,
    pub limits: ResourceLimits,
    pub storage: StorageSettings,
    pub browser_service: BrowserServiceSettings,
}

/// Remote browser service used by the browser engine
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserServiceSettings {
    pub enabled: bool,
    pub url: String,
    pub timeout_ms: u64,
}

/// Crawler-specific settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlerSettings {
    pub max_depth: u32,
    /// Per-request retry budget
    pub max_retries: u32,
    pub strategy: QueueStrategy,
    pub engine: EngineKind,
    pub same_domain_only: bool,
    pub request_timeout_ms: u64,
    pub politeness_delay: u64,  // Delay between requests in milliseconds
    pub politeness_jitter: u64, // Upper bound of the random extra delay
    pub max_requests_per_minute: Option<u32>,
    pub url_patterns: UrlPatterns,
    /// Let seo jobs follow links past the start page
    pub seo_follow_links: bool,
}

/// URL pattern settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Autoscaled pool and snapshotter settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AutoscaleSettings {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub desired_concurrency: usize,
    pub autoscale_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    /// Lag above which the event loop counts as overloaded
    pub max_event_loop_lag_ms: u64,
    /// Fraction of `max_memory_mb` above which memory counts as overloaded
    pub max_memory_ratio: f64,
    /// Memory budget; defaults to a quarter of system memory
    pub max_memory_mb: Option<u64>,
    pub history_size: usize,
}

/// Session pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionSettings {
    pub max_pool_size: usize,
    pub max_usage_count: u32,
    pub max_error_score: f64,
}

/// Browser simulation settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserSettings {
    pub browser_type: String,  // "chrome", "firefox", etc.
    pub headless: bool,
    pub fingerprints: Vec<BrowserFingerprint>,
    pub behavior: BrowserBehavior,
}

/// Browser fingerprint settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub extra_headers: HashMap<String, String>,
}

/// Browser behavior simulation settings, forwarded to the browser service
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserBehavior {
    pub scroll_behavior: String,  // "random", "smooth", "none"
    pub click_delay: (u64, u64),  // Min and max delay in milliseconds
    pub mouse_movement: bool,
    pub wait_for_idle_ms: u64,
}

/// Proxy settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProxySettings {
    pub enabled: bool,
    pub rotation_strategy: String, // "session", "request", "timed"
    pub rotation_interval: Option<u64>, // Seconds between rotations if using "timed"
    pub selection: String, // "random", "round_robin"
    pub proxy_list: Vec<ProxyConfig>,
}

/// Individual proxy configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    pub name: String,
    pub proxy_type: String, // "http", "socks5"
    pub address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub country: Option<String>,
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageSettings {
    pub queue: QueueSettings,
    pub results: ResultsSettings,
}

/// Queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueSettings {
    pub backend: String, // "redis", "memory"
    pub redis_url: String,
    pub task_ttl: u64, // Time to live for queue keys in seconds
    pub connect_timeout_ms: u64,
    pub key_prefix: String,
}

/// Job and dataset storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResultsSettings {
    pub storage_type: String, // "memory", "filesystem"
    pub path: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: "redis".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            task_ttl: 86400,
            connect_timeout_ms: 2000,
            key_prefix: "crawlforge".to_string(),
        }
    }
}

impl Default for ResultsSettings {
    fn default() -> Self {
        let path = directories::ProjectDirs::from("com", "crawlforge", "crawlforge")
            .map(|dirs| dirs.data_dir().join("results"))
            .unwrap_or_else(|| PathBuf::from("./data/results"));

        Self {
            storage_type: "filesystem".to_string(),
            path: path.to_string_lossy().into_owned(),
        }
    }
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_retries: 3,
            strategy: QueueStrategy::Bfs,
            engine: EngineKind::Http,
            same_domain_only: true,
            request_timeout_ms: 30_000,
            politeness_delay: 1000,
            politeness_jitter: 500,
            max_requests_per_minute: Some(60),
            url_patterns: UrlPatterns::default(),
            seo_follow_links: false,
        }
    }
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 16,
            desired_concurrency: 2,
            autoscale_interval_ms: 1000,
            snapshot_interval_ms: 500,
            max_event_loop_lag_ms: 50,
            max_memory_ratio: 0.7,
            max_memory_mb: None,
            history_size: 30,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            max_usage_count: 50,
            max_error_score: 3.0,
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            browser_type: "chrome".to_string(),
            headless: true,
            fingerprints: vec![],
            behavior: BrowserBehavior {
                scroll_behavior: "random".to_string(),
                click_delay: (100, 300),
                mouse_movement: true,
                wait_for_idle_ms: 1500,
            },
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rotation_strategy: "session".to_string(),
            rotation_interval: Some(600),
            selection: "random".to_string(),
            proxy_list: vec![],
        }
    }
}

impl Default for BrowserServiceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:5000".to_string(),
            timeout_ms: 120_000,
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerSettings::default(),
            autoscale: AutoscaleSettings::default(),
            session: SessionSettings::default(),
            browser: BrowserSettings::default(),
            proxy: ProxySettings::default(),
            limits: ResourceLimits {
                max_pages: Some(1000),
                max_duration_ms: None,
                max_bytes: None,
            },
            storage: StorageSettings::default(),
            browser_service: BrowserServiceSettings::default(),
        }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "crawlforge", "crawlforge") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the sites directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        // Move back up to the config directory
        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let config_dir = Self::config_dir();
        let profile_path = config_dir.join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file; missing sections take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(sites_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}
