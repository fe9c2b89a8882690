//! Social platform scrapers.
//!
//! Each platform pairs a primary strategy (public JSON or embedded page state
//! over plain HTTP) with a fallback that reads the browser-rendered page. The
//! chain only reports failure once both strategies came back empty or broken.

pub mod instagram;
pub mod tiktok;
pub mod twitter;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::crawler::engine::CrawlerEngine;
use crate::crawler::task::{CrawlRequest, CrawlResult};
use crate::error::CrawlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Instagram,
    TikTok,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Twitter => write!(f, "twitter"),
            Self::Instagram => write!(f, "instagram"),
            Self::TikTok => write!(f, "tiktok"),
        }
    }
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Twitter, Platform::Instagram, Platform::TikTok];

    fn domains(self) -> &'static [&'static str] {
        match self {
            Self::Twitter => &["twitter.com", "x.com"],
            Self::Instagram => &["instagram.com"],
            Self::TikTok => &["tiktok.com"],
        }
    }

    /// First path segments that never name a profile
    fn reserved_paths(self) -> &'static [&'static str] {
        match self {
            Self::Twitter => &["home", "explore", "search", "i", "intent", "share", "hashtag", "settings", "notifications", "messages"],
            Self::Instagram => &["p", "reel", "reels", "explore", "stories", "accounts", "direct", "tv"],
            Self::TikTok => &["discover", "tag", "music", "foryou", "following", "live"],
        }
    }

    fn owns_host(self, host: &str) -> bool {
        self.domains()
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
    }

    /// Platform whose domain serves `url`
    pub fn detect(url: &str) -> Option<Platform> {
        let parsed = Url::parse(url.trim()).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        Self::ALL.into_iter().find(|platform| platform.owns_host(&host))
    }

    /// Validate that `url` is a profile URL of this platform
    pub fn parse_target(self, url: &str) -> Result<PlatformTarget, CrawlError> {
        let unsupported = || CrawlError::UnsupportedPlatformUrl {
            url: url.to_string(),
            platform: self.to_string(),
        };

        let parsed = Url::parse(url.trim()).map_err(|_| unsupported())?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(unsupported());
        }
        let host = parsed.host_str().ok_or_else(unsupported)?.to_ascii_lowercase();
        if !self.owns_host(&host) {
            return Err(unsupported());
        }

        let segment = parsed
            .path_segments()
            .and_then(|mut segments| segments.next())
            .unwrap_or_default();

        let username = match self {
            Self::TikTok => segment.strip_prefix('@').unwrap_or_default(),
            _ => segment,
        };

        let valid = !username.is_empty()
            && !self.reserved_paths().contains(&username.to_ascii_lowercase().as_str())
            && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(unsupported());
        }

        Ok(PlatformTarget {
            platform: self,
            url: url.trim().to_string(),
            username: username.to_string(),
        })
    }
}

/// A validated profile to scrape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformTarget {
    pub platform: Platform,
    pub url: String,
    pub username: String,
}

impl PlatformTarget {
    /// Canonical profile page
    pub fn profile_url(&self) -> String {
        match self.platform {
            Platform::Twitter => format!("https://x.com/{}", self.username),
            Platform::Instagram => format!("https://www.instagram.com/{}/", self.username),
            Platform::TikTok => format!("https://www.tiktok.com/@{}", self.username),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOptions {
    /// Upper bound on returned items
    pub max_items: usize,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self { max_items: 20 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub followers: Option<u64>,
    pub following: Option<u64>,
    pub posts: Option<u64>,
    pub avatar_url: Option<String>,
    pub verified: Option<bool>,
}

/// One post, tweet or video
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformItem {
    pub id: String,
    pub url: String,
    pub text: Option<String>,
    pub created_at: Option<String>,
    pub likes: Option<u64>,
    pub comments: Option<u64>,
    pub shares: Option<u64>,
    pub views: Option<u64>,
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutput {
    pub platform: Platform,
    pub source_url: String,
    /// Name of the strategy that produced the data
    pub strategy: String,
    pub profile: Option<ProfileInfo>,
    pub items: Vec<PlatformItem>,
}

impl ScrapeOutput {
    pub fn new(target: &PlatformTarget, strategy: &str) -> Self {
        Self {
            platform: target.platform,
            source_url: target.url.clone(),
            strategy: strategy.to_string(),
            profile: None,
            items: Vec::new(),
        }
    }

    /// Nothing usable was extracted
    pub fn is_empty(&self) -> bool {
        self.profile.is_none() && self.items.is_empty()
    }
}

/// One way of getting data for a platform target
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScrapeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn scrape(&self, target: &PlatformTarget, options: &ScrapeOptions) -> Result<ScrapeOutput, CrawlError>;
}

/// Primary strategy with a fallback for one platform
pub struct StrategyChain {
    platform: Platform,
    primary: Box<dyn ScrapeStrategy>,
    fallback: Box<dyn ScrapeStrategy>,
}

impl StrategyChain {
    pub fn new(platform: Platform, primary: Box<dyn ScrapeStrategy>, fallback: Box<dyn ScrapeStrategy>) -> Self {
        Self {
            platform,
            primary,
            fallback,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    async fn attempt(
        &self,
        strategy: &dyn ScrapeStrategy,
        target: &PlatformTarget,
        options: &ScrapeOptions,
    ) -> Result<ScrapeOutput, String> {
        match strategy.scrape(target, options).await {
            Ok(mut output) if !output.is_empty() => {
                output.items.truncate(options.max_items);
                Ok(output)
            }
            Ok(_) => Err(format!("{} returned no data", strategy.name())),
            Err(e) => Err(format!("{}: {}", strategy.name(), e)),
        }
    }

    /// Validate `url`, then try the primary and the fallback in turn
    pub async fn scrape(&self, url: &str, options: &ScrapeOptions) -> Result<ScrapeOutput, CrawlError> {
        let target = self.platform.parse_target(url)?;

        let primary = match self.attempt(self.primary.as_ref(), &target, options).await {
            Ok(output) => {
                info!("Scraped {} {} with {}", self.platform, target.username, output.strategy);
                return Ok(output);
            }
            Err(reason) => reason,
        };

        warn!("{} primary strategy failed for {} ({}), trying fallback", self.platform, target.username, primary);

        match self.attempt(self.fallback.as_ref(), &target, options).await {
            Ok(output) => {
                info!("Scraped {} {} with fallback {}", self.platform, target.username, output.strategy);
                Ok(output)
            }
            Err(fallback) => Err(CrawlError::StrategyChainExhausted {
                platform: self.platform.to_string(),
                primary,
                fallback,
            }),
        }
    }
}

/// Routes URLs to the chain of the platform that serves them
pub struct PlatformScraper {
    chains: Vec<StrategyChain>,
}

impl PlatformScraper {
    /// Standard chains: primary over the HTTP engine, fallback over the browser engine
    pub fn new(http: Arc<CrawlerEngine>, browser: Arc<CrawlerEngine>) -> Self {
        Self::from_chains(vec![
            twitter::chain(Arc::clone(&http), Arc::clone(&browser)),
            instagram::chain(Arc::clone(&http), Arc::clone(&browser)),
            tiktok::chain(http, browser),
        ])
    }

    pub fn from_chains(chains: Vec<StrategyChain>) -> Self {
        Self { chains }
    }

    pub async fn scrape(&self, url: &str, options: &ScrapeOptions) -> Result<ScrapeOutput, CrawlError> {
        let unsupported = || CrawlError::UnsupportedPlatformUrl {
            url: url.to_string(),
            platform: "supported".to_string(),
        };

        let platform = Platform::detect(url).ok_or_else(unsupported)?;
        let chain = self
            .chains
            .iter()
            .find(|chain| chain.platform() == platform)
            .ok_or_else(unsupported)?;

        chain.scrape(url, options).await
    }
}

/// Fetch `url` through `engine`
pub(crate) async fn fetch_page(
    engine: &CrawlerEngine,
    url: &str,
    headers: &[(&str, &str)],
) -> Result<CrawlResult, CrawlError> {
    let mut request = CrawlRequest::new(url)?;
    for (name, value) in headers {
        request = request.with_header(name, value);
    }
    engine.handle_request(&request).await
}

/// JSON embedded in `<script id="...">`
pub(crate) fn embedded_json(url: &str, html: &str, script_id: &str) -> Result<Value, CrawlError> {
    let parse_error = |message: String| CrawlError::Parse {
        url: url.to_string(),
        message,
    };

    let selector = Selector::parse(&format!(r#"script[id="{}"]"#, script_id))
        .map_err(|e| parse_error(format!("bad selector: {:?}", e)))?;
    let document = Html::parse_document(html);
    let script = document
        .select(&selector)
        .next()
        .ok_or_else(|| parse_error(format!("no {} script in page", script_id)))?;

    let text: String = script.text().collect();
    serde_json::from_str(&text).map_err(|e| parse_error(format!("invalid {} JSON: {}", script_id, e)))
}

pub(crate) fn json_u64(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

pub(crate) fn json_string(value: &Value) -> Option<String> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn meta_content(document: &Html, property: &str) -> Option<String> {
    let selector = Selector::parse(&format!(r#"meta[property="{0}"], meta[name="{0}"]"#, property)).ok()?;
    document
        .select(&selector)
        .filter_map(|element| element.value().attr("content"))
        .map(str::trim)
        .find(|content| !content.is_empty())
        .map(str::to_string)
}

/// Profile and item links read from a rendered profile page.
///
/// `item_pattern` matches item paths and captures the item id in its first group.
pub(crate) fn parse_rendered_profile(
    target: &PlatformTarget,
    strategy: &str,
    html: &str,
    item_pattern: &str,
) -> Result<ScrapeOutput, CrawlError> {
    let item_pattern = Regex::new(item_pattern).map_err(|e| CrawlError::Parse {
        url: target.url.clone(),
        message: format!("bad item pattern: {}", e),
    })?;
    let document = Html::parse_document(html);
    let mut output = ScrapeOutput::new(target, strategy);

    let title = meta_content(&document, "og:title");
    let description = meta_content(&document, "og:description");
    let image = meta_content(&document, "og:image");
    if title.is_some() || description.is_some() {
        output.profile = Some(ProfileInfo {
            username: target.username.clone(),
            display_name: title,
            bio: description,
            avatar_url: image,
            ..ProfileInfo::default()
        });
    }

    let base = Url::parse(&target.profile_url()).ok();
    let Ok(anchors) = Selector::parse("a[href]") else {
        return Ok(output);
    };

    for href in document.select(&anchors).filter_map(|a| a.value().attr("href")) {
        let Some(absolute) = base.as_ref().and_then(|b| b.join(href).ok()) else {
            continue;
        };
        let Some(id) = item_pattern.captures(absolute.path()).and_then(|c| c.get(1)) else {
            continue;
        };
        let id = id.as_str().to_string();
        if output.items.iter().any(|item| item.id == id) {
            continue;
        }

        let mut url = absolute.clone();
        url.set_query(None);
        url.set_fragment(None);
        output.items.push(PlatformItem {
            id,
            url: url.to_string(),
            ..PlatformItem::default()
        });
    }

    Ok(output)
}
