use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::crawler::engine::CrawlerEngine;
use crate::error::CrawlError;
use crate::platforms::{
    embedded_json, fetch_page, json_string, json_u64, parse_rendered_profile, Platform, PlatformItem, PlatformTarget,
    ProfileInfo, ScrapeOptions, ScrapeOutput, ScrapeStrategy, StrategyChain,
};

const SYNDICATION_URL: &str = "https://syndication.twitter.com/srv/timeline-profile/screen-name";

/// Tweet permalinks, capturing the tweet id
const STATUS_PATH: &str = r"^/[A-Za-z0-9_]+/status/(\d+)";

pub fn chain(http: Arc<CrawlerEngine>, browser: Arc<CrawlerEngine>) -> StrategyChain {
    StrategyChain::new(
        Platform::Twitter,
        Box::new(SyndicationTimeline { engine: http }),
        Box::new(RenderedProfile { engine: browser }),
    )
}

/// Public embed timeline, which carries tweets as Next.js page state
pub struct SyndicationTimeline {
    engine: Arc<CrawlerEngine>,
}

#[async_trait]
impl ScrapeStrategy for SyndicationTimeline {
    fn name(&self) -> &'static str {
        "syndication-timeline"
    }

    async fn scrape(&self, target: &PlatformTarget, _options: &ScrapeOptions) -> Result<ScrapeOutput, CrawlError> {
        let url = format!("{}/{}", SYNDICATION_URL, target.username);
        let page = fetch_page(&self.engine, &url, &[]).await?;
        let state = embedded_json(&url, &page.body, "__NEXT_DATA__")?;
        Ok(parse_timeline(target, self.name(), &state))
    }
}

fn parse_user(user: &Value) -> Option<ProfileInfo> {
    Some(ProfileInfo {
        username: json_string(&user["screen_name"])?,
        display_name: json_string(&user["name"]),
        bio: json_string(&user["description"]),
        followers: json_u64(&user["followers_count"]),
        following: json_u64(&user["friends_count"]),
        posts: json_u64(&user["statuses_count"]),
        avatar_url: json_string(&user["profile_image_url_https"]),
        verified: user["verified"].as_bool().or_else(|| user["is_blue_verified"].as_bool()),
    })
}

fn parse_tweet(tweet: &Value, username: &str) -> Option<PlatformItem> {
    let id = json_string(&tweet["id_str"]).or_else(|| json_u64(&tweet["id"]).map(|id| id.to_string()))?;
    let author = json_string(&tweet["user"]["screen_name"]).unwrap_or_else(|| username.to_string());

    let media_urls = tweet["entities"]["media"]
        .as_array()
        .map(|media| media.iter().filter_map(|m| json_string(&m["media_url_https"])).collect())
        .unwrap_or_default();

    Some(PlatformItem {
        url: format!("https://x.com/{}/status/{}", author, id),
        id,
        text: json_string(&tweet["full_text"]).or_else(|| json_string(&tweet["text"])),
        created_at: json_string(&tweet["created_at"]),
        likes: json_u64(&tweet["favorite_count"]),
        comments: json_u64(&tweet["reply_count"]),
        shares: json_u64(&tweet["retweet_count"]),
        views: None,
        media_urls,
    })
}

/// Profile and tweets from the syndication page state
pub fn parse_timeline(target: &PlatformTarget, strategy: &str, state: &Value) -> ScrapeOutput {
    let mut output = ScrapeOutput::new(target, strategy);
    let entries = state["props"]["pageProps"]["timeline"]["entries"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    for entry in &entries {
        if entry["type"].as_str() != Some("tweet") {
            continue;
        }
        let tweet = &entry["content"]["tweet"];

        let is_own = json_string(&tweet["user"]["screen_name"])
            .map_or(true, |name| name.eq_ignore_ascii_case(&target.username));
        if output.profile.is_none() && is_own {
            output.profile = parse_user(&tweet["user"]);
        }

        if let Some(item) = parse_tweet(tweet, &target.username) {
            output.items.push(item);
        }
    }

    output
}

/// Browser-rendered profile page
pub struct RenderedProfile {
    engine: Arc<CrawlerEngine>,
}

#[async_trait]
impl ScrapeStrategy for RenderedProfile {
    fn name(&self) -> &'static str {
        "rendered-profile"
    }

    async fn scrape(&self, target: &PlatformTarget, _options: &ScrapeOptions) -> Result<ScrapeOutput, CrawlError> {
        let page = fetch_page(&self.engine, &target.profile_url(), &[]).await?;
        parse_rendered_profile(target, self.name(), &page.body, STATUS_PATH)
    }
}
