use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::crawler::engine::CrawlerEngine;
use crate::error::CrawlError;
use crate::platforms::{
    fetch_page, json_string, json_u64, parse_rendered_profile, Platform, PlatformItem, PlatformTarget, ProfileInfo,
    ScrapeOptions, ScrapeOutput, ScrapeStrategy, StrategyChain,
};

const PROFILE_API_URL: &str = "https://i.instagram.com/api/v1/users/web_profile_info/";

/// App id the Instagram web client sends with API calls
const WEB_APP_ID: &str = "936619743392459";

/// Post and reel permalinks, capturing the shortcode
const POST_PATH: &str = r"^/(?:[A-Za-z0-9_.]+/)?(?:p|reel)/([A-Za-z0-9_-]+)";

pub fn chain(http: Arc<CrawlerEngine>, browser: Arc<CrawlerEngine>) -> StrategyChain {
    StrategyChain::new(
        Platform::Instagram,
        Box::new(ProfileApi { engine: http }),
        Box::new(RenderedProfile { engine: browser }),
    )
}

/// The JSON endpoint behind the web profile page
pub struct ProfileApi {
    engine: Arc<CrawlerEngine>,
}

#[async_trait]
impl ScrapeStrategy for ProfileApi {
    fn name(&self) -> &'static str {
        "web-profile-api"
    }

    async fn scrape(&self, target: &PlatformTarget, _options: &ScrapeOptions) -> Result<ScrapeOutput, CrawlError> {
        let url = format!("{}?username={}", PROFILE_API_URL, target.username);
        let response = fetch_page(
            &self.engine,
            &url,
            &[("x-ig-app-id", WEB_APP_ID), ("Accept", "application/json")],
        )
        .await?;

        let body: Value = serde_json::from_str(&response.body).map_err(|e| CrawlError::Parse {
            url: url.clone(),
            message: format!("invalid profile JSON: {}", e),
        })?;
        Ok(parse_profile_response(target, self.name(), &body))
    }
}

fn caption(node: &Value) -> Option<String> {
    node["edge_media_to_caption"]["edges"]
        .as_array()
        .and_then(|edges| edges.first())
        .and_then(|edge| json_string(&edge["node"]["text"]))
}

fn parse_post(node: &Value) -> Option<PlatformItem> {
    let shortcode = json_string(&node["shortcode"])?;
    let kind = if node["is_video"].as_bool().unwrap_or(false) { "reel" } else { "p" };

    Some(PlatformItem {
        id: json_string(&node["id"]).unwrap_or_else(|| shortcode.clone()),
        url: format!("https://www.instagram.com/{}/{}/", kind, shortcode),
        text: caption(node),
        created_at: node["taken_at_timestamp"]
            .as_i64()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|ts| ts.to_rfc3339()),
        likes: json_u64(&node["edge_liked_by"]["count"]).or_else(|| json_u64(&node["edge_media_preview_like"]["count"])),
        comments: json_u64(&node["edge_media_to_comment"]["count"]),
        shares: None,
        views: json_u64(&node["video_view_count"]),
        media_urls: json_string(&node["display_url"]).into_iter().collect(),
    })
}

/// Profile and recent posts from a `web_profile_info` response
pub fn parse_profile_response(target: &PlatformTarget, strategy: &str, body: &Value) -> ScrapeOutput {
    let mut output = ScrapeOutput::new(target, strategy);
    let user = &body["data"]["user"];
    if !user.is_object() {
        return output;
    }

    output.profile = Some(ProfileInfo {
        username: json_string(&user["username"]).unwrap_or_else(|| target.username.clone()),
        display_name: json_string(&user["full_name"]),
        bio: json_string(&user["biography"]),
        followers: json_u64(&user["edge_followed_by"]["count"]),
        following: json_u64(&user["edge_follow"]["count"]),
        posts: json_u64(&user["edge_owner_to_timeline_media"]["count"]),
        avatar_url: json_string(&user["profile_pic_url_hd"]).or_else(|| json_string(&user["profile_pic_url"])),
        verified: user["is_verified"].as_bool(),
    });

    if let Some(edges) = user["edge_owner_to_timeline_media"]["edges"].as_array() {
        output.items = edges.iter().filter_map(|edge| parse_post(&edge["node"])).collect();
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
        parse_rendered_profile(target, self.name(), &page.body, POST_PATH)
    }
}
