use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::crawler::engine::CrawlerEngine;
use crate::error::CrawlError;
use crate::platforms::{
    embedded_json, fetch_page, json_string, json_u64, parse_rendered_profile, Platform, PlatformItem, PlatformTarget,
    ProfileInfo, ScrapeOptions, ScrapeOutput, ScrapeStrategy, StrategyChain,
};

const REHYDRATION_SCRIPT: &str = "__UNIVERSAL_DATA_FOR_REHYDRATION__";

const VIDEO_PATH: &str = r"^/@[A-Za-z0-9_.]+/video/(\d+)";

pub fn chain(http: Arc<CrawlerEngine>, browser: Arc<CrawlerEngine>) -> StrategyChain {
    StrategyChain::new(
        Platform::TikTok,
        Box::new(RehydrationState { engine: http }),
        Box::new(RenderedProfile { engine: browser }),
    )
}

/// State the server embeds in the profile page for client hydration
pub struct RehydrationState {
    engine: Arc<CrawlerEngine>,
}

#[async_trait]
impl ScrapeStrategy for RehydrationState {
    fn name(&self) -> &'static str {
        "rehydration-state"
    }

    async fn scrape(&self, target: &PlatformTarget, _options: &ScrapeOptions) -> Result<ScrapeOutput, CrawlError> {
        let url = target.profile_url();
        let page = fetch_page(&self.engine, &url, &[]).await?;
        let state = embedded_json(&url, &page.body, REHYDRATION_SCRIPT)?;
        Ok(parse_rehydration(target, self.name(), &state))
    }
}

fn parse_video(video: &Value, username: &str) -> Option<PlatformItem> {
    let id = json_string(&video["id"])?;
    let author = json_string(&video["author"]["uniqueId"])
        .or_else(|| json_string(&video["author"]))
        .unwrap_or_else(|| username.to_string());
    let stats = &video["stats"];

    Some(PlatformItem {
        url: format!("https://www.tiktok.com/@{}/video/{}", author, id),
        id,
        text: json_string(&video["desc"]),
        created_at: json_u64(&video["createTime"])
            .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single())
            .map(|ts| ts.to_rfc3339()),
        likes: json_u64(&stats["diggCount"]),
        comments: json_u64(&stats["commentCount"]),
        shares: json_u64(&stats["shareCount"]),
        views: json_u64(&stats["playCount"]),
        media_urls: json_string(&video["video"]["cover"]).into_iter().collect(),
    })
}

/// Profile and any listed videos from the rehydration state
pub fn parse_rehydration(target: &PlatformTarget, strategy: &str, state: &Value) -> ScrapeOutput {
    let mut output = ScrapeOutput::new(target, strategy);
    let detail = &state["__DEFAULT_SCOPE__"]["webapp.user-detail"];
    let user = &detail["userInfo"]["user"];
    let stats = &detail["userInfo"]["stats"];

    if let Some(username) = json_string(&user["uniqueId"]) {
        output.profile = Some(ProfileInfo {
            username,
            display_name: json_string(&user["nickname"]),
            bio: json_string(&user["signature"]),
            followers: json_u64(&stats["followerCount"]),
            following: json_u64(&stats["followingCount"]),
            posts: json_u64(&stats["videoCount"]),
            avatar_url: json_string(&user["avatarLarger"]).or_else(|| json_string(&user["avatarMedium"])),
            verified: user["verified"].as_bool(),
        });
    }

    let videos = detail["itemList"]
        .as_array()
        .or_else(|| state["__DEFAULT_SCOPE__"]["webapp.user-post"]["itemList"].as_array());
    if let Some(videos) = videos {
        output.items = videos.iter().filter_map(|video| parse_video(video, &target.username)).collect();
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
        parse_rendered_profile(target, self.name(), &page.body, VIDEO_PATH)
    }
}
