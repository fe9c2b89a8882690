//! Dataset payloads built from fetched pages.

use scraper::{Html, Selector};
use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::crawler::job::JobType;
use crate::crawler::task::CrawlResult;

const MAX_TITLE_LEN: usize = 60;
const MAX_DESCRIPTION_LEN: usize = 160;

/// Summary recorded for `url` jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagePayload {
    pub status_code: u16,
    pub depth: u32,
    pub title: Option<String>,
    pub description: Option<String>,
    pub word_count: usize,
    pub link_count: usize,
}

/// Audit recorded for `seo` jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeoPayload {
    pub status_code: u16,
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub canonical: Option<String>,
    pub h1_count: usize,
    pub robots: Option<String>,
    pub issues: Vec<String>,
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let selector = selector(css)?;
    let text = document
        .select(&selector)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    (!text.is_empty()).then_some(text)
}

fn first_attr(document: &Html, css: &str, attr: &str) -> Option<String> {
    let selector = selector(css)?;
    let value = document
        .select(&selector)
        .next()?
        .value()
        .attr(attr)?
        .trim()
        .to_string();
    (!value.is_empty()).then_some(value)
}

fn count(document: &Html, css: &str) -> usize {
    selector(css).map_or(0, |selector| document.select(&selector).count())
}

fn word_count(document: &Html) -> usize {
    let Some(body) = selector("body") else {
        return 0;
    };
    document
        .select(&body)
        .next()
        .map_or(0, |body| body.text().flat_map(str::split_whitespace).count())
}

pub fn page_payload(result: &CrawlResult, link_count: usize) -> PagePayload {
    let document = Html::parse_document(&result.body);

    PagePayload {
        status_code: result.status_code,
        depth: result.request.depth,
        title: first_text(&document, "title"),
        description: first_attr(&document, r#"meta[name="description"]"#, "content"),
        word_count: word_count(&document),
        link_count,
    }
}

pub fn seo_payload(result: &CrawlResult) -> SeoPayload {
    let document = Html::parse_document(&result.body);

    let title = first_text(&document, "title");
    let meta_description = first_attr(&document, r#"meta[name="description"]"#, "content");
    let canonical = first_attr(&document, r#"link[rel="canonical"]"#, "href");
    let robots = first_attr(&document, r#"meta[name="robots"]"#, "content");
    let h1_count = count(&document, "h1");

    let mut issues = Vec::new();
    match &title {
        None => issues.push("missing title".to_string()),
        Some(t) if t.chars().count() > MAX_TITLE_LEN => {
            issues.push(format!("title longer than {} characters", MAX_TITLE_LEN))
        }
        _ => {}
    }
    match &meta_description {
        None => issues.push("missing meta description".to_string()),
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => {
            issues.push(format!("meta description longer than {} characters", MAX_DESCRIPTION_LEN))
        }
        _ => {}
    }
    if canonical.is_none() {
        issues.push("missing canonical link".to_string());
    }
    match h1_count {
        0 => issues.push("missing h1".to_string()),
        1 => {}
        n => issues.push(format!("{} h1 elements", n)),
    }
    if robots.as_deref().map_or(false, |r| r.to_ascii_lowercase().contains("noindex")) {
        issues.push("page is noindex".to_string());
    }

    SeoPayload {
        status_code: result.status_code,
        title,
        meta_description,
        canonical,
        h1_count,
        robots,
        issues,
    }
}

/// Payload for a page according to the job type
pub fn payload_for(job_type: JobType, result: &CrawlResult, link_count: usize) -> Value {
    let payload = match job_type {
        JobType::Url => serde_json::to_value(page_payload(result, link_count)),
        JobType::Seo => serde_json::to_value(seo_payload(result)),
    };
    payload.unwrap_or(Value::Null)
}
