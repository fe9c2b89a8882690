use std::collections::HashSet;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;
use tracing::{debug, warn};

use crate::cli::config::CrawlerSettings;
use crate::crawler::task::CrawlRequest;
use crate::utils::url::registrable_host;

/// Absolute HTTP(S) targets of every `a[href]` in a page
pub fn extract_links(base_url: &str, html: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let document = Html::parse_document(html);

    document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .map(str::trim)
        .filter(|href| {
            let lower = href.to_ascii_lowercase();
            !href.is_empty()
                && !href.starts_with('#')
                && !lower.starts_with("mailto:")
                && !lower.starts_with("javascript:")
                && !lower.starts_with("tel:")
        })
        .filter_map(|href| base.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|url| url.to_string())
        .collect()
}

fn compile_patterns(patterns: &[String], kind: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Invalid {} pattern '{}': {}", kind, pattern, e);
                None
            }
        })
        .collect()
}

/// Decides which discovered links become new requests
#[derive(Debug, Clone)]
pub struct LinkFilter {
    max_depth: u32,
    same_domain_only: bool,
    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
}

impl LinkFilter {
    pub fn new(settings: &CrawlerSettings) -> Self {
        Self {
            max_depth: settings.max_depth,
            same_domain_only: settings.same_domain_only,
            include_patterns: compile_patterns(&settings.url_patterns.include, "include"),
            exclude_patterns: compile_patterns(&settings.url_patterns.exclude, "exclude"),
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Child requests for the links found on `parent`'s page.
    ///
    /// Returns nothing once the parent sits at the depth limit. Duplicates
    /// within the batch collapse onto their first occurrence.
    pub fn filter_discovered_links(&self, parent: &CrawlRequest, links: &[String]) -> Vec<CrawlRequest> {
        if parent.depth >= self.max_depth {
            return Vec::new();
        }

        let parent_host = Url::parse(&parent.url)
            .ok()
            .and_then(|url| url.host_str().map(|h| registrable_host(&h.to_lowercase()).to_string()));

        let mut seen = HashSet::new();
        let mut accepted = Vec::new();

        for link in links {
            let Ok(url) = Url::parse(link) else {
                debug!("Skipping invalid URL {}", link);
                continue;
            };

            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }

            if self.same_domain_only {
                let host = url.host_str().map(|h| registrable_host(&h.to_lowercase()).to_string());
                if host.is_none() || host != parent_host {
                    debug!("Skipping cross-domain URL {}", link);
                    continue;
                }
            }

            if self.exclude_patterns.iter().any(|p| p.is_match(link)) {
                debug!("Skipping URL matching exclusion pattern: {}", link);
                continue;
            }

            if !self.include_patterns.is_empty() && !self.include_patterns.iter().any(|p| p.is_match(link)) {
                debug!("Skipping URL not matching any inclusion pattern: {}", link);
                continue;
            }

            let Ok(child) = CrawlRequest::child_of(parent, link) else {
                continue;
            };

            if seen.insert(child.unique_key.clone()) {
                accepted.push(child);
            }
        }

        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::UrlPatterns;

    fn create_test_config() -> CrawlerSettings {
        CrawlerSettings {
            max_depth: 2,
            same_domain_only: true,
            url_patterns: UrlPatterns {
                include: vec![],
                exclude: vec![r"^.*\.(jpg|jpeg|png|gif|css|js)$".to_string()],
            },
            ..CrawlerSettings::default()
        }
    }

    fn links(urls: &[&str]) -> Vec<String> {
        urls.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_extract_links_resolves_relative() {
        let html = r##"
            <a href="/about">About</a>
            <a href="contact?b=2&a=1">Contact</a>
            <a href="https://other.com/x">Other</a>
            <a href="mailto:me@example.com">Mail</a>
            <a href="javascript:void(0)">JS</a>
            <a href="#top">Top</a>
            <a>No href</a>
        "##;

        let found = extract_links("https://example.com/blog/", html);
        assert_eq!(found, vec![
            "https://example.com/about",
            "https://example.com/blog/contact?b=2&a=1",
            "https://other.com/x",
        ]);
    }

    #[test]
    fn test_depth_budget() {
        let filter = LinkFilter::new(&create_test_config());
        let mut parent = CrawlRequest::new("https://example.com").unwrap();

        parent.depth = 1;
        let children = filter.filter_discovered_links(&parent, &links(&["https://example.com/a"]));
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].depth, 2);

        parent.depth = 2;
        assert!(filter.filter_discovered_links(&parent, &links(&["https://example.com/a"])).is_empty());
    }

    #[test]
    fn test_domain_and_patterns() {
        let filter = LinkFilter::new(&create_test_config());
        let parent = CrawlRequest::new("https://www.example.com").unwrap();

        let children = filter.filter_discovered_links(&parent, &links(&[
            "https://example.com/page",
            "https://other-site.com/page",
            "https://example.com/image.jpg",
            "ftp://example.com/file",
        ]));

        let urls: Vec<&str> = children.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["https://example.com/page"]);
    }

    #[test]
    fn test_include_patterns_and_cross_domain_allowed() {
        let mut config = create_test_config();
        config.same_domain_only = false;
        config.url_patterns.include = vec![r"/docs/".to_string()];
        let filter = LinkFilter::new(&config);
        let parent = CrawlRequest::new("https://example.com").unwrap();

        let children = filter.filter_discovered_links(&parent, &links(&[
            "https://other.com/docs/a",
            "https://example.com/blog/b",
        ]));
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].url, "https://other.com/docs/a");
    }

    #[test]
    fn test_batch_dedup_by_unique_key() {
        let filter = LinkFilter::new(&create_test_config());
        let parent = CrawlRequest::new("https://example.com").unwrap();

        let children = filter.filter_discovered_links(&parent, &links(&[
            "https://example.com/a?utm_source=x",
            "https://example.com/a#frag",
            "https://EXAMPLE.com/a/",
            "https://example.com/b",
        ]));
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].parent_url.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn test_invalid_patterns_are_ignored() {
        let mut config = create_test_config();
        config.url_patterns.exclude = vec!["(".to_string()];
        let filter = LinkFilter::new(&config);
        let parent = CrawlRequest::new("https://example.com").unwrap();

        assert_eq!(filter.filter_discovered_links(&parent, &links(&["https://example.com/x"])).len(), 1);
    }
}
