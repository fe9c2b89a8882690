//! Anti-bot page classifiers.
//!
//! These only flag a response; nothing here attempts to solve or bypass a
//! challenge. All functions are pure.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::RegexSet;
use serde::{Serialize, Deserialize};

/// Why a response was judged to be an anti-bot page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSignal {
    Captcha { provider: String },
    CloudflareChallenge,
    CloudflareBlock,
    RateLimited,
}

impl fmt::Display for BlockSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Captcha { provider } => write!(f, "{} captcha", provider),
            Self::CloudflareChallenge => write!(f, "Cloudflare challenge"),
            Self::CloudflareBlock => write!(f, "Cloudflare block page"),
            Self::RateLimited => write!(f, "rate limited"),
        }
    }
}

/// Providers in match order; the index lines up with `captcha_patterns`
const CAPTCHA_PROVIDERS: &[&str] = &["recaptcha", "hcaptcha", "turnstile", "datadome", "perimeterx", "arkose"];

fn captcha_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RegexSet::new([
            r#"(?i)class=["'][^"']*g-recaptcha|google\.com/recaptcha/|recaptcha/api\.js"#,
            r#"(?i)class=["'][^"']*h-captcha|hcaptcha\.com/1/api\.js|js\.hcaptcha\.com"#,
            r#"(?i)class=["'][^"']*cf-turnstile|challenges\.cloudflare\.com/turnstile"#,
            r"(?i)captcha-delivery\.com|geo\.captcha-delivery",
            r"(?i)px-captcha|_pxcaptcha|perimeterx",
            r"(?i)arkoselabs\.com|funcaptcha",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

fn header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Name of the CAPTCHA provider embedded in the page, if any
pub fn detect_captcha(body: &str) -> Option<String> {
    captcha_patterns()
        .matches(body)
        .iter()
        .next()
        .and_then(|index| CAPTCHA_PROVIDERS.get(index))
        .map(|provider| provider.to_string())
}

/// Cloudflare interstitials and block pages
pub fn detect_cloudflare(status: u16, headers: &BTreeMap<String, String>, body: &str) -> Option<BlockSignal> {
    if header(headers, "cf-mitigated").map_or(false, |v| v.eq_ignore_ascii_case("challenge")) {
        return Some(BlockSignal::CloudflareChallenge);
    }

    let served_by_cloudflare = header(headers, "server").map_or(false, |v| v.eq_ignore_ascii_case("cloudflare"))
        || header(headers, "cf-ray").is_some();

    let challenge_markers = ["Just a moment...", "challenge-platform", "cf-browser-verification", "Checking your browser before accessing"];
    if challenge_markers.iter().any(|marker| body.contains(marker)) && (served_by_cloudflare || status == 403 || status == 503) {
        return Some(BlockSignal::CloudflareChallenge);
    }

    let block_markers = ["Sorry, you have been blocked", "Attention Required! | Cloudflare", "error code: 1020"];
    if block_markers.iter().any(|marker| body.contains(marker)) && (served_by_cloudflare || status == 403) {
        return Some(BlockSignal::CloudflareBlock);
    }

    None
}

/// Classify a response. Cloudflare wins over a generic CAPTCHA since its
/// challenge pages embed Turnstile.
pub fn classify(status: u16, headers: &BTreeMap<String, String>, body: &str) -> Option<BlockSignal> {
    if let Some(signal) = detect_cloudflare(status, headers, body) {
        return Some(signal);
    }

    if let Some(provider) = detect_captcha(body) {
        return Some(BlockSignal::Captcha { provider });
    }

    if status == 429 {
        return Some(BlockSignal::RateLimited);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_captcha_providers() {
        let recaptcha = r#"<div class="g-recaptcha" data-sitekey="x"></div>"#;
        assert_eq!(detect_captcha(recaptcha).as_deref(), Some("recaptcha"));

        let hcaptcha = r#"<script src="https://js.hcaptcha.com/1/api.js"></script>"#;
        assert_eq!(detect_captcha(hcaptcha).as_deref(), Some("hcaptcha"));

        let datadome = r#"<iframe src="https://geo.captcha-delivery.com/captcha/"></iframe>"#;
        assert_eq!(detect_captcha(datadome).as_deref(), Some("datadome"));

        assert_eq!(detect_captcha("<p>An article about what a CAPTCHA is</p>"), None);
    }

    #[test]
    fn test_cloudflare_header_challenge() {
        let signal = detect_cloudflare(403, &headers(&[("CF-Mitigated", "challenge")]), "");
        assert_eq!(signal, Some(BlockSignal::CloudflareChallenge));
    }

    #[test]
    fn test_cloudflare_interstitial_body() {
        let body = "<title>Just a moment...</title><script src=\"/cdn-cgi/challenge-platform/h/b\"></script>";
        let signal = detect_cloudflare(503, &headers(&[("server", "cloudflare")]), body);
        assert_eq!(signal, Some(BlockSignal::CloudflareChallenge));
    }

    #[test]
    fn test_cloudflare_block_page() {
        let body = "<h1>Sorry, you have been blocked</h1>";
        let signal = detect_cloudflare(403, &headers(&[("cf-ray", "8a1b")]), body);
        assert_eq!(signal, Some(BlockSignal::CloudflareBlock));
    }

    #[test]
    fn test_marker_on_ordinary_page_is_ignored() {
        let body = "<p>Just a moment... while we load your basket</p>";
        assert_eq!(detect_cloudflare(200, &headers(&[("server", "nginx")]), body), None);
    }

    #[test]
    fn test_classify_order() {
        let turnstile = r#"<title>Just a moment...</title><div class="cf-turnstile"></div>"#;
        assert_eq!(
            classify(403, &headers(&[("server", "cloudflare")]), turnstile),
            Some(BlockSignal::CloudflareChallenge)
        );

        let turnstile_only = r#"<div class="cf-turnstile"></div>"#;
        assert_eq!(
            classify(200, &headers(&[]), turnstile_only),
            Some(BlockSignal::Captcha { provider: "turnstile".to_string() })
        );

        assert_eq!(classify(429, &headers(&[]), ""), Some(BlockSignal::RateLimited));
        assert_eq!(classify(200, &headers(&[]), "<html>fine</html>"), None);
    }
}
