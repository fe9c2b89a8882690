//! Browser-plausible request headers.
//!
//! Every header set is derived from a fingerprint so that the client hints,
//! the User-Agent and the Accept headers always describe the same browser.
//! Per-request variance (Referer, DNT) comes from a seedable RNG.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::stealth::fingerprint::{Fingerprint, FingerprintGenerator};
use crate::stealth::user_agents::{BrowserFamily, UserAgentPool};

const REFERERS: &[&str] = &[
    "https://www.google.com/",
    "https://www.bing.com/",
    "https://duckduckgo.com/",
];

/// Greased brand entries Chromium rotates through by major version
const GREASE_BRANDS: &[(&str, &str)] = &[
    ("Not_A Brand", "8"),
    ("Not A(Brand", "99"),
    ("Not/A)Brand", "8"),
    ("Not)A;Brand", "24"),
];

/// `Sec-Ch-Ua` value for a Chromium major version
pub fn sec_ch_ua(version: u32) -> String {
    let (brand, brand_version) = GREASE_BRANDS[version as usize % GREASE_BRANDS.len()];
    format!(
        "\"{}\";v=\"{}\", \"Chromium\";v=\"{}\", \"Google Chrome\";v=\"{}\"",
        brand, brand_version, version, version
    )
}

fn accept_for(browser: BrowserFamily) -> &'static str {
    match browser {
        BrowserFamily::Chrome => "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
        BrowserFamily::Firefox => "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        BrowserFamily::Safari => "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    }
}

/// Headers that never change for a given identity
pub fn base_headers(fingerprint: &Fingerprint) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    headers.insert("User-Agent".to_string(), fingerprint.user_agent.clone());
    headers.insert("Accept".to_string(), accept_for(fingerprint.browser).to_string());
    headers.insert("Accept-Language".to_string(), fingerprint.accept_language.clone());
    headers.insert("Accept-Encoding".to_string(), "gzip, deflate, br".to_string());
    headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
    headers.insert("Sec-Fetch-Dest".to_string(), "document".to_string());
    headers.insert("Sec-Fetch-Mode".to_string(), "navigate".to_string());
    headers.insert("Sec-Fetch-User".to_string(), "?1".to_string());

    if fingerprint.browser.sends_client_hints() {
        headers.insert("Sec-Ch-Ua".to_string(), sec_ch_ua(fingerprint.browser_version));
        headers.insert("Sec-Ch-Ua-Mobile".to_string(), "?0".to_string());
        headers.insert(
            "Sec-Ch-Ua-Platform".to_string(),
            format!("\"{}\"", fingerprint.platform.client_hint()),
        );
    }

    headers
}

/// Full header set for one request made with `fingerprint`
pub fn request_headers<R: Rng + ?Sized>(fingerprint: &Fingerprint, rng: &mut R) -> BTreeMap<String, String> {
    let mut headers = fingerprint.headers.clone();
    if headers.is_empty() {
        headers = base_headers(fingerprint);
    }

    if rng.gen_bool(0.4) {
        let referer = REFERERS.choose(rng).unwrap_or(&REFERERS[0]);
        headers.insert("Referer".to_string(), referer.to_string());
        headers.insert("Sec-Fetch-Site".to_string(), "cross-site".to_string());
    } else {
        headers.insert("Sec-Fetch-Site".to_string(), "none".to_string());
    }

    if rng.gen_bool(0.3) {
        headers.insert("DNT".to_string(), "1".to_string());
    }

    headers
}

/// Stand-alone header source for callers without a session
pub struct HeaderGenerator {
    fingerprints: FingerprintGenerator,
    rng: StdRng,
}

impl HeaderGenerator {
    pub fn new(pool: UserAgentPool) -> Self {
        Self {
            fingerprints: FingerprintGenerator::new(pool),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(pool: UserAgentPool, seed: u64) -> Self {
        Self {
            fingerprints: FingerprintGenerator::with_seed(pool, seed),
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
        }
    }

    /// Headers for a freshly drawn identity
    pub fn get_stealth_headers(&mut self) -> BTreeMap<String, String> {
        let fingerprint = self.fingerprints.generate();
        request_headers(&fingerprint, &mut self.rng)
    }

    /// Headers for an existing identity
    pub fn headers_for(&mut self, fingerprint: &Fingerprint) -> BTreeMap<String, String> {
        request_headers(fingerprint, &mut self.rng)
    }
}
