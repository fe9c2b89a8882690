use std::fmt;

use rand::Rng;
use regex::Regex;
use serde::{Serialize, Deserialize};
use tracing::warn;

use crate::cli::config::BrowserFingerprint;

/// Browser family advertised by a User-Agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrowserFamily {
    Chrome,
    Firefox,
    Safari,
}

impl BrowserFamily {
    /// Whether the browser sends Sec-Ch-Ua client hints
    pub fn sends_client_hints(self) -> bool {
        matches!(self, Self::Chrome)
    }
}

/// Operating system advertised by a User-Agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsPlatform {
    Windows,
    MacOs,
    Linux,
}

impl OsPlatform {
    /// Value of the Sec-Ch-Ua-Platform hint (without quotes)
    pub fn client_hint(self) -> &'static str {
        match self {
            Self::Windows => "Windows",
            Self::MacOs => "macOS",
            Self::Linux => "Linux",
        }
    }

    /// `navigator.platform` value
    pub fn navigator_platform(self) -> &'static str {
        match self {
            Self::Windows => "Win32",
            Self::MacOs => "MacIntel",
            Self::Linux => "Linux x86_64",
        }
    }
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.client_hint())
    }
}

/// A User-Agent string together with the facts encoded in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgentProfile {
    pub user_agent: String,
    pub browser: BrowserFamily,
    /// Major version of the browser
    pub version: u32,
    pub platform: OsPlatform,
    /// Preferred Accept-Language, when the profile pins one
    pub accept_language: Option<String>,
}

const CHROME_VERSIONS: &[u32] = &[120, 121, 122, 123, 124, 125, 126];
const FIREFOX_VERSIONS: &[u32] = &[121, 123, 125, 126];

fn chrome_ua(platform: OsPlatform, version: u32) -> String {
    let os = match platform {
        OsPlatform::Windows => "Windows NT 10.0; Win64; x64",
        OsPlatform::MacOs => "Macintosh; Intel Mac OS X 10_15_7",
        OsPlatform::Linux => "X11; Linux x86_64",
    };
    format!(
        "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Safari/537.36",
        os, version
    )
}

fn firefox_ua(platform: OsPlatform, version: u32) -> String {
    let os = match platform {
        OsPlatform::Windows => "Windows NT 10.0; Win64; x64",
        OsPlatform::MacOs => "Macintosh; Intel Mac OS X 10.15",
        OsPlatform::Linux => "X11; Linux x86_64",
    };
    format!("Mozilla/5.0 ({}; rv:{}.0) Gecko/20100101 Firefox/{}.0", os, version, version)
}

/// Pool of plausible desktop User-Agents
#[derive(Debug, Clone)]
pub struct UserAgentPool {
    profiles: Vec<UserAgentProfile>,
}

impl Default for UserAgentPool {
    fn default() -> Self {
        let mut profiles = Vec::new();

        for &version in CHROME_VERSIONS {
            for platform in [OsPlatform::Windows, OsPlatform::MacOs, OsPlatform::Linux] {
                profiles.push(UserAgentProfile {
                    user_agent: chrome_ua(platform, version),
                    browser: BrowserFamily::Chrome,
                    version,
                    platform,
                    accept_language: None,
                });
            }
        }

        for &version in FIREFOX_VERSIONS {
            for platform in [OsPlatform::Windows, OsPlatform::MacOs] {
                profiles.push(UserAgentProfile {
                    user_agent: firefox_ua(platform, version),
                    browser: BrowserFamily::Firefox,
                    version,
                    platform,
                    accept_language: None,
                });
            }
        }

        for version in [16, 17] {
            profiles.push(UserAgentProfile {
                user_agent: format!(
                    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{}.4 Safari/605.1.15",
                    version
                ),
                browser: BrowserFamily::Safari,
                version,
                platform: OsPlatform::MacOs,
                accept_language: None,
            });
        }

        Self { profiles }
    }
}

impl UserAgentPool {
    /// Pool made only of the given profiles
    pub fn from_profiles(profiles: Vec<UserAgentProfile>) -> Self {
        if profiles.is_empty() {
            return Self::default();
        }
        Self { profiles }
    }

    /// Default pool extended with configured fingerprints
    pub fn with_configured(fingerprints: &[BrowserFingerprint]) -> Self {
        let mut pool = Self::default();
        for fingerprint in fingerprints {
            match parse_user_agent(&fingerprint.user_agent) {
                Some(mut profile) => {
                    profile.accept_language = Some(fingerprint.accept_language.clone());
                    pool.profiles.push(profile);
                }
                None => warn!("Ignoring unrecognised User-Agent in fingerprint '{}'", fingerprint.name),
            }
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profiles(&self) -> &[UserAgentProfile] {
        &self.profiles
    }

    /// Pick a profile uniformly at random
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> &UserAgentProfile {
        &self.profiles[rng.gen_range(0..self.profiles.len())]
    }
}

/// Recover browser, version and platform from a User-Agent string
pub fn parse_user_agent(user_agent: &str) -> Option<UserAgentProfile> {
    let platform = if user_agent.contains("Windows") {
        OsPlatform::Windows
    } else if user_agent.contains("Macintosh") || user_agent.contains("Mac OS X") {
        OsPlatform::MacOs
    } else if user_agent.contains("Linux") || user_agent.contains("X11") {
        OsPlatform::Linux
    } else {
        return None;
    };

    let patterns = [
        (BrowserFamily::Firefox, r"Firefox/(\d+)"),
        (BrowserFamily::Chrome, r"Chrome/(\d+)"),
        (BrowserFamily::Safari, r"Version/(\d+)[.\d]* Safari/"),
    ];

    for (browser, pattern) in patterns {
        let regex = Regex::new(pattern).ok()?;
        if let Some(captures) = regex.captures(user_agent) {
            let version = captures.get(1)?.as_str().parse().ok()?;
            return Some(UserAgentProfile {
                user_agent: user_agent.to_string(),
                browser,
                version,
                platform,
                accept_language: None,
            });
        }
    }

    None
}
