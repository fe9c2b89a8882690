use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Serialize, Deserialize};
use tracing::debug;
use uuid::Uuid;

use crate::stealth::headers;
use crate::stealth::user_agents::{BrowserFamily, OsPlatform, UserAgentPool, UserAgentProfile};

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f32,
}

/// Complete browser identity bound to one session for its whole lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub id: String,
    pub user_agent: String,
    pub browser: BrowserFamily,
    pub browser_version: u32,
    pub platform: OsPlatform,
    pub accept_language: String,
    pub viewport: Viewport,
    pub timezone: String,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub hardware_concurrency: u32,
    pub device_memory: u32,
    pub color_depth: u32,
    pub has_touch: bool,
    /// Headers that stay fixed for this identity
    pub headers: BTreeMap<String, String>,
}

const LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.9,es;q=0.8",
    "de-DE,de;q=0.9,en;q=0.8",
    "fr-FR,fr;q=0.9,en;q=0.8",
];

const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Los_Angeles",
    "Europe/London",
    "Europe/Berlin",
];

const SCREENS: &[(u32, u32)] = &[(1920, 1080), (1536, 864), (1440, 900), (1366, 768), (2560, 1440)];

/// Generates internally consistent fingerprints from a User-Agent pool
pub struct FingerprintGenerator {
    pool: UserAgentPool,
    rng: StdRng,
}

impl FingerprintGenerator {
    /// Generator seeded from OS entropy
    pub fn new(pool: UserAgentPool) -> Self {
        Self {
            pool,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic generator for tests
    pub fn with_seed(pool: UserAgentPool, seed: u64) -> Self {
        Self {
            pool,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create a fresh fingerprint
    pub fn generate(&mut self) -> Fingerprint {
        let profile = self.pool.sample(&mut self.rng).clone();
        self.complete_fingerprint(&profile)
    }

    /// Complete a User-Agent profile with the remaining identity details
    fn complete_fingerprint(&mut self, profile: &UserAgentProfile) -> Fingerprint {
        let rng = &mut self.rng;

        let (width, height) = *SCREENS.choose(rng).unwrap_or(&(1920, 1080));
        let device_scale_factor = match profile.platform {
            OsPlatform::MacOs => 2.0,
            _ => *[1.0_f32, 1.25, 1.5].choose(rng).unwrap_or(&1.0),
        };
        let viewport = Viewport { width, height, device_scale_factor };

        let accept_language = profile
            .accept_language
            .clone()
            .unwrap_or_else(|| LANGUAGES.choose(rng).unwrap_or(&LANGUAGES[0]).to_string());

        // WebGL info based on platform
        let (webgl_vendor, webgl_renderer) = match profile.platform {
            OsPlatform::Windows => (
                "Google Inc. (Intel)".to_string(),
                "ANGLE (Intel, Intel(R) UHD Graphics 620 Direct3D11 vs_5_0 ps_5_0, D3D11)".to_string(),
            ),
            OsPlatform::MacOs => ("Apple Inc.".to_string(), "Apple M1".to_string()),
            OsPlatform::Linux => (
                "Mesa".to_string(),
                "Mesa Intel(R) UHD Graphics 620 (KBL GT2)".to_string(),
            ),
        };

        let mut fingerprint = Fingerprint {
            id: Uuid::new_v4().to_string(),
            user_agent: profile.user_agent.clone(),
            browser: profile.browser,
            browser_version: profile.version,
            platform: profile.platform,
            accept_language,
            viewport,
            timezone: TIMEZONES.choose(rng).unwrap_or(&TIMEZONES[0]).to_string(),
            webgl_vendor,
            webgl_renderer,
            hardware_concurrency: *[4, 8, 12, 16].choose(rng).unwrap_or(&8),
            device_memory: *[4, 8, 16].choose(rng).unwrap_or(&8),
            color_depth: if rng.gen_bool(0.8) { 24 } else { 30 },
            has_touch: false,
            headers: BTreeMap::new(),
        };
        fingerprint.headers = headers::base_headers(&fingerprint);

        debug!("Generated fingerprint {} ({:?} {} on {})",
            fingerprint.id, fingerprint.browser, fingerprint.browser_version, fingerprint.platform);

        fingerprint
    }
}
