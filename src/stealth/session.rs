//! Host-scoped identities.
//!
//! Each host has at most one live session. A session's health only moves
//! forward (`Good -> Degraded -> Retired`) and a retired session is dropped
//! from the pool, so it can never be handed out again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cli::config::SessionSettings;
use crate::proxy::ProxyManager;
use crate::stealth::fingerprint::{Fingerprint, FingerprintGenerator};
use crate::stealth::headers;
use crate::stealth::user_agents::UserAgentPool;

/// Error score removed by a success
const ERROR_SCORE_DECREMENT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionHealth {
    Good,
    Degraded,
    Retired,
}

/// Snapshot of a session as handed to a worker
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub host: String,
    pub fingerprint: Fingerprint,
    pub health: SessionHealth,
    pub error_score: f64,
    pub usage_count: u32,
    pub proxy_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPoolStats {
    pub active: usize,
    pub good: usize,
    pub degraded: usize,
    pub created_total: u64,
    pub retired_total: u64,
}

struct PooledSession {
    session: Session,
    last_used: u64,
}

struct PoolState {
    sessions: HashMap<String, PooledSession>,
    by_host: HashMap<String, String>,
    fingerprints: FingerprintGenerator,
    rng: StdRng,
    clock: u64,
    created_total: u64,
    retired_total: u64,
}

pub struct SessionPool {
    settings: SessionSettings,
    state: Mutex<PoolState>,
    proxies: Option<Arc<Mutex<ProxyManager>>>,
}

impl SessionPool {
    pub fn new(
        settings: SessionSettings,
        user_agents: UserAgentPool,
        proxies: Option<Arc<Mutex<ProxyManager>>>,
    ) -> Self {
        Self::build(settings, FingerprintGenerator::new(user_agents), StdRng::from_entropy(), proxies)
    }

    pub fn with_seed(
        settings: SessionSettings,
        user_agents: UserAgentPool,
        proxies: Option<Arc<Mutex<ProxyManager>>>,
        seed: u64,
    ) -> Self {
        Self::build(
            settings,
            FingerprintGenerator::with_seed(user_agents, seed),
            StdRng::seed_from_u64(seed),
            proxies,
        )
    }

    fn build(
        settings: SessionSettings,
        fingerprints: FingerprintGenerator,
        rng: StdRng,
        proxies: Option<Arc<Mutex<ProxyManager>>>,
    ) -> Self {
        Self {
            settings,
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                by_host: HashMap::new(),
                fingerprints,
                rng,
                clock: 0,
                created_total: 0,
                retired_total: 0,
            }),
            proxies,
        }
    }

    /// Live session for `host`, minting one when none exists.
    ///
    /// The whole lookup-or-mint runs under the pool lock, so concurrent
    /// callers for the same host always share one session.
    pub async fn get_session(&self, host: &str) -> Result<Session> {
        let host = host.to_ascii_lowercase();
        let mut state = self.state.lock().await;
        state.clock += 1;
        let now = state.clock;

        if let Some(id) = state.by_host.get(&host).cloned() {
            let exhausted = state
                .sessions
                .get(&id)
                .map_or(true, |entry| entry.session.usage_count >= self.settings.max_usage_count);

            if exhausted {
                debug!("Session {} for {} reached its usage limit", id, host);
                self.retire_locked(&mut state, &id).await;
            } else if let Some(entry) = state.sessions.get_mut(&id) {
                entry.session.usage_count += 1;
                entry.last_used = now;
                return Ok(entry.session.clone());
            }
        }

        if state.sessions.len() >= self.settings.max_pool_size.max(1) {
            let oldest = state
                .sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                debug!("Session pool full, evicting {}", id);
                Self::remove_locked(&mut state, &id);
            }
        }

        let proxy_url = match &self.proxies {
            Some(proxies) => proxies.lock().await.get_proxy()?.and_then(|p| p.url()),
            None => None,
        };

        let session = Session {
            id: Uuid::new_v4().to_string(),
            host: host.clone(),
            fingerprint: state.fingerprints.generate(),
            health: SessionHealth::Good,
            error_score: 0.0,
            usage_count: 1,
            proxy_url,
            created_at: Utc::now(),
        };

        debug!("Minted session {} for {}", session.id, host);

        state.created_total += 1;
        state.by_host.insert(host, session.id.clone());
        state.sessions.insert(session.id.clone(), PooledSession {
            session: session.clone(),
            last_used: now,
        });

        Ok(session)
    }

    /// Record a success. Lowers the error score; a degraded session stays degraded.
    pub async fn mark_good(&self, session_id: &str) -> Option<SessionHealth> {
        let mut state = self.state.lock().await;
        let entry = state.sessions.get_mut(session_id)?;
        entry.session.error_score = (entry.session.error_score - ERROR_SCORE_DECREMENT).max(0.0);
        Some(entry.session.health)
    }

    /// Record a failure; retires the session once its error score hits the limit
    pub async fn mark_bad(&self, session_id: &str) -> Option<SessionHealth> {
        let mut state = self.state.lock().await;
        let entry = state.sessions.get_mut(session_id)?;
        entry.session.error_score += 1.0;
        entry.session.health = SessionHealth::Degraded;

        if entry.session.error_score >= self.settings.max_error_score {
            info!("Session {} exceeded its error budget", session_id);
            self.retire_locked(&mut state, session_id).await;
            return Some(SessionHealth::Retired);
        }

        Some(SessionHealth::Degraded)
    }

    /// Retire a session for good. Its proxy is excluded from rotation.
    pub async fn retire(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().await;
        self.retire_locked(&mut state, session_id).await
    }

    async fn retire_locked(&self, state: &mut PoolState, session_id: &str) -> bool {
        let Some(session) = Self::remove_locked(state, session_id) else {
            return false;
        };
        state.retired_total += 1;

        debug!("Retired session {} for {}", session.id, session.host);

        if let (Some(proxies), Some(proxy_url)) = (&self.proxies, &session.proxy_url) {
            let mut proxies = proxies.lock().await;
            let address = proxies.find_by_url(proxy_url).map(|p| p.address.clone());
            if let Some(address) = address {
                proxies.mark_failed(&address);
            }
        }

        true
    }

    fn remove_locked(state: &mut PoolState, session_id: &str) -> Option<Session> {
        let entry = state.sessions.remove(session_id)?;
        if state.by_host.get(&entry.session.host).map(String::as_str) == Some(session_id) {
            state.by_host.remove(&entry.session.host);
        }
        Some(entry.session)
    }

    /// Per-request headers for a session's identity
    pub async fn headers_for(&self, session: &Session) -> BTreeMap<String, String> {
        let mut state = self.state.lock().await;
        headers::request_headers(&session.fingerprint, &mut state.rng)
    }

    pub async fn stats(&self) -> SessionPoolStats {
        let state = self.state.lock().await;
        let mut stats = SessionPoolStats {
            active: state.sessions.len(),
            created_total: state.created_total,
            retired_total: state.retired_total,
            ..SessionPoolStats::default()
        };
        for entry in state.sessions.values() {
            match entry.session.health {
                SessionHealth::Good => stats.good += 1,
                SessionHealth::Degraded => stats.degraded += 1,
                SessionHealth::Retired => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{ProxyConfig, ProxySettings};

    fn settings() -> SessionSettings {
        SessionSettings {
            max_pool_size: 100,
            max_usage_count: 50,
            max_error_score: 3.0,
        }
    }

    fn pool(settings: SessionSettings) -> SessionPool {
        SessionPool::with_seed(settings, UserAgentPool::default(), None, 7)
    }

    #[tokio::test]
    async fn test_same_host_shares_a_session() {
        let pool = pool(settings());
        let a = pool.get_session("example.com").await.unwrap();
        let b = pool.get_session("EXAMPLE.com").await.unwrap();
        let c = pool.get_session("example.org").await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.usage_count, 2);
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_retired_session_is_never_returned() {
        let pool = pool(settings());
        let first = pool.get_session("example.com").await.unwrap();
        assert!(pool.retire(&first.id).await);

        let second = pool.get_session("example.com").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_ne!(first.fingerprint.id, second.fingerprint.id);
        assert!(!pool.retire(&first.id).await);
        assert_eq!(pool.mark_good(&first.id).await, None);
    }

    #[tokio::test]
    async fn test_health_is_monotonic() {
        let pool = pool(settings());
        let session = pool.get_session("example.com").await.unwrap();

        assert_eq!(pool.mark_bad(&session.id).await, Some(SessionHealth::Degraded));
        assert_eq!(pool.mark_good(&session.id).await, Some(SessionHealth::Degraded));
        assert_eq!(pool.mark_good(&session.id).await, Some(SessionHealth::Degraded));

        // 1.0 - 0.5 - 0.5 = 0, so three more failures are needed
        assert_eq!(pool.mark_bad(&session.id).await, Some(SessionHealth::Degraded));
        assert_eq!(pool.mark_bad(&session.id).await, Some(SessionHealth::Degraded));
        assert_eq!(pool.mark_bad(&session.id).await, Some(SessionHealth::Retired));

        let next = pool.get_session("example.com").await.unwrap();
        assert_ne!(next.id, session.id);
        assert_eq!(next.health, SessionHealth::Good);
    }

    #[tokio::test]
    async fn test_usage_limit_rotates_session() {
        let pool = pool(SessionSettings { max_usage_count: 2, ..settings() });
        let a = pool.get_session("example.com").await.unwrap();
        let b = pool.get_session("example.com").await.unwrap();
        let c = pool.get_session("example.com").await.unwrap();

        assert_eq!(a.id, b.id);
        assert_ne!(b.id, c.id);
        assert_eq!(pool.stats().await.retired_total, 1);
    }

    #[tokio::test]
    async fn test_full_pool_evicts_least_recently_used() {
        let pool = pool(SessionSettings { max_pool_size: 2, ..settings() });
        let a = pool.get_session("a.com").await.unwrap();
        let b = pool.get_session("b.com").await.unwrap();
        pool.get_session("a.com").await.unwrap();
        pool.get_session("c.com").await.unwrap();

        assert_eq!(pool.stats().await.active, 2);
        assert_eq!(pool.get_session("a.com").await.unwrap().id, a.id);
        assert_ne!(pool.get_session("b.com").await.unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_session() {
        let pool = Arc::new(pool(settings()));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get_session("example.com").await.unwrap().id })
            })
            .collect();

        let ids: std::collections::HashSet<String> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(ids.len(), 1);
        assert_eq!(pool.stats().await.created_total, 1);
    }

    #[tokio::test]
    async fn test_retiring_marks_proxy_failed() {
        let proxy = |name: &str| ProxyConfig {
            name: name.to_string(),
            proxy_type: "http".to_string(),
            address: format!("{}.proxy.local", name),
            port: Some(3128),
            username: None,
            password: None,
            country: None,
        };
        let proxies = Arc::new(Mutex::new(ProxyManager::new(ProxySettings {
            enabled: true,
            rotation_strategy: "request".to_string(),
            rotation_interval: None,
            selection: "round_robin".to_string(),
            proxy_list: vec![proxy("a"), proxy("b")],
        })));

        let pool = SessionPool::with_seed(settings(), UserAgentPool::default(), Some(proxies.clone()), 1);
        let first = pool.get_session("example.com").await.unwrap();
        assert_eq!(first.proxy_url.as_deref(), Some("http://a.proxy.local:3128"));

        pool.retire(&first.id).await;

        // Only b is left in rotation
        for host in ["x.com", "y.com", "z.com"] {
            let session = pool.get_session(host).await.unwrap();
            assert_eq!(session.proxy_url.as_deref(), Some("http://b.proxy.local:3128"));
        }
    }

    #[tokio::test]
    async fn test_headers_follow_the_fingerprint() {
        let pool = pool(settings());
        let session = pool.get_session("example.com").await.unwrap();
        let headers = pool.headers_for(&session).await;
        assert_eq!(headers.get("User-Agent"), Some(&session.fingerprint.user_agent));
    }
}
