use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::crawler::detect;
use crate::crawler::fetcher::{FetchContext, Fetcher};
use crate::crawler::task::{CrawlRequest, CrawlResult, RequestState};
use crate::error::CrawlError;
use crate::stealth::SessionPool;
use crate::utils::url::hostname;

pub use crate::crawler::fetcher::EngineKind;

/// Outcome of one request together with its final lifecycle state
#[derive(Debug)]
pub struct HandledRequest {
    pub state: RequestState,
    pub session_id: Option<String>,
    pub outcome: Result<CrawlResult, CrawlError>,
}

/// Runs one request end to end: session, fetch, detectors, session bookkeeping
pub struct CrawlerEngine {
    fetcher: Arc<dyn Fetcher>,
    sessions: Arc<SessionPool>,
    request_timeout: Duration,
}

impl CrawlerEngine {
    pub fn new(fetcher: Arc<dyn Fetcher>, sessions: Arc<SessionPool>, request_timeout: Duration) -> Self {
        Self {
            fetcher,
            sessions,
            request_timeout,
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.fetcher.kind()
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    /// Handle a request. Errors always carry the request URL.
    pub async fn handle_request(&self, request: &CrawlRequest) -> Result<CrawlResult, CrawlError> {
        self.handle(request).await.outcome
    }

    /// Like `handle_request`, also reporting the lifecycle state reached
    pub async fn handle(&self, request: &CrawlRequest) -> HandledRequest {
        let mut state = RequestState::Queued;

        let host = match hostname(&request.url) {
            Ok(host) => host,
            Err(e) => {
                return HandledRequest {
                    state: RequestState::Failed,
                    session_id: None,
                    outcome: Err(e),
                }
            }
        };

        let session = match self.sessions.get_session(&host).await {
            Ok(session) => session,
            Err(e) => {
                return HandledRequest {
                    state: RequestState::Failed,
                    session_id: None,
                    outcome: Err(CrawlError::Network {
                        url: request.url.clone(),
                        message: format!("no session available: {:#}", e),
                    }),
                }
            }
        };

        let mut headers = self.sessions.headers_for(&session).await;
        for (name, value) in request.extra_headers() {
            headers.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
            headers.insert(name, value);
        }

        let context = FetchContext {
            headers,
            proxy_url: session.proxy_url.clone(),
            fingerprint: session.fingerprint.clone(),
            timeout: self.request_timeout,
        };

        state = state.advance(None);
        debug!("Fetching {} with session {} ({:?})", request.url, session.id, self.kind());

        let fetched = match tokio::time::timeout(self.request_timeout, self.fetcher.fetch(request, &context)).await {
            Ok(result) => result,
            Err(_) => Err(CrawlError::Timeout {
                url: request.url.clone(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        };

        let outcome = fetched.and_then(|result| Self::check_response(&request.url, result));

        match &outcome {
            Ok(_) => {
                self.sessions.mark_good(&session.id).await;
            }
            Err(e) => {
                self.sessions.mark_bad(&session.id).await;
                if e.is_anti_bot() {
                    warn!("Retiring session {} for {}: {}", session.id, host, e);
                    self.sessions.retire(&session.id).await;
                }
            }
        }

        HandledRequest {
            state: state.advance(Some(outcome.is_ok())),
            session_id: Some(session.id),
            outcome,
        }
    }

    /// Turn anti-bot pages and error statuses into errors
    fn check_response(url: &str, result: CrawlResult) -> Result<CrawlResult, CrawlError> {
        if let Some(signal) = detect::classify(result.status_code, &result.headers, &result.body) {
            return Err(CrawlError::Blocked {
                url: url.to_string(),
                signal,
            });
        }

        if result.status_code >= 400 {
            return Err(CrawlError::HttpStatus {
                url: url.to_string(),
                status: result.status_code,
            });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::SessionSettings;
    use crate::crawler::detect::BlockSignal;
    use crate::crawler::fetcher::MockFetcher;
    use crate::stealth::UserAgentPool;
    use std::collections::BTreeMap;

    fn sessions() -> Arc<SessionPool> {
        Arc::new(SessionPool::with_seed(
            SessionSettings {
                max_pool_size: 10,
                max_usage_count: 100,
                max_error_score: 5.0,
            },
            UserAgentPool::default(),
            None,
            21,
        ))
    }

    fn response(request: &CrawlRequest, status: u16, body: &str) -> CrawlResult {
        CrawlResult {
            url: request.url.clone(),
            status_code: status,
            body: body.to_string(),
            headers: BTreeMap::new(),
            content_type: "text/html".to_string(),
            request: request.clone(),
        }
    }

    fn engine_returning(status: u16, body: &'static str, sessions: Arc<SessionPool>) -> CrawlerEngine {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_kind().return_const(EngineKind::Http);
        fetcher
            .expect_fetch()
            .returning(move |request, _| Ok(response(request, status, body)));
        CrawlerEngine::new(Arc::new(fetcher), sessions, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_success_keeps_session() {
        let sessions = sessions();
        let engine = engine_returning(200, "<html>ok</html>", sessions.clone());
        let request = CrawlRequest::new("https://example.com/a").unwrap();

        let first = engine.handle(&request).await;
        let second = engine.handle(&request).await;

        assert_eq!(first.state, RequestState::Succeeded);
        assert!(first.outcome.is_ok());
        assert_eq!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn test_forbidden_retires_session() {
        let sessions = sessions();
        let engine = engine_returning(403, "denied", sessions.clone());
        let request = CrawlRequest::new("https://example.com/a").unwrap();

        let first = engine.handle(&request).await;
        assert_eq!(first.state, RequestState::Failed);
        let error = first.outcome.unwrap_err();
        assert!(matches!(error, CrawlError::HttpStatus { status: 403, .. }));
        assert_eq!(error.url(), Some("https://example.com/a"));

        let second = engine.handle(&request).await;
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(sessions.stats().await.retired_total, 2);
    }

    #[tokio::test]
    async fn test_captcha_page_is_blocked() {
        let sessions = sessions();
        let engine = engine_returning(200, r#"<div class="g-recaptcha"></div>"#, sessions.clone());
        let request = CrawlRequest::new("https://example.com/a").unwrap();

        let error = engine.handle_request(&request).await.unwrap_err();
        assert!(matches!(
            error,
            CrawlError::Blocked { signal: BlockSignal::Captcha { .. }, .. }
        ));
        assert_eq!(sessions.stats().await.active, 0);
    }

    #[tokio::test]
    async fn test_server_error_degrades_without_retiring() {
        let sessions = sessions();
        let engine = engine_returning(502, "bad gateway", sessions.clone());
        let request = CrawlRequest::new("https://example.com/a").unwrap();

        let handled = engine.handle(&request).await;
        assert!(handled.outcome.unwrap_err().is_retryable());

        let stats = sessions.stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.degraded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out() {
        struct SlowFetcher;

        #[async_trait::async_trait]
        impl Fetcher for SlowFetcher {
            fn kind(&self) -> EngineKind {
                EngineKind::Http
            }

            async fn fetch(&self, request: &CrawlRequest, _: &FetchContext) -> Result<CrawlResult, CrawlError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(response(request, 200, ""))
            }
        }

        let sessions = sessions();
        let engine = CrawlerEngine::new(Arc::new(SlowFetcher), sessions.clone(), Duration::from_millis(100));
        let request = CrawlRequest::new("https://example.com/slow").unwrap();

        let error = engine.handle_request(&request).await.unwrap_err();
        assert!(matches!(error, CrawlError::Timeout { timeout_ms: 100, .. }));
        assert_eq!(sessions.stats().await.degraded, 1);
    }
}
