//! End-to-end tests against a local mock site.
//!
//! These run the real HTTP fetcher, engine and controller with the memory
//! queue and job store.

use std::sync::Arc;
use std::time::Duration;

use crawlforge::autoscale::MemoryProbe;
use crawlforge::cli::config::CrawlerConfig;
use crawlforge::crawler::controller::build_sessions;
use crawlforge::crawler::limiter::ResourceLimits;
use crawlforge::crawler::{CrawlRequest, CrawlerController, CrawlerEngine, HttpFetcher};
use crawlforge::dataset::{diff_datasets, export_dataset, import_json, ExportFormat};
use crawlforge::error::CrawlError;
use crawlforge::storage::jobs::MemoryJobStore;
use crawlforge::{CrawlEvent, JobStatus};
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct IdleProbe;

impl MemoryProbe for IdleProbe {
    fn memory_ratio(&self) -> f64 {
        0.05
    }
}

/// Fast local configuration: memory backends, no politeness delay
fn create_test_config() -> CrawlerConfig {
    let mut config = CrawlerConfig::default();
    config.storage.queue.backend = "memory".to_string();
    config.storage.results.storage_type = "memory".to_string();
    config.crawler.politeness_delay = 0;
    config.crawler.politeness_jitter = 0;
    config.crawler.max_requests_per_minute = None;
    config.crawler.request_timeout_ms = 5_000;
    config.crawler.max_retries = 1;
    config.limits = ResourceLimits::default();
    config.autoscale.max_concurrency = 4;
    config
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(format!("<html><head><title>Test</title></head><body>{}</body></html>", body))
        .insert_header("content-type", "text/html; charset=utf-8")
}

async fn mount_site(server: &MockServer) {
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(&format!(
            r#"<a href="{base}/page1">1</a><a href="/page2">2</a><a href="https://elsewhere.test/x">out</a>"#
        )))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page1"))
        .respond_with(html(r#"<a href="/page3">3</a><a href="/">home</a>"#))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page2"))
        .respond_with(html("<p>Leaf page</p>"))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page3"))
        .respond_with(html("<p>Deep page</p>"))
        .mount(server)
        .await;
}

fn engine(config: &CrawlerConfig) -> CrawlerEngine {
    CrawlerEngine::new(
        Arc::new(HttpFetcher::new()),
        build_sessions(config),
        Duration::from_millis(config.crawler.request_timeout_ms),
    )
}

fn controller(config: CrawlerConfig) -> CrawlerController {
    CrawlerController::with_parts(config, Arc::new(MemoryJobStore::default()), Arc::new(HttpFetcher::new()))
        .with_memory_probe(Arc::new(IdleProbe))
}

#[tokio::test]
async fn test_http_engine_fetches_page_with_session_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header_exists("user-agent"))
        .and(header_exists("accept-language"))
        .respond_with(html("<p>hello</p>"))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config();
    let engine = engine(&config);
    let request = CrawlRequest::new(&format!("{}/", server.uri())).unwrap();

    let result = engine.handle_request(&request).await.unwrap();
    assert_eq!(result.status_code, 200);
    assert!(result.is_html());
    assert!(result.body.contains("hello"));
}

#[tokio::test]
async fn test_http_engine_reports_blocks_and_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/challenge"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("cf-mitigated", "challenge")
                .set_body_string("<html><title>Just a moment...</title></html>"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/throttled"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let config = create_test_config();
    let engine = engine(&config);

    let challenge = CrawlRequest::new(&format!("{}/challenge", server.uri())).unwrap();
    let error = engine.handle_request(&challenge).await.unwrap_err();
    assert!(matches!(error, CrawlError::Blocked { .. }));
    assert!(error.is_anti_bot());

    let throttled = CrawlRequest::new(&format!("{}/throttled", server.uri())).unwrap();
    let error = engine.handle_request(&throttled).await.unwrap_err();
    assert!(error.is_anti_bot());
    assert!(error.is_retryable());

    let missing = CrawlRequest::new(&format!("{}/missing", server.uri())).unwrap();
    let error = engine.handle_request(&missing).await.unwrap_err();
    assert!(matches!(error, CrawlError::HttpStatus { status: 404, .. }));
    assert!(!error.is_retryable());
    assert_eq!(error.url(), Some(missing.url.as_str()));

    // Both anti-bot responses retired their session
    assert!(engine.sessions().stats().await.retired_total >= 2);
}

#[tokio::test]
async fn test_full_crawl_single_domain() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let controller = controller(create_test_config());
    let mut events = controller.subscribe().await;

    let job = controller.create_job(&format!("{}/", server.uri()), "url").await.unwrap();
    let finished = controller.run_job(&job.id).await.unwrap();

    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.stats.pages_crawled, 4);
    assert!(finished.stats.bytes_downloaded > 0);

    let items = controller.get_items(&job.id).await.unwrap();
    let mut urls: Vec<String> = items.iter().map(|item| item.url.clone()).collect();
    urls.sort();
    assert_eq!(urls.len(), 4);
    assert!(urls.iter().all(|url| url.starts_with(&server.uri())));

    let mut completed = 0;
    let mut finished_event = false;
    while let Ok(event) = events.try_recv() {
        match event {
            CrawlEvent::RequestCompleted { .. } => completed += 1,
            CrawlEvent::CrawlFinished { status, .. } => {
                assert_eq!(status, JobStatus::Completed);
                finished_event = true;
            }
            _ => {}
        }
    }
    assert_eq!(completed, 4);
    assert!(finished_event);
}

#[tokio::test]
async fn test_crawl_respects_depth_and_page_limit() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let mut config = create_test_config();
    config.crawler.max_depth = 1;
    let shallow = controller(config);
    let job = shallow.create_job(&format!("{}/", server.uri()), "url").await.unwrap();
    let finished = shallow.run_job(&job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.stats.pages_crawled, 3);

    let mut config = create_test_config();
    config.limits.max_pages = Some(2);
    let limited = controller(config);
    let job = limited.create_job(&format!("{}/", server.uri()), "url").await.unwrap();
    let finished = limited.run_job(&job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Stopped);
    assert_eq!(finished.stats.pages_crawled, 2);
    assert!(finished.stop_reason.unwrap().starts_with("Page limit reached"));
}

#[tokio::test]
async fn test_recrawl_diff_detects_changed_page() {
    let first = MockServer::start().await;
    mount_site(&first).await;

    let controller = controller(create_test_config());
    let job = controller.create_job(&format!("{}/", first.uri()), "url").await.unwrap();
    controller.run_job(&job.id).await.unwrap();
    let before = controller.get_items(&job.id).await.unwrap();

    // Round trip through the JSON export, as the diff command reads files
    let exported = export_dataset(&before, ExportFormat::Json { pretty: true }).unwrap();
    let old_items = import_json(&exported).unwrap();
    assert_eq!(old_items.len(), before.len());

    let mut after = before.clone();
    let changed_url = format!("{}/page2", first.uri());
    for item in after.iter_mut().filter(|item| item.url == changed_url) {
        *item = crawlforge::dataset::DatasetItem::new(&item.url, serde_json::json!({"title": "Updated"}));
    }
    after.retain(|item| !item.url.ends_with("/page3"));

    let diff = diff_datasets(&old_items, &after);
    assert!(diff.added.is_empty());
    assert_eq!(diff.removed.len(), 1);
    assert_eq!(diff.changed.len(), 1);
}
