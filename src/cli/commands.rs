use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::controller::{build_fetcher, build_sessions, parse_strategy, CrawlEvent, CrawlerController};
use crate::crawler::engine::{CrawlerEngine, EngineKind};
use crate::crawler::job::{CrawlJob, JobStatus};
use crate::dataset::export::export_to_file;
use crate::dataset::{diff_datasets, import_json, ExportFormat};
use crate::platforms::{PlatformScraper, ScrapeOptions};

/// Where the configuration comes from
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    pub profile: Option<String>,
    pub path: Option<PathBuf>,
}

impl ConfigSource {
    pub fn load(&self) -> Result<CrawlerConfig> {
        if let Some(path) = &self.path {
            return CrawlerConfig::load_from_file(path);
        }
        match &self.profile {
            Some(profile) => {
                CrawlerConfig::load_profile(profile).context(format!("Failed to load profile: {}", profile))
            }
            None => CrawlerConfig::load_default(),
        }
    }
}

/// Command line overrides for a crawl
#[derive(Debug, Clone, Default)]
pub struct CrawlOverrides {
    pub depth: Option<u32>,
    pub limit: Option<u64>,
    pub strategy: Option<String>,
    pub engine: Option<String>,
}

impl CrawlOverrides {
    pub fn apply(&self, config: &mut CrawlerConfig) -> Result<()> {
        if let Some(d) = self.depth {
            config.crawler.max_depth = d;
        }
        if let Some(l) = self.limit {
            config.limits.max_pages = Some(l);
        }
        if let Some(strategy) = &self.strategy {
            config.crawler.strategy = parse_strategy(Some(strategy))?;
        }
        if let Some(engine) = &self.engine {
            config.crawler.engine =
                EngineKind::parse(engine).with_context(|| format!("Unknown engine: {}", engine))?;
        }
        Ok(())
    }
}

fn print_job(job: &CrawlJob) {
    println!("Job ID: {}", job.id);
    println!("URL: {}", job.url);
    println!("Type: {}", job.job_type);
    println!("Status: {}", job.status);
    println!("Pages Crawled: {}", job.stats.pages_crawled);
    println!("Bytes Downloaded: {}", job.stats.bytes_downloaded);
    println!("Elapsed: {}ms", job.stats.elapsed_ms);
    println!("Created: {}", job.created_at);
    if let Some(started) = job.started_at {
        println!("Started: {}", started);
    }
    println!("Last Updated: {}", job.updated_at);
    if let Some(finished) = job.finished_at {
        println!("Finished: {}", finished);
    }
    if let Some(reason) = &job.stop_reason {
        println!("Stop Reason: {}", reason);
    }

    if !job.errors.is_empty() {
        println!("Recent Errors:");
        for error in job.errors.iter().rev().take(10) {
            println!("  - {}", error);
        }
    }
}

/// Run a stored job with progress logging; Ctrl-C cancels it
async fn run_to_end(controller: Arc<CrawlerController>, job_id: &str) -> Result<CrawlJob> {
    let mut events = controller.subscribe().await;
    let progress = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                CrawlEvent::RequestCompleted { url, status_code, links_enqueued, .. } => {
                    info!("[{}] {} (+{} links)", status_code, url, links_enqueued);
                }
                CrawlEvent::RequestFailed { url, error, will_retry, .. } => {
                    if will_retry {
                        warn!("{} failed, will retry: {}", url, error);
                    } else {
                        warn!("{} failed: {}", url, error);
                    }
                }
                CrawlEvent::CrawlFinished { .. } => break,
                CrawlEvent::RequestStarted { .. } => {}
            }
        }
    });

    let interrupt = {
        let controller = Arc::clone(&controller);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling job {}", job_id);
                if let Err(e) = controller.cancel_job(&job_id).await {
                    warn!("Failed to cancel job {}: {:#}", job_id, e);
                }
            }
        })
    };

    let result = controller.run_job(job_id).await;
    interrupt.abort();
    match &result {
        Ok(_) => {
            let _ = progress.await;
        }
        Err(_) => progress.abort(),
    }
    result
}

/// Create a job and run it to the end
pub async fn crawl(source: &ConfigSource, url: String, job_type: String, overrides: CrawlOverrides) -> Result<()> {
    let mut config = source.load()?;
    overrides.apply(&mut config)?;

    let controller = Arc::new(CrawlerController::new(config).await?);
    let job = controller.create_job(&url, &job_type).await?;

    info!("Crawling job created with ID: {}", job.id);
    info!("Use `crawlforge status {}` to check the job status", job.id);

    let finished = run_to_end(controller, &job.id).await?;
    print_job(&finished);
    Ok(())
}

/// Run or resume a stored job
pub async fn run(source: &ConfigSource, job_id: String) -> Result<()> {
    let controller = Arc::new(CrawlerController::new(source.load()?).await?);
    let finished = run_to_end(controller, &job_id).await?;
    print_job(&finished);
    Ok(())
}

pub async fn jobs(source: &ConfigSource) -> Result<()> {
    let controller = CrawlerController::new(source.load()?).await?;
    let jobs = controller.get_jobs().await?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!("{:<36}  {:<9}  {:<4}  {:>7}  URL", "ID", "STATUS", "TYPE", "PAGES");
    for job in jobs {
        println!(
            "{:<36}  {:<9}  {:<4}  {:>7}  {}",
            job.id, job.status, job.job_type, job.stats.pages_crawled, job.url
        );
    }
    Ok(())
}

/// Check the status of a crawling job
pub async fn status(source: &ConfigSource, job_id: String) -> Result<()> {
    let controller = CrawlerController::new(source.load()?).await?;
    let job = controller
        .get_job(&job_id)
        .await?
        .with_context(|| format!("Job {} not found", job_id))?;

    print_job(&job);
    Ok(())
}

pub async fn cancel(source: &ConfigSource, job_id: String) -> Result<()> {
    let controller = CrawlerController::new(source.load()?).await?;
    let job = controller.cancel_job(&job_id).await?;
    println!("Job {} is now {}", job.id, job.status);
    Ok(())
}

/// Scrape a social profile through its strategy chain
pub async fn scrape(source: &ConfigSource, url: String, max_items: usize, output: Option<PathBuf>) -> Result<()> {
    let config = source.load()?;
    let timeout = Duration::from_millis(config.crawler.request_timeout_ms);
    let sessions = build_sessions(&config);

    let http = Arc::new(CrawlerEngine::new(
        build_fetcher(&config, EngineKind::Http)?,
        Arc::clone(&sessions),
        timeout,
    ));
    let browser = if config.browser_service.enabled {
        Arc::new(CrawlerEngine::new(build_fetcher(&config, EngineKind::Browser)?, sessions, timeout))
    } else {
        warn!("Browser service disabled, fallback strategies will fetch over plain HTTP");
        Arc::clone(&http)
    };
    let scraper = PlatformScraper::new(http, browser);

    let result = scraper.scrape(&url, &ScrapeOptions { max_items }).await?;
    let json = serde_json::to_string_pretty(&result).context("Failed to serialize scrape result")?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, json)
                .await
                .context(format!("Failed to write {}", path.display()))?;
            info!("Scrape result written to: {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Export data from a job
pub async fn export(
    source: &ConfigSource,
    job_id: String,
    format: String,
    output: Option<PathBuf>,
    pretty: bool,
) -> Result<()> {
    let format = ExportFormat::parse(&format, pretty)?;
    let controller = CrawlerController::new(source.load()?).await?;

    let job = controller
        .get_job(&job_id)
        .await?
        .with_context(|| format!("Job {} not found", job_id))?;
    if !job.status.is_terminal() {
        warn!("Job is {}, data may be incomplete", job.status);
    } else if job.status != JobStatus::Completed {
        warn!("Job ended as {}", job.status);
    }

    let items = controller.get_items(&job_id).await?;
    match output {
        Some(path) => {
            export_to_file(&items, format, &path).await?;
            info!("Exported {} items to: {}", items.len(), path.display());
        }
        None => {
            let path = PathBuf::from(format!("{}.{}", job_id, format.extension()));
            export_to_file(&items, format, &path).await?;
            info!("Exported {} items to: {}", items.len(), path.display());
        }
    }
    Ok(())
}

/// Print the difference between two JSON exports
pub async fn diff(old: PathBuf, new: PathBuf) -> Result<()> {
    let read = |path: PathBuf| async move {
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context(format!("Failed to read {}", path.display()))?;
        import_json(&contents).context(format!("Failed to import {}", path.display()))
    };

    let old_items = read(old).await?;
    let new_items = read(new).await?;
    let diff = diff_datasets(&old_items, &new_items);

    println!("{}", serde_json::to_string_pretty(&diff)?);
    info!(
        "{} added, {} removed, {} changed",
        diff.added.len(),
        diff.removed.len(),
        diff.changed.len()
    );
    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from defaults when missing
pub fn manage_profile(profile_name: String) -> Result<()> {
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        },
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            CrawlerConfig::default().save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the active configuration
pub fn show_config(source: &ConfigSource) -> Result<()> {
    let config = source.load()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}
