use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, Context};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::cli::config::ResultsSettings;
use crate::crawler::job::CrawlJob;
use crate::dataset::DatasetItem;

/// Persistence for jobs and the dataset items they produce
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job
    async fn save_job(&self, job: &CrawlJob) -> Result<()>;

    /// Get a job by id
    async fn get_job(&self, job_id: &str) -> Result<Option<CrawlJob>>;

    /// List all jobs, newest first
    async fn list_jobs(&self) -> Result<Vec<CrawlJob>>;

    /// Append dataset items for a job
    async fn append_items(&self, job_id: &str, items: &[DatasetItem]) -> Result<()>;

    /// All dataset items recorded for a job
    async fn get_items(&self, job_id: &str) -> Result<Vec<DatasetItem>>;

    /// Delete a job and all its data
    async fn delete_job(&self, job_id: &str) -> Result<()>;
}

/// Factory for creating a JobStore implementation
pub struct JobStoreFactory;

impl JobStoreFactory {
    /// Create a new JobStore instance based on the settings
    pub async fn create(settings: &ResultsSettings) -> Result<Arc<dyn JobStore>> {
        match settings.storage_type.as_str() {
            "memory" => Ok(Arc::new(MemoryJobStore::default())),
            "filesystem" => {
                let store = FileJobStore::new(PathBuf::from(&settings.path)).await?;
                Ok(Arc::new(store))
            }
            _ => {
                anyhow::bail!("Unsupported results storage type: {}", settings.storage_type);
            }
        }
    }
}

fn sort_newest_first(jobs: &mut [CrawlJob]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Job store that lives only as long as the process
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, CrawlJob>>,
    items: RwLock<HashMap<String, Vec<DatasetItem>>>,
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_job(&self, job: &CrawlJob) -> Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<CrawlJob>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<CrawlJob>> {
        let mut jobs: Vec<CrawlJob> = self.jobs.read().await.values().cloned().collect();
        sort_newest_first(&mut jobs);
        Ok(jobs)
    }

    async fn append_items(&self, job_id: &str, items: &[DatasetItem]) -> Result<()> {
        self.items
            .write()
            .await
            .entry(job_id.to_string())
            .or_default()
            .extend_from_slice(items);
        Ok(())
    }

    async fn get_items(&self, job_id: &str) -> Result<Vec<DatasetItem>> {
        Ok(self.items.read().await.get(job_id).cloned().unwrap_or_default())
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.jobs.write().await.remove(job_id);
        self.items.write().await.remove(job_id);
        Ok(())
    }
}

/// Job store writing one JSON file per job and one JSON-lines file per dataset
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub async fn new(root: PathBuf) -> Result<Self> {
        for dir in ["jobs", "datasets"] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path).await
                .context(format!("Failed to create directory: {}", path.display()))?;
        }

        debug!("Using filesystem job store at {}", root.display());

        Ok(Self { root })
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(format!("{}.json", job_id))
    }

    fn items_path(&self, job_id: &str) -> PathBuf {
        self.root.join("datasets").join(format!("{}.jsonl", job_id))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save_job(&self, job: &CrawlJob) -> Result<()> {
        let contents = serde_json::to_string_pretty(job)
            .context("Failed to serialize job")?;

        // Write then rename so readers never see a torn file
        let path = self.job_path(&job.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await
            .context(format!("Failed to write job file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path).await
            .context(format!("Failed to replace job file: {}", path.display()))?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<CrawlJob>> {
        let path = self.job_path(job_id);
        if !path.exists() {
            return Ok(None);
        }

        let contents = tokio::fs::read_to_string(&path).await
            .context(format!("Failed to read job file: {}", path.display()))?;
        let job = serde_json::from_str(&contents)
            .context(format!("Failed to parse job file: {}", path.display()))?;

        Ok(Some(job))
    }

    async fn list_jobs(&self) -> Result<Vec<CrawlJob>> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("jobs")).await
            .context("Failed to list job files")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let contents = tokio::fs::read_to_string(&path).await?;
                match serde_json::from_str::<CrawlJob>(&contents) {
                    Ok(job) => jobs.push(job),
                    Err(e) => debug!("Skipping unreadable job file {}: {}", path.display(), e),
                }
            }
        }

        sort_newest_first(&mut jobs);
        Ok(jobs)
    }

    async fn append_items(&self, job_id: &str, items: &[DatasetItem]) -> Result<()> {
        let mut buffer = String::new();
        for item in items {
            buffer.push_str(&serde_json::to_string(item).context("Failed to serialize dataset item")?);
            buffer.push('\n');
        }

        let path = self.items_path(job_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(format!("Failed to open dataset file: {}", path.display()))?;
        file.write_all(buffer.as_bytes()).await
            .context(format!("Failed to append to dataset file: {}", path.display()))?;
        file.flush().await?;

        Ok(())
    }

    async fn get_items(&self, job_id: &str) -> Result<Vec<DatasetItem>> {
        let path = self.items_path(job_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = tokio::fs::read_to_string(&path).await
            .context(format!("Failed to read dataset file: {}", path.display()))?;

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Failed to parse dataset item"))
            .collect()
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        for path in [self.job_path(job_id), self.items_path(job_id)] {
            if path.exists() {
                tokio::fs::remove_file(&path).await
                    .context(format!("Failed to delete {}", path.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::job::{JobStatus, JobType};
    use serde_json::json;

    async fn exercise(store: &dyn JobStore) {
        let mut first = CrawlJob::new("https://example.com", JobType::Url, 2).unwrap();
        first.created_at = first.created_at - chrono::Duration::seconds(10);
        let second = CrawlJob::new("https://example.org", JobType::Seo, 2).unwrap();

        store.save_job(&first).await.unwrap();
        store.save_job(&second).await.unwrap();

        let jobs = store.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, second.id);

        first.transition(JobStatus::Running);
        store.save_job(&first).await.unwrap();
        let loaded = store.get_job(&first.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);

        let items = vec![
            DatasetItem::new("https://example.com/a", json!({"t": 1})),
            DatasetItem::new("https://example.com/b", json!({"t": 2})),
        ];
        store.append_items(&first.id, &items[..1]).await.unwrap();
        store.append_items(&first.id, &items[1..]).await.unwrap();
        assert_eq!(store.get_items(&first.id).await.unwrap(), items);

        store.delete_job(&first.id).await.unwrap();
        assert!(store.get_job(&first.id).await.unwrap().is_none());
        assert!(store.get_items(&first.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryJobStore::default()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path().to_path_buf()).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_backend() {
        let settings = ResultsSettings {
            storage_type: "mongodb".to_string(),
            path: String::new(),
        };
        assert!(JobStoreFactory::create(&settings).await.is_err());
    }
}
