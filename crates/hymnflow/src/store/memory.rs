use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{JobStateStore, StoreError};
use crate::worker::job::{Job, JobId};

/// In-process store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStateStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStateStore for MemoryStateStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(jobs.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        jobs.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::job::{JobKind, JobSource};

    fn download(url: &str) -> Job {
        Job::new(JobKind::CachedDownload, JobSource::remote(url))
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = MemoryStateStore::new();
        let job = download("https://cdn.example.com/1.mp3");

        store.save(&job).await.unwrap();
        assert_eq!(store.load(&job.id).await.unwrap(), Some(job.clone()));

        store.delete(&job.id).await.unwrap();
        assert!(store.load(&job.id).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_snapshot() {
        let store = MemoryStateStore::new();
        let mut job = download("https://cdn.example.com/1.mp3");
        store.save(&job).await.unwrap();

        job.progress = 42;
        store.save(&job).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.load(&job.id).await.unwrap().unwrap().progress, 42);
    }

    #[tokio::test]
    async fn test_delete_unknown_is_ok() {
        let store = MemoryStateStore::new();
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_oldest_first() {
        let store = MemoryStateStore::new();
        let mut older = download("https://cdn.example.com/a.mp3");
        older.created_at -= chrono::Duration::seconds(10);
        let newer = download("https://cdn.example.com/b.mp3");
        store.save(&newer).await.unwrap();
        store.save(&older).await.unwrap();

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }
}
