use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::error::{DittoError, Result};
use crate::jobs::job::{retention_cutoff, JobPhase, JobRecord};

/// In-memory table of the jobs of one kind.
///
/// Reads share the lock, every mutation takes it exclusively. Closures passed
/// to [`JobRegistry::mutate`] run under the write lock and must not block;
/// callers do external I/O before or after, never inside.
#[derive(Debug)]
pub struct JobRegistry<P, D> {
    jobs: RwLock<HashMap<String, JobRecord<P, D>>>,
}

impl<P: JobPhase, D: Clone> Default for JobRegistry<P, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: JobPhase, D: Clone> JobRegistry<P, D> {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a record. Returns the record previously stored under
    /// the same id.
    pub async fn put(&self, job: JobRecord<P, D>) -> Option<JobRecord<P, D>> {
        self.jobs.write().await.insert(job.id.clone(), job)
    }

    /// Insert a record whose id has never been used.
    pub async fn insert_new(&self, job: JobRecord<P, D>) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(DittoError::Conflict(format!("job id {} already in use", job.id)));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<JobRecord<P, D>> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.jobs.read().await.contains_key(id)
    }

    pub async fn delete(&self, id: &str) -> Option<JobRecord<P, D>> {
        self.jobs.write().await.remove(id)
    }

    /// All records sorted chronologically by creation time
    pub async fn list_all(&self) -> Vec<JobRecord<P, D>> {
        let mut jobs: Vec<JobRecord<P, D>> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Atomic read-modify-write of one record. Returns `None` when the id is
    /// unknown.
    pub async fn mutate<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut JobRecord<P, D>) -> R,
    ) -> Option<R> {
        let mut jobs = self.jobs.write().await;
        jobs.get_mut(id).map(f)
    }

    /// Remove every record matching `pred` and return them.
    pub async fn remove_where(
        &self,
        mut pred: impl FnMut(&JobRecord<P, D>) -> bool,
    ) -> Vec<JobRecord<P, D>> {
        let mut jobs = self.jobs.write().await;
        let ids: Vec<String> = jobs
            .values()
            .filter(|job| pred(job))
            .map(|job| job.id.clone())
            .collect();
        ids.iter().filter_map(|id| jobs.remove(id)).collect()
    }

    /// Remove every record created more than `max_age` ago.
    pub async fn remove_older_than(&self, max_age: Duration) -> Vec<JobRecord<P, D>> {
        match retention_cutoff(max_age) {
            Some(cutoff) => self.remove_where(|job| job.created_at < cutoff).await,
            None => Vec::new(),
        }
    }

    /// Ids of records created more than `max_age` ago, oldest first.
    pub async fn ids_older_than(&self, max_age: Duration) -> Vec<String> {
        let Some(cutoff) = retention_cutoff(max_age) else {
            return Vec::new();
        };
        self.list_all()
            .await
            .into_iter()
            .filter(|job| job.created_at < cutoff)
            .map(|job| job.id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
