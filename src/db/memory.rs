use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::JobStore;
use crate::core::Job;

/// Process-local job records, for one-shot runs and tests.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.start_time().cmp(&a.start_time()));
        jobs.truncate(limit);
        Ok(jobs)
    }
}
