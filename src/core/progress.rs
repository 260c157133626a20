//! In-memory progress tracking for active jobs.
//!
//! Holds the latest `ProgressEvent` of every running job so live queries
//! (current file, byte counters) can be answered without touching storage.
//! Progress is never persisted; entries disappear when a job ends.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::events::JobObserver;
use super::{Job, ProgressEvent};

#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, ProgressEvent>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, event: ProgressEvent) {
        let mut map = self.inner.write().await;
        map.insert(event.job_id.clone(), event);
    }

    pub async fn get(&self, job_id: &str) -> Option<ProgressEvent> {
        let map = self.inner.read().await;
        map.get(job_id).cloned()
    }

    pub async fn remove(&self, job_id: &str) {
        let mut map = self.inner.write().await;
        map.remove(job_id);
    }

    pub async fn get_all(&self) -> HashMap<String, ProgressEvent> {
        let map = self.inner.read().await;
        map.clone()
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}

#[async_trait]
impl JobObserver for ProgressTracker {
    async fn on_job_progress(&self, progress: &ProgressEvent) -> Result<()> {
        self.update(progress.clone()).await;
        Ok(())
    }

    async fn on_job_completed(&self, job: &Job) -> Result<()> {
        self.remove(&job.id).await;
        Ok(())
    }

    async fn on_job_failed(&self, job: &Job, _error: &str) -> Result<()> {
        self.remove(&job.id).await;
        Ok(())
    }

    async fn on_job_cancelled(&self, job: &Job) -> Result<()> {
        self.remove(&job.id).await;
        Ok(())
    }
}
