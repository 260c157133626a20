//! Job persistence.
//!
//! The queue treats storage as best-effort: a failed save is logged and the
//! in-memory cache stays authoritative for active jobs.

use anyhow::Result;
use async_trait::async_trait;

use crate::core::Job;

mod jobs;
mod memory;

pub use jobs::SqliteJobStore;
pub use memory::MemoryJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace the job with the same id.
    async fn save_job(&self, job: &Job) -> Result<()>;

    async fn load_job(&self, id: &str) -> Result<Option<Job>>;

    /// Most recent jobs first, by start time (enqueue time if never started).
    async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>>;
}
