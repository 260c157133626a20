use std::path::Path;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::{Connection, params, rusqlite};
use tokio_rusqlite::rusqlite::OptionalExtension;

use super::JobStore;
use crate::core::Job;

const JOB_COLUMNS: &str =
    "id, kind, name, status, progress, created_at, started_at, ended_at, error, correlation_id";

/// SQLite-backed job records.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Connection,
}

impl SqliteJobStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .await
            .map_err(|e| anyhow!("Failed to open job database {}: {}", path.display(), e))?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| anyhow!("Failed to open in-memory job database: {}", e))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            let schema = include_str!("schema.sql");
            conn.execute_batch(schema)?;
            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(|e| anyhow!("Failed to initialise job schema: {}", e))?;

        Ok(Self { conn })
    }
}

/// Raw column values; converted to `Job` outside the database thread.
struct JobRow {
    id: String,
    kind: String,
    name: String,
    status: String,
    progress: i64,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    error: Option<String>,
    correlation_id: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            status: row.get(3)?,
            progress: row.get(4)?,
            created_at: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
            error: row.get(8)?,
            correlation_id: row.get(9)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            kind: self.kind.parse().map_err(|e: String| anyhow!(e))?,
            status: self.status.parse().map_err(|e: String| anyhow!(e))?,
            progress: self.progress.clamp(0, 100) as u8,
            created_at: parse_time(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_time).transpose()?,
            id: self.id,
            name: self.name,
            error: self.error,
            correlation_id: self.correlation_id,
        })
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in job table: {}", s))?
        .with_timezone(&Utc))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let job = job.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO jobs (id, kind, name, status, progress, created_at,
                                       started_at, ended_at, error, correlation_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                        status = excluded.status,
                        progress = excluded.progress,
                        started_at = excluded.started_at,
                        ended_at = excluded.ended_at,
                        error = excluded.error",
                    params![
                        &job.id,
                        job.kind.as_str(),
                        &job.name,
                        job.status.as_str(),
                        job.progress as i64,
                        format_time(&job.created_at),
                        job.started_at.as_ref().map(format_time),
                        job.ended_at.as_ref().map(format_time),
                        &job.error,
                        &job.correlation_id,
                    ],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .map_err(|e| anyhow!("Failed to save job: {}", e))
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        let id = id.to_string();
        let row = self
            .conn
            .call(move |c| {
                let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
                let mut stmt = c.prepare(&sql)?;
                let row = stmt.query_row(params![id], JobRow::from_row).optional()?;
                Ok::<_, rusqlite::Error>(row)
            })
            .await
            .map_err(|e| anyhow!("Failed to load job: {}", e))?;

        row.map(JobRow::into_job).transpose()
    }

    async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |c| {
                let sql = format!(
                    "SELECT {} FROM jobs
                     ORDER BY COALESCE(started_at, created_at) DESC
                     LIMIT ?1",
                    JOB_COLUMNS
                );
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![limit], JobRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await
            .map_err(|e| anyhow!("Failed to list jobs: {}", e))?;

        rows.into_iter().map(JobRow::into_job).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobKind, JobStatus};

    #[tokio::test]
    async fn save_is_an_upsert() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        let job = Job::new("job-1", JobKind::Backup, "backup prod", Some("run-1".into()));
        store.save_job(&job).await.unwrap();

        let running = job.running().unwrap();
        store.save_job(&running).await.unwrap();
        let failed = running.failed("disk full").unwrap();
        store.save_job(&failed).await.unwrap();

        let loaded = store.load_job("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("disk full"));
        assert_eq!(loaded.correlation_id.as_deref(), Some("run-1"));
        assert!(loaded.ended_at.is_some());
    }

    #[tokio::test]
    async fn missing_job_is_none() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        assert!(store.load_job("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_jobs_are_newest_first_and_limited() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        for i in 0..5 {
            let mut job = Job::new(format!("job-{}", i), JobKind::Discovery, "scan", None);
            job.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.save_job(&job).await.unwrap();
        }

        let recent = store.list_recent_jobs(3).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["job-4", "job-3", "job-2"]);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/jobs.db");
        {
            let store = SqliteJobStore::open(&path).await.unwrap();
            store
                .save_job(&Job::new("job-1", JobKind::Inspect, "inspect", None))
                .await
                .unwrap();
        }
        let store = SqliteJobStore::open(&path).await.unwrap();
        assert!(store.load_job("job-1").await.unwrap().is_some());
    }
}
