use std::collections::HashMap;
use std::path::Path;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::{Connection, rusqlite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{HandlerContext, check_transfer, ensure_not_cancelled};
use crate::core::LogLevel;
use crate::core::queue::{JobHandler, JobReporter, parse_payload};
use crate::error::JobError;

#[derive(Debug, Clone, Deserialize)]
pub struct InspectPayload {
    pub server: String,
    pub remote_path: String,
}

/// What a read-only look at a database file reveals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseSummary {
    pub tables: Vec<String>,
    pub page_count: i64,
    pub page_size: i64,
    /// `["ok"]` for a healthy file, otherwise the problems SQLite reported.
    pub integrity: Vec<String>,
}

impl DatabaseSummary {
    pub fn is_healthy(&self) -> bool {
        self.integrity.len() == 1 && self.integrity[0] == "ok"
    }

    pub fn size_bytes(&self) -> i64 {
        self.page_count * self.page_size
    }
}

/// Open `path` read-only and summarise it.
pub async fn inspect_database(path: &Path) -> Result<DatabaseSummary> {
    let conn = Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .await
    .map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;

    conn.call(|c| {
        let tables = {
            let mut stmt = c.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            names
        };
        let page_count = c.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size = c.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let integrity = {
            let mut stmt = c.prepare("PRAGMA integrity_check")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        Ok::<_, rusqlite::Error>(DatabaseSummary {
            tables,
            page_count,
            page_size,
            integrity,
        })
    })
    .await
    .map_err(|e| anyhow!("Failed to inspect {}: {}", path.display(), e))
}

pub struct InspectHandler {
    ctx: HandlerContext,
}

impl InspectHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for InspectHandler {
    async fn execute(
        &self,
        payload: serde_json::Value,
        reporter: JobReporter,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        let payload: InspectPayload = parse_payload(payload)?;
        let server = self.ctx.server(&payload.server)?;

        let workdir = tempfile::Builder::new()
            .prefix("litesentry-inspect-")
            .tempdir()
            .map_err(|e| JobError::failed(format!("failed to create work directory: {}", e)))?;
        let local_path = workdir.path().join("inspect.db");

        reporter.report_progress(0.0, "downloading", Some(&payload.remote_path), None, None);
        let result = self
            .ctx
            .transport
            .download(
                &server,
                &payload.remote_path,
                &local_path,
                Some(reporter.byte_progress("downloading", &payload.remote_path, 0, 80)),
                &cancel,
            )
            .await;
        check_transfer(&result, &cancel, "download")?;
        ensure_not_cancelled(&cancel)?;

        reporter.report_progress(80.0, "inspecting", Some(&payload.remote_path), None, None);
        let summary = inspect_database(&local_path).await?;

        if summary.is_healthy() {
            info!(
                server = %server.name,
                remote_path = %payload.remote_path,
                tables = summary.tables.len(),
                size_bytes = summary.size_bytes(),
                "Database inspected"
            );
        } else {
            warn!(
                server = %server.name,
                remote_path = %payload.remote_path,
                problems = summary.integrity.len(),
                "Database failed integrity check"
            );
        }

        let level = if summary.is_healthy() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let details = serde_json::to_value(&summary).map_err(|e| JobError::Failed(e.into()))?;
        reporter.log_event(
            level,
            format!(
                "{}:{} has {} tables, integrity {}",
                server.name,
                payload.remote_path,
                summary.tables.len(),
                if summary.is_healthy() { "ok" } else { "FAILED" }
            ),
            Some("inspect"),
            HashMap::from([("summary".to_string(), details)]),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn summarises_a_local_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        {
            let conn = Connection::open(&path).await.unwrap();
            conn.call(|c| {
                c.execute_batch(
                    "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
                     CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER);
                     INSERT INTO users (name) VALUES ('ada');",
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
        }

        let summary = inspect_database(&path).await.unwrap();
        assert_eq!(summary.tables, vec!["orders", "users"]);
        assert!(summary.is_healthy());
        assert!(summary.page_count > 0);
        assert_eq!(summary.size_bytes(), summary.page_count * summary.page_size);
    }

    #[tokio::test]
    async fn garbage_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a.db");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();

        assert!(inspect_database(&path).await.is_err());
    }
}
