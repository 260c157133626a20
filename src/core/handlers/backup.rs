use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{HandlerContext, check_transfer, ensure_not_cancelled};
use crate::core::queue::{JobHandler, JobReporter, parse_payload};
use crate::core::transport::shell_quote;
use crate::core::{LogLevel, ServerConfig};
use crate::error::JobError;

#[derive(Debug, Clone, Deserialize)]
pub struct BackupPayload {
    pub server: String,
    pub remote_path: String,
    /// Overrides `<backup_directory>/<server>`.
    #[serde(default)]
    pub destination_dir: Option<PathBuf>,
}

pub struct BackupHandler {
    ctx: HandlerContext,
}

impl BackupHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    /// Take a consistent copy with the sqlite3 CLI. Returns the snapshot path
    /// or None when the remote host cannot make one.
    async fn snapshot(
        &self,
        server: &ServerConfig,
        remote_path: &str,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let snapshot = format!("/tmp/litesentry-{}.db", job_id);
        let command = format!(
            "command -v sqlite3 >/dev/null 2>&1 && sqlite3 {} {}",
            shell_quote(remote_path),
            shell_quote(&format!(".backup {}", snapshot)),
        );
        let result = self
            .ctx
            .transport
            .execute_command(server, &command, cancel)
            .await;
        if result.success {
            Some(snapshot)
        } else {
            warn!(
                server = %server.name,
                remote_path,
                reason = %result.failure_reason(),
                "Snapshot unavailable, copying live file"
            );
            None
        }
    }

    async fn remove_snapshot(&self, server: &ServerConfig, snapshot: &str) {
        // Runs even after the job was cancelled
        let command = format!("rm -f -- {}", shell_quote(snapshot));
        let result = self
            .ctx
            .transport
            .execute_command(server, &command, &CancellationToken::new())
            .await;
        if !result.success {
            warn!(server = %server.name, snapshot, reason = %result.failure_reason(), "Failed to remove remote snapshot");
        }
    }
}

#[async_trait]
impl JobHandler for BackupHandler {
    async fn execute(
        &self,
        payload: serde_json::Value,
        reporter: JobReporter,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        let payload: BackupPayload = parse_payload(payload)?;
        let server = self.ctx.server(&payload.server)?;

        let destination_dir = payload
            .destination_dir
            .clone()
            .unwrap_or_else(|| self.ctx.backup_directory.join(&server.name));
        let local_path =
            destination_dir.join(backup_file_name(&payload.remote_path, Utc::now()));

        reporter.report_progress(0.0, "snapshot", Some(&payload.remote_path), None, None);
        let snapshot = self
            .snapshot(&server, &payload.remote_path, reporter.job_id(), &cancel)
            .await;
        if let Err(e) = ensure_not_cancelled(&cancel) {
            if let Some(snapshot) = &snapshot {
                self.remove_snapshot(&server, snapshot).await;
            }
            return Err(e);
        }
        let source = snapshot.as_deref().unwrap_or(&payload.remote_path);
        reporter.report_progress(10.0, "downloading", Some(&payload.remote_path), None, None);

        let result = self
            .ctx
            .transport
            .download(
                &server,
                source,
                &local_path,
                Some(reporter.byte_progress("downloading", &payload.remote_path, 10, 90)),
                &cancel,
            )
            .await;
        if let Some(snapshot) = &snapshot {
            self.remove_snapshot(&server, snapshot).await;
        }
        check_transfer(&result, &cancel, "download")?;

        reporter.report_progress(90.0, "verifying", Some(&payload.remote_path), None, None);
        let digest_path = local_path.clone();
        let digest = tokio::task::spawn_blocking(move || hash_file_sync(&digest_path))
            .await
            .map_err(|e| JobError::failed(format!("digest task failed: {}", e)))??;

        info!(
            server = %server.name,
            remote_path = %payload.remote_path,
            local_path = %local_path.display(),
            bytes = result.bytes_transferred,
            blake3 = %digest,
            consistent = snapshot.is_some(),
            "Backup complete"
        );
        let properties = HashMap::from([
            ("server".to_string(), serde_json::json!(server.name)),
            ("remote_path".to_string(), serde_json::json!(payload.remote_path)),
            ("local_path".to_string(), serde_json::json!(local_path.display().to_string())),
            ("bytes".to_string(), serde_json::json!(result.bytes_transferred)),
            ("blake3".to_string(), serde_json::json!(digest.to_hex().to_string())),
            ("snapshot".to_string(), serde_json::json!(snapshot.is_some())),
        ]);
        reporter.log_event(
            LogLevel::Info,
            format!("Backed up {} to {}", payload.remote_path, local_path.display()),
            Some("backup"),
            properties,
        );
        Ok(())
    }
}

/// `<stem>_<UTC timestamp>.<ext>` for the remote file name.
pub fn backup_file_name(remote_path: &str, at: DateTime<Utc>) -> String {
    let name = Path::new(remote_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("database");
    let stamp = at.format("%Y%m%dT%H%M%SZ");
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, stamp, ext),
        _ => format!("{}_{}", name, stamp),
    }
}

/// Hash a file using BLAKE3, streaming in chunks.
fn hash_file_sync(path: &Path) -> Result<blake3::Hash, JobError> {
    let digest = || -> Result<blake3::Hash> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = std::io::BufReader::with_capacity(128 * 1024, file);
        let mut hasher = blake3::Hasher::new();

        let mut buffer = [0u8; 128 * 1024];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(hasher.finalize())
    };
    digest().map_err(JobError::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backup_name_keeps_extension() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            backup_file_name("/var/lib/app/data.sqlite3", at),
            "data_20240309T140507Z.sqlite3"
        );
        assert_eq!(backup_file_name("/srv/state", at), "state_20240309T140507Z");
        assert_eq!(backup_file_name("/srv/.hidden", at), ".hidden_20240309T140507Z");
    }

    #[test]
    fn digest_matches_one_shot_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.db");
        let content = vec![7u8; 300 * 1024];
        std::fs::write(&path, &content).unwrap();

        assert_eq!(hash_file_sync(&path).unwrap(), blake3::hash(&content));
        assert!(hash_file_sync(&dir.path().join("missing.db")).is_err());
    }
}
