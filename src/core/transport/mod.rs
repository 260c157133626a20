//! Remote transport: command execution and file transfer against servers.
//!
//! Every operation returns a result value; remote, protocol and connection
//! failures are reported through `success = false` rather than as errors.

mod pool;
mod ssh;
pub mod stream;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{ServerConfig, TransferResult};

pub use pool::SessionPool;
pub use ssh::{SshTransport, TransportOptions};

/// Progress callback: `(bytes_so_far, total_bytes_if_known)`.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Transport-level failure description, if the command never produced
    /// an exit status.
    pub error: Option<String>,
}

impl CommandResult {
    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            duration_ms,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// One-line description of why the command did not succeed.
    pub fn failure_reason(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        let stderr = self.stderr.trim();
        match (self.exit_code, stderr.is_empty()) {
            (Some(code), true) => format!("exit status {}", code),
            (Some(code), false) => format!("exit status {}: {}", code, stderr),
            (None, _) => "command did not complete".to_string(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` on `server`. Cancellation stops the local wait only; a
    /// dispatched remote process keeps running until it exits.
    async fn execute_command(
        &self,
        server: &ServerConfig,
        command: &str,
        cancel: &CancellationToken,
    ) -> CommandResult;

    /// True when a session can be obtained and a no-op command succeeds.
    async fn test_connection(&self, server: &ServerConfig) -> bool;

    async fn download(
        &self,
        server: &ServerConfig,
        remote_path: &str,
        local_path: &Path,
        on_progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> TransferResult;

    async fn upload(
        &self,
        server: &ServerConfig,
        local_path: &Path,
        remote_path: &str,
        on_progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> TransferResult;

    /// Copy a file between servers.
    ///
    /// When both ends are the same host, port and username a server-side
    /// `cp -p` is tried first. Otherwise, or if that fails, the file is streamed through
    /// a local temporary file, with progress reported as two halves of one
    /// transfer.
    async fn copy(
        &self,
        source: &ServerConfig,
        source_path: &str,
        destination: &ServerConfig,
        destination_path: &str,
        on_progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let started = Instant::now();

        // Only one login can see both paths with the same permissions
        if source.pool_key() == destination.pool_key() {
            let command = format!(
                "cp -p -- {src} {dst} && stat -c %s -- {dst}",
                src = shell_quote(source_path),
                dst = shell_quote(destination_path),
            );
            let result = self.execute_command(destination, &command, cancel).await;
            if result.success {
                let bytes = result.stdout.trim().parse::<u64>().unwrap_or(0);
                if let Some(cb) = &on_progress {
                    cb(bytes, Some(bytes));
                }
                info!(
                    server = %destination.name,
                    source = %source_path,
                    destination = %destination_path,
                    bytes,
                    "Server-side copy complete"
                );
                return TransferResult::ok(bytes, elapsed_ms(started));
            }
            if cancel.is_cancelled() {
                return TransferResult::failed("transfer cancelled", 0, elapsed_ms(started));
            }
            warn!(
                server = %destination.name,
                reason = %result.failure_reason(),
                "Server-side copy failed, streaming through local host"
            );
        }

        let staging = match tempfile::Builder::new().prefix("litesentry-copy-").tempfile() {
            Ok(file) => file.into_temp_path(),
            Err(e) => {
                return TransferResult::failed(
                    format!("failed to create staging file: {}", e),
                    0,
                    elapsed_ms(started),
                );
            }
        };

        let down = self
            .download(
                source,
                source_path,
                &staging,
                on_progress.clone().map(stream::first_half),
                cancel,
            )
            .await;
        if !down.success {
            return TransferResult::failed(
                format!(
                    "download leg failed: {}",
                    down.error.unwrap_or_default()
                ),
                down.bytes_transferred,
                elapsed_ms(started),
            );
        }

        let up = self
            .upload(
                destination,
                &staging,
                destination_path,
                on_progress.map(|cb| stream::second_half(cb, down.bytes_transferred)),
                cancel,
            )
            .await;
        // `staging` is removed when dropped
        if !up.success {
            return TransferResult::failed(
                format!("upload leg failed: {}", up.error.unwrap_or_default()),
                up.bytes_transferred,
                elapsed_ms(started),
            );
        }

        TransferResult::ok(up.bytes_transferred, elapsed_ms(started))
    }
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/srv/app.db"), "'/srv/app.db'");
        assert_eq!(shell_quote("/srv/it's.db"), r"'/srv/it'\''s.db'");
    }

    #[test]
    fn failure_reason_prefers_transport_error() {
        let r = CommandResult::failure("connection reset", 10);
        assert_eq!(r.failure_reason(), "connection reset");

        let r = CommandResult {
            exit_code: Some(2),
            stderr: "No such file\n".into(),
            ..Default::default()
        };
        assert_eq!(r.failure_reason(), "exit status 2: No such file");
    }
}
