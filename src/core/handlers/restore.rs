use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{HandlerContext, check_transfer};
use crate::core::LogLevel;
use crate::core::queue::{JobHandler, JobReporter, parse_payload};
use crate::error::JobError;

#[derive(Debug, Clone, Deserialize)]
pub struct RestorePayload {
    pub server: String,
    pub local_path: PathBuf,
    pub remote_path: String,
}

pub struct RestoreHandler {
    ctx: HandlerContext,
}

impl RestoreHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for RestoreHandler {
    async fn execute(
        &self,
        payload: serde_json::Value,
        reporter: JobReporter,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        let payload: RestorePayload = parse_payload(payload)?;
        let server = self.ctx.server(&payload.server)?;

        if !tokio::fs::try_exists(&payload.local_path)
            .await
            .unwrap_or(false)
        {
            return Err(JobError::failed(format!(
                "local file {} does not exist",
                payload.local_path.display()
            )));
        }

        let label = payload.local_path.display().to_string();
        reporter.report_progress(0.0, "uploading", Some(&label), None, None);
        let result = self
            .ctx
            .transport
            .upload(
                &server,
                &payload.local_path,
                &payload.remote_path,
                Some(reporter.byte_progress("uploading", &label, 0, 100)),
                &cancel,
            )
            .await;
        check_transfer(&result, &cancel, "upload")?;

        info!(
            server = %server.name,
            local_path = %label,
            remote_path = %payload.remote_path,
            bytes = result.bytes_transferred,
            duration_ms = result.duration_ms,
            "Restore complete"
        );
        reporter.log_event(
            LogLevel::Info,
            format!("Restored {} to {}:{}", label, server.name, payload.remote_path),
            Some("restore"),
            HashMap::from([
                ("bytes".to_string(), serde_json::json!(result.bytes_transferred)),
                ("duration_ms".to_string(), serde_json::json!(result.duration_ms)),
            ]),
        );
        Ok(())
    }
}
