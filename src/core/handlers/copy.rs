use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{HandlerContext, check_transfer};
use crate::core::LogLevel;
use crate::core::queue::{JobHandler, JobReporter, parse_payload};
use crate::error::JobError;

#[derive(Debug, Clone, Deserialize)]
pub struct CopyPayload {
    pub source_server: String,
    pub source_path: String,
    pub destination_server: String,
    pub destination_path: String,
}

pub struct CopyHandler {
    ctx: HandlerContext,
}

impl CopyHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for CopyHandler {
    async fn execute(
        &self,
        payload: serde_json::Value,
        reporter: JobReporter,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        let payload: CopyPayload = parse_payload(payload)?;
        let source = self.ctx.server(&payload.source_server)?;
        let destination = self.ctx.server(&payload.destination_server)?;

        reporter.report_progress(0.0, "copying", Some(&payload.source_path), None, None);
        let result = self
            .ctx
            .transport
            .copy(
                &source,
                &payload.source_path,
                &destination,
                &payload.destination_path,
                Some(reporter.byte_progress("copying", &payload.source_path, 0, 100)),
                &cancel,
            )
            .await;
        check_transfer(&result, &cancel, "copy")?;

        info!(
            source = %source.name,
            destination = %destination.name,
            source_path = %payload.source_path,
            destination_path = %payload.destination_path,
            bytes = result.bytes_transferred,
            "Copy complete"
        );
        reporter.log_event(
            LogLevel::Info,
            format!(
                "Copied {}:{} to {}:{}",
                source.name, payload.source_path, destination.name, payload.destination_path
            ),
            Some("copy"),
            HashMap::from([
                ("bytes".to_string(), serde_json::json!(result.bytes_transferred)),
                ("duration_ms".to_string(), serde_json::json!(result.duration_ms)),
            ]),
        );
        Ok(())
    }
}
