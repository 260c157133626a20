use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::HandlerContext;
use crate::core::discovery::DiscoveryError;
use crate::core::queue::{JobHandler, JobReporter, parse_payload};
use crate::core::{Discovery, LogLevel};
use crate::error::JobError;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryPayload {
    pub server: String,
    /// Narrows the scan to this directory instead of `/`.
    #[serde(default)]
    pub search_root: Option<String>,
}

pub struct DiscoveryHandler {
    ctx: HandlerContext,
    discovery: Discovery,
}

impl DiscoveryHandler {
    pub fn new(ctx: HandlerContext, discovery: Discovery) -> Self {
        Self { ctx, discovery }
    }
}

#[async_trait]
impl JobHandler for DiscoveryHandler {
    async fn execute(
        &self,
        payload: serde_json::Value,
        reporter: JobReporter,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        let payload: DiscoveryPayload = parse_payload(payload)?;
        let server = self.ctx.server(&payload.server)?;

        let progress = |percent: u8, phase: &str| {
            reporter.report_progress(f64::from(percent), phase, None, None, None);
        };

        let files = self
            .discovery
            .discover(
                &server,
                payload.search_root.as_deref(),
                &cancel,
                Some(&progress),
            )
            .await
            .map_err(|e| match e {
                DiscoveryError::Cancelled => JobError::Cancelled,
                other => JobError::Failed(other.into()),
            })?;

        let listing = serde_json::to_value(&files).map_err(|e| JobError::Failed(e.into()))?;
        let properties = HashMap::from([
            ("server".to_string(), serde_json::json!(server.name)),
            ("count".to_string(), serde_json::json!(files.len())),
            ("files".to_string(), listing),
        ]);
        reporter.log_event(
            LogLevel::Info,
            format!("Found {} database files on {}", files.len(), server.name),
            Some("discovery"),
            properties,
        );

        Ok(())
    }
}
