use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::JobReporter;
use crate::core::JobKind;
use crate::error::JobError;

/// Executes one kind of job.
///
/// The payload is whatever was passed to `JobQueue::enqueue`; each handler
/// owns its shape. Handlers are expected to check `cancel` between steps and
/// return `JobError::Cancelled` once they notice it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(
        &self,
        payload: serde_json::Value,
        reporter: JobReporter,
        cancel: CancellationToken,
    ) -> Result<(), JobError>;
}

/// Decode a handler payload, reporting malformed input as a job failure.
pub fn parse_payload<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T, JobError> {
    serde_json::from_value(payload)
        .map_err(|e| JobError::failed(format!("invalid job payload: {}", e)))
}

/// Maps a job kind to the handler that runs it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}
