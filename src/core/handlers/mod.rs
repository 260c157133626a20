//! Job handlers, one per `JobKind`.

mod backup;
mod copy;
mod discovery;
mod inspect;
mod restore;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use backup::{BackupHandler, BackupPayload, backup_file_name};
pub use copy::{CopyHandler, CopyPayload};
pub use discovery::{DiscoveryHandler, DiscoveryPayload};
pub use inspect::{DatabaseSummary, InspectHandler, InspectPayload, inspect_database};
pub use restore::{RestoreHandler, RestorePayload};

use super::queue::HandlerRegistry;
use super::transport::Transport;
use super::{Discovery, DiscoveryOptions, JobKind, ServerConfig, ServerRegistry, TransferResult};
use crate::config::AppConfig;
use crate::error::JobError;

/// Everything the handlers share.
#[derive(Clone)]
pub struct HandlerContext {
    pub transport: Arc<dyn Transport>,
    pub servers: Arc<ServerRegistry>,
    pub backup_directory: PathBuf,
}

impl HandlerContext {
    fn server(&self, name: &str) -> Result<ServerConfig, JobError> {
        self.servers
            .get(name)
            .cloned()
            .map_err(|e| JobError::Failed(e.into()))
    }
}

/// A registry with a handler for every job kind.
pub fn default_registry(ctx: HandlerContext, config: &AppConfig) -> HandlerRegistry {
    let discovery = Discovery::new(ctx.transport.clone(), DiscoveryOptions::from(config));

    let mut registry = HandlerRegistry::new();
    registry
        .register(
            JobKind::Discovery,
            Arc::new(DiscoveryHandler::new(ctx.clone(), discovery)),
        )
        .register(JobKind::Backup, Arc::new(BackupHandler::new(ctx.clone())))
        .register(JobKind::Restore, Arc::new(RestoreHandler::new(ctx.clone())))
        .register(JobKind::Copy, Arc::new(CopyHandler::new(ctx.clone())))
        .register(JobKind::Inspect, Arc::new(InspectHandler::new(ctx)));
    registry
}

/// Turn a failed transfer into the matching job error.
fn check_transfer(
    result: &TransferResult,
    cancel: &CancellationToken,
    what: &str,
) -> Result<(), JobError> {
    if result.success {
        return Ok(());
    }
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }
    Err(JobError::failed(format!(
        "{} failed: {}",
        what,
        result.error.as_deref().unwrap_or("unknown error")
    )))
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}
