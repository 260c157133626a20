use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::handlers::{self, HandlerContext};
use crate::core::{
    JobQueue, LoggingObserver, ProgressTracker, QueueOptions, ServerRegistry, SshTransport,
    Transport, TransportOptions,
};
use crate::db::JobStore;

/// Shared daemon state handed to the RPC layer and the CLI.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub servers: Arc<ServerRegistry>,
    pub transport: Arc<dyn Transport>,
    pub queue: Arc<JobQueue>,
    pub progress: ProgressTracker,
}

impl AppContext {
    /// Wire up the SSH transport, job handlers and queue. Starts the queue
    /// workers, so this must run inside a Tokio runtime.
    pub fn new(config: AppConfig, store: Arc<dyn JobStore>) -> Self {
        let transport: Arc<dyn Transport> =
            Arc::new(SshTransport::new(TransportOptions::from(&config)));
        Self::with_transport(config, store, transport)
    }

    pub fn with_transport(
        config: AppConfig,
        store: Arc<dyn JobStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let servers = Arc::new(ServerRegistry::new(config.servers.clone()));
        let registry = handlers::default_registry(
            HandlerContext {
                transport: transport.clone(),
                servers: servers.clone(),
                backup_directory: config.backup_directory.clone(),
            },
            &config,
        );

        let queue = Arc::new(JobQueue::new(QueueOptions::from(&config), store, registry));
        let progress = ProgressTracker::new();
        queue.subscribe(Arc::new(LoggingObserver));
        queue.subscribe(Arc::new(progress.clone()));

        Self {
            config: Arc::new(config),
            servers,
            transport,
            queue,
            progress,
        }
    }
}
