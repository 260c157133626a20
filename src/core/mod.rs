pub mod discovery;
pub mod events;
pub mod handlers;
pub mod models;
pub mod progress;
pub mod queue;
pub mod servers;
pub mod transport;

pub use discovery::{Discovery, DiscoveryOptions};
pub use events::{EventDispatcher, JobEvent, JobObserver, LoggingObserver, SubscriptionId};
pub use models::{
    DiscoveredDbFile, Job, JobKind, JobOutcome, JobStatus, LogEvent, LogLevel, ProgressEvent,
    TransferResult,
};
pub use progress::ProgressTracker;
pub use queue::{
    HandlerRegistry, JobCompletion, JobHandler, JobQueue, JobReporter, QueueOptions, QueueStats,
};
pub use servers::{AuthKind, Credentials, PoolKey, ServerConfig, ServerRegistry};
pub use transport::{CommandResult, SshTransport, Transport, TransportOptions};
