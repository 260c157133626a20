//! Job lifecycle events and their observers.
//!
//! Every subscription gets its own bounded channel and delivery task: events
//! for one observer arrive in the order they were published, and a slow or
//! failing observer never holds up the others. Delivery is best-effort; an
//! event dropped for a full channel is an observability gap, not an error.

use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use super::{Job, LogEvent, LogLevel, ProgressEvent};

/// Per-observer buffer before events are dropped.
const OBSERVER_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub enum JobEvent {
    Started(Job),
    Progress(ProgressEvent),
    Log(LogEvent),
    Completed(Job),
    Failed { job: Job, error: String },
    Cancelled(Job),
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Started(job) | Self::Completed(job) | Self::Cancelled(job) => &job.id,
            Self::Failed { job, .. } => &job.id,
            Self::Progress(p) => &p.job_id,
            Self::Log(l) => &l.job_id,
        }
    }
}

/// Receives job lifecycle callbacks. All methods default to no-ops.
#[async_trait]
pub trait JobObserver: Send + Sync {
    async fn on_job_started(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    async fn on_job_progress(&self, _progress: &ProgressEvent) -> Result<()> {
        Ok(())
    }

    async fn on_job_log(&self, _log: &LogEvent) -> Result<()> {
        Ok(())
    }

    async fn on_job_completed(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    async fn on_job_failed(&self, _job: &Job, _error: &str) -> Result<()> {
        Ok(())
    }

    async fn on_job_cancelled(&self, _job: &Job) -> Result<()> {
        Ok(())
    }
}

async fn deliver(observer: &dyn JobObserver, event: &JobEvent) -> Result<()> {
    match event {
        JobEvent::Started(job) => observer.on_job_started(job).await,
        JobEvent::Progress(p) => observer.on_job_progress(p).await,
        JobEvent::Log(l) => observer.on_job_log(l).await,
        JobEvent::Completed(job) => observer.on_job_completed(job).await,
        JobEvent::Failed { job, error } => observer.on_job_failed(job, error).await,
        JobEvent::Cancelled(job) => observer.on_job_cancelled(job).await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<JobEvent>,
}

#[derive(Default)]
pub struct EventDispatcher {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`. Must be called from within a Tokio runtime.
    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::channel::<JobEvent>(OBSERVER_BUFFER);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = deliver(observer.as_ref(), &event).await {
                    warn!(
                        subscription = id.0,
                        job_id = %event.job_id(),
                        error = %e,
                        "Job observer failed"
                    );
                }
            }
            debug!(subscription = id.0, "Observer delivery task finished");
        });

        self.lock().push(Subscriber { id, tx });
        id
    }

    /// Remove a subscription. Events already queued for it are still
    /// delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Fan `event` out to every subscriber without blocking.
    pub fn publish(&self, event: JobEvent) {
        let senders: Vec<(SubscriptionId, mpsc::Sender<JobEvent>)> =
            self.lock().iter().map(|s| (s.id, s.tx.clone())).collect();

        for (id, tx) in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscription = id.0, job_id = %event.job_id(), "Observer lagging, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription = id.0, "Observer gone, event dropped");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Writes lifecycle events to the tracing log.
pub struct LoggingObserver;

#[async_trait]
impl JobObserver for LoggingObserver {
    async fn on_job_started(&self, job: &Job) -> Result<()> {
        info!(job_id = %job.id, kind = %job.kind, name = %job.name, "Job started");
        Ok(())
    }

    async fn on_job_log(&self, log: &LogEvent) -> Result<()> {
        let category = log.category.as_deref().unwrap_or("job");
        match log.level {
            LogLevel::Debug => debug!(job_id = %log.job_id, category, "{}", log.message),
            LogLevel::Info => info!(job_id = %log.job_id, category, "{}", log.message),
            LogLevel::Warn => warn!(job_id = %log.job_id, category, "{}", log.message),
            LogLevel::Error => error!(job_id = %log.job_id, category, "{}", log.message),
        }
        Ok(())
    }

    async fn on_job_completed(&self, job: &Job) -> Result<()> {
        info!(job_id = %job.id, kind = %job.kind, "Job completed");
        Ok(())
    }

    async fn on_job_failed(&self, job: &Job, error: &str) -> Result<()> {
        error!(job_id = %job.id, kind = %job.kind, error, "Job failed");
        Ok(())
    }

    async fn on_job_cancelled(&self, job: &Job) -> Result<()> {
        info!(job_id = %job.id, kind = %job.kind, "Job cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobKind;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Recorder(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl JobObserver for Recorder {
        async fn on_job_started(&self, job: &Job) -> Result<()> {
            let _ = self.0.send(format!("started:{}", job.id));
            Ok(())
        }

        async fn on_job_completed(&self, job: &Job) -> Result<()> {
            let _ = self.0.send(format!("completed:{}", job.id));
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl JobObserver for Broken {
        async fn on_job_started(&self, _job: &Job) -> Result<()> {
            anyhow::bail!("observer exploded")
        }
    }

    fn job(id: &str) -> Job {
        Job::new(id, JobKind::Discovery, "scan", None)
    }

    #[tokio::test]
    async fn failing_observer_does_not_affect_others() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(Arc::new(Broken));
        dispatcher.subscribe(Arc::new(Recorder(tx)));

        dispatcher.publish(JobEvent::Started(job("a")));
        dispatcher.publish(JobEvent::Completed(job("a")));

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("started:a"));
        assert_eq!(second.as_deref(), Some("completed:a"));
    }

    #[tokio::test]
    async fn unsubscribed_observer_stops_receiving() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = dispatcher.subscribe(Arc::new(Recorder(tx)));

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.subscriber_count(), 0);

        dispatcher.publish(JobEvent::Started(job("b")));
        // Sender side of the observer channel is gone, so the task ends
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), None);
    }
}
