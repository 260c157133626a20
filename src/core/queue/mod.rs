//! Bounded job queue and worker pool.
//!
//! Jobs live in an in-memory cache keyed by id. Every state change replaces
//! the cached `Job` with a new value under the map's shard lock, so a
//! cancellation racing a worker's completion resolves to exactly one
//! terminal state. Storage is written after the cache and only best-effort.

mod handler;
mod reporter;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

pub use handler::{HandlerRegistry, JobHandler, parse_payload};
pub use reporter::JobReporter;

use super::events::{EventDispatcher, JobEvent, JobObserver, SubscriptionId};
use super::{Job, JobKind, JobOutcome, JobStatus};
use crate::config::AppConfig;
use crate::db::JobStore;
use crate::error::{JobError, QueueError};

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    pub recent_jobs_limit: usize,
    pub shutdown_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            queue_capacity: 1000,
            recent_jobs_limit: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&AppConfig> for QueueOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            queue_capacity: config.queue_capacity,
            recent_jobs_limit: config.recent_jobs_limit,
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Snapshot of queue occupancy for status views.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub workers: usize,
    pub queued: usize,
    pub running: usize,
    pub capacity: usize,
    pub shutting_down: bool,
}

/// Resolves once a job reaches a terminal state.
pub enum JobCompletion {
    Ready(JobOutcome),
    Pending(watch::Receiver<Option<JobOutcome>>),
}

impl JobCompletion {
    pub async fn wait(self) -> JobOutcome {
        match self {
            Self::Ready(outcome) => outcome,
            Self::Pending(mut rx) => {
                let resolved = match rx.wait_for(Option::is_some).await {
                    Ok(value) => (*value).clone(),
                    Err(_) => None,
                };
                // Sender dropped without an outcome only happens on teardown
                resolved.unwrap_or(JobOutcome::Cancelled)
            }
        }
    }
}

fn outcome_of(job: &Job) -> Option<JobOutcome> {
    match job.status {
        JobStatus::Completed => Some(JobOutcome::Completed),
        JobStatus::Failed => Some(JobOutcome::Failed(job.error.clone().unwrap_or_default())),
        JobStatus::Cancelled => Some(JobOutcome::Cancelled),
        JobStatus::Queued | JobStatus::Running => None,
    }
}

struct WorkItem {
    id: String,
    kind: JobKind,
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Tracking for a job that is queued or running.
struct Registration {
    cancel: CancellationToken,
    outcome: watch::Sender<Option<JobOutcome>>,
}

impl Registration {
    /// First outcome wins.
    fn resolve(&self, outcome: JobOutcome) {
        self.outcome.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
    }
}

pub(crate) struct QueueInner {
    jobs: DashMap<String, Job>,
    active: DashMap<String, Registration>,
    store: Arc<dyn JobStore>,
    handlers: HandlerRegistry,
    dispatcher: EventDispatcher,
    permits: Arc<Semaphore>,
    intake: Mutex<Option<mpsc::Sender<WorkItem>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<WorkItem>>,
    shutdown: CancellationToken,
    options: QueueOptions,
}

pub struct JobQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Create the queue and start its workers. Must be called from within a
    /// Tokio runtime.
    pub fn new(options: QueueOptions, store: Arc<dyn JobStore>, handlers: HandlerRegistry) -> Self {
        let worker_count = options.max_concurrent_jobs.max(1);
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));

        let inner = Arc::new(QueueInner {
            jobs: DashMap::new(),
            active: DashMap::new(),
            store,
            handlers,
            dispatcher: EventDispatcher::new(),
            permits: Arc::new(Semaphore::new(worker_count)),
            intake: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            shutdown: CancellationToken::new(),
            options,
        });

        let workers = (0..worker_count)
            .map(|n| {
                let inner = inner.clone();
                tokio::spawn(
                    async move { inner.worker_loop(n).await }
                        .instrument(info_span!("worker", worker = n)),
                )
            })
            .collect();

        info!(workers = worker_count, capacity = inner.options.queue_capacity, "Job queue started");

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    pub async fn enqueue(
        &self,
        kind: JobKind,
        name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<String, QueueError> {
        self.enqueue_correlated(kind, name, payload, None).await
    }

    /// Enqueue a job linked to a causing entity. Blocks while the queue is
    /// full.
    pub async fn enqueue_correlated(
        &self,
        kind: JobKind,
        name: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: Option<String>,
    ) -> Result<String, QueueError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        if !inner.handlers.contains(kind) {
            return Err(QueueError::NoHandler(kind));
        }
        let Some(tx) = inner.intake_sender() else {
            return Err(QueueError::ShuttingDown);
        };

        let id = Uuid::now_v7().to_string();
        let job = Job::new(id.clone(), kind, name, correlation_id);
        inner.jobs.insert(id.clone(), job.clone());
        inner.persist(&job).await;

        let cancel = CancellationToken::new();
        let (outcome, _) = watch::channel(None);
        inner.active.insert(
            id.clone(),
            Registration {
                cancel: cancel.clone(),
                outcome,
            },
        );

        let item = WorkItem {
            id: id.clone(),
            kind,
            payload,
            enqueued_at: job.created_at,
            cancel,
        };

        let sent = tokio::select! {
            res = tx.send(item) => res.is_ok(),
            _ = inner.shutdown.cancelled() => false,
        };
        if !sent {
            inner.finish(&id, JobOutcome::Cancelled).await;
            return Err(QueueError::ShuttingDown);
        }

        debug!(job_id = %id, %kind, "Job enqueued");
        Ok(id)
    }

    /// Request cancellation. Returns false when the job is unknown or
    /// already terminal.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let inner = &self.inner;
        let Some(token) = inner.active.get(job_id).map(|r| r.cancel.clone()) else {
            return false;
        };
        token.cancel();

        if let Some(job) = inner.transition(job_id, Job::cancelled) {
            info!(job_id, "Job cancellation requested");
            inner.persist(&job).await;
            inner.dispatcher.publish(JobEvent::Cancelled(job));
            if let Some(reg) = inner.active.get(job_id) {
                reg.resolve(JobOutcome::Cancelled);
            }
        }
        true
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        if let Some(job) = self.inner.jobs.get(job_id) {
            return Some(job.clone());
        }
        match self.inner.store.load_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id, error = %e, "Failed to load job");
                None
            }
        }
    }

    /// Recent jobs, newest first. Cached state overrides stored state.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let limit = self.inner.options.recent_jobs_limit;
        let mut by_id: HashMap<String, Job> = match self.inner.store.list_recent_jobs(limit).await
        {
            Ok(jobs) => jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list stored jobs");
                HashMap::new()
            }
        };
        for entry in self.inner.jobs.iter() {
            by_id.insert(entry.key().clone(), entry.value().clone());
        }

        let mut jobs: Vec<Job> = by_id.into_values().collect();
        sort_newest_first(&mut jobs);
        jobs.truncate(limit);
        jobs
    }

    /// Queued and running jobs, newest first.
    pub fn list_active_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .iter()
            .filter(|e| e.status.is_active())
            .map(|e| e.value().clone())
            .collect();
        sort_newest_first(&mut jobs);
        jobs
    }

    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) -> SubscriptionId {
        self.inner.dispatcher.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.dispatcher.unsubscribe(id)
    }

    /// Completion handle for `job_id`, or None if the job is unknown.
    pub async fn completion(&self, job_id: &str) -> Option<JobCompletion> {
        if let Some(reg) = self.inner.active.get(job_id) {
            return Some(JobCompletion::Pending(reg.outcome.subscribe()));
        }
        let job = self.get_job(job_id).await?;
        // Registration is removed just after the terminal transition
        Some(match outcome_of(&job) {
            Some(outcome) => JobCompletion::Ready(outcome),
            None => JobCompletion::Ready(JobOutcome::Cancelled),
        })
    }

    pub fn stats(&self) -> QueueStats {
        let (queued, running) = self.inner.jobs.iter().fold((0, 0), |(q, r), e| match e.status {
            JobStatus::Queued => (q + 1, r),
            JobStatus::Running => (q, r + 1),
            _ => (q, r),
        });
        QueueStats {
            workers: self.inner.options.max_concurrent_jobs.max(1),
            queued,
            running,
            capacity: self.inner.options.queue_capacity,
            shutting_down: self.inner.shutdown.is_cancelled(),
        }
    }

    /// Stop intake, let in-flight jobs drain for up to the configured
    /// timeout, then cancel whatever is still registered.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        info!("Job queue shutting down");
        inner.shutdown.cancel();
        inner.lock_intake().take();

        let mut workers = std::mem::take(&mut *self.lock_workers());
        let drain = async {
            for handle in workers.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task ended abnormally");
                }
            }
        };
        if tokio::time::timeout(inner.options.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                timeout_secs = inner.options.shutdown_timeout.as_secs(),
                "Workers did not drain in time, cancelling remaining jobs"
            );
        }

        let remaining: Vec<String> = inner.active.iter().map(|e| e.key().clone()).collect();
        for id in remaining {
            if let Some(reg) = inner.active.get(&id) {
                reg.cancel.cancel();
            }
            inner.finish(&id, JobOutcome::Cancelled).await;
        }

        for handle in &workers {
            handle.abort();
        }
        info!("Job queue stopped");
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        for handle in self.lock_workers().iter() {
            handle.abort();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn sort_newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.start_time().cmp(&a.start_time()));
}

impl QueueInner {
    fn lock_intake(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<WorkItem>>> {
        self.intake
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn intake_sender(&self) -> Option<mpsc::Sender<WorkItem>> {
        self.lock_intake().clone()
    }

    /// Replace the cached job with `f(job)`. Returns the new value, or None
    /// if the job is unknown or `f` refused the transition.
    fn transition(&self, id: &str, f: impl FnOnce(&Job) -> Option<Job>) -> Option<Job> {
        let mut entry = self.jobs.get_mut(id)?;
        let next = f(entry.value())?;
        *entry.value_mut() = next.clone();
        Some(next)
    }

    /// Run `f` on the cached job only while it is Running. The shard lock is
    /// held across `f`, so anything it publishes is ordered before a
    /// terminal transition's event.
    fn while_running(&self, id: &str, f: impl FnOnce(&mut Job)) -> bool {
        match self.jobs.get_mut(id) {
            Some(mut entry) if entry.status == JobStatus::Running => {
                f(entry.value_mut());
                true
            }
            _ => false,
        }
    }

    fn snapshot(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|e| e.value().clone())
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job).await {
            warn!(job_id = %job.id, error = %e, "Failed to persist job");
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "Worker started");
        loop {
            let item = {
                let mut rx = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(item) = item else {
                break;
            };
            self.process(item).await;
        }
        debug!(worker, "Worker stopped");
    }

    async fn process(self: &Arc<Self>, item: WorkItem) {
        let WorkItem {
            id,
            kind,
            payload,
            enqueued_at,
            cancel,
        } = item;

        if cancel.is_cancelled() {
            debug!(job_id = %id, "Skipping job cancelled while queued");
            self.finish(&id, JobOutcome::Cancelled).await;
            return;
        }

        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finish(&id, JobOutcome::Cancelled).await;
                    return;
                }
            },
            _ = cancel.cancelled() => {
                self.finish(&id, JobOutcome::Cancelled).await;
                return;
            }
        };

        let Some(handler) = self.handlers.get(kind) else {
            let reason = QueueError::NoHandler(kind).to_string();
            self.start_then_finish(&id, JobOutcome::Failed(reason)).await;
            return;
        };

        let Some(job) = self.transition(&id, Job::running) else {
            // Cancelled between the check above and now
            self.finish(&id, JobOutcome::Cancelled).await;
            return;
        };
        let waited_ms = (Utc::now() - enqueued_at).num_milliseconds().max(0);
        debug!(job_id = %id, %kind, waited_ms, "Job dequeued");
        self.persist(&job).await;
        self.dispatcher.publish(JobEvent::Started(job));

        let reporter = JobReporter::new(&id, self.clone());
        let span = info_span!("job", job_id = %id, %kind);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { handler.execute(payload, reporter, cancel).await }.instrument(span)
        });

        let outcome = match task.await {
            Ok(Ok(())) => JobOutcome::Completed,
            Ok(Err(JobError::Cancelled)) => JobOutcome::Cancelled,
            Ok(Err(JobError::Failed(_))) if cancel.is_cancelled() => JobOutcome::Cancelled,
            Ok(Err(JobError::Failed(e))) => JobOutcome::Failed(format!("{:#}", e)),
            Err(e) if e.is_panic() => JobOutcome::Failed(format!(
                "job handler panicked: {}",
                panic_message(e.into_panic())
            )),
            Err(e) => JobOutcome::Failed(format!("job handler task failed: {}", e)),
        };

        self.finish(&id, outcome).await;
    }

    async fn start_then_finish(&self, id: &str, outcome: JobOutcome) {
        if let Some(job) = self.transition(id, Job::running) {
            self.dispatcher.publish(JobEvent::Started(job));
        }
        self.finish(id, outcome).await;
    }

    /// Apply the terminal transition for `outcome` (unless the job is already
    /// terminal), resolve waiters and drop the registration.
    async fn finish(&self, id: &str, outcome: JobOutcome) {
        let transitioned = match &outcome {
            JobOutcome::Completed => self.transition(id, Job::completed),
            JobOutcome::Failed(reason) => self.transition(id, |job| job.failed(reason.as_str())),
            JobOutcome::Cancelled => self.transition(id, Job::cancelled),
        };

        if let Some(job) = transitioned {
            match &outcome {
                JobOutcome::Completed => {
                    debug!(job_id = %id, "Job completed");
                    self.dispatcher.publish(JobEvent::Completed(job));
                }
                JobOutcome::Failed(reason) => {
                    debug!(job_id = %id, error = %reason, "Job failed");
                    self.dispatcher.publish(JobEvent::Failed {
                        job,
                        error: reason.clone(),
                    });
                }
                JobOutcome::Cancelled => {
                    debug!(job_id = %id, "Job cancelled");
                    self.dispatcher.publish(JobEvent::Cancelled(job));
                }
            }
        }

        // The cached state is authoritative; it may differ from `outcome`
        // when a cancel won the race.
        let current = self.snapshot(id);
        let resolved = current.as_ref().and_then(outcome_of).unwrap_or(outcome);
        if let Some(job) = &current {
            self.persist(job).await;
        }
        if let Some((_, reg)) = self.active.remove(id) {
            reg.resolve(resolved);
        }
        self.prune_cache();
    }

    /// Drop the oldest terminal jobs once the cache outgrows the reporting
    /// window. Storage still has them.
    fn prune_cache(&self) {
        let excess = self
            .jobs
            .len()
            .saturating_sub(self.options.recent_jobs_limit.max(1));
        if excess == 0 {
            return;
        }
        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .jobs
            .iter()
            .filter(|e| e.status.is_terminal())
            .map(|e| (e.ended_at.unwrap_or(e.created_at), e.key().clone()))
            .collect();
        finished.sort();
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}
