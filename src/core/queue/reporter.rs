use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use super::QueueInner;
use crate::core::events::JobEvent;
use crate::core::transport::ProgressFn;
use crate::core::{LogEvent, LogLevel, ProgressEvent};
use crate::logging::LogThrottle;

/// Progress and log sink handed to a running job handler.
///
/// Bound to a single job id. Cheap to clone and safe to call from blocking
/// threads, so it can back transfer progress callbacks directly.
#[derive(Clone)]
pub struct JobReporter {
    job_id: Arc<str>,
    queue: Arc<QueueInner>,
    throttle: Arc<LogThrottle>,
}

impl JobReporter {
    pub(super) fn new(job_id: &str, queue: Arc<QueueInner>) -> Self {
        Self {
            job_id: Arc::from(job_id),
            queue,
            throttle: Arc::new(LogThrottle::new(Duration::from_secs(1))),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Record progress. `percent` is clamped to [0, 100]; the job's cached
    /// progress only ever moves forward, but every report is broadcast.
    /// Reports arriving after the job reached a terminal state are dropped.
    pub fn report_progress(
        &self,
        percent: f64,
        phase: &str,
        current_file: Option<&str>,
        processed_bytes: Option<u64>,
        total_bytes: Option<u64>,
    ) {
        let percent = clamp_percent(percent);
        let published = self.queue.while_running(&self.job_id, |job| {
            if let Some(next) = job.with_progress(percent) {
                *job = next;
            }
            self.queue.dispatcher.publish(JobEvent::Progress(ProgressEvent {
                job_id: self.job_id.to_string(),
                percent,
                phase: phase.to_string(),
                current_file: current_file.map(str::to_string),
                processed_bytes,
                total_bytes,
                timestamp: Utc::now(),
            }));
        });

        if !published {
            debug!(job_id = %self.job_id, percent, phase, "Dropped progress for finished job");
        } else if self.throttle.should_log() {
            debug!(job_id = %self.job_id, percent, phase, "Job progress");
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_event(level, message, None, HashMap::new());
    }

    pub fn log_event(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        category: Option<&str>,
        properties: HashMap<String, serde_json::Value>,
    ) {
        self.queue.dispatcher.publish(JobEvent::Log(LogEvent {
            job_id: self.job_id.to_string(),
            level,
            message: message.into(),
            category: category.map(str::to_string),
            properties,
            timestamp: Utc::now(),
        }));
    }

    /// A transfer callback that maps byte counts onto the `[from, to]` slice
    /// of the job's overall progress.
    pub fn byte_progress(&self, phase: &str, file: &str, from: u8, to: u8) -> ProgressFn {
        let reporter = self.clone();
        let phase = phase.to_string();
        let file = file.to_string();
        let span = f64::from(to.saturating_sub(from));
        Arc::new(move |bytes: u64, total: Option<u64>| {
            let fraction = match total {
                Some(t) if t > 0 => (bytes as f64 / t as f64).min(1.0),
                _ => 0.0,
            };
            reporter.report_progress(
                f64::from(from) + span * fraction,
                &phase,
                Some(&file),
                Some(bytes),
                total,
            );
        })
    }
}

fn clamp_percent(percent: f64) -> u8 {
    if percent.is_nan() {
        return 0;
    }
    percent.clamp(0.0, 100.0).round() as u8
}
