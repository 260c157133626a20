use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kinds of work the queue knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Discovery,
    Backup,
    Restore,
    Copy,
    Inspect,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Discovery,
        JobKind::Backup,
        JobKind::Restore,
        JobKind::Copy,
        JobKind::Inspect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Copy => "copy",
            Self::Inspect => "inspect",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job kind: {}", s))
    }
}

/// Job lifecycle: `Queued -> Running -> {Completed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(Self::Queued),
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// A tracked unit of asynchronous work.
///
/// `Job` is a value: every transition returns a new `Job` which the queue
/// writes back into its cache. Terminal jobs never transition again; the
/// transition methods return `None` for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub correlation_id: Option<String>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        kind: JobKind,
        name: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            status: JobStatus::Queued,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
            correlation_id,
        }
    }

    /// Ordering key for reporting views: when the job started running, or
    /// when it was enqueued if it has not started yet.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }

    pub fn running(&self) -> Option<Self> {
        if self.status != JobStatus::Queued {
            return None;
        }
        Some(Self {
            status: JobStatus::Running,
            started_at: Some(Utc::now()),
            ..self.clone()
        })
    }

    /// Progress never moves backwards and only changes while running.
    pub fn with_progress(&self, percent: u8) -> Option<Self> {
        if self.status != JobStatus::Running || percent <= self.progress {
            return None;
        }
        Some(Self {
            progress: percent.min(100),
            ..self.clone()
        })
    }

    pub fn completed(&self) -> Option<Self> {
        self.terminate(JobStatus::Completed, None)
    }

    pub fn failed(&self, error: impl Into<String>) -> Option<Self> {
        self.terminate(JobStatus::Failed, Some(error.into()))
    }

    pub fn cancelled(&self) -> Option<Self> {
        self.terminate(JobStatus::Cancelled, None)
    }

    fn terminate(&self, status: JobStatus, error: Option<String>) -> Option<Self> {
        if self.status.is_terminal() {
            return None;
        }
        let progress = if status == JobStatus::Completed {
            100
        } else {
            self.progress
        };
        Some(Self {
            status,
            progress,
            ended_at: Some(Utc::now()),
            error,
            ..self.clone()
        })
    }
}

/// How a job's processing ended, as seen by whoever awaits its completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// A database file found on a remote server. Every metadata field is
/// optional: a file whose stat failed is still reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDbFile {
    pub path: String,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub permissions: Option<String>,
}

impl DiscoveredDbFile {
    pub fn unknown(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: None,
            modified: None,
            owner: None,
            permissions: None,
        }
    }
}

/// Result of every transfer operation, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub success: bool,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl TransferResult {
    pub fn ok(bytes_transferred: u64, duration_ms: u64) -> Self {
        Self {
            success: true,
            bytes_transferred,
            duration_ms,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, bytes_transferred: u64, duration_ms: u64) -> Self {
        Self {
            success: false,
            bytes_transferred,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Live progress of a running job. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub percent: u8,
    pub phase: String,
    pub current_file: Option<String>,
    pub processed_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// A log line emitted by a job handler. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub job_id: String,
    pub level: LogLevel,
    pub message: String,
    pub category: Option<String>,
    pub properties: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_job() -> Job {
        Job::new("job-1", JobKind::Discovery, "scan", None)
            .running()
            .unwrap()
    }

    #[test]
    fn new_job_is_queued_without_timestamps() {
        let job = Job::new("job-1", JobKind::Backup, "backup prod", Some("run-7".into()));
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        assert!(job.ended_at.is_none());
        assert_eq!(job.correlation_id.as_deref(), Some("run-7"));
    }

    #[test]
    fn progress_is_monotonic_while_running() {
        let job = running_job().with_progress(40).unwrap();
        assert!(job.with_progress(30).is_none());
        assert!(job.with_progress(40).is_none());
        assert_eq!(job.with_progress(55).unwrap().progress, 55);
    }

    #[test]
    fn progress_ignored_unless_running() {
        let queued = Job::new("job-1", JobKind::Discovery, "scan", None);
        assert!(queued.with_progress(10).is_none());
    }

    #[test]
    fn completion_forces_full_progress_and_sets_end_once() {
        let done = running_job().with_progress(20).unwrap().completed().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.ended_at.is_some());

        assert!(done.cancelled().is_none());
        assert!(done.failed("late").is_none());
        assert!(done.completed().is_none());
    }

    #[test]
    fn queued_job_can_be_cancelled_directly() {
        let job = Job::new("job-1", JobKind::Copy, "copy", None);
        let cancelled = job.cancelled().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.error.is_none());
        assert!(cancelled.running().is_none());
    }

    #[test]
    fn failure_records_error_text() {
        let failed = running_job().failed("boom").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn kind_and_status_parse_from_strings() {
        assert_eq!("Inspect".parse::<JobKind>().unwrap(), JobKind::Inspect);
        assert!("nope".parse::<JobKind>().is_err());
        assert_eq!("Running".parse::<JobStatus>().unwrap(), JobStatus::Running);
    }
}
