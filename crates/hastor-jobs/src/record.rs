//! Job records: the serializable view of a job that is returned by queries
//! and carried by `core.get_jobs` events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Job identifier. Monotonically increasing, never reused within a process.
pub type JobId = u64;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    /// Queued; lock not yet acquired.
    Waiting,
    /// Executing.
    Running,
    /// Finished with a result.
    Success,
    /// Finished with an error.
    Failed,
    /// Cancelled.
    Aborted,
    /// Finished without acting on its input.
    Ignored,
}

impl JobState {
    /// True for every state a job never leaves.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Waiting | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Aborted => "ABORTED",
            JobState::Ignored => "IGNORED",
        };
        f.write_str(s)
    }
}

/// Job progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Percent complete, 0..=100.
    pub percent: Option<u8>,
    /// Current step.
    pub description: Option<String>,
    /// Free-form extra data.
    pub extra: Option<Value>,
}

/// Structured failure information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcInfo {
    /// Debug rendering of the error.
    pub repr: String,
    /// Error class: `VALIDATION`, `CallError`, `LockError` or `Error`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Numeric errno when known.
    pub errno: Option<i32>,
    /// Extra error payload; for validation failures the list of
    /// `[attribute, message, errno]` triples.
    pub extra: Option<Value>,
}

/// Snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub id: JobId,
    /// Method name, e.g. `failover.events.vrrp_master`.
    pub method: String,
    /// Arguments with secrets redacted.
    pub arguments: Value,
    /// Human-readable description.
    pub description: Option<String>,
    /// Lock the job runs under.
    pub lock: Option<String>,
    /// Whether the job accepts abort requests.
    pub abortable: bool,
    /// Current state.
    pub state: JobState,
    /// Progress.
    pub progress: JobProgress,
    /// Result on success.
    pub result: Option<Value>,
    /// Error message on failure.
    pub error: Option<String>,
    /// Error chain on failure.
    pub exception: Option<String>,
    /// Structured failure information.
    pub exc_info: Option<ExcInfo>,
    /// Per-job log file, once anything was logged.
    pub logs_path: Option<PathBuf>,
    /// Head and tail of the log, set when the job terminates.
    pub logs_excerpt: Option<String>,
    /// Creation time.
    pub time_created: DateTime<Utc>,
    /// Start time.
    pub time_started: Option<DateTime<Utc>>,
    /// Termination time.
    pub time_finished: Option<DateTime<Utc>>,
}

/// What a job function produced.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Completed; recorded as `SUCCESS` with this result.
    Completed(Value),
    /// Declined to act; recorded as `IGNORED` with the reason as result.
    Ignored(String),
}

impl From<Value> for JobOutcome {
    fn from(value: Value) -> Self {
        JobOutcome::Completed(value)
    }
}

impl From<()> for JobOutcome {
    fn from(_: ()) -> Self {
        JobOutcome::Completed(Value::Null)
    }
}

/// Submission parameters.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Method name.
    pub method: String,
    /// Raw arguments; redacted before they are stored.
    pub arguments: Value,
    /// Lock the job must hold while running.
    pub lock: Option<String>,
    /// Admission bound on jobs sharing the lock. `Some(0)` refuses while a
    /// job with the same lock is running; `Some(n)` refuses once `n` jobs
    /// with the same lock are already waiting.
    pub lock_queue_size: Option<usize>,
    /// Whether abort requests are honored.
    pub abortable: bool,
    /// Human-readable description.
    pub description: Option<String>,
}

impl JobSpec {
    /// Abortable, lock-free job with no arguments.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            arguments: Value::Null,
            lock: None,
            lock_queue_size: None,
            abortable: true,
            description: None,
        }
    }

    /// Set the arguments.
    pub fn arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    /// Run under `lock`.
    pub fn lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    /// Bound the lock queue.
    pub fn lock_queue_size(mut self, size: usize) -> Self {
        self.lock_queue_size = Some(size);
        self
    }

    /// Refuse abort requests.
    pub fn not_abortable(mut self) -> Self {
        self.abortable = false;
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Running.is_terminal());
        for s in [JobState::Success, JobState::Failed, JobState::Aborted, JobState::Ignored] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn test_state_wire_format() {
        assert_eq!(serde_json::to_string(&JobState::Ignored).unwrap(), "\"IGNORED\"");
        assert_eq!(JobState::Running.to_string(), "RUNNING");
    }

    #[test]
    fn test_exc_info_type_field() {
        let info = ExcInfo {
            repr: "x".into(),
            kind: "VALIDATION".into(),
            errno: None,
            extra: None,
        };
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["type"], "VALIDATION");
    }

    #[test]
    fn test_spec_builder() {
        let spec = JobSpec::new("failover.events.vrrp_master")
            .lock("vrrp_master")
            .lock_queue_size(0)
            .not_abortable();
        assert_eq!(spec.lock.as_deref(), Some("vrrp_master"));
        assert_eq!(spec.lock_queue_size, Some(0));
        assert!(!spec.abortable);
    }
}
