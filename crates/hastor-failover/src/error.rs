//! Failover coordinator errors.

use hastor_jobs::{JobAborted, JobError};
use hastor_sys::{CallError, Errno, LockError, ValidationErrors};
use thiserror::Error;

/// Failover coordinator errors.
#[derive(Debug, Error)]
pub enum FailoverError {
    /// The fencing daemon refused to start. The local advskew was demoted
    /// to `advskew` so the peer wins the next election.
    #[error("fenced exited with code {code}, advskew demoted to {advskew}")]
    Fencing {
        /// Startup exit code.
        code: i32,
        /// Demotion value applied to the interface's virtual addresses.
        advskew: u32,
    },

    /// No volume could be imported.
    #[error("all volumes failed to import: {}", .failed.join("; "))]
    AllImportsFailed {
        /// `name: error` for every volume.
        failed: Vec<String>,
    },

    /// Volumes were not exported in time; a reboot was requested.
    #[error("volume export did not finish within {secs}s, rebooting")]
    ExportTimeout {
        /// Export bound in seconds.
        secs: u64,
    },

    /// A volume export failed; a reboot was requested.
    #[error("volume export failed, rebooting: {0}")]
    ExportFailed(CallError),

    /// A FIFO line could not be parsed.
    #[error("malformed VRRP event {line:?}: {reason}")]
    Parse {
        /// Offending line.
        line: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Collaborator call failure.
    #[error("{0}")]
    Call(#[from] CallError),

    /// Configuration rejected.
    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    /// Job queue failure.
    #[error("{0}")]
    Job(#[from] JobError),

    /// Lock registry failure.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// The job was aborted before entering its unabortable section.
    #[error("{0}")]
    Aborted(#[from] JobAborted),

    /// Sentinel or configuration file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for failover operations.
pub type Result<T> = std::result::Result<T, FailoverError>;

impl From<FailoverError> for CallError {
    fn from(err: FailoverError) -> Self {
        match err {
            FailoverError::Call(e) | FailoverError::ExportFailed(e) => e,
            FailoverError::Job(e) => e.into(),
            FailoverError::Lock(e) => e.into(),
            FailoverError::Validation(_) | FailoverError::Parse { .. } => CallError::new(Errno::EINVAL, err.to_string()),
            FailoverError::ExportTimeout { .. } => CallError::new(Errno::ETIMEDOUT, err.to_string()),
            other => CallError::new(Errno::EFAULT, other.to_string()),
        }
    }
}

/// Job functions surface validation failures and aborts as such and
/// everything else as a `CallError`.
pub(crate) fn job_error(err: FailoverError) -> anyhow::Error {
    match err {
        FailoverError::Validation(v) => v.into(),
        FailoverError::Aborted(a) => a.into(),
        other => CallError::from(other).into(),
    }
}
