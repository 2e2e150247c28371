//! Job queue errors.

use hastor_sys::{CallError, Errno, LockError, ValidationErrors};
use thiserror::Error;

use crate::record::JobId;

/// Job queue errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Admission refused by the lock queue size.
    #[error("This job is already being performed")]
    AlreadyRunning {
        /// Method of the refused job.
        method: String,
    },

    /// No job with this id.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The job was aborted.
    #[error("job {0} was aborted")]
    Aborted(JobId),

    /// The job is past a point where it can be aborted.
    #[error("job {0} cannot be aborted")]
    NotAbortable(JobId),

    /// Waiting timed out.
    #[error("timed out waiting for job {0}")]
    Timeout(JobId),

    /// The job failed.
    #[error("{error}")]
    Failed {
        /// Job id.
        id: JobId,
        /// Rendered error message.
        error: String,
        /// Errno when the failure was a `CallError`.
        errno: Option<Errno>,
    },

    /// Validation failure inside the job.
    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    /// Lock registry failure.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// The job log could not be written.
    #[error("job log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for job operations.
pub type Result<T> = std::result::Result<T, JobError>;

impl From<JobError> for CallError {
    fn from(err: JobError) -> Self {
        let errno = match &err {
            JobError::AlreadyRunning { .. } => Errno::EBUSY,
            JobError::NotFound(_) => Errno::ENOENT,
            JobError::Aborted(_) => Errno::EFAULT,
            JobError::NotAbortable(_) => Errno::EBUSY,
            JobError::Timeout(_) => Errno::ETIMEDOUT,
            JobError::Failed { errno, .. } => errno.unwrap_or(Errno::EFAULT),
            JobError::Validation(_) => Errno::EINVAL,
            JobError::Lock(_) => Errno::EBUSY,
            JobError::Io(_) => Errno::EFAULT,
        };
        CallError::new(errno, err.to_string())
    }
}

/// Returned by job code that observed its own cancellation. The runner
/// records the job as `ABORTED` instead of `FAILED`.
#[derive(Debug, Clone, Copy, Error)]
#[error("job aborted")]
pub struct JobAborted;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_message() {
        let err = JobError::AlreadyRunning {
            method: "directoryservices.health.recover".into(),
        };
        assert_eq!(err.to_string(), "This job is already being performed");
        let call: CallError = err.into();
        assert_eq!(call.errno, Errno::EBUSY);
    }

    #[test]
    fn test_failed_keeps_errno() {
        let err = JobError::Failed {
            id: 3,
            error: "boom".into(),
            errno: Some(Errno::ESERVICESTARTFAILURE),
        };
        let call: CallError = err.into();
        assert_eq!(call.errno, Errno::ESERVICESTARTFAILURE);
    }
}
