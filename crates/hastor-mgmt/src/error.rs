//! Admin surface errors and their HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hastor_ds::DsError;
use hastor_failover::FailoverError;
use hastor_jobs::JobError;
use hastor_sys::{CallError, Errno, ValidationErrors};
use serde_json::json;
use thiserror::Error;

/// Admin surface errors.
#[derive(Debug, Error)]
pub enum MgmtError {
    /// Request rejected by validation; surfaced to the caller unchanged.
    #[error("{0}")]
    Validation(ValidationErrors),

    /// Expected failure of the requested operation.
    #[error("{0}")]
    Call(CallError),

    /// Daemon configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Local file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for admin operations.
pub type Result<T> = std::result::Result<T, MgmtError>;

impl From<CallError> for MgmtError {
    fn from(err: CallError) -> Self {
        MgmtError::Call(err)
    }
}

impl From<ValidationErrors> for MgmtError {
    fn from(err: ValidationErrors) -> Self {
        MgmtError::Validation(err)
    }
}

impl From<JobError> for MgmtError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(v) => MgmtError::Validation(v),
            other => MgmtError::Call(other.into()),
        }
    }
}

impl From<FailoverError> for MgmtError {
    fn from(err: FailoverError) -> Self {
        match err {
            FailoverError::Validation(v) => MgmtError::Validation(v),
            FailoverError::Job(e) => e.into(),
            other => MgmtError::Call(other.into()),
        }
    }
}

impl From<DsError> for MgmtError {
    fn from(err: DsError) -> Self {
        match err {
            DsError::Validation(v) => MgmtError::Validation(v),
            DsError::Job(e) => e.into(),
            other => MgmtError::Call(other.into()),
        }
    }
}

fn status_for(errno: Errno) -> StatusCode {
    match errno {
        Errno::EINVAL => StatusCode::BAD_REQUEST,
        Errno::ENOENT => StatusCode::NOT_FOUND,
        Errno::EBUSY | Errno::EEXIST => StatusCode::CONFLICT,
        Errno::ETIMEDOUT => StatusCode::GATEWAY_TIMEOUT,
        Errno::EPERM | Errno::ENOTAUTHENTICATED => StatusCode::FORBIDDEN,
        Errno::ENOTSUP | Errno::ENOMETHOD => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for MgmtError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            MgmtError::Validation(v) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({
                    "error": v.to_string(),
                    "errno": Errno::EINVAL.code(),
                    "errname": Errno::EINVAL.name(),
                    "errors": v.errors(),
                }),
            ),
            MgmtError::Call(e) => (
                status_for(e.errno),
                json!({
                    "error": e.message,
                    "errno": e.errno.code(),
                    "errname": e.errno.name(),
                    "extra": e.extra,
                }),
            ),
            MgmtError::Config(_) | MgmtError::Metrics(_) | MgmtError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": self.to_string(),
                    "errno": Errno::EFAULT.code(),
                    "errname": Errno::EFAULT.name(),
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_validation_stays_validation() {
        let mut v = ValidationErrors::new();
        v.add("failover.update.volumes", "bad");
        let err: MgmtError = JobError::Validation(v).into();
        assert!(matches!(err, MgmtError::Validation(_)));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(MgmtError::from(JobError::NotFound(7)).into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            MgmtError::from(JobError::AlreadyRunning { method: "x".into() })
                .into_response()
                .status(),
            StatusCode::CONFLICT
        );
        let call = CallError::new(Errno::ESERVICESTARTFAILURE, "winbind failed");
        assert_eq!(MgmtError::from(call).into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
