//! Error types shared by every hastor subsystem.
//!
//! `CallError` is the expected, per-operation failure that callers may
//! recover from or surface. `ValidationErrors` is the admin-facing list of
//! `(attribute, message, errno)` triples and never triggers recovery.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error numbers carried by [`CallError`].
///
/// The domain-specific codes start at 201 so they never collide with the
/// POSIX values that share the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Errno {
    /// Operation not permitted.
    EPERM,
    /// No such file or directory.
    ENOENT,
    /// Bad address / unexpected internal failure.
    EFAULT,
    /// Resource busy.
    EBUSY,
    /// Object already exists.
    EEXIST,
    /// Invalid argument.
    EINVAL,
    /// Operation timed out.
    ETIMEDOUT,
    /// Operation not supported.
    ENOTSUP,
    /// Requested method does not exist.
    ENOMETHOD,
    /// A service failed to start.
    ESERVICESTARTFAILURE,
    /// The remote controller returned an error.
    EREMOTENODEERROR,
    /// Dataset is locked.
    EDATASETISLOCKED,
    /// Reporting timestamp is invalid.
    EINVALIDRRDTIMESTAMP,
    /// Caller is not authenticated.
    ENOTAUTHENTICATED,
    /// TLS certificate verification failed.
    ESSLCERTVERIFICATIONERROR,
}

impl Errno {
    /// Numeric value of the error.
    pub fn code(&self) -> i32 {
        match self {
            Errno::EPERM => libc::EPERM,
            Errno::ENOENT => libc::ENOENT,
            Errno::EFAULT => libc::EFAULT,
            Errno::EBUSY => libc::EBUSY,
            Errno::EEXIST => libc::EEXIST,
            Errno::EINVAL => libc::EINVAL,
            Errno::ETIMEDOUT => libc::ETIMEDOUT,
            Errno::ENOTSUP => libc::ENOTSUP,
            Errno::ENOMETHOD => 201,
            Errno::ESERVICESTARTFAILURE => 202,
            Errno::EREMOTENODEERROR => 203,
            Errno::EDATASETISLOCKED => 204,
            Errno::EINVALIDRRDTIMESTAMP => 205,
            Errno::ENOTAUTHENTICATED => 206,
            Errno::ESSLCERTVERIFICATIONERROR => 207,
        }
    }

    /// Inverse of [`Errno::code`].
    pub fn from_code(code: i32) -> Option<Errno> {
        const ALL: [Errno; 15] = [
            Errno::EPERM,
            Errno::ENOENT,
            Errno::EFAULT,
            Errno::EBUSY,
            Errno::EEXIST,
            Errno::EINVAL,
            Errno::ETIMEDOUT,
            Errno::ENOTSUP,
            Errno::ENOMETHOD,
            Errno::ESERVICESTARTFAILURE,
            Errno::EREMOTENODEERROR,
            Errno::EDATASETISLOCKED,
            Errno::EINVALIDRRDTIMESTAMP,
            Errno::ENOTAUTHENTICATED,
            Errno::ESSLCERTVERIFICATIONERROR,
        ];
        ALL.into_iter().find(|e| e.code() == code)
    }

    /// Symbolic name of the error.
    pub fn name(&self) -> &'static str {
        match self {
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EFAULT => "EFAULT",
            Errno::EBUSY => "EBUSY",
            Errno::EEXIST => "EEXIST",
            Errno::EINVAL => "EINVAL",
            Errno::ETIMEDOUT => "ETIMEDOUT",
            Errno::ENOTSUP => "ENOTSUP",
            Errno::ENOMETHOD => "ENOMETHOD",
            Errno::ESERVICESTARTFAILURE => "ESERVICESTARTFAILURE",
            Errno::EREMOTENODEERROR => "EREMOTENODEERROR",
            Errno::EDATASETISLOCKED => "EDATASETISLOCKED",
            Errno::EINVALIDRRDTIMESTAMP => "EINVALIDRRDTIMESTAMP",
            Errno::ENOTAUTHENTICATED => "ENOTAUTHENTICATED",
            Errno::ESSLCERTVERIFICATIONERROR => "ESSLCERTVERIFICATIONERROR",
        }
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An expected failure of a single operation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{errno}] {message}")]
pub struct CallError {
    /// Error number.
    pub errno: Errno,
    /// Human readable message.
    pub message: String,
    /// Optional structured detail.
    pub extra: Option<serde_json::Value>,
}

impl CallError {
    /// Create an error without extra detail.
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
            extra: None,
        }
    }

    /// Attach structured detail.
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

impl From<std::io::Error> for CallError {
    fn from(err: std::io::Error) -> Self {
        let errno = match err.kind() {
            std::io::ErrorKind::NotFound => Errno::ENOENT,
            std::io::ErrorKind::PermissionDenied => Errno::EPERM,
            std::io::ErrorKind::AlreadyExists => Errno::EEXIST,
            std::io::ErrorKind::TimedOut => Errno::ETIMEDOUT,
            std::io::ErrorKind::InvalidInput => Errno::EINVAL,
            _ => Errno::EFAULT,
        };
        CallError::new(errno, err.to_string())
    }
}

/// Result alias for façade operations.
pub type CallResult<T> = Result<T, CallError>;

/// One entry of a [`ValidationErrors`] list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Dotted attribute path, e.g. `failover_update.disabled`.
    pub attribute: String,
    /// Human readable message.
    pub message: String,
    /// Error number.
    pub errno: Errno,
}

/// A list of validation failures surfaced unchanged to admin callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure with `EINVAL`.
    pub fn add(&mut self, attribute: impl Into<String>, message: impl Into<String>) {
        self.add_with_errno(attribute, message, Errno::EINVAL);
    }

    /// Record a failure with an explicit errno.
    pub fn add_with_errno(
        &mut self,
        attribute: impl Into<String>,
        message: impl Into<String>,
        errno: Errno,
    ) {
        self.errors.push(ValidationError {
            attribute: attribute.into(),
            message: message.into(),
            errno,
        });
    }

    /// Whether no failures were recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded failures.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Recorded failures in insertion order.
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// `(attribute, message, errno)` triples in insertion order.
    pub fn triples(&self) -> Vec<(String, String, i32)> {
        self.errors
            .iter()
            .map(|e| (e.attribute.clone(), e.message.clone(), e.errno.code()))
            .collect()
    }

    /// Consume the list, returning `Err(self)` if anything was recorded.
    pub fn check(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "[{}] {}: {}", e.errno, e.attribute, e.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errno_values() {
        assert_eq!(Errno::ENOMETHOD.code(), 201);
        assert_eq!(Errno::ESERVICESTARTFAILURE.code(), 202);
        assert_eq!(Errno::ESSLCERTVERIFICATIONERROR.code(), 207);
        assert_eq!(Errno::ENOENT.code(), libc::ENOENT);
    }

    #[test]
    fn test_call_error_display() {
        let err = CallError::new(Errno::ESERVICESTARTFAILURE, "winbindd failed to start");
        assert_eq!(
            format!("{}", err),
            "[ESERVICESTARTFAILURE] winbindd failed to start"
        );
    }

    #[test]
    fn test_call_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CallError = io.into();
        assert_eq!(err.errno, Errno::ENOENT);
    }

    #[test]
    fn test_validation_errors_check() {
        let verrors = ValidationErrors::new();
        assert!(verrors.check().is_ok());

        let mut verrors = ValidationErrors::new();
        verrors.add("failover_update.disabled", "need a critical interface");
        let err = verrors.check().unwrap_err();
        assert_eq!(err.len(), 1);
        assert_eq!(
            err.triples(),
            vec![(
                "failover_update.disabled".to_string(),
                "need a critical interface".to_string(),
                libc::EINVAL
            )]
        );
    }

    #[test]
    fn test_validation_errors_display_joins() {
        let mut verrors = ValidationErrors::new();
        verrors.add("a", "first");
        verrors.add_with_errno("b", "second", Errno::EEXIST);
        let msg = verrors.to_string();
        assert!(msg.contains("[EINVAL] a: first"));
        assert!(msg.contains("[EEXIST] b: second"));
    }
}
