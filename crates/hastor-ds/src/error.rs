//! Directory services errors.

use hastor_jobs::JobError;
use hastor_sys::{CallError, Errno, LockError, ValidationErrors};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::DsType;
use crate::keytab::KeytabError;

/// Why a health check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum FaultReason {
    /// krb5.conf is missing.
    Krb5NoConfig,
    /// krb5.conf has wrong owner or mode.
    Krb5ConfigPerm,
    /// System keytab is missing.
    Krb5NoKeytab,
    /// System keytab has wrong owner or mode.
    Krb5KeytabPerm,
    /// No valid ticket in the system credential cache.
    Krb5TktExpired,
    /// Machine account entry missing from the keytab.
    AdKeytabInvalid,
    /// Machine secret store is missing.
    AdSecretFileMissing,
    /// Machine secret store has no entry for the domain.
    AdSecretEntryMissing,
    /// The stored machine secret is rejected by the KDC.
    AdSecretInvalid,
    /// The secure channel to the domain controller is broken.
    AdNetlogonFailure,
    /// winbindd does not answer.
    AdWbclientFailure,
    /// winbindd is not running.
    WinbindStopped,
    /// Clock offset to the domain controller is too large.
    NtpExcessiveSlew,
    /// IPA default.conf is missing.
    IpaNoConfig,
    /// IPA default.conf has wrong owner or mode.
    IpaConfigPerm,
    /// IPA CA certificate is missing.
    IpaNoCacert,
    /// IPA CA certificate has wrong owner or mode.
    IpaCacertPerm,
    /// Root DSE could not be read.
    LdapBindFailed,
    /// sssd is not running.
    SssdStopped,
}

impl FaultReason {
    /// Wire name, e.g. `KRB5_TKT_EXPIRED`.
    pub fn name(&self) -> &'static str {
        match self {
            FaultReason::Krb5NoConfig => "KRB5_NO_CONFIG",
            FaultReason::Krb5ConfigPerm => "KRB5_CONFIG_PERM",
            FaultReason::Krb5NoKeytab => "KRB5_NO_KEYTAB",
            FaultReason::Krb5KeytabPerm => "KRB5_KEYTAB_PERM",
            FaultReason::Krb5TktExpired => "KRB5_TKT_EXPIRED",
            FaultReason::AdKeytabInvalid => "AD_KEYTAB_INVALID",
            FaultReason::AdSecretFileMissing => "AD_SECRET_FILE_MISSING",
            FaultReason::AdSecretEntryMissing => "AD_SECRET_ENTRY_MISSING",
            FaultReason::AdSecretInvalid => "AD_SECRET_INVALID",
            FaultReason::AdNetlogonFailure => "AD_NETLOGON_FAILURE",
            FaultReason::AdWbclientFailure => "AD_WBCLIENT_FAILURE",
            FaultReason::WinbindStopped => "WINBIND_STOPPED",
            FaultReason::NtpExcessiveSlew => "NTP_EXCESSIVE_SLEW",
            FaultReason::IpaNoConfig => "IPA_NO_CONFIG",
            FaultReason::IpaConfigPerm => "IPA_CONFIG_PERM",
            FaultReason::IpaNoCacert => "IPA_NO_CACERT",
            FaultReason::IpaCacertPerm => "IPA_CACERT_PERM",
            FaultReason::LdapBindFailed => "LDAP_BIND_FAILED",
            FaultReason::SssdStopped => "SSSD_STOPPED",
        }
    }

    /// Kerberos foundation failure, shared by every service type.
    pub fn is_krb5(&self) -> bool {
        matches!(
            self,
            FaultReason::Krb5NoConfig
                | FaultReason::Krb5ConfigPerm
                | FaultReason::Krb5NoKeytab
                | FaultReason::Krb5KeytabPerm
                | FaultReason::Krb5TktExpired
        )
    }

    /// Whether a recovery action exists for this reason under `ds_type`.
    pub fn is_recoverable(&self, ds_type: DsType) -> bool {
        match self {
            r if r.is_krb5() => true,
            FaultReason::AdKeytabInvalid
            | FaultReason::AdSecretFileMissing
            | FaultReason::AdSecretEntryMissing
            | FaultReason::AdNetlogonFailure
            | FaultReason::WinbindStopped => ds_type == DsType::Ad,
            FaultReason::IpaNoConfig
            | FaultReason::IpaConfigPerm
            | FaultReason::IpaNoCacert
            | FaultReason::IpaCacertPerm => ds_type == DsType::Ipa,
            FaultReason::LdapBindFailed => ds_type == DsType::Ldap,
            FaultReason::SssdStopped => ds_type != DsType::Ad,
            _ => false,
        }
    }
}

impl std::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed health check.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}: {message}")]
pub struct HealthError {
    /// Reason code.
    pub reason: FaultReason,
    /// Human-readable message, published as the health `status_msg`.
    pub message: String,
}

impl HealthError {
    /// Create a health error.
    pub fn new(reason: FaultReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<HealthError> for CallError {
    fn from(err: HealthError) -> Self {
        CallError::new(Errno::EFAULT, err.message.clone()).with_extra(json!({ "reason": err.reason }))
    }
}

/// Directory services errors.
#[derive(Debug, Error)]
pub enum DsError {
    /// A health check failed and was not recovered.
    #[error("{0}")]
    Health(#[from] HealthError),

    /// A recovery action failed.
    #[error("recovery for {reason} failed: {source}")]
    Recovery {
        /// Reason being recovered.
        reason: FaultReason,
        /// Underlying failure.
        #[source]
        source: CallError,
    },

    /// A service call failed.
    #[error("{0}")]
    Call(#[from] CallError),

    /// Invalid configuration.
    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    /// Job queue failure.
    #[error("{0}")]
    Job(#[from] JobError),

    /// Lock registry failure.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// Keytab could not be decoded.
    #[error("{0}")]
    Keytab(#[from] KeytabError),

    /// Local file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for directory services operations.
pub type Result<T> = std::result::Result<T, DsError>;

impl From<DsError> for CallError {
    fn from(err: DsError) -> Self {
        match err {
            DsError::Health(e) => e.into(),
            DsError::Call(e) => e,
            DsError::Recovery { reason, source } => {
                CallError::new(source.errno, format!("recovery for {reason} failed: {}", source.message))
                    .with_extra(json!({ "reason": reason }))
            }
            DsError::Validation(e) => CallError::new(Errno::EINVAL, e.to_string()).with_extra(json!(e.triples())),
            DsError::Job(e) => e.into(),
            DsError::Lock(e) => e.into(),
            DsError::Keytab(e) => CallError::new(Errno::EINVAL, e.to_string()),
            DsError::Io(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_name_matches_serde() {
        for r in [
            FaultReason::Krb5TktExpired,
            FaultReason::AdSecretFileMissing,
            FaultReason::NtpExcessiveSlew,
            FaultReason::IpaCacertPerm,
        ] {
            assert_eq!(serde_json::to_value(r).unwrap(), r.name());
        }
    }

    #[test]
    fn test_recoverable_table() {
        assert!(FaultReason::Krb5TktExpired.is_recoverable(DsType::Ldap));
        assert!(FaultReason::AdNetlogonFailure.is_recoverable(DsType::Ad));
        assert!(!FaultReason::AdSecretInvalid.is_recoverable(DsType::Ad));
        assert!(!FaultReason::NtpExcessiveSlew.is_recoverable(DsType::Ad));
        assert!(!FaultReason::LdapBindFailed.is_recoverable(DsType::Ipa));
        assert!(FaultReason::LdapBindFailed.is_recoverable(DsType::Ldap));
        assert!(FaultReason::SssdStopped.is_recoverable(DsType::Ipa));
    }

    #[test]
    fn test_health_error_to_call_error() {
        let call: CallError = HealthError::new(FaultReason::WinbindStopped, "winbindd failed to start").into();
        assert_eq!(call.extra.unwrap()["reason"], "WINBIND_STOPPED");
    }
}
