//! Per-service health checks and the recovery actions that pair with them.
//!
//! Every service type implements [`HealthChecker`]: `check` returns the
//! first fault it finds as a [`HealthError`], and `recover` attempts the
//! repair that matches the fault's reason. The retry policy lives in
//! [`crate::engine`].

mod ad;
mod ipa;
mod kerberos;
mod ldap;

pub use ad::{AdHealth, MAX_SERVER_TIME_OFFSET};
pub use ipa::IpaHealth;
pub use kerberos::{check_kerberos, kinit_credential, recover_kerberos, renew_if_due};
pub use ldap::LdapHealth;

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hastor_sys::kerberos::{SYSTEM_CCACHE, SYSTEM_KEYTAB, SYSTEM_KRB5_CONF};
use hastor_sys::{AdService, CallError, Host, Kerberos, Ldap, SecretsStore, ServiceManager};

use crate::config::{DSConfig, DsType};
use crate::error::{DsError, FaultReason, HealthError};

/// Host paths the health checks inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsPaths {
    /// Kerberos configuration, expected `0644`.
    pub krb5_conf: PathBuf,
    /// System keytab, expected `0600`.
    pub keytab: PathBuf,
    /// System credential cache.
    pub ccache: PathBuf,
    /// IPA client configuration, expected `0644`.
    pub ipa_default_conf: PathBuf,
    /// IPA CA certificate, expected `0644`.
    pub ipa_cacert: PathBuf,
    /// Scratch directory for throwaway credential caches and keytabs.
    pub scratch_dir: PathBuf,
    /// Expected owner of every checked file.
    pub owner_uid: u32,
}

impl Default for DsPaths {
    fn default() -> Self {
        Self {
            krb5_conf: PathBuf::from(SYSTEM_KRB5_CONF),
            keytab: PathBuf::from(SYSTEM_KEYTAB),
            ccache: PathBuf::from(SYSTEM_CCACHE),
            ipa_default_conf: PathBuf::from("/etc/ipa/default.conf"),
            ipa_cacert: PathBuf::from("/etc/ipa/ca.crt"),
            scratch_dir: PathBuf::from("/var/run/hastor/ds"),
            owner_uid: 0,
        }
    }
}

impl DsPaths {
    /// Every path rooted under `root`, owned by the current user. Used by
    /// tests and by dry runs against a staging tree.
    pub fn under(root: &Path) -> Self {
        Self {
            krb5_conf: root.join("krb5.conf"),
            keytab: root.join("krb5.keytab"),
            ccache: root.join("krb5cc_0"),
            ipa_default_conf: root.join("ipa/default.conf"),
            ipa_cacert: root.join("ipa/ca.crt"),
            scratch_dir: root.join("scratch"),
            // SAFETY: geteuid has no preconditions and cannot fail.
            owner_uid: unsafe { libc::geteuid() },
        }
    }
}

/// Everything a health check talks to.
#[derive(Clone)]
pub struct DsEnv {
    /// Ticket acquisition and inspection.
    pub kerberos: Arc<dyn Kerberos>,
    /// Directory binds.
    pub ldap: Arc<dyn Ldap>,
    /// Active Directory domain operations.
    pub ad: Arc<dyn AdService>,
    /// Machine account secrets.
    pub secrets: Arc<dyn SecretsStore>,
    /// Service control.
    pub services: Arc<dyn ServiceManager>,
    /// Host configuration helpers.
    pub host: Arc<dyn Host>,
    /// Checked paths.
    pub paths: DsPaths,
}

impl std::fmt::Debug for DsEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsEnv").field("paths", &self.paths).finish_non_exhaustive()
    }
}

/// Health check and repair for one service type.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Service type handled.
    fn service_type(&self) -> DsType;

    /// Run every check in order and return the first fault.
    async fn check(&self, env: &DsEnv, cfg: &DSConfig) -> Result<(), HealthError>;

    /// Attempt the repair for `err`. Only called for reasons where
    /// [`FaultReason::is_recoverable`] holds.
    async fn recover(&self, env: &DsEnv, cfg: &DSConfig, err: &HealthError) -> Result<(), DsError>;
}

/// Checker for `ds_type`.
pub fn checker_for(ds_type: DsType) -> &'static dyn HealthChecker {
    match ds_type {
        DsType::Ad => &AdHealth,
        DsType::Ipa => &IpaHealth,
        DsType::Ldap => &LdapHealth,
    }
}

/// Verify that `path` exists, is owned by `owner_uid` and has exactly
/// `mode` permission bits.
pub(crate) fn check_file(
    path: &Path,
    mode: u32,
    owner_uid: u32,
    missing: FaultReason,
    perm: FaultReason,
    what: &str,
) -> Result<(), HealthError> {
    let md = match std::fs::metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HealthError::new(missing, format!("{what} {} does not exist", path.display())));
        }
        Err(e) => {
            return Err(HealthError::new(perm, format!("{what} {}: {e}", path.display())));
        }
    };
    let mut problems = Vec::new();
    if md.uid() != owner_uid {
        problems.push(format!("owned by uid {} (expected {owner_uid})", md.uid()));
    }
    let actual = md.mode() & 0o777;
    if actual != mode {
        problems.push(format!("mode {actual:o} (expected {mode:o})"));
    }
    if problems.is_empty() {
        return Ok(());
    }
    Err(HealthError::new(
        perm,
        format!("{what} {}: unexpected {}", path.display(), problems.join(", ")),
    ))
}

/// Chmod `path` to `mode` and chown it to `owner_uid`.
pub(crate) fn fix_file_perms(path: &Path, mode: u32, owner_uid: u32) -> Result<(), CallError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    let md = std::fs::metadata(path)?;
    if md.uid() != owner_uid {
        std::os::unix::fs::chown(path, Some(owner_uid), None)?;
    }
    Ok(())
}

/// Wrap a failed repair step.
pub(crate) fn recovery_failed(reason: FaultReason) -> impl FnOnce(CallError) -> DsError {
    move |source| DsError::Recovery { reason, source }
}


#[cfg(test)]
mod tests {
    use super::testenv::write_mode;
    use super::*;

    #[test]
    fn test_check_file_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("krb5.conf");
        let uid = unsafe { libc::geteuid() };
        let err = check_file(&path, 0o644, uid, FaultReason::Krb5NoConfig, FaultReason::Krb5ConfigPerm, "conf")
            .unwrap_err();
        assert_eq!(err.reason, FaultReason::Krb5NoConfig);

        write_mode(&path, b"x", 0o600);
        let err = check_file(&path, 0o644, uid, FaultReason::Krb5NoConfig, FaultReason::Krb5ConfigPerm, "conf")
            .unwrap_err();
        assert_eq!(err.reason, FaultReason::Krb5ConfigPerm);
        assert!(err.message.contains("mode 600"));

        fix_file_perms(&path, 0o644, uid).unwrap();
        check_file(&path, 0o644, uid, FaultReason::Krb5NoConfig, FaultReason::Krb5ConfigPerm, "conf").unwrap();
    }

    #[test]
    fn test_checker_dispatch() {
        for t in [DsType::Ad, DsType::Ipa, DsType::Ldap] {
            assert_eq!(checker_for(t).service_type(), t);
        }
    }
}
