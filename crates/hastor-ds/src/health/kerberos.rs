//! Kerberos checks shared by every service type.

use std::time::Duration;

use chrono::Local;
use hastor_sys::{CallError, Errno, KinitCredential, KinitOptions};
use tracing::{debug, info, warn};

use super::{check_file, fix_file_perms, recovery_failed, DsEnv};
use crate::config::{DSConfig, DsCredential};
use crate::error::{DsError, FaultReason, HealthError};

/// Credential used to refresh the system ticket for `cfg`.
///
/// An AD join authenticates as the machine account from the system keytab;
/// the other types use the configured kerberos credential.
pub fn kinit_credential(env: &DsEnv, cfg: &DSConfig) -> Result<KinitCredential, CallError> {
    let realm = cfg
        .kerberos_realm
        .clone()
        .or_else(|| cfg.ad().map(|ad| ad.domain.to_ascii_uppercase()));
    if let Some(ad) = cfg.ad() {
        let realm = realm.ok_or_else(|| CallError::new(Errno::EINVAL, "kerberos realm is not configured"))?;
        return Ok(KinitCredential::Keytab {
            principal: format!("{}$@{}", ad.netbiosname.to_ascii_uppercase(), realm),
            keytab: env.paths.keytab.clone(),
        });
    }
    match &cfg.credential {
        Some(DsCredential::KerberosPrincipal { principal }) => Ok(KinitCredential::Keytab {
            principal: principal.clone(),
            keytab: env.paths.keytab.clone(),
        }),
        Some(DsCredential::KerberosUser { username, password }) => {
            let principal = match (username.contains('@'), realm) {
                (true, _) => username.clone(),
                (false, Some(realm)) => format!("{username}@{realm}"),
                (false, None) => {
                    return Err(CallError::new(Errno::EINVAL, "kerberos realm is not configured"));
                }
            };
            Ok(KinitCredential::Password {
                principal,
                password: password.clone(),
            })
        }
        _ => Err(CallError::new(Errno::EINVAL, "no kerberos credential configured")),
    }
}

/// Check the kerberos configuration file, the system keytab and the
/// system ticket, in that order.
pub async fn check_kerberos(env: &DsEnv) -> Result<(), HealthError> {
    let paths = &env.paths;
    check_file(
        &paths.krb5_conf,
        0o644,
        paths.owner_uid,
        FaultReason::Krb5NoConfig,
        FaultReason::Krb5ConfigPerm,
        "kerberos configuration file",
    )?;
    check_file(
        &paths.keytab,
        0o600,
        paths.owner_uid,
        FaultReason::Krb5NoKeytab,
        FaultReason::Krb5KeytabPerm,
        "kerberos keytab",
    )?;
    match env.kerberos.current_cred(&paths.ccache).await {
        Ok(Some(cred)) if !cred.expired_at(Local::now().naive_local()) => {
            debug!(principal = %cred.principal, expires = %cred.expires, "kerberos ticket valid");
            Ok(())
        }
        Ok(Some(cred)) => Err(HealthError::new(
            FaultReason::Krb5TktExpired,
            format!("kerberos ticket for {} expired at {}", cred.principal, cred.expires),
        )),
        Ok(None) => Err(HealthError::new(
            FaultReason::Krb5TktExpired,
            "system credential cache holds no kerberos ticket",
        )),
        Err(e) => Err(HealthError::new(
            FaultReason::Krb5TktExpired,
            format!("failed to read system credential cache: {}", e.message),
        )),
    }
}

/// Repair a kerberos fault.
pub async fn recover_kerberos(env: &DsEnv, cfg: &DSConfig, err: &HealthError) -> Result<(), DsError> {
    let paths = &env.paths;
    let reason = err.reason;
    match reason {
        FaultReason::Krb5NoConfig | FaultReason::Krb5ConfigPerm => {
            env.host.etc_generate("kerberos").await.map_err(recovery_failed(reason))?;
            fix_file_perms(&paths.krb5_conf, 0o644, paths.owner_uid).map_err(recovery_failed(reason))?;
        }
        FaultReason::Krb5NoKeytab => {
            env.host.etc_generate("kerberos").await.map_err(recovery_failed(reason))?;
            if !paths.keytab.exists() {
                return Err(DsError::Recovery {
                    reason,
                    source: CallError::new(
                        Errno::ENOENT,
                        format!("{} was not regenerated", paths.keytab.display()),
                    ),
                });
            }
            fix_file_perms(&paths.keytab, 0o600, paths.owner_uid).map_err(recovery_failed(reason))?;
        }
        FaultReason::Krb5KeytabPerm => {
            fix_file_perms(&paths.keytab, 0o600, paths.owner_uid).map_err(recovery_failed(reason))?;
        }
        FaultReason::Krb5TktExpired => {
            let cred = kinit_credential(env, cfg).map_err(recovery_failed(reason))?;
            if let Err(e) = env.kerberos.kdestroy(&paths.ccache).await {
                debug!(error = %e, "kdestroy before kinit failed");
            }
            let opts = KinitOptions {
                ccache: paths.ccache.clone(),
                timeout: cfg.timeout(),
                ..KinitOptions::default()
            };
            env.kerberos.kinit(&cred, &opts).await.map_err(recovery_failed(reason))?;
            info!(principal = cred.principal(), "obtained new system kerberos ticket");
        }
        other => {
            return Err(DsError::Recovery {
                reason: other,
                source: CallError::new(Errno::EINVAL, format!("{other} is not a kerberos fault")),
            });
        }
    }
    Ok(())
}

/// Renew the system ticket when it expires within `window`. Falls back to
/// a fresh kinit when the renewal is refused. Returns whether anything was
/// done.
pub async fn renew_if_due(env: &DsEnv, cfg: &DSConfig, window: Duration) -> Result<bool, CallError> {
    let Some(cred) = env.kerberos.current_cred(&env.paths.ccache).await? else {
        return Ok(false);
    };
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
    if cred.expires - Local::now().naive_local() > window {
        return Ok(false);
    }
    match env.kerberos.renew(&env.paths.ccache).await {
        Ok(()) => {
            debug!(principal = %cred.principal, "renewed kerberos ticket");
        }
        Err(e) => {
            warn!(principal = %cred.principal, error = %e, "ticket renewal refused, obtaining a new ticket");
            let kcred = kinit_credential(env, cfg)?;
            let opts = KinitOptions {
                ccache: env.paths.ccache.clone(),
                timeout: cfg.timeout(),
                ..KinitOptions::default()
            };
            env.kerberos.kinit(&kcred, &opts).await?;
        }
    }
    Ok(true)
}
