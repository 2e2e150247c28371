//! Active Directory health.

use async_trait::async_trait;
use hastor_sys::service::DEFAULT_RESTART_TIMEOUT;
use hastor_sys::{atomic_write, CallError, Errno, KinitCredential, KinitOptions};
use tracing::{debug, info, warn};

use super::kerberos::{check_kerberos, recover_kerberos};
use super::{recovery_failed, DsEnv, HealthChecker};
use crate::config::{AdConfig, DSConfig, DsType};
use crate::error::{DsError, FaultReason, HealthError};
use crate::keytab::Keytab;

/// Largest tolerated clock offset to the domain controller, in seconds.
pub const MAX_SERVER_TIME_OFFSET: i64 = 180;

const WINBINDD: &str = "winbindd";

/// Name under which the machine account keytab is persisted.
const AD_KEYTAB_NAME: &str = "AD_MACHINE_ACCOUNT";

/// Active Directory checker.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdHealth;

fn ad_config(cfg: &DSConfig) -> Result<&AdConfig, CallError> {
    cfg.ad()
        .ok_or_else(|| CallError::new(Errno::EINVAL, "active directory is not configured"))
}

fn realm(cfg: &DSConfig, ad: &AdConfig) -> String {
    cfg.kerberos_realm
        .clone()
        .unwrap_or_else(|| ad.domain.to_ascii_uppercase())
}

fn machine_principal(cfg: &DSConfig, ad: &AdConfig) -> String {
    format!("{}$@{}", ad.netbiosname.to_ascii_uppercase(), realm(cfg, ad))
}

impl AdHealth {
    async fn check_ad(&self, env: &DsEnv, cfg: &DSConfig, ad: &AdConfig) -> Result<(), HealthError> {
        let mut kdc = None;
        match env.ad.domain_info(&ad.domain).await {
            Ok(info) => {
                if info.server_time_offset.abs() > MAX_SERVER_TIME_OFFSET {
                    return Err(HealthError::new(
                        FaultReason::NtpExcessiveSlew,
                        format!(
                            "clock offset of {}s to domain controller {} exceeds {MAX_SERVER_TIME_OFFSET}s",
                            info.server_time_offset, info.ldap_server
                        ),
                    ));
                }
                kdc = Some(info.kdc_server);
            }
            Err(e) => debug!(domain = %ad.domain, error = %e, "domain info unavailable, skipping clock check"),
        }

        let secret = match env.secrets.get_machine_secret(&ad.workgroup).await {
            Err(e) => {
                return Err(HealthError::new(
                    FaultReason::AdSecretFileMissing,
                    format!("machine account secret store is unavailable: {}", e.message),
                ));
            }
            Ok(None) => {
                return Err(HealthError::new(
                    FaultReason::AdSecretEntryMissing,
                    format!("no machine account secret stored for domain {}", ad.workgroup),
                ));
            }
            Ok(Some(secret)) => secret,
        };

        let principal = machine_principal(cfg, ad);
        let scratch = env.paths.scratch_dir.join("krb5cc_machine_check");
        let opts = KinitOptions {
            ccache: scratch.clone(),
            kdc,
            renewable: None,
            timeout: cfg.timeout(),
        };
        let cred = KinitCredential::Password {
            principal: principal.clone(),
            password: secret,
        };
        let kinit = env.kerberos.kinit(&cred, &opts).await;
        if let Err(e) = env.kerberos.kdestroy(&scratch).await {
            debug!(error = %e, "failed to destroy scratch credential cache");
        }
        if let Err(e) = kinit {
            return Err(HealthError::new(
                FaultReason::AdSecretInvalid,
                format!("stored machine account secret for {principal} was rejected: {}", e.message),
            ));
        }

        match Keytab::read(&env.paths.keytab) {
            Ok(Ok(kt)) if kt.has_principal(&principal) => {}
            Ok(Ok(_)) => {
                return Err(HealthError::new(
                    FaultReason::AdKeytabInvalid,
                    format!("system keytab has no entry for {principal}"),
                ));
            }
            Ok(Err(e)) => {
                return Err(HealthError::new(
                    FaultReason::AdKeytabInvalid,
                    format!("system keytab is malformed: {e}"),
                ));
            }
            // Missing or unreadable keytab is reported by the kerberos check.
            Err(_) => {}
        }

        match env.services.started(WINBINDD).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(HealthError::new(FaultReason::WinbindStopped, "winbindd is not running"));
            }
            Err(e) => {
                return Err(HealthError::new(
                    FaultReason::WinbindStopped,
                    format!("failed to query winbindd state: {}", e.message),
                ));
            }
        }
        if let Err(e) = env.ad.open_wbclient().await {
            return Err(HealthError::new(
                FaultReason::AdWbclientFailure,
                format!("failed to open winbind client: {}", e.message),
            ));
        }
        if let Err(e) = env.ad.ping_dc().await {
            return Err(HealthError::new(
                FaultReason::AdNetlogonFailure,
                format!("netlogon connection to domain controller failed: {}", e.message),
            ));
        }
        Ok(())
    }

    /// Export the machine account keys, merge them into the system keytab
    /// and persist the result.
    async fn rebuild_keytab(&self, env: &DsEnv, cfg: &DSConfig, ad: &AdConfig) -> Result<(), CallError> {
        let reason = FaultReason::AdKeytabInvalid;
        let exported = env.paths.scratch_dir.join("krb5.keytab.export");
        std::fs::create_dir_all(&env.paths.scratch_dir)?;
        env.ad.export_keytab(&exported).await?;
        let fresh = std::fs::read(&exported);
        if let Err(e) = std::fs::remove_file(&exported) {
            debug!(error = %e, "failed to remove exported keytab");
        }
        let fresh = Keytab::parse(&fresh?)
            .map_err(|e| CallError::new(Errno::EFAULT, format!("{reason}: exported keytab is malformed: {e}")))?;
        let principal = machine_principal(cfg, ad);
        if !fresh.has_principal(&principal) {
            return Err(CallError::new(
                Errno::EFAULT,
                format!("exported keytab has no entry for {principal}"),
            ));
        }
        let mut system = match Keytab::read(&env.paths.keytab) {
            Ok(Ok(kt)) => kt,
            Ok(Err(e)) => {
                warn!(error = %e, "discarding malformed system keytab");
                Keytab::default()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Keytab::default(),
            Err(e) => return Err(e.into()),
        };
        system.merge(&fresh);
        let bytes = system
            .to_bytes()
            .map_err(|e| CallError::new(Errno::EFAULT, e.to_string()))?;
        atomic_write(&env.paths.keytab, &bytes, 0o600)?;
        env.secrets.put_keytab(AD_KEYTAB_NAME, &bytes).await?;
        env.secrets.flush_cache().await;
        info!(principal = %principal, entries = system.entries.len(), "rebuilt system keytab");
        Ok(())
    }

    async fn restore_secrets(&self, env: &DsEnv, cfg: &DSConfig, ad: &AdConfig) -> Result<(), CallError> {
        if !env.secrets.restore(&ad.netbiosname).await? {
            return Err(CallError::new(
                Errno::ENOENT,
                format!("no backup of the machine account secrets exists for {}", ad.netbiosname),
            ));
        }
        env.secrets.flush_cache().await;
        let secret = env.secrets.get_machine_secret(&ad.workgroup).await?.ok_or_else(|| {
            CallError::new(
                Errno::ENOENT,
                format!("restored secrets hold no entry for domain {}", ad.workgroup),
            )
        })?;
        let scratch = env.paths.scratch_dir.join("krb5cc_machine_check");
        let cred = KinitCredential::Password {
            principal: machine_principal(cfg, ad),
            password: secret,
        };
        let opts = KinitOptions {
            ccache: scratch.clone(),
            renewable: None,
            timeout: cfg.timeout(),
            ..KinitOptions::default()
        };
        let kinit = env.kerberos.kinit(&cred, &opts).await;
        if let Err(e) = env.kerberos.kdestroy(&scratch).await {
            debug!(error = %e, "failed to destroy scratch credential cache");
        }
        kinit?;
        env.services.restart(WINBINDD, DEFAULT_RESTART_TIMEOUT).await?;
        info!(netbiosname = %ad.netbiosname, "restored machine account secrets from backup");
        Ok(())
    }
}

#[async_trait]
impl HealthChecker for AdHealth {
    fn service_type(&self) -> DsType {
        DsType::Ad
    }

    async fn check(&self, env: &DsEnv, cfg: &DSConfig) -> Result<(), HealthError> {
        let ad = ad_config(cfg).map_err(|e| HealthError::new(FaultReason::AdSecretEntryMissing, e.message))?;
        self.check_ad(env, cfg, ad).await?;
        check_kerberos(env).await
    }

    async fn recover(&self, env: &DsEnv, cfg: &DSConfig, err: &HealthError) -> Result<(), DsError> {
        let reason = err.reason;
        if reason.is_krb5() {
            return recover_kerberos(env, cfg, err).await;
        }
        let ad = ad_config(cfg).map_err(recovery_failed(reason))?;
        let res = match reason {
            FaultReason::AdKeytabInvalid => self.rebuild_keytab(env, cfg, ad).await,
            FaultReason::AdSecretFileMissing | FaultReason::AdSecretEntryMissing => {
                self.restore_secrets(env, cfg, ad).await
            }
            FaultReason::AdNetlogonFailure => {
                async {
                    env.host.etc_generate("smb").await?;
                    env.services.restart(WINBINDD, DEFAULT_RESTART_TIMEOUT).await
                }
                .await
            }
            FaultReason::WinbindStopped => env.services.start(WINBINDD, false).await.map(|_| ()),
            other => Err(CallError::new(Errno::EINVAL, format!("no recovery for {other}"))),
        };
        res.map_err(recovery_failed(reason))
    }
}
