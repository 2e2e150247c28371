//! IPA health.

use async_trait::async_trait;
use hastor_sys::service::DEFAULT_RESTART_TIMEOUT;
use hastor_sys::{CallError, Errno, LdapBind, LdapOptions};

use super::kerberos::{check_kerberos, recover_kerberos};
use super::{check_file, recovery_failed, DsEnv, HealthChecker};
use crate::config::{DSConfig, DsType};
use crate::error::{DsError, FaultReason, HealthError};

pub(crate) const SSSD: &str = "sssd";

/// IPA checker.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpaHealth;

/// Check that sssd is running.
pub(crate) async fn check_sssd(env: &DsEnv) -> Result<(), HealthError> {
    match env.services.started(SSSD).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(HealthError::new(FaultReason::SssdStopped, "sssd is not running")),
        Err(e) => Err(HealthError::new(
            FaultReason::SssdStopped,
            format!("failed to query sssd state: {}", e.message),
        )),
    }
}

/// Regenerate the client configuration group `etc` and restart sssd.
pub(crate) async fn regenerate_and_restart_sssd(env: &DsEnv, etc: &str) -> Result<(), CallError> {
    env.host.etc_generate(etc).await?;
    env.services.restart(SSSD, DEFAULT_RESTART_TIMEOUT).await
}

#[async_trait]
impl HealthChecker for IpaHealth {
    fn service_type(&self) -> DsType {
        DsType::Ipa
    }

    async fn check(&self, env: &DsEnv, cfg: &DSConfig) -> Result<(), HealthError> {
        check_kerberos(env).await?;

        let paths = &env.paths;
        check_file(
            &paths.ipa_default_conf,
            0o644,
            paths.owner_uid,
            FaultReason::IpaNoConfig,
            FaultReason::IpaConfigPerm,
            "IPA configuration file",
        )?;
        check_file(
            &paths.ipa_cacert,
            0o644,
            paths.owner_uid,
            FaultReason::IpaNoCacert,
            FaultReason::IpaCacertPerm,
            "IPA CA certificate",
        )?;

        let ipa = cfg
            .ipa()
            .ok_or_else(|| HealthError::new(FaultReason::LdapBindFailed, "IPA is not configured"))?;
        let url = format!("ldap://{}", ipa.target_server);
        let opts = LdapOptions {
            timeout: cfg.timeout(),
            starttls: false,
            validate_certificates: ipa.validate_certificates,
        };
        if let Err(e) = env.ldap.root_dse(&url, &LdapBind::Gssapi { sealed: true }, &opts).await {
            return Err(HealthError::new(
                FaultReason::LdapBindFailed,
                format!("failed to read root DSE from {url}: {}", e.message),
            ));
        }

        check_sssd(env).await
    }

    async fn recover(&self, env: &DsEnv, cfg: &DSConfig, err: &HealthError) -> Result<(), DsError> {
        let reason = err.reason;
        if reason.is_krb5() {
            return recover_kerberos(env, cfg, err).await;
        }
        let res = match reason {
            FaultReason::IpaNoConfig
            | FaultReason::IpaConfigPerm
            | FaultReason::IpaNoCacert
            | FaultReason::IpaCacertPerm
            | FaultReason::SssdStopped => regenerate_and_restart_sssd(env, "ipa").await,
            other => Err(CallError::new(Errno::EINVAL, format!("no recovery for {other}"))),
        };
        res.map_err(recovery_failed(reason))
    }
}
