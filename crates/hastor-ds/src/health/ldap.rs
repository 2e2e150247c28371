//! Plain LDAP health.

use async_trait::async_trait;
use hastor_sys::{CallError, Errno, LdapBind, LdapOptions};
use tracing::debug;

use super::ipa::{check_sssd, regenerate_and_restart_sssd};
use super::kerberos::{check_kerberos, recover_kerberos};
use super::{recovery_failed, DsEnv, HealthChecker};
use crate::config::{DSConfig, DsCredential, DsType};
use crate::error::{DsError, FaultReason, HealthError};

/// LDAP checker.
#[derive(Debug, Default, Clone, Copy)]
pub struct LdapHealth;

fn bind_for(cred: Option<&DsCredential>) -> LdapBind {
    match cred {
        Some(DsCredential::LdapPlain { binddn, bindpw }) => LdapBind::Simple {
            binddn: binddn.clone(),
            password: bindpw.clone(),
        },
        Some(DsCredential::LdapMtls {
            client_certificate,
            client_key,
        }) => LdapBind::Mtls {
            cert: client_certificate.clone(),
            key: client_key.clone(),
        },
        Some(DsCredential::KerberosUser { .. }) | Some(DsCredential::KerberosPrincipal { .. }) => {
            LdapBind::Gssapi { sealed: true }
        }
        Some(DsCredential::LdapAnonymous) | None => LdapBind::Anonymous,
    }
}

#[async_trait]
impl HealthChecker for LdapHealth {
    fn service_type(&self) -> DsType {
        DsType::Ldap
    }

    async fn check(&self, env: &DsEnv, cfg: &DSConfig) -> Result<(), HealthError> {
        if cfg.kerberos_realm.is_some() {
            check_kerberos(env).await?;
        }

        let ldap = cfg
            .ldap()
            .ok_or_else(|| HealthError::new(FaultReason::LdapBindFailed, "LDAP is not configured"))?;
        let bind = bind_for(cfg.credential.as_ref());
        let opts = LdapOptions {
            timeout: cfg.timeout(),
            starttls: ldap.starttls,
            validate_certificates: ldap.validate_certificates,
        };
        let mut failures = Vec::new();
        for url in &ldap.server_urls {
            match env.ldap.root_dse(url, &bind, &opts).await {
                Ok(_) => {
                    failures.clear();
                    break;
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "LDAP bind failed");
                    failures.push(format!("{url}: {}", e.message));
                }
            }
        }
        if !failures.is_empty() || ldap.server_urls.is_empty() {
            return Err(HealthError::new(
                FaultReason::LdapBindFailed,
                format!("failed to bind to any LDAP server: {}", failures.join("; ")),
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
            FaultReason::LdapBindFailed | FaultReason::SssdStopped => regenerate_and_restart_sssd(env, "ldap").await,
            other => Err(CallError::new(Errno::EINVAL, format!("no recovery for {other}"))),
        };
        res.map_err(recovery_failed(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testenv::TestEnv;
    use super::*;
    use crate::config::{DsConfiguration, LdapConfig};
    use hastor_sys::SecretString;

    fn cfg(urls: &[&str]) -> DSConfig {
        DSConfig {
            service_type: Some(DsType::Ldap),
            enabled: true,
            credential: Some(DsCredential::LdapPlain {
                binddn: "cn=nas,dc=example,dc=com".into(),
                bindpw: SecretString::new("bindsecret"),
            }),
            kerberos_realm: None,
            configuration: Some(DsConfiguration::Ldap(LdapConfig {
                server_urls: urls.iter().map(|s| s.to_string()).collect(),
                basedn: "dc=example,dc=com".into(),
                starttls: false,
                validate_certificates: true,
            })),
            ..DSConfig::default()
        }
    }

    #[tokio::test]
    async fn test_simple_bind_without_kerberos() {
        let t = TestEnv::new();
        t.services.set_running("sssd", true);
        // No ticket, but no realm either.
        LdapHealth.check(&t.env, &cfg(&["ldaps://ldap.example.com"])).await.unwrap();
        assert_eq!(t.ldap.calls(), vec!["ldaps://ldap.example.com simple:cn=nas,dc=example,dc=com"]);
    }

    #[tokio::test]
    async fn test_realm_requires_ticket() {
        let t = TestEnv::new();
        t.services.set_running("sssd", true);
        let mut c = cfg(&["ldap://ldap.example.com"]);
        c.kerberos_realm = Some("EXAMPLE.COM".into());
        let err = LdapHealth.check(&t.env, &c).await.unwrap_err();
        assert_eq!(err.reason, FaultReason::Krb5TktExpired);
    }

    #[tokio::test]
    async fn test_all_servers_fail() {
        let t = TestEnv::new();
        t.ldap.fail_bind(Some(CallError::new(Errno::EFAULT, "Invalid credentials")));
        let err = LdapHealth
            .check(&t.env, &cfg(&["ldap://a.example.com", "ldap://b.example.com"]))
            .await
            .unwrap_err();
        assert_eq!(err.reason, FaultReason::LdapBindFailed);
        assert!(err.message.contains("ldap://b.example.com: Invalid credentials"));
        assert_eq!(t.ldap.calls().len(), 2);

        LdapHealth.recover(&t.env, &cfg(&["ldap://a.example.com"]), &err).await.unwrap();
        assert_eq!(t.host.count("etc_generate ldap"), 1);
        assert_eq!(t.services.calls_for("restart"), vec!["sssd"]);
    }

    #[test]
    fn test_bind_mapping() {
        assert_eq!(bind_for(Some(&DsCredential::LdapAnonymous)), LdapBind::Anonymous);
        assert_eq!(
            bind_for(Some(&DsCredential::KerberosPrincipal { principal: "p".into() })),
            LdapBind::Gssapi { sealed: true }
        );
    }
}
