//! Active Directory domain membership probes.

use crate::error::{CallError, CallResult, Errno};
use crate::exec::{CommandSpec, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Subset of `net ads info` used by the health checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// LDAP server address.
    #[serde(rename = "LDAP server", default)]
    pub ldap_server: String,
    /// Kerberos realm.
    #[serde(rename = "Realm", default)]
    pub realm: String,
    /// KDC used for the domain.
    #[serde(rename = "KDC server", default)]
    pub kdc_server: String,
    /// Clock difference with the domain controller in seconds.
    #[serde(rename = "Server time offset", default)]
    pub server_time_offset: i64,
}

/// Domain membership contract.
#[async_trait]
pub trait AdService: Send + Sync {
    /// Query the joined domain.
    async fn domain_info(&self, domain: &str) -> CallResult<DomainInfo>;

    /// Open a client connection to winbindd.
    async fn open_wbclient(&self) -> CallResult<()>;

    /// Verify the secure channel to a domain controller.
    async fn ping_dc(&self) -> CallResult<()>;

    /// Write a keytab for the machine account, derived from the stored
    /// machine secret, to `path`.
    async fn export_keytab(&self, path: &Path) -> CallResult<()>;
}

/// [`AdService`] backed by Samba's `net` and `wbinfo`.
#[derive(Clone)]
pub struct NetAds {
    runner: Arc<dyn Runner>,
    timeout: Duration,
}

impl NetAds {
    /// Create a wrapper with a network timeout.
    pub fn new(runner: Arc<dyn Runner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    async fn checked(&self, argv: &[&str], errno: Errno) -> CallResult<String> {
        let out = self
            .runner
            .run(CommandSpec::new(argv.iter().copied()).with_timeout(self.timeout))
            .await?;
        if !out.success() {
            let reason = if out.timed_out {
                "timed out".to_string()
            } else {
                out.stderr_str()
            };
            return Err(CallError::new(errno, format!("{}: {}", argv.join(" "), reason)));
        }
        Ok(out.stdout_str())
    }
}

#[async_trait]
impl AdService for NetAds {
    async fn domain_info(&self, domain: &str) -> CallResult<DomainInfo> {
        let stdout = self
            .checked(&["net", "--json", "-S", domain, "ads", "info"], Errno::EFAULT)
            .await?;
        serde_json::from_str(&stdout).map_err(|e| {
            CallError::new(Errno::EFAULT, format!("unexpected `net ads info` output: {e}"))
        })
    }

    async fn open_wbclient(&self) -> CallResult<()> {
        self.checked(&["wbinfo", "--ping"], Errno::EFAULT).await?;
        Ok(())
    }

    async fn ping_dc(&self) -> CallResult<()> {
        self.checked(&["wbinfo", "--ping-dc"], Errno::EFAULT).await?;
        Ok(())
    }

    async fn export_keytab(&self, path: &Path) -> CallResult<()> {
        let argv = ["net", "--use-kerberos", "required", "-P", "ads", "keytab", "create"];
        let spec = CommandSpec::new(argv)
            .with_env("KRB5_KTNAME", format!("FILE:{}", path.display()))
            .with_timeout(self.timeout);
        let out = self.runner.run(spec).await?;
        if !out.success() {
            return Err(CallError::new(
                Errno::EFAULT,
                format!("failed to create machine account keytab: {}", out.stderr_str()),
            ));
        }
        Ok(())
    }
}
