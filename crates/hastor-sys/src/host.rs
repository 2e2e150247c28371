//! Host-level configuration helpers.

use crate::error::CallResult;
use crate::exec::{execute, CommandSpec, Runner};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Host configuration contract.
#[async_trait]
pub trait Host: Send + Sync {
    /// Regenerate the configuration files of one group (`rc`, `ssl`,
    /// `smb`, `krb5`, `ipa`, `ldap`, `system_dataset`, `cron`, ...).
    async fn etc_generate(&self, group: &str) -> CallResult<()>;

    /// Rewrite the resolver configuration.
    async fn sync_dns(&self) -> CallResult<()>;

    /// Unlock every self-encrypting disk.
    async fn sed_unlock_all(&self) -> CallResult<()>;

    /// Start user-configured virtual machines.
    async fn start_vms(&self) -> CallResult<()>;

    /// Rebuild the directory user and group cache.
    async fn fill_account_cache(&self) -> CallResult<()>;
}

/// [`Host`] backed by the appliance helper binaries.
#[derive(Clone)]
pub struct HostCli {
    runner: Arc<dyn Runner>,
    helper: String,
}

impl HostCli {
    /// Create a wrapper that runs `helper <verb> [args]` through `runner`.
    pub fn new(runner: Arc<dyn Runner>, helper: impl Into<String>) -> Self {
        Self {
            runner,
            helper: helper.into(),
        }
    }

    async fn helper(&self, args: &[&str], timeout: Duration) -> CallResult<()> {
        let mut argv = vec![self.helper.as_str()];
        argv.extend_from_slice(args);
        execute(self.runner.as_ref(), CommandSpec::new(argv).with_timeout(timeout)).await?;
        Ok(())
    }
}

#[async_trait]
impl Host for HostCli {
    async fn etc_generate(&self, group: &str) -> CallResult<()> {
        info!(group, "regenerating configuration");
        self.helper(&["etc", "generate", group], Duration::from_secs(60))
            .await
    }

    async fn sync_dns(&self) -> CallResult<()> {
        self.helper(&["dns", "sync"], Duration::from_secs(30)).await
    }

    async fn sed_unlock_all(&self) -> CallResult<()> {
        info!("unlocking self-encrypting disks");
        self.helper(&["sed", "unlock-all"], Duration::from_secs(300))
            .await
    }

    async fn start_vms(&self) -> CallResult<()> {
        self.helper(&["vm", "start-on-boot"], Duration::from_secs(300))
            .await
    }

    async fn fill_account_cache(&self) -> CallResult<()> {
        self.helper(&["account-cache", "fill"], Duration::from_secs(600))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRunner;

    #[tokio::test]
    async fn test_helper_argv() {
        let runner = Arc::new(FakeRunner::new());
        let host = HostCli::new(runner.clone(), "/usr/libexec/hastor-helper");
        host.etc_generate("krb5").await.unwrap();
        host.sync_dns().await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0], vec!["/usr/libexec/hastor-helper", "etc", "generate", "krb5"]);
        assert_eq!(calls[1], vec!["/usr/libexec/hastor-helper", "dns", "sync"]);
    }

    #[tokio::test]
    async fn test_helper_failure_propagates() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["helper", "sed"], 2, "", "no SED password configured");
        let host = HostCli::new(runner, "helper");
        let err = host.sed_unlock_all().await.unwrap_err();
        assert!(err.message.contains("no SED password configured"));
    }
}
