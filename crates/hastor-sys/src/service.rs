//! Service start, stop and restart.

use crate::error::{CallError, CallResult, Errno};
use crate::exec::{CommandSpec, ExecOutput, Runner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default per-service restart timeout.
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(15);

/// Service manager contract. Names are appliance service names
/// (`cifs`, `nfs`, `iscsitarget`, `winbindd`, `sssd`, ...).
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Start a service. With `silent`, a failed start logs and returns
    /// `Ok(false)`; otherwise it fails with `ESERVICESTARTFAILURE`.
    async fn start(&self, name: &str, silent: bool) -> CallResult<bool>;

    /// Stop a service.
    async fn stop(&self, name: &str) -> CallResult<()>;

    /// Restart a service within `timeout`.
    async fn restart(&self, name: &str, timeout: Duration) -> CallResult<()>;

    /// Reload a service's configuration.
    async fn reload(&self, name: &str) -> CallResult<()>;

    /// Whether the service is running.
    async fn started(&self, name: &str) -> CallResult<bool>;

    /// Whether the administrator enabled the service to run.
    async fn enabled(&self, name: &str) -> CallResult<bool>;
}

/// [`ServiceManager`] backed by `systemctl`.
#[derive(Clone)]
pub struct SystemdServices {
    runner: Arc<dyn Runner>,
    units: HashMap<String, String>,
}

impl SystemdServices {
    /// Create a wrapper with the stock service-to-unit mapping.
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        let units = [
            ("cifs", "smbd"),
            ("nfs", "nfs-server"),
            ("iscsitarget", "scst"),
            ("winbindd", "winbind"),
            ("sssd", "sssd"),
            ("keepalived", "keepalived"),
            ("http", "nginx"),
            ("syslogd", "syslog-ng"),
            ("ssh", "ssh"),
            ("cron", "cron"),
            ("smartd", "smartmontools"),
            ("collectd", "collectd"),
            ("netdata", "netdata"),
            ("truecommand", "truecommand-agent"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { runner, units }
    }

    fn unit<'a>(&'a self, name: &'a str) -> &'a str {
        self.units.get(name).map(String::as_str).unwrap_or(name)
    }

    async fn systemctl(&self, verb: &str, name: &str, timeout: Option<Duration>) -> CallResult<ExecOutput> {
        let mut spec = CommandSpec::new(["systemctl", verb, self.unit(name)]);
        if let Some(t) = timeout {
            spec = spec.with_timeout(t);
        }
        Ok(self.runner.run(spec).await?)
    }
}

#[async_trait]
impl ServiceManager for SystemdServices {
    async fn start(&self, name: &str, silent: bool) -> CallResult<bool> {
        let out = self
            .systemctl("start", name, Some(DEFAULT_RESTART_TIMEOUT))
            .await?;
        if out.success() {
            info!(service = name, "service started");
            return Ok(true);
        }
        let reason = if out.timed_out {
            "timed out".to_string()
        } else {
            out.stderr_str()
        };
        if silent {
            warn!(service = name, %reason, "service failed to start");
            return Ok(false);
        }
        Err(CallError::new(
            Errno::ESERVICESTARTFAILURE,
            format!("{} failed to start: {}", name, reason),
        ))
    }

    async fn stop(&self, name: &str) -> CallResult<()> {
        let out = self.systemctl("stop", name, Some(DEFAULT_RESTART_TIMEOUT)).await?;
        if !out.success() {
            return Err(CallError::new(
                Errno::EFAULT,
                format!("{} failed to stop: {}", name, out.stderr_str()),
            ));
        }
        Ok(())
    }

    async fn restart(&self, name: &str, timeout: Duration) -> CallResult<()> {
        let out = self.systemctl("restart", name, Some(timeout)).await?;
        if out.timed_out {
            return Err(CallError::new(
                Errno::ETIMEDOUT,
                format!("{} restart timed out after {:?}", name, timeout),
            ));
        }
        if !out.success() {
            return Err(CallError::new(
                Errno::ESERVICESTARTFAILURE,
                format!("{} failed to restart: {}", name, out.stderr_str()),
            ));
        }
        Ok(())
    }

    async fn reload(&self, name: &str) -> CallResult<()> {
        let out = self.systemctl("reload", name, Some(DEFAULT_RESTART_TIMEOUT)).await?;
        if !out.success() {
            return Err(CallError::new(
                Errno::EFAULT,
                format!("{} failed to reload: {}", name, out.stderr_str()),
            ));
        }
        Ok(())
    }

    async fn started(&self, name: &str) -> CallResult<bool> {
        let out = self.systemctl("is-active", name, None).await?;
        Ok(out.exit_code == 0)
    }

    async fn enabled(&self, name: &str) -> CallResult<bool> {
        let out = self.systemctl("is-enabled", name, None).await?;
        Ok(out.exit_code == 0)
    }
}
