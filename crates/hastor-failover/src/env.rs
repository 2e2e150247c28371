//! Services a failover transition drives, and the knobs it runs with.

use std::sync::Arc;
use std::time::Duration;

use hastor_sys::{Fencing, Firewall, Host, Interfaces, Peer, PoolService, Rebooter, ServiceManager, Watchdog};
use serde::{Deserialize, Serialize};

/// Collaborators of the failover coordinator.
#[derive(Clone)]
pub struct FailoverEnv {
    /// Pool import and export.
    pub pools: Arc<dyn PoolService>,
    /// Shared-storage arbitration.
    pub fencing: Arc<dyn Fencing>,
    /// VRRP state and advskew.
    pub interfaces: Arc<dyn Interfaces>,
    /// Traffic admission.
    pub firewall: Arc<dyn Firewall>,
    /// Service control.
    pub services: Arc<dyn ServiceManager>,
    /// Host configuration helpers.
    pub host: Arc<dyn Host>,
    /// Hardware watchdog.
    pub watchdog: Arc<dyn Watchdog>,
    /// Immediate reboot.
    pub rebooter: Arc<dyn Rebooter>,
    /// The other controller.
    pub peer: Arc<dyn Peer>,
}

impl std::fmt::Debug for FailoverEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverEnv").finish_non_exhaustive()
    }
}

/// Which services a transition restarts or stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePlan {
    /// Restarted concurrently on promotion, each under the restart timeout.
    pub critical: Vec<String>,
    /// Restarted in the background on promotion, stopped on demotion.
    pub non_critical: Vec<String>,
    /// Admin UI service, restarted first on promotion.
    pub http: String,
    /// VRRP daemon, restarted on demotion to give up the VIPs.
    pub keepalived: String,
    /// Restarted on demotion.
    pub syslog: String,
    /// Restarted on demotion when enabled by the user.
    pub ssh: String,
}

impl Default for ServicePlan {
    fn default() -> Self {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        Self {
            critical: names(&["iscsitarget", "cifs", "nfs"]),
            non_critical: names(&["collectd", "rrdcached", "smartd", "truecommand"]),
            http: "http".to_string(),
            keepalived: "keepalived".to_string(),
            syslog: "syslogd".to_string(),
            ssh: "ssh".to_string(),
        }
    }
}

/// Transition timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Bound on exporting every volume during demotion.
    pub export_timeout: Duration,
    /// Hardware watchdog timeout armed before export.
    pub watchdog_secs: u32,
    /// Per-service restart bound.
    pub restart_timeout: Duration,
    /// Extra fencing starts while the remote node is still fencing.
    pub fenced_retries: u32,
    /// Pause between those starts.
    pub fenced_retry_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            export_timeout: Duration::from_secs(4),
            watchdog_secs: 4,
            restart_timeout: hastor_sys::service::DEFAULT_RESTART_TIMEOUT,
            fenced_retries: 4,
            fenced_retry_delay: Duration::from_secs(5),
        }
    }
}
