//! Daemon configuration (`hastord.toml`).

use hastor_failover::SentinelPaths;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MgmtError, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// How to reach the other controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Base URL of the peer's admin endpoint on the heartbeat link.
    pub url: String,
    /// Bearer token the peer expects.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            url: "http://169.254.10.2:8443".to_string(),
            token: None,
            timeout_secs: 5,
        }
    }
}

/// `hastord` configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    /// Admin API listen address.
    pub bind_addr: SocketAddr,
    /// Bearer token required by the admin API; none disables the check.
    pub admin_token: Option<String>,
    /// Persisted `FailoverConfig`, `DSConfig` and secret store.
    pub state_dir: PathBuf,
    /// Cluster lock files.
    pub lock_dir: PathBuf,
    /// Per-job log files.
    pub job_log_dir: PathBuf,
    /// Terminated jobs kept in the registry.
    pub max_terminated_jobs: usize,
    /// FIFO the VRRP daemon writes state changes to.
    pub vrrp_fifo: PathBuf,
    /// Status, override, cache-file and watchdog sentinels.
    pub sentinels: SentinelPaths,
    /// Seconds between periodic directory services recovery passes.
    pub health_interval_secs: u64,
    /// Renew the system kerberos ticket when it expires within this many
    /// seconds.
    pub ticket_renew_window_secs: u64,
    /// Appliance helper binary used for configuration generation.
    pub helper: String,
    /// Where keys synced from the peer are stored.
    pub keystore: PathBuf,
    /// The other controller.
    pub peer: PeerConfig,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8443)),
            admin_token: None,
            state_dir: PathBuf::from("/var/db/hastor"),
            lock_dir: PathBuf::from("/var/run/hastor/locks"),
            job_log_dir: PathBuf::from("/var/log/hastor/jobs"),
            max_terminated_jobs: 1000,
            vrrp_fifo: PathBuf::from("/var/run/vrrpd.fifo"),
            sentinels: SentinelPaths::default(),
            health_interval_secs: 900,
            ticket_renew_window_secs: 3600,
            helper: "/usr/libexec/hastor-helper".to_string(),
            keystore: PathBuf::from("/data/hastor/pool_keys.json"),
            peer: PeerConfig::default(),
            log_format: LogFormat::Text,
        }
    }
}

impl MgmtConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| MgmtError::Config(format!("{}: {}", path.display(), e))),
            "json" => serde_json::from_str(&contents).map_err(|e| MgmtError::Config(format!("{}: {}", path.display(), e))),
            _ => Err(MgmtError::Config(format!("unsupported config file extension: {ext:?}"))),
        }
    }

    /// Same as [`MgmtConfig::from_file`], falling back to the defaults when
    /// the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Configuration rooted under `root`, for tests and staging trees.
    pub fn under(root: &Path) -> Self {
        Self {
            state_dir: root.join("state"),
            lock_dir: root.join("locks"),
            job_log_dir: root.join("jobs"),
            vrrp_fifo: root.join("vrrpd.fifo"),
            sentinels: SentinelPaths::under(&root.join("sentinels")),
            keystore: root.join("pool_keys.json"),
            ..Self::default()
        }
    }

    /// Persisted failover configuration.
    pub fn failover_config_path(&self) -> PathBuf {
        self.state_dir.join("failover.json")
    }

    /// Persisted directory services configuration.
    pub fn ds_config_path(&self) -> PathBuf {
        self.state_dir.join("directoryservices.json")
    }

    /// Live machine account secret store.
    pub fn secrets_path(&self) -> PathBuf {
        self.state_dir.join("secrets.json")
    }

    /// Database backup of the secret store.
    pub fn secrets_backup_dir(&self) -> PathBuf {
        self.state_dir.join("secrets.db")
    }

    /// Interval between periodic recovery passes.
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    /// Ticket renewal window.
    pub fn ticket_renew_window(&self) -> Duration {
        Duration::from_secs(self.ticket_renew_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MgmtConfig::default();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8443)));
        assert!(config.admin_token.is_none());
        assert_eq!(config.health_interval(), Duration::from_secs(900));
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.failover_config_path(), PathBuf::from("/var/db/hastor/failover.json"));
        assert_eq!(config.sentinels, SentinelPaths::default());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
bind_addr = "10.0.0.1:8080"
admin_token = "test-token"
state_dir = "/srv/hastor"
health_interval_secs = 60
log_format = "json"

[peer]
url = "http://10.0.0.2:8080"
"#
        )
        .unwrap();

        let config = MgmtConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([10, 0, 0, 1], 8080)));
        assert_eq!(config.admin_token.as_deref(), Some("test-token"));
        assert_eq!(config.ds_config_path(), PathBuf::from("/srv/hastor/directoryservices.json"));
        assert_eq!(config.health_interval_secs, 60);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.peer.url, "http://10.0.0.2:8080");
        assert_eq!(config.peer.timeout_secs, 5);
        assert_eq!(config.vrrp_fifo, PathBuf::from("/var/run/vrrpd.fifo"));
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"bind_addr": "127.0.0.1:9000", "vrrp_fifo": "/tmp/vrrp"}}"#).unwrap();

        let config = MgmtConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.vrrp_fifo, PathBuf::from("/tmp/vrrp"));
        assert_eq!(config.max_terminated_jobs, 1000);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(MgmtConfig::from_file(file.path()), Err(MgmtError::Config(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MgmtConfig::load_or_default(&dir.path().join("hastord.toml")).unwrap();
        assert_eq!(config, MgmtConfig::default());
    }
}
