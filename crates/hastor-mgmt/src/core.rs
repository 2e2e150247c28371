//! The daemon's object graph: one job queue, one health engine and one
//! failover coordinator sharing a lock registry and an event bus, plus the
//! admin operations the API exposes on top of them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hastor_ds::config::DEFAULT_TIMEOUT_SEC;
use hastor_ds::{DSConfig, DSHealthState, DsEnv, DsPaths, DsStatus, DsType, HealthEngine, HealthState};
use hastor_failover::{
    ControllerState, EventOutcome, FailoverConfig, FailoverCoordinator, FailoverEnv, FifoReader, StateChange,
};
use hastor_jobs::{EventBus, JobId, JobQueue, JobQueueConfig, JobRecord, JobState, RedactionTable};
use hastor_sys::{
    CallError, CarpInterfaces, DevWatchdog, Errno, FencedCli, FileSecretsStore, HostCli, HttpPeer, JsonState, LdapSearchCli,
    LockRegistry, MitKerberos, NetAds, NftFirewall, Runner, SysrqRebooter, SystemExecutor, SystemdServices, ZpoolCli,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MgmtConfig;
use crate::error::{MgmtError, Result};
use crate::metrics::MgmtMetrics;

/// Service implementations the core drives.
#[derive(Debug, Clone)]
pub struct Services {
    /// Collaborators of the failover coordinator.
    pub failover: FailoverEnv,
    /// Collaborators of the health engine.
    pub ds: DsEnv,
}

impl Services {
    /// Command-backed implementations for a real controller.
    pub fn system(config: &MgmtConfig) -> Result<Self> {
        let runner: Arc<dyn Runner> = Arc::new(SystemExecutor::new());
        let services = Arc::new(SystemdServices::new(runner.clone()));
        let host = Arc::new(HostCli::new(runner.clone(), config.helper.as_str()));
        let peer = HttpPeer::new(
            config.peer.url.as_str(),
            config.peer.token.clone(),
            config.keystore.as_path(),
            Duration::from_secs(config.peer.timeout_secs),
        )?;
        let failover = FailoverEnv {
            pools: Arc::new(ZpoolCli::new(runner.clone())),
            fencing: Arc::new(FencedCli::new(runner.clone())),
            interfaces: Arc::new(CarpInterfaces::new(runner.clone())),
            firewall: Arc::new(NftFirewall::new(runner.clone())),
            services: services.clone(),
            host: host.clone(),
            watchdog: Arc::new(DevWatchdog::default()),
            rebooter: Arc::new(SysrqRebooter::default()),
            peer: Arc::new(peer),
        };
        let paths = DsPaths::default();
        let ds = DsEnv {
            kerberos: Arc::new(MitKerberos::new(runner.clone(), paths.scratch_dir.as_path())),
            ldap: Arc::new(LdapSearchCli::new(runner.clone())),
            ad: Arc::new(NetAds::new(runner, Duration::from_secs(u64::from(DEFAULT_TIMEOUT_SEC)))),
            secrets: Arc::new(FileSecretsStore::new(config.secrets_path(), config.secrets_backup_dir())),
            services,
            host,
            paths,
        };
        Ok(Self { failover, ds })
    }
}

/// Failover status as served to the UI and to the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverStatus {
    /// Controller state; `MASTER` tells the peer this node is active.
    pub state: ControllerState,
    /// Administratively disabled.
    pub disabled: bool,
    /// Events that became transition jobs.
    pub accepted: u64,
    /// Events the pipeline dropped.
    pub ignored: u64,
    /// The job queue stopped starting jobs ahead of a reboot.
    pub halted: bool,
    /// Recent state changes, oldest first.
    pub history: Vec<StateChange>,
}

/// Job list filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Only jobs of this method.
    pub method: Option<String>,
    /// Only jobs in this state.
    pub state: Option<JobState>,
}

/// Admin override of the health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetHealthState {
    /// Service the record describes.
    #[serde(default)]
    pub service_type: Option<DsType>,
    /// New status.
    pub status: DsStatus,
    /// Required for `FAULTED`, forbidden otherwise.
    #[serde(default)]
    pub status_msg: Option<String>,
}

/// Dependency-injected daemon core.
pub struct Core {
    config: MgmtConfig,
    queue: Arc<JobQueue>,
    health: Arc<HealthEngine>,
    failover: Arc<FailoverCoordinator>,
    metrics: Arc<MgmtMetrics>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("bind_addr", &self.config.bind_addr)
            .field("failover", &self.failover)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl Core {
    /// Build the core for a real controller: load the persisted
    /// configuration and wire the command-backed services.
    pub fn system(config: MgmtConfig) -> Result<Self> {
        let services = Services::system(&config)?;
        Self::build(config, services)
    }

    /// Build the core over `services`. Must be called inside a tokio
    /// runtime; the job dispatcher starts immediately.
    pub fn build(config: MgmtConfig, services: Services) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;
        let bus = EventBus::default();
        let locks = LockRegistry::new(config.lock_dir.as_path())?;
        let redaction = Arc::new(RedactionTable::new());
        redaction.register(hastor_ds::engine::UPDATE_METHOD, &["password", "bindpw", "client_key"]);

        let queue_cfg = JobQueueConfig {
            log_dir: config.job_log_dir.clone(),
            max_terminated: config.max_terminated_jobs,
            ..JobQueueConfig::default()
        };
        let queue = Arc::new(JobQueue::new(queue_cfg, bus.clone(), locks, redaction.clone())?);

        let ds_cfg = Arc::new(JsonState::<DSConfig>::load(config.ds_config_path())?);
        let health_state = Arc::new(HealthState::new(bus, redaction));
        let health = Arc::new(HealthEngine::new(services.ds, ds_cfg, health_state));

        let failover_cfg = Arc::new(JsonState::<FailoverConfig>::load(config.failover_config_path())?);
        let failover = Arc::new(FailoverCoordinator::new(
            services.failover,
            failover_cfg,
            queue.clone(),
            config.sentinels.clone(),
        ));

        let metrics = Arc::new(MgmtMetrics::new()?);
        info!(state = %failover.state(), "core initialised");
        Ok(Self {
            config,
            queue,
            health,
            failover,
            metrics,
        })
    }

    /// Daemon configuration.
    pub fn config(&self) -> &MgmtConfig {
        &self.config
    }

    /// Job queue.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Directory services health engine.
    pub fn health(&self) -> &Arc<HealthEngine> {
        &self.health
    }

    /// Failover coordinator.
    pub fn failover(&self) -> &Arc<FailoverCoordinator> {
        &self.failover
    }

    /// Exported metrics.
    pub fn metrics(&self) -> &Arc<MgmtMetrics> {
        &self.metrics
    }

    /// Spawn the background tasks: VRRP FIFO reader, failover coordinator,
    /// periodic health recovery and the metrics observer.
    pub fn start(&self, token: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tasks.spawn(FifoReader::new(self.config.vrrp_fifo.as_path()).run(tx, token.clone()));
        tasks.spawn(self.failover.clone().run(rx, token.clone()));
        tasks.spawn(self.health.clone().supervise(
            self.queue.clone(),
            self.config.health_interval(),
            self.config.ticket_renew_window(),
            token.clone(),
        ));
        let metrics = self.metrics.clone();
        let bus = self.queue.bus().clone();
        tasks.spawn(async move { metrics.observe(bus, token).await });
        tasks
    }

    /// `failover.config`.
    pub fn failover_config(&self) -> FailoverConfig {
        self.failover.config()
    }

    /// `failover.update`.
    pub async fn failover_update(&self, new: FailoverConfig) -> Result<FailoverConfig> {
        Ok(self.failover.update_config(new).await?)
    }

    /// `failover.force_takeover`.
    pub async fn force_takeover(&self, ifname: &str) -> Result<EventOutcome> {
        info!(ifname, "administrator requested forced takeover");
        Ok(self.failover.force_takeover(ifname).await?)
    }

    /// `failover.status`.
    pub fn failover_status(&self) -> FailoverStatus {
        let stats = self.failover.stats();
        FailoverStatus {
            state: stats.state,
            disabled: self.failover.config().disabled,
            accepted: stats.accepted,
            ignored: stats.ignored,
            halted: self.queue.is_halted(),
            history: self.failover.history(),
        }
    }

    /// Rewrite the local status files; the peer asks for this after it
    /// demotes.
    pub fn refresh_failover_status(&self) {
        self.failover.refresh_status();
    }

    /// Keys the peer copies after it demotes. An empty store is `{}`.
    pub fn pool_keys(&self) -> Result<Value> {
        read_keystore(&self.config.keystore)
    }

    /// Current health record without running a check.
    pub fn health_status(&self) -> DSHealthState {
        self.health.health()
    }

    /// `directoryservices.health.check`: one check pass under the recovery
    /// lock.
    pub async fn health_check(&self) -> Result<DSHealthState> {
        let id = self.health.submit_check(&self.queue)?;
        self.job_health(id).await
    }

    /// `directoryservices.health.recover`: check plus bounded recovery.
    pub async fn health_recover(&self) -> Result<DSHealthState> {
        let id = self.health.submit_recover(&self.queue)?;
        self.job_health(id).await
    }

    async fn job_health(&self, id: JobId) -> Result<DSHealthState> {
        self.queue.wait(id, None, true).await?;
        Ok(self.health.health())
    }

    /// `directoryservices.health.set_state`. The override is validated up
    /// front and applied by a job holding the recovery lock.
    pub async fn health_set_state(&self, req: SetHealthState) -> Result<DSHealthState> {
        DSHealthState::validate_override(req.status, req.status_msg.as_deref())?;
        let id = self
            .health
            .submit_set_state(&self.queue, req.service_type, req.status, req.status_msg)?;
        self.job_health(id).await
    }

    /// Current directory services configuration.
    pub fn ds_config(&self) -> DSConfig {
        self.health.config()
    }

    /// `directoryservices.update`. Validation failures are reported before
    /// anything is queued; the job validates again under the lock.
    pub async fn ds_update(&self, new: DSConfig) -> Result<DSConfig> {
        new.validate()?;
        new.validate_update(&self.health.config())?;
        let id = self.health.submit_update(&self.queue, new)?;
        self.queue.wait(id, None, true).await?;
        Ok(self.health.config())
    }

    /// `core.get_jobs`.
    pub fn jobs(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.queue
            .list()
            .into_iter()
            .filter(|r| filter.method.as_deref().map_or(true, |m| r.method == m))
            .filter(|r| filter.state.map_or(true, |s| r.state == s))
            .collect()
    }

    /// One job record.
    pub fn job(&self, id: JobId) -> Result<JobRecord> {
        Ok(self.queue.get(id)?)
    }

    /// `core.job_wait`.
    pub async fn job_wait(&self, id: JobId, timeout: Option<Duration>) -> Result<JobRecord> {
        Ok(self.queue.wait_record(id, timeout).await?)
    }

    /// `core.job_abort`.
    pub fn job_abort(&self, id: JobId) -> Result<JobRecord> {
        self.queue.abort(id)?;
        Ok(self.queue.get(id)?)
    }

    /// Prometheus text exposition, with failover counters brought current.
    pub fn render_metrics(&self) -> String {
        self.metrics.sync_failover(&self.failover.stats());
        self.metrics.render()
    }
}

fn read_keystore(path: &Path) -> Result<Value> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| MgmtError::Call(CallError::new(Errno::EFAULT, format!("{}: {e}", path.display())))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Default::default())),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use hastor_sys::fakes::{
        FakeAd, FakeFencing, FakeFirewall, FakeHost, FakeInterfaces, FakeKerberos, FakeLdap, FakePeer, FakePools,
        FakeRebooter, FakeSecrets, FakeServices, FakeWatchdog,
    };
    use tempfile::TempDir;

    /// A core over in-memory fakes in a temp tree.
    pub struct TestCore {
        pub core: Arc<Core>,
        pub pools: Arc<FakePools>,
        pub firewall: Arc<FakeFirewall>,
        pub fencing: Arc<FakeFencing>,
        pub dir: TempDir,
    }

    impl TestCore {
        pub fn new() -> Self {
            Self::with_config(|_| {})
        }

        pub fn with_config(tweak: impl FnOnce(&mut MgmtConfig)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = MgmtConfig::under(dir.path());
            tweak(&mut config);

            let pools = Arc::new(FakePools::new());
            let firewall = Arc::new(FakeFirewall::new());
            let fencing = Arc::new(FakeFencing::new());
            let services = Arc::new(FakeServices::new());
            let host = Arc::new(FakeHost::new());
            let failover = FailoverEnv {
                pools: pools.clone(),
                fencing: fencing.clone(),
                interfaces: Arc::new(FakeInterfaces::new()),
                firewall: firewall.clone(),
                services: services.clone(),
                host: host.clone(),
                watchdog: Arc::new(FakeWatchdog::new()),
                rebooter: Arc::new(FakeRebooter::new()),
                peer: Arc::new(FakePeer::new()),
            };
            let ds = DsEnv {
                kerberos: Arc::new(FakeKerberos::new()),
                ldap: Arc::new(FakeLdap::new()),
                ad: Arc::new(FakeAd::new()),
                secrets: Arc::new(FakeSecrets::new()),
                services,
                host,
                paths: DsPaths::under(&dir.path().join("ds")),
            };
            let core = Core::build(config, Services { failover, ds }).unwrap();
            Self {
                core: Arc::new(core),
                pools,
                firewall,
                fencing,
                dir,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::TestCore;
    use super::*;
    use hastor_failover::Volume;
    use std::collections::{BTreeMap, BTreeSet};

    fn enabled_config() -> FailoverConfig {
        FailoverConfig {
            disabled: false,
            internal_interfaces: BTreeSet::from(["eth2".to_string()]),
            critical_groups: BTreeMap::from([(1, BTreeSet::from(["eth0".to_string()]))]),
            volumes: vec![Volume::new("tank", "0xAB")],
            ..FailoverConfig::default()
        }
    }

    #[tokio::test]
    async fn test_failover_update_persists() {
        let t = TestCore::new();
        let saved = t.core.failover_update(enabled_config()).await.unwrap();
        assert!(!saved.disabled);
        let on_disk: FailoverConfig =
            serde_json::from_slice(&std::fs::read(t.core.config().failover_config_path()).unwrap()).unwrap();
        assert_eq!(on_disk, saved);
        assert!(!t.core.failover_status().disabled);
    }

    #[tokio::test]
    async fn test_failover_update_rejects_enabled_without_groups() {
        let t = TestCore::new();
        let cfg = FailoverConfig {
            disabled: false,
            ..FailoverConfig::default()
        };
        let err = t.core.failover_update(cfg).await.unwrap_err();
        assert!(matches!(err, crate::error::MgmtError::Validation(_)));
        assert!(t.core.failover_config().disabled);
    }

    #[tokio::test]
    async fn test_health_check_on_disabled_config() {
        let t = TestCore::new();
        let health = t.core.health_check().await.unwrap();
        assert_eq!(health, DSHealthState::disabled());
        let jobs = t.core.jobs(&JobFilter {
            method: Some(hastor_ds::engine::CHECK_METHOD.to_string()),
            state: Some(JobState::Success),
        });
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_set_state_guard() {
        let t = TestCore::new();
        let missing_msg = SetHealthState {
            service_type: Some(DsType::Ad),
            status: DsStatus::Faulted,
            status_msg: None,
        };
        assert!(matches!(
            t.core.health_set_state(missing_msg).await,
            Err(MgmtError::Validation(_))
        ));
        assert!(t.core.jobs(&JobFilter::default()).is_empty());

        let ok = SetHealthState {
            service_type: Some(DsType::Ad),
            status: DsStatus::Faulted,
            status_msg: Some("manual".into()),
        };
        let health = t.core.health_set_state(ok).await.unwrap();
        assert_eq!(health.status, DsStatus::Faulted);
        assert_eq!(t.core.health_status().status_msg.as_deref(), Some("manual"));
    }

    #[tokio::test]
    async fn test_force_takeover_without_volumes() {
        let t = TestCore::new();
        let id = match t.core.force_takeover("eth0").await.unwrap() {
            EventOutcome::Accepted(id) => id,
            EventOutcome::Ignored(reason) => panic!("ignored: {reason}"),
        };
        let rec = t.core.job_wait(id, Some(Duration::from_secs(30))).await.unwrap();
        assert_eq!(rec.state, JobState::Success);
        assert_eq!(rec.result, Some(serde_json::json!("INFO")));
        assert_eq!(t.core.failover_status().state, ControllerState::Master);
        assert_eq!(t.fencing.calls(), vec!["stop", "start FORCE"]);
    }

    #[tokio::test]
    async fn test_pool_keys_default_and_content() {
        let t = TestCore::new();
        assert_eq!(t.core.pool_keys().unwrap(), serde_json::json!({}));
        std::fs::write(&t.core.config().keystore, br#"{"tank": "k"}"#).unwrap();
        assert_eq!(t.core.pool_keys().unwrap()["tank"], "k");
    }

    #[tokio::test]
    async fn test_abort_unknown_job() {
        let t = TestCore::new();
        assert!(t.core.job_abort(4242).is_err());
    }
}
