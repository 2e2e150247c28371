//! Test harness: a daemon core wired to in-memory fakes in a temp tree.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hastor_ds::keytab::KRB5_NT_PRINCIPAL;
use hastor_ds::{AdConfig, DSConfig, DsConfiguration, DsCredential, DsEnv, DsPaths, DsType, Keytab, KeytabEntry};
use hastor_failover::{EventKind, EventOutcome, FailoverConfig, FailoverEnv, SentinelPaths, VrrpEvent};
use hastor_jobs::{EventBus, JobRecord};
use hastor_mgmt::{Core, MgmtConfig, Services};
use hastor_sys::fakes::{
    FakeAd, FakeFencing, FakeFirewall, FakeHost, FakeInterfaces, FakeKerberos, FakeLdap, FakePeer, FakePools,
    FakeRebooter, FakeSecrets, FakeServices, FakeWatchdog,
};
use tempfile::TempDir;
use zeroize::Zeroizing;

/// Machine principal of the AD fixture.
pub const AD_PRINCIPAL: &str = "TRUENAS$@AD.EXAMPLE.COM";

/// Machine account secret of the AD fixture.
pub const AD_SECRET: &str = "machine-secret";

/// Every fake the core talks to. Shared handles, so tests can script
/// behavior and inspect recorded calls while the core runs.
#[derive(Debug, Clone, Default)]
pub struct Fakes {
    /// Pools.
    pub pools: Arc<FakePools>,
    /// Fencing daemon.
    pub fencing: Arc<FakeFencing>,
    /// VRRP interfaces.
    pub interfaces: Arc<FakeInterfaces>,
    /// Packet filter.
    pub firewall: Arc<FakeFirewall>,
    /// Service manager.
    pub services: Arc<FakeServices>,
    /// Host helpers.
    pub host: Arc<FakeHost>,
    /// Hardware watchdog.
    pub watchdog: Arc<FakeWatchdog>,
    /// Reboot hook.
    pub rebooter: Arc<FakeRebooter>,
    /// The other controller.
    pub peer: Arc<FakePeer>,
    /// Kerberos client.
    pub kerberos: Arc<FakeKerberos>,
    /// LDAP client.
    pub ldap: Arc<FakeLdap>,
    /// AD domain operations.
    pub ad: Arc<FakeAd>,
    /// Machine account secrets.
    pub secrets: Arc<FakeSecrets>,
}

impl Fakes {
    /// Fresh fakes with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Failover collaborators.
    pub fn failover_env(&self) -> FailoverEnv {
        FailoverEnv {
            pools: self.pools.clone(),
            fencing: self.fencing.clone(),
            interfaces: self.interfaces.clone(),
            firewall: self.firewall.clone(),
            services: self.services.clone(),
            host: self.host.clone(),
            watchdog: self.watchdog.clone(),
            rebooter: self.rebooter.clone(),
            peer: self.peer.clone(),
        }
    }

    /// Directory services collaborators checking files under `paths`.
    pub fn ds_env(&self, paths: DsPaths) -> DsEnv {
        DsEnv {
            kerberos: self.kerberos.clone(),
            ldap: self.ldap.clone(),
            ad: self.ad.clone(),
            secrets: self.secrets.clone(),
            services: self.services.clone(),
            host: self.host.clone(),
            paths,
        }
    }
}

/// Write `data` to `path` with permission bits `mode`, creating parents.
pub fn write_mode(path: &Path, data: &[u8], mode: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("failed to create parent directory");
    }
    std::fs::write(path, data).expect("failed to write fixture");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).expect("failed to chmod fixture");
}

/// Enabled AD configuration joined with the machine principal.
pub fn ad_config() -> DSConfig {
    DSConfig {
        service_type: Some(DsType::Ad),
        enabled: true,
        credential: Some(DsCredential::KerberosPrincipal {
            principal: AD_PRINCIPAL.into(),
        }),
        kerberos_realm: Some("AD.EXAMPLE.COM".into()),
        configuration: Some(DsConfiguration::Ad(AdConfig {
            domain: "ad.example.com".into(),
            netbiosname: "TRUENAS".into(),
            workgroup: "AD".into(),
            site: None,
            computer_account_ou: None,
        })),
        ..DSConfig::default()
    }
}

/// A complete controller over fakes: job queue, health engine, failover
/// coordinator and metrics, with state, locks, job logs and sentinels all
/// under one temp directory.
pub struct Appliance {
    /// The fakes behind the core.
    pub fakes: Fakes,
    /// The core.
    pub core: Arc<Core>,
    /// Files the health checks inspect.
    pub ds_paths: DsPaths,
    dir: TempDir,
}

impl std::fmt::Debug for Appliance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appliance").field("dir", &self.dir.path()).finish_non_exhaustive()
    }
}

impl Appliance {
    /// Boot a core whose persisted configuration is `failover` and `ds`.
    /// Must be called inside a tokio runtime.
    pub fn new(failover: FailoverConfig, ds: DSConfig) -> Self {
        Self::with_fakes(Fakes::new(), failover, ds)
    }

    /// Same as [`Appliance::new`] over pre-scripted `fakes`.
    pub fn with_fakes(fakes: Fakes, failover: FailoverConfig, ds: DSConfig) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let config = MgmtConfig::under(dir.path());
        std::fs::create_dir_all(&config.state_dir).expect("failed to create state dir");
        write_json(&config.failover_config_path(), &failover);
        write_json(&config.ds_config_path(), &ds);

        let ds_paths = DsPaths::under(&dir.path().join("ds"));
        std::fs::create_dir_all(&ds_paths.scratch_dir).expect("failed to create scratch dir");
        write_mode(&ds_paths.krb5_conf, b"[libdefaults]\n", 0o644);
        write_mode(&ds_paths.keytab, &machine_keytab(), 0o600);

        let services = Services {
            failover: fakes.failover_env(),
            ds: fakes.ds_env(ds_paths.clone()),
        };
        let core = Core::build(config, services).expect("failed to build core");
        Self {
            fakes,
            core: Arc::new(core),
            ds_paths,
            dir,
        }
    }

    /// Root of the temp tree.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Sentinel files of the coordinator.
    pub fn sentinels(&self) -> &SentinelPaths {
        &self.core.config().sentinels
    }

    /// The bus every job and health event goes through.
    pub fn bus(&self) -> EventBus {
        self.core.queue().bus().clone()
    }

    /// Make the AD fixture pass every check: live and backed-up secret,
    /// winbind running and a valid system ticket.
    pub fn healthy_ad(&self) {
        self.fakes.secrets.set_live("AD", AD_SECRET);
        self.fakes.secrets.set_backup("TRUENAS", "AD", AD_SECRET);
        self.fakes.services.set_running("winbindd", true);
        self.fakes.kerberos.set_valid(AD_PRINCIPAL);
    }

    /// Feed one VRRP event through the coordinator.
    pub async fn event(&self, ifname: &str, kind: EventKind) -> EventOutcome {
        self.core
            .failover()
            .handle_event(VrrpEvent::new(ifname, kind))
            .await
            .expect("event handling failed")
    }

    /// Feed one event that must be accepted and wait for its job.
    pub async fn run(&self, ifname: &str, kind: EventKind) -> JobRecord {
        match self.event(ifname, kind).await {
            EventOutcome::Accepted(id) => self
                .core
                .job_wait(id, Some(Duration::from_secs(30)))
                .await
                .expect("job wait failed"),
            EventOutcome::Ignored(reason) => panic!("event ignored: {reason}"),
        }
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) {
    let bytes = serde_json::to_vec_pretty(value).expect("failed to serialize fixture");
    std::fs::write(path, bytes).expect("failed to write fixture");
}

fn machine_keytab() -> Vec<u8> {
    let kt = Keytab {
        entries: vec![KeytabEntry {
            realm: "AD.EXAMPLE.COM".into(),
            components: vec!["TRUENAS$".into()],
            name_type: KRB5_NT_PRINCIPAL,
            timestamp: 1_700_000_000,
            kvno: 2,
            enctype: 18,
            key: Zeroizing::new(vec![7; 32]),
        }],
    };
    kt.to_bytes().expect("failed to encode keytab")
}
