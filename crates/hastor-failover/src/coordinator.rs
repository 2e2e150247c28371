//! The failover event coordinator: routes VRRP events through the
//! pre-acceptance pipeline, dispatches promotion and demotion jobs, and
//! keeps the status files in step with the controller state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hastor_jobs::{EventKind as BusEventKind, JobId, JobQueue, JobSpec, JobState};
use hastor_sys::{locks, JsonState};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FailoverConfig;
use crate::env::{FailoverEnv, ServicePlan, Timings};
use crate::error::{job_error, Result};
use crate::event::{EventKind, VrrpEvent, VRRP_EVENT_TOPIC};
use crate::pipeline::{evaluate, refresh_volumes, Action, Decision};
use crate::sentinel::{SentinelPaths, StatusMarker};
use crate::state::{ControllerState, ControllerStateMachine, StateChange};

/// Bound on waiting for the configuration lock held by another mutation.
const CONFIG_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// What became of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A transition job was queued.
    Accepted(JobId),
    /// Dropped by the pipeline.
    Ignored(String),
}

/// Event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailoverStats {
    /// Events that became jobs.
    pub accepted: u64,
    /// Events the pipeline dropped.
    pub ignored: u64,
    /// Current controller state.
    pub state: ControllerState,
}

/// Failover event coordinator.
pub struct FailoverCoordinator {
    pub(crate) env: FailoverEnv,
    config: Arc<JsonState<FailoverConfig>>,
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) paths: SentinelPaths,
    pub(crate) plan: ServicePlan,
    pub(crate) timings: Timings,
    pub(crate) state: ControllerStateMachine,
    /// Promotions and demotions never overlap.
    pub(crate) transition: tokio::sync::Mutex<()>,
    /// Self-encrypting disks were unlocked by this process or the peer.
    pub(crate) sed_unlocked: AtomicBool,
    accepted: AtomicU64,
    ignored: AtomicU64,
}

impl std::fmt::Debug for FailoverCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverCoordinator")
            .field("state", &self.state.get())
            .field("paths", &self.paths)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl FailoverCoordinator {
    /// Coordinator over `config`, dispatching on `queue`.
    pub fn new(
        env: FailoverEnv,
        config: Arc<JsonState<FailoverConfig>>,
        queue: Arc<JobQueue>,
        paths: SentinelPaths,
    ) -> Self {
        let initial = match paths.marker() {
            Some(StatusMarker::Master) => ControllerState::Master,
            Some(StatusMarker::Failed) => ControllerState::Faulted,
            _ => ControllerState::BackupIdle,
        };
        let state = ControllerStateMachine::new(initial, queue.bus().clone());
        Self {
            env,
            config,
            queue,
            paths,
            plan: ServicePlan::default(),
            timings: Timings::default(),
            state,
            transition: tokio::sync::Mutex::new(()),
            sed_unlocked: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
        }
    }

    /// Override the service plan.
    pub fn with_plan(mut self, plan: ServicePlan) -> Self {
        self.plan = plan;
        self
    }

    /// Override the transition timings.
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Current configuration.
    pub fn config(&self) -> FailoverConfig {
        self.config.snapshot()
    }

    /// Current controller state.
    pub fn state(&self) -> ControllerState {
        self.state.get()
    }

    /// Recent controller state changes.
    pub fn history(&self) -> Vec<StateChange> {
        self.state.history()
    }

    /// Queue transition jobs run on.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Sentinel paths.
    pub fn paths(&self) -> &SentinelPaths {
        &self.paths
    }

    /// Event counters.
    pub fn stats(&self) -> FailoverStats {
        FailoverStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            state: self.state.get(),
        }
    }

    /// Validate and persist a new configuration under the
    /// `failover_event` lock.
    pub async fn update_config(&self, new: FailoverConfig) -> Result<FailoverConfig> {
        let _guard = self
            .queue
            .locks()
            .with_lock(locks::FAILOVER_EVENT, Some(CONFIG_LOCK_TIMEOUT))
            .await?;
        new.validate()?;
        self.config.replace(new.clone())?;
        info!(
            disabled = new.disabled,
            master_preferred = new.master_preferred,
            volumes = new.volumes.len(),
            "failover configuration updated"
        );
        Ok(new)
    }

    /// Publish `ev`, run the pipeline under the interface's queue lock and
    /// dispatch the resulting job.
    pub async fn handle_event(self: &Arc<Self>, ev: VrrpEvent) -> Result<EventOutcome> {
        self.queue.bus().publish(
            VRRP_EVENT_TOPIC,
            BusEventKind::Changed,
            json!({ "ifname": ev.ifname, "event": ev.kind }),
        );

        let _ifq = self
            .queue
            .locks()
            .with_lock(&locks::failover_ifq(&ev.ifname), None)
            .await?;
        let mut cfg = self.config.snapshot();
        refresh_volumes(&self.env, &mut cfg).await;

        match evaluate(&self.env, &self.queue, &cfg, &ev).await {
            Decision::Ignore(reason) => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
                Ok(EventOutcome::Ignored(reason))
            }
            Decision::Accept(action) => {
                let id = self.submit(action, &ev.ifname, ev.kind, cfg)?;
                self.accepted.fetch_add(1, Ordering::Relaxed);
                info!(job_id = id, ifname = %ev.ifname, event = %ev.kind, method = action.method(), "VRRP event accepted");
                self.spawn_status_refresh(id, action);
                Ok(EventOutcome::Accepted(id))
            }
        }
    }

    /// Record the administrator's takeover request and handle it as a
    /// forced promotion on `ifname`.
    pub async fn force_takeover(self: &Arc<Self>, ifname: &str) -> Result<EventOutcome> {
        self.paths.write_override()?;
        self.handle_event(VrrpEvent::new(ifname, EventKind::ForceTakeover)).await
    }

    fn submit(self: &Arc<Self>, action: Action, ifname: &str, kind: EventKind, cfg: FailoverConfig) -> Result<JobId> {
        let lock = match action {
            Action::Promote { .. } => locks::VRRP_MASTER,
            Action::Demote => locks::VRRP_BACKUP,
        };
        let spec = JobSpec::new(action.method())
            .arguments(json!({ "ifname": ifname, "event": kind }))
            .lock(lock)
            .description(format!("{kind} event on {ifname}"));
        let coord = self.clone();
        let ifname = ifname.to_string();
        let id = self.queue.submit(spec, move |ctx| async move {
            let res = match action {
                Action::Promote { force } => coord.become_master(&ctx, &ifname, force, cfg).await,
                Action::Demote => coord.become_backup(&ctx, &ifname, cfg).await,
            };
            res.map_err(job_error)
        })?;
        Ok(id)
    }

    fn spawn_status_refresh(self: &Arc<Self>, id: JobId, action: Action) {
        let coord = self.clone();
        tokio::spawn(async move {
            let rec = match coord.queue.wait_record(id, None).await {
                Ok(rec) => rec,
                Err(e) => {
                    debug!(job_id = id, error = %e, "failover job vanished before status refresh");
                    return;
                }
            };
            if rec.state == JobState::Ignored {
                return;
            }
            coord.refresh_status();
            if action == Action::Demote {
                if let Err(e) = coord.env.peer.refresh_status().await {
                    warn!(error = %e, "failed to refresh failover status on the peer");
                }
            }
        });
    }

    /// Rewrite the status files from the controller state. Transitional
    /// states keep whatever the running job last wrote.
    pub fn refresh_status(&self) {
        let marker = match self.state.get() {
            ControllerState::Master => Some(StatusMarker::Master),
            ControllerState::Faulted => Some(StatusMarker::Failed),
            ControllerState::BackupIdle => None,
            ControllerState::Promoting | ControllerState::Demoting => return,
        };
        if let Err(e) = self.paths.set_marker(marker) {
            warn!(error = %e, "failed to refresh failover status files");
        }
    }

    /// Consume events until `rx` closes or `token` is cancelled. Each
    /// interface gets its own worker so events on one interface are handled
    /// in order, one transition at a time.
    pub async fn run(self: Arc<Self>, mut rx: UnboundedReceiver<VrrpEvent>, token: CancellationToken) {
        info!("failover coordinator started");
        let mut workers: HashMap<String, mpsc::UnboundedSender<VrrpEvent>> = HashMap::new();
        let mut tasks = JoinSet::new();
        loop {
            let ev = tokio::select! {
                _ = token.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            let tx = workers.entry(ev.ifname.clone()).or_insert_with(|| {
                let (tx, worker_rx) = mpsc::unbounded_channel();
                tasks.spawn(self.clone().interface_worker(ev.ifname.clone(), worker_rx, token.clone()));
                tx
            });
            if let Err(e) = tx.send(ev) {
                warn!(ifname = %e.0.ifname, "interface worker gone, dropping event");
            }
        }
        drop(workers);
        while tasks.join_next().await.is_some() {}
        info!("failover coordinator stopped");
    }

    async fn interface_worker(
        self: Arc<Self>,
        ifname: String,
        mut rx: UnboundedReceiver<VrrpEvent>,
        token: CancellationToken,
    ) {
        debug!(%ifname, "interface worker started");
        loop {
            let ev = tokio::select! {
                _ = token.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            match self.handle_event(ev).await {
                Ok(EventOutcome::Accepted(id)) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        res = self.queue.wait_record(id, None) => {
                            if let Err(e) = res {
                                debug!(job_id = id, error = %e, "lost track of failover job");
                            }
                        }
                    }
                }
                Ok(EventOutcome::Ignored(_)) => {}
                Err(e) => warn!(%ifname, error = %e, "failed to handle VRRP event"),
            }
        }
        debug!(%ifname, "interface worker stopped");
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::config::Volume;
    use crate::env::testenv::TestEnv;
    use hastor_jobs::{EventBus, JobQueueConfig, JobRecord, RedactionTable};
    use hastor_sys::LockRegistry;
    use std::collections::{BTreeMap, BTreeSet};

    /// A coordinator over fakes with `eth0` and `eth1` in critical group 1
    /// and `eth2` internal.
    pub struct Harness {
        pub t: TestEnv,
        pub coord: Arc<FailoverCoordinator>,
        pub paths: SentinelPaths,
        pub _dir: tempfile::TempDir,
    }

    impl Harness {
        /// One exported volume `tank` / `0xAB`.
        pub fn new() -> Self {
            Self::with_volumes(&[("tank", "0xAB")])
        }

        pub fn with_volumes(volumes: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let t = TestEnv::new();
            for (name, guid) in volumes {
                t.pools.add_pool(name, guid, "OFFLINE");
            }
            let cfg = FailoverConfig {
                disabled: false,
                internal_interfaces: BTreeSet::from(["eth2".to_string()]),
                critical_groups: BTreeMap::from([(1, BTreeSet::from(["eth0".to_string(), "eth1".to_string()]))]),
                volumes: volumes.iter().map(|(n, g)| Volume::new(*n, *g)).collect(),
                ..FailoverConfig::default()
            };
            let locks = LockRegistry::new(dir.path().join("locks")).unwrap();
            let qcfg = JobQueueConfig {
                log_dir: dir.path().join("jobs"),
                rescan_interval: Duration::from_millis(20),
                ..JobQueueConfig::default()
            };
            let queue = JobQueue::new(qcfg, EventBus::default(), locks, Arc::new(RedactionTable::new())).unwrap();
            let paths = SentinelPaths::under(dir.path());
            let timings = Timings {
                fenced_retry_delay: Duration::from_millis(10),
                ..Timings::default()
            };
            let coord = FailoverCoordinator::new(
                t.env.clone(),
                Arc::new(JsonState::ephemeral(cfg)),
                Arc::new(queue),
                paths.clone(),
            )
            .with_timings(timings);
            Self {
                t,
                coord: Arc::new(coord),
                paths,
                _dir: dir,
            }
        }

        /// Handle one event and wait for the job it must produce.
        pub async fn run(&self, ifname: &str, kind: EventKind) -> JobRecord {
            match self.coord.handle_event(VrrpEvent::new(ifname, kind)).await.unwrap() {
                EventOutcome::Accepted(id) => self
                    .coord
                    .queue()
                    .wait_record(id, Some(Duration::from_secs(30)))
                    .await
                    .unwrap(),
                EventOutcome::Ignored(reason) => panic!("event ignored: {reason}"),
            }
        }
    }
}
