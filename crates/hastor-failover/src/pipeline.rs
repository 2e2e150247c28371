//! Pre-acceptance pipeline: decides whether an event becomes a promotion,
//! a demotion or nothing at all.

use hastor_jobs::{JobQueue, JobState};
use tracing::{debug, info, warn};

use crate::config::FailoverConfig;
use crate::env::FailoverEnv;
use crate::event::{EventKind, VrrpEvent};

/// Job method for promotions.
pub const MASTER_METHOD: &str = "failover.events.vrrp_master";
/// Job method for demotions.
pub const BACKUP_METHOD: &str = "failover.events.vrrp_backup";

/// What an accepted event does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Become master. `force` skips group quorum and forces fencing.
    Promote {
        /// Forced takeover.
        force: bool,
    },
    /// Become backup.
    Demote,
}

impl Action {
    /// Job method running this action.
    pub fn method(self) -> &'static str {
        match self {
            Action::Promote { .. } => MASTER_METHOD,
            Action::Demote => BACKUP_METHOD,
        }
    }
}

/// Pipeline verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Dispatch a job.
    Accept(Action),
    /// Drop the event, with the reason.
    Ignore(String),
}

/// Refresh every volume's status from the pool service. Pools the service
/// does not report are `OFFLINE`; lookup failures keep the stored status.
pub async fn refresh_volumes(env: &FailoverEnv, cfg: &mut FailoverConfig) {
    for vol in &mut cfg.volumes {
        match env.pools.status(&vol.name).await {
            Ok(Some(info)) => vol.status = info.status,
            Ok(None) => vol.status = "OFFLINE".to_string(),
            Err(e) => warn!(volume = %vol.name, error = %e, "failed to query volume status"),
        }
    }
}

/// Run the pipeline for `ev` against `cfg`, whose volume statuses must be
/// current.
pub async fn evaluate(env: &FailoverEnv, queue: &JobQueue, cfg: &FailoverConfig, ev: &VrrpEvent) -> Decision {
    let ignore = |reason: String| {
        info!(ifname = %ev.ifname, event = %ev.kind, %reason, "ignoring VRRP event");
        Decision::Ignore(reason)
    };

    let action = match ev.kind {
        EventKind::Init => return ignore("INIT events do not trigger failover".to_string()),
        EventKind::Master => Action::Promote { force: false },
        EventKind::ForceTakeover => Action::Promote { force: true },
        EventKind::Backup => Action::Demote,
    };

    if queue.is_halted() {
        return ignore("job queue is halted".to_string());
    }
    if !queue.find(action.method(), JobState::Running).is_empty() {
        return ignore(format!("{} already running", action.method()));
    }

    if ev.kind == EventKind::ForceTakeover {
        return Decision::Accept(action);
    }

    if cfg.is_internal(&ev.ifname) {
        return ignore(format!("{} is an internal interface", ev.ifname));
    }
    if cfg.is_non_critical(&ev.ifname) {
        return ignore(format!("{} is a non-critical interface", ev.ifname));
    }

    if cfg.disabled {
        if !cfg.master_preferred {
            return ignore("failover is disabled and this node is not the preferred master".to_string());
        }
        let peer_is_master = match env.peer.is_master().await {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "peer unreachable, assuming it is not master");
                false
            }
        };
        if peer_is_master {
            return ignore("failover is disabled and the peer is master".to_string());
        }
        info!(ifname = %ev.ifname, "failover disabled on preferred master, forcing takeover");
        return Decision::Accept(Action::Promote { force: true });
    }

    if ev.kind == EventKind::Master && !cfg.volumes.is_empty() && cfg.volumes.iter().all(|v| v.is_imported()) {
        return ignore("every volume is already imported".to_string());
    }

    Decision::Accept(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Volume;
    use crate::env::testenv::TestEnv;
    use hastor_jobs::{EventBus, JobQueueConfig, JobSpec, RedactionTable};
    use hastor_sys::LockRegistry;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::time::Duration;

    fn queue(dir: &std::path::Path) -> JobQueue {
        let locks = LockRegistry::new(dir.join("locks")).unwrap();
        let cfg = JobQueueConfig {
            log_dir: dir.join("jobs"),
            rescan_interval: Duration::from_millis(20),
            ..JobQueueConfig::default()
        };
        JobQueue::new(cfg, EventBus::default(), locks, Arc::new(RedactionTable::new())).unwrap()
    }

    fn cfg() -> FailoverConfig {
        FailoverConfig {
            disabled: false,
            internal_interfaces: BTreeSet::from(["eth2".to_string()]),
            critical_groups: BTreeMap::from([(1, BTreeSet::from(["eth0".to_string()]))]),
            non_critical_interfaces: BTreeSet::from(["eth9".to_string()]),
            volumes: vec![Volume::new("tank", "0xAB")],
            ..FailoverConfig::default()
        }
    }

    fn ev(ifname: &str, kind: EventKind) -> VrrpEvent {
        VrrpEvent::new(ifname, kind)
    }

    #[tokio::test]
    async fn test_filters() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let t = TestEnv::new();
        let c = cfg();

        assert_eq!(
            evaluate(&t.env, &q, &c, &ev("eth0", EventKind::Master)).await,
            Decision::Accept(Action::Promote { force: false })
        );
        assert_eq!(evaluate(&t.env, &q, &c, &ev("eth0", EventKind::Backup)).await, Decision::Accept(Action::Demote));
        for (ifname, kind) in [("eth2", EventKind::Master), ("eth9", EventKind::Backup), ("eth0", EventKind::Init)] {
            assert!(matches!(evaluate(&t.env, &q, &c, &ev(ifname, kind)).await, Decision::Ignore(_)));
        }
        assert_eq!(
            evaluate(&t.env, &q, &c, &ev("eth2", EventKind::ForceTakeover)).await,
            Decision::Accept(Action::Promote { force: true })
        );
    }

    #[tokio::test]
    async fn test_master_with_everything_imported_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let t = TestEnv::new();
        t.pools.add_pool("tank", "0xAB", "ONLINE");
        let mut c = cfg();
        refresh_volumes(&t.env, &mut c).await;
        assert_eq!(c.volumes[0].status, "ONLINE");
        assert!(matches!(evaluate(&t.env, &q, &c, &ev("eth0", EventKind::Master)).await, Decision::Ignore(_)));
    }

    #[tokio::test]
    async fn test_disabled_preferred_master_takes_over() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let t = TestEnv::new();
        let mut c = cfg();
        c.disabled = true;

        assert!(matches!(evaluate(&t.env, &q, &c, &ev("eth0", EventKind::Master)).await, Decision::Ignore(_)));

        c.master_preferred = true;
        t.peer.set_master(true);
        assert!(matches!(evaluate(&t.env, &q, &c, &ev("eth0", EventKind::Backup)).await, Decision::Ignore(_)));

        t.peer.set_master(false);
        assert_eq!(
            evaluate(&t.env, &q, &c, &ev("eth0", EventKind::Backup)).await,
            Decision::Accept(Action::Promote { force: true })
        );

        t.peer.set_unreachable(true);
        assert_eq!(
            evaluate(&t.env, &q, &c, &ev("eth0", EventKind::Master)).await,
            Decision::Accept(Action::Promote { force: true })
        );
    }

    #[tokio::test]
    async fn test_running_job_of_same_kind_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let t = TestEnv::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let id = q
            .submit(JobSpec::new(MASTER_METHOD), move |_ctx| async move {
                let _ = rx.await;
                Ok(())
            })
            .unwrap();
        while q.get(id).unwrap().state != JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let c = cfg();
        assert!(matches!(evaluate(&t.env, &q, &c, &ev("eth1", EventKind::Master)).await, Decision::Ignore(_)));
        assert_eq!(evaluate(&t.env, &q, &c, &ev("eth0", EventKind::Backup)).await, Decision::Accept(Action::Demote));
        tx.send(()).unwrap();
        q.wait_record(id, Some(Duration::from_secs(5))).await.unwrap();
    }

    #[tokio::test]
    async fn test_halted_queue_ignores_everything() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let t = TestEnv::new();
        q.halt();
        assert!(matches!(
            evaluate(&t.env, &q, &cfg(), &ev("eth0", EventKind::ForceTakeover)).await,
            Decision::Ignore(_)
        ));
    }
}
