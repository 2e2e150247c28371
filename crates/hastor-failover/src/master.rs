//! Becoming MASTER: quorum, fencing, pool import and service commit.

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use hastor_jobs::{job_log, JobContext, JobOutcome};
use hastor_sys::{Errno, FencingMode, ImportOptions, VrrpState};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{FailoverConfig, Volume};
use crate::coordinator::FailoverCoordinator;
use crate::error::{FailoverError, Result};
use crate::sentinel::StatusMarker;

/// Mount root for imported pools.
pub const IMPORT_ALTROOT: &str = "/mnt";

/// Fencing exit code while the remote node still holds the reservations.
pub const FENCED_REMOTE_RUNNING: i32 = 2;

/// Advskew applied to the interface's VIPs after fencing exits with `code`,
/// or `None` when fencing succeeded.
pub fn fencing_advskew(code: i32) -> Option<u32> {
    match code {
        0 => None,
        1 => Some(201),
        2 => Some(202),
        3 => Some(203),
        5 => Some(205),
        _ => Some(204),
    }
}

fn fencing_reason(code: i32) -> &'static str {
    match code {
        1 => "failed to register keys on disks",
        2 => "fencing is running on the remote node",
        3 => "10% or more of the disks failed to be reserved",
        5 => "fencing hit an unexpected fatal error",
        _ => "fencing exited with an unexpected code",
    }
}

impl FailoverCoordinator {
    /// Sibling interfaces of `ifname` currently in `state`.
    pub(crate) async fn siblings_in(&self, ctx: &JobContext, cfg: &FailoverConfig, ifname: &str, state: VrrpState) -> Vec<String> {
        let mut hits = Vec::new();
        for sibling in cfg.siblings(ifname) {
            match self.env.interfaces.vrrp_state(&sibling).await {
                Ok(Some(s)) if s == state => hits.push(sibling),
                Ok(Some(_)) => {}
                Ok(None) => job_log!(ctx, info, "{} has no VRRP instance, treating as down", sibling),
                Err(e) => job_log!(ctx, warn, "failed to read VRRP state of {}: {}", sibling, e),
            }
        }
        hits
    }

    pub(crate) fn mark(&self, ctx: &JobContext, marker: Option<StatusMarker>) {
        if let Err(e) = self.paths.set_marker(marker) {
            job_log!(ctx, warn, "failed to update failover status file: {}", e);
        }
    }

    /// Stop any running fencing daemon and start it again. Returns the
    /// start exit code; a start that could not be run counts as unexpected.
    async fn start_fencing(&self, ctx: &JobContext, force: bool) -> i32 {
        if let Err(e) = self.env.fencing.stop().await {
            job_log!(ctx, warn, "failed to stop fenced: {}", e);
        }
        let mode = if force { FencingMode::Force } else { FencingMode::Normal };
        let mut attempts = 0;
        let mut waited = Duration::ZERO;
        loop {
            let code = match self.env.fencing.start(mode).await {
                Ok(code) => code,
                Err(e) => {
                    job_log!(ctx, error, "failed to start fenced: {}", e);
                    -1
                }
            };
            if force || code != FENCED_REMOTE_RUNNING || attempts >= self.timings.fenced_retries {
                return code;
            }
            attempts += 1;
            tokio::time::sleep(self.timings.fenced_retry_delay).await;
            waited += self.timings.fenced_retry_delay;
            job_log!(
                ctx,
                warn,
                "fenced still running on the remote node, retrying (waited {:.1}s)",
                waited.as_secs_f64()
            );
        }
    }

    async fn demote_vips(&self, ctx: &JobContext, ifname: &str, advskew: u32) {
        let vhids = match self.env.interfaces.list_vhids(ifname).await {
            Ok(v) => v,
            Err(e) => {
                job_log!(ctx, error, "failed to list virtual hosts on {}: {}", ifname, e);
                return;
            }
        };
        for vhid in vhids {
            if let Err(e) = self.env.interfaces.set_advskew(ifname, vhid, advskew).await {
                job_log!(ctx, error, "failed to set advskew {} on {} vhid {}: {}", advskew, ifname, vhid, e);
            }
        }
    }

    async fn import_volume(&self, ctx: &JobContext, vol: &Volume) -> hastor_sys::CallResult<()> {
        let opts = ImportOptions {
            altroot: Some(IMPORT_ALTROOT.to_string()),
            cachefile: Some(self.paths.zpool_cache.clone()),
            force: false,
        };
        match self.env.pools.import_by_guid(&vol.guid, &opts).await {
            Err(e) if e.errno == Errno::ENOENT => {
                job_log!(ctx, warn, "import of {} with cache file failed ({}), retrying without", vol.name, e.message);
                let opts = ImportOptions { cachefile: None, ..opts };
                self.env.pools.import_by_guid(&vol.guid, &opts).await
            }
            res => res,
        }
    }

    async fn unlock_sed_once(&self, ctx: &JobContext) {
        if self.sed_unlocked.load(Ordering::SeqCst) {
            return;
        }
        match self.env.host.sed_unlock_all().await {
            Ok(()) => {
                self.sed_unlocked.store(true, Ordering::SeqCst);
                job_log!(ctx, info, "unlocked self-encrypting disks");
            }
            Err(e) => job_log!(ctx, error, "failed to unlock SED disk(s): {}", e),
        }
    }

    async fn commit_master(&self, ctx: &JobContext) {
        for group in ["rc", "system_dataset", "ssl"] {
            if let Err(e) = self.env.host.etc_generate(group).await {
                job_log!(ctx, error, "failed to generate {} configuration: {}", group, e);
            }
        }
        if let Err(e) = self.env.host.sync_dns().await {
            job_log!(ctx, warn, "failed to sync DNS configuration: {}", e);
        }

        let timeout = self.timings.restart_timeout;
        if let Err(e) = self.env.services.restart(&self.plan.http, timeout).await {
            job_log!(ctx, error, "failed to restart {}: {}", self.plan.http, e);
        }

        job_log!(ctx, info, "restarting critical services");
        let services = &self.env.services;
        let restarts = self.plan.critical.iter().map(|svc| async move {
            let res = tokio::time::timeout(timeout, services.restart(svc, timeout)).await;
            (svc, res)
        });
        for (svc, res) in join_all(restarts).await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => job_log!(ctx, error, "failed to restart {}: {}", svc, e),
                Err(_) => job_log!(ctx, error, "restart of {} timed out after {}s", svc, timeout.as_secs()),
            }
        }

        job_log!(ctx, info, "allowing network traffic");
        if let Err(e) = self.env.firewall.accept_all().await {
            job_log!(ctx, error, "failed to allow network traffic: {}", e);
        }
        if let Err(e) = self.env.host.etc_generate("cron").await {
            job_log!(ctx, error, "failed to generate cron configuration: {}", e);
        }

        let env = self.env.clone();
        let non_critical = self.plan.non_critical.clone();
        tokio::spawn(async move {
            for svc in &non_critical {
                if let Err(e) = env.services.restart(svc, timeout).await {
                    warn!(service = %svc, error = %e, "failed to restart non-critical service");
                }
            }
            if let Err(e) = env.host.start_vms().await {
                warn!(error = %e, "failed to start virtual machines");
            }
            info!("non-critical services restarted");
        });
    }

    /// Promotion job body. Runs under the `vrrp_master` lock.
    pub(crate) async fn become_master(
        &self,
        ctx: &JobContext,
        ifname: &str,
        force: bool,
        cfg: FailoverConfig,
    ) -> Result<JobOutcome> {
        let _serial = self.transition.lock().await;
        if self.queue.is_halted() {
            return Ok(JobOutcome::Ignored("node is rebooting".to_string()));
        }
        ctx.set_progress(None, Some("ELECTING"));

        if force {
            job_log!(ctx, warn, "forcefully taking over as the MASTER node");
        } else {
            let active = self.siblings_in(ctx, &cfg, ifname, VrrpState::Backup).await;
            if !active.is_empty() {
                job_log!(
                    ctx,
                    warn,
                    "received MASTER event for {} but {} still active on the other node, ignoring",
                    ifname,
                    active.join(", ")
                );
                ctx.set_progress(None, Some("IGNORED"));
                return Ok(JobOutcome::Ignored(format!("{} still BACKUP", active.join(", "))));
            }
            job_log!(ctx, warn, "entering MASTER on {}", ifname);
        }

        self.mark(ctx, Some(StatusMarker::Electing));
        let pending = self.state.begin_promotion();

        let code = self.start_fencing(ctx, force).await;
        if let Some(advskew) = fencing_advskew(code) {
            if !matches!(code, 1 | 2 | 3 | 5) {
                job_log!(ctx, warn, "unmapped fencing exit code {}, treating as {}", code, advskew);
            }
            job_log!(ctx, error, "{} (code {}), exiting", fencing_reason(code), code);
            self.demote_vips(ctx, ifname, advskew).await;
            ctx.set_progress(None, Some("ERROR"));
            self.mark(ctx, Some(StatusMarker::Failed));
            let err = FailoverError::Fencing { code, advskew };
            pending.fault(err.to_string());
            return Err(err);
        }

        if cfg.volumes.is_empty() {
            job_log!(ctx, info, "no volumes configured, nothing to import");
            self.mark(ctx, Some(StatusMarker::Master));
            pending.promoted();
            ctx.set_progress(None, Some("SUCCESS"));
            return Ok(JobOutcome::Completed(json!("INFO")));
        }

        if let Err(e) = self.paths.apply_cachefile_policy() {
            job_log!(ctx, warn, "pool cache file policy failed: {}", e);
        }
        self.unlock_sed_once(ctx).await;

        ctx.set_progress(None, Some("IMPORTING"));
        self.mark(ctx, Some(StatusMarker::Importing));

        let mut failed = Vec::new();
        for vol in &cfg.volumes {
            job_log!(ctx, info, "importing {}", vol.name);
            match self.import_volume(ctx, vol).await {
                Ok(()) => {
                    if let Err(e) = self.env.pools.unlock_datasets(&vol.name).await {
                        job_log!(ctx, error, "failed to unlock encrypted datasets on {}: {}", vol.name, e.message);
                    }
                }
                Err(e) => {
                    job_log!(ctx, error, "failed to import {} with guid {}: {}", vol.name, vol.guid, e.message);
                    failed.push(format!("{}: {}", vol.name, e.message));
                }
            }
        }
        if failed.len() == cfg.volumes.len() {
            job_log!(ctx, error, "all volumes failed to import");
            ctx.set_progress(None, Some("ERROR"));
            self.mark(ctx, Some(StatusMarker::Failed));
            let err = FailoverError::AllImportsFailed { failed };
            pending.fault(err.to_string());
            return Err(err);
        }
        if !failed.is_empty() {
            job_log!(ctx, error, "{} volume(s) failed to import, continuing with the rest", failed.len());
        }
        job_log!(ctx, info, "volume imports complete");

        self.commit_master(ctx).await;

        if let Err(e) = self.paths.clear_override() {
            job_log!(ctx, warn, "failed to remove takeover override: {}", e);
        }
        self.mark(ctx, Some(StatusMarker::Master));
        pending.promoted();
        job_log!(ctx, info, "failover event complete");
        ctx.set_progress(None, Some("SUCCESS"));
        Ok(JobOutcome::Completed(json!("SUCCESS")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testutil::Harness;
    use crate::event::EventKind;
    use crate::state::ControllerState;
    use hastor_jobs::JobState;
    use hastor_sys::{CallError, PoolService};

    #[test]
    fn test_fencing_advskew_mapping() {
        assert_eq!(fencing_advskew(0), None);
        for (code, skew) in [(1, 201), (2, 202), (3, 203), (4, 204), (5, 205), (7, 204), (-1, 204)] {
            assert_eq!(fencing_advskew(code), Some(skew), "code {code}");
        }
    }

    #[tokio::test]
    async fn test_fencing_failure_demotes_vips() {
        let h = Harness::new();
        h.t.interfaces.set("eth0", VrrpState::Master, &[10, 11]);
        h.t.fencing.script(&[3]);
        let rec = h.run("eth0", EventKind::Master).await;
        assert_eq!(rec.state, JobState::Failed);
        assert_eq!(rec.progress.description.as_deref(), Some("ERROR"));
        assert_eq!(
            h.t.interfaces.advskews(),
            vec![("eth0".to_string(), 10, 203), ("eth0".to_string(), 11, 203)]
        );
        assert_eq!(h.t.firewall.accept_count(), 0);
        assert_eq!(h.coord.state(), ControllerState::Faulted);
        assert!(h.paths.failed.exists());
        assert_eq!(h.t.pools.pool("tank").unwrap().status, "OFFLINE");
    }

    #[tokio::test]
    async fn test_fenced_remote_running_is_retried() {
        let h = Harness::new();
        h.t.fencing.script(&[2, 2, 0]);
        let rec = h.run("eth0", EventKind::Master).await;
        assert_eq!(rec.state, JobState::Success);
        let starts = h.t.fencing.calls().iter().filter(|c| *c == "start NORMAL").count();
        assert_eq!(starts, 3);
    }

    #[tokio::test]
    async fn test_force_takeover_skips_quorum_and_forces_fencing() {
        let h = Harness::new();
        h.t.interfaces.set("eth1", VrrpState::Backup, &[]);
        let rec = h.run("eth0", EventKind::ForceTakeover).await;
        assert_eq!(rec.state, JobState::Success);
        assert_eq!(h.t.fencing.calls(), vec!["stop", "start FORCE"]);
    }

    #[tokio::test]
    async fn test_stale_cachefile_retried_without_cache() {
        let h = Harness::new();
        h.t.pools.stale_cachefile("0xAB");
        let rec = h.run("eth0", EventKind::Master).await;
        assert_eq!(rec.state, JobState::Success);
        let imports: Vec<String> = h.t.pools.calls().into_iter().filter(|c| c.starts_with("import")).collect();
        assert_eq!(imports.len(), 2);
        assert!(imports[1].ends_with("cachefile=none"));
        assert_eq!(h.t.pools.pool("tank").unwrap().status, "ONLINE");
    }

    #[tokio::test]
    async fn test_partial_import_continues() {
        let h = Harness::with_volumes(&[("tank", "0xAB"), ("dozer", "0xCD")]);
        h.t.pools.fail_import("0xCD", CallError::new(Errno::EBUSY, "pool is busy"));
        h.t.pools.fail_unlock("tank");
        let rec = h.run("eth0", EventKind::Master).await;
        assert_eq!(rec.state, JobState::Success);
        assert_eq!(h.t.firewall.accept_count(), 1);
        assert_eq!(h.coord.state(), ControllerState::Master);
    }

    #[tokio::test]
    async fn test_all_imports_failed() {
        let h = Harness::with_volumes(&[("tank", "0xAB"), ("dozer", "0xCD")]);
        h.t.pools.fail_import("0xAB", CallError::new(Errno::EBUSY, "pool is busy"));
        h.t.pools.fail_import("0xCD", CallError::new(Errno::EBUSY, "pool is busy"));
        let rec = h.run("eth0", EventKind::Master).await;
        assert_eq!(rec.state, JobState::Failed);
        assert!(rec.error.unwrap().contains("all volumes failed to import"));
        assert_eq!(h.t.firewall.accept_count(), 0);
        assert!(h.paths.failed.exists());
    }

    #[tokio::test]
    async fn test_no_volumes_completes_with_info() {
        let h = Harness::with_volumes(&[]);
        let rec = h.run("eth0", EventKind::Master).await;
        assert_eq!(rec.state, JobState::Success);
        assert_eq!(rec.result, Some(json!("INFO")));
        assert!(h.t.pools.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sed_unlocked_once_per_process() {
        let h = Harness::new();
        assert_eq!(h.run("eth0", EventKind::Master).await.state, JobState::Success);
        h.t.pools.export("tank", true).await.unwrap();
        assert_eq!(h.run("eth0", EventKind::Master).await.state, JobState::Success);
        assert_eq!(h.t.host.count("sed_unlock_all"), 1);
    }

    #[tokio::test]
    async fn test_failed_sed_unlock_is_retried_next_promotion() {
        let h = Harness::new();
        h.t.host.fail("sed_unlock_all");
        assert_eq!(h.run("eth0", EventKind::Master).await.state, JobState::Success);
        h.t.pools.export("tank", true).await.unwrap();
        h.run("eth0", EventKind::Master).await;
        assert_eq!(h.t.host.count("sed_unlock_all"), 2);
    }

    #[tokio::test]
    async fn test_commit_restarts_services_and_removes_override() {
        let h = Harness::new();
        h.paths.write_override().unwrap();
        h.t.services.fail_start("nfs", "exports invalid");
        let rec = h.run("eth0", EventKind::Master).await;
        assert_eq!(rec.state, JobState::Success);
        let restarted = h.t.services.calls_for("restart");
        assert_eq!(restarted[0], "http");
        for svc in ["iscsitarget", "cifs", "nfs"] {
            assert!(restarted.iter().any(|s| s == svc), "{svc} not restarted");
        }
        assert_eq!(h.t.host.count("etc_generate rc"), 1);
        assert_eq!(h.t.host.count("sync_dns"), 1);
        assert!(!h.paths.override_file.exists());
        assert!(h.paths.killcache.exists());
    }
}
