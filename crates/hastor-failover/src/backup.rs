//! Becoming BACKUP: give up the VIPs, export pools under a watchdog, and
//! settle into standby.

use std::sync::atomic::Ordering;

use hastor_jobs::{job_log, JobContext, JobOutcome};
use hastor_sys::{CallError, VrrpState};
use serde_json::json;

use crate::config::FailoverConfig;
use crate::coordinator::FailoverCoordinator;
use crate::error::{FailoverError, Result};

impl FailoverCoordinator {
    /// Give up on a clean demotion: stop starting jobs and reboot now.
    fn reboot_now(&self, ctx: &JobContext, why: &str) {
        job_log!(ctx, error, "{}, rebooting", why);
        self.queue.halt();
        if let Err(e) = self.env.rebooter.reboot() {
            job_log!(ctx, error, "reboot request failed: {}", e);
        }
    }

    async fn export_volumes(&self, cfg: &FailoverConfig) -> std::result::Result<(), CallError> {
        for vol in cfg.volumes.iter().filter(|v| v.is_imported()) {
            self.env.pools.export(&vol.name, true).await?;
        }
        Ok(())
    }

    async fn settle_backup(&self, ctx: &JobContext) {
        for svc in &self.plan.non_critical {
            if let Err(e) = self.env.services.stop(svc).await {
                job_log!(ctx, warn, "failed to stop {}: {}", svc, e);
            }
        }
        if let Err(e) = self.env.services.restart(&self.plan.syslog, self.timings.restart_timeout).await {
            job_log!(ctx, warn, "failed to restart {}: {}", self.plan.syslog, e);
        }
        if let Err(e) = self.env.host.etc_generate("cron").await {
            job_log!(ctx, warn, "failed to generate cron configuration: {}", e);
        }
        match self.env.services.enabled(&self.plan.ssh).await {
            Ok(true) => {
                if let Err(e) = self.env.services.restart(&self.plan.ssh, self.timings.restart_timeout).await {
                    job_log!(ctx, warn, "failed to restart {}: {}", self.plan.ssh, e);
                }
            }
            Ok(false) => {}
            Err(e) => job_log!(ctx, warn, "failed to query {}: {}", self.plan.ssh, e),
        }
        job_log!(ctx, info, "syncing encryption keys from the MASTER node");
        if let Err(e) = self.env.peer.sync_keys().await {
            job_log!(ctx, warn, "failed to sync encryption keys: {}", e);
        }
    }

    /// Demotion job body. Runs under the `vrrp_backup` lock; not abortable
    /// once the watchdog is about to be armed.
    pub(crate) async fn become_backup(&self, ctx: &JobContext, ifname: &str, cfg: FailoverConfig) -> Result<JobOutcome> {
        let _serial = self.transition.lock().await;
        if self.queue.is_halted() {
            return Ok(JobOutcome::Ignored("node is rebooting".to_string()));
        }

        let active = self.siblings_in(ctx, &cfg, ifname, VrrpState::Master).await;
        if !active.is_empty() {
            job_log!(
                ctx,
                warn,
                "received BACKUP event for {} but {} still MASTER, ignoring",
                ifname,
                active.join(", ")
            );
            ctx.set_progress(None, Some("IGNORED"));
            return Ok(JobOutcome::Ignored(format!("{} still MASTER", active.join(", "))));
        }
        job_log!(ctx, warn, "entering BACKUP on {}", ifname);
        let pending = self.state.begin_demotion();

        if let Err(e) = self.env.fencing.stop().await {
            job_log!(ctx, warn, "failed to stop fenced: {}", e);
        }
        job_log!(ctx, info, "blocking network traffic");
        let heartbeat: Vec<String> = cfg.internal_interfaces.iter().cloned().collect();
        if let Err(e) = self.env.firewall.drop_all(&heartbeat).await {
            job_log!(ctx, error, "failed to block network traffic: {}", e);
        }
        job_log!(ctx, info, "transitioning all VIPs off this node");
        if let Err(e) = self.env.services.restart(&self.plan.keepalived, self.timings.restart_timeout).await {
            job_log!(ctx, error, "failed to restart {}: {}", self.plan.keepalived, e);
        }

        ctx.shield()?;
        let epoch = u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX);
        if let Err(e) = self.paths.write_watchdog_alert(epoch) {
            job_log!(ctx, warn, "failed to write watchdog alert file: {}", e);
        }
        if let Err(e) = self.env.watchdog.arm(self.timings.watchdog_secs).await {
            job_log!(ctx, error, "failed to arm watchdog: {}", e);
        }

        let limit = self.timings.export_timeout;
        match tokio::time::timeout(limit, self.export_volumes(&cfg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.reboot_now(ctx, &format!("volume export failed: {}", e.message));
                pending.stall();
                return Err(FailoverError::ExportFailed(e));
            }
            Err(_) => {
                self.reboot_now(ctx, &format!("volume export did not finish within {}s", limit.as_secs()));
                pending.stall();
                return Err(FailoverError::ExportTimeout { secs: limit.as_secs() });
            }
        }

        if let Err(e) = self.env.watchdog.disarm().await {
            job_log!(ctx, warn, "failed to disarm watchdog: {}", e);
        }
        if let Err(e) = self.paths.clear_watchdog_alert() {
            job_log!(ctx, warn, "failed to remove watchdog alert file: {}", e);
        }

        self.settle_backup(ctx).await;

        // The peer unlocked the drives; a later promotion must not retry.
        self.sed_unlocked.store(true, Ordering::SeqCst);
        self.mark(ctx, None);
        pending.demoted();
        job_log!(ctx, info, "successfully became the BACKUP node");
        ctx.set_progress(None, Some("SUCCESS"));
        Ok(JobOutcome::Completed(json!("SUCCESS")))
    }
}
