//! The directory services health engine: one check pass, the bounded
//! recovery loop around it, and the job wrappers and periodic supervisor
//! that run both under the `ds_recovery` lock.

use std::sync::Arc;
use std::time::Duration;

use hastor_jobs::{job_log, JobError, JobId, JobQueue, JobSpec};
use hastor_sys::{locks, CallError, JsonState};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DSConfig, DsType};
use crate::error::{DsError, Result};
use crate::health::{checker_for, renew_if_due, DsEnv};
use crate::state::{DSHealthState, DsStatus, HealthState};

/// Recovery actions applied for one failing check before re-raising.
pub const MAX_RECOVER_ATTEMPTS: u32 = 3;

/// Pause between a recovery action and the next check.
pub const RECOVER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Job method running one check pass.
pub const CHECK_METHOD: &str = "directoryservices.health.check";
/// Job method running check plus bounded recovery.
pub const RECOVER_METHOD: &str = "directoryservices.health.recover";
/// Job method replacing the directory services configuration.
pub const UPDATE_METHOD: &str = "directoryservices.update";
/// Job method applying an admin override of the health record.
pub const SET_STATE_METHOD: &str = "directoryservices.health.set_state";

/// Health engine.
pub struct HealthEngine {
    env: DsEnv,
    config: Arc<JsonState<DSConfig>>,
    state: Arc<HealthState>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for HealthEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthEngine")
            .field("health", &self.state.get())
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl HealthEngine {
    /// Create an engine over `config`, publishing through `state`. The
    /// configured bind password is scrubbed from every fault message.
    pub fn new(env: DsEnv, config: Arc<JsonState<DSConfig>>, state: Arc<HealthState>) -> Self {
        remember_credential(&state, &config.snapshot());
        Self {
            env,
            config,
            state,
            max_attempts: MAX_RECOVER_ATTEMPTS,
            retry_delay: RECOVER_RETRY_DELAY,
        }
    }

    /// Override the retry bound and delay.
    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_delay = retry_delay;
        self
    }

    /// Services the checks talk to.
    pub fn env(&self) -> &DsEnv {
        &self.env
    }

    /// Current configuration.
    pub fn config(&self) -> DSConfig {
        self.config.snapshot()
    }

    /// Current health record.
    pub fn health(&self) -> DSHealthState {
        self.state.get()
    }

    /// Health record holder.
    pub fn state(&self) -> &Arc<HealthState> {
        &self.state
    }

    /// Service type to check, or `None` when the pass is skipped. A disabled
    /// configuration resets the record; a join or leave in progress leaves
    /// it alone.
    fn gate(&self, cfg: &DSConfig) -> Option<DsType> {
        let service_type = match (cfg.enabled, cfg.service_type) {
            (true, Some(t)) => t,
            _ => {
                self.state.reset();
                return None;
            }
        };
        match self.state.get().status {
            DsStatus::Joining | DsStatus::Leaving => {
                debug!(service_type = %service_type, "join or leave in progress, skipping health check");
                None
            }
            _ => Some(service_type),
        }
    }

    /// Run one check pass and return the resulting record. A failure is
    /// reflected as `FAULTED` in the record, not as an error.
    pub async fn check(&self) -> DSHealthState {
        let cfg = self.config();
        if let Some(t) = self.gate(&cfg) {
            match checker_for(t).check(&self.env, &cfg).await {
                Ok(()) => {
                    self.state.healthy(t);
                }
                Err(err) => {
                    let msg = self.state.redaction().scrub(&err.message);
                    warn!(service_type = %t, reason = %err.reason, "directory services health check failed: {msg}");
                    self.state.faulted(t, msg);
                }
            }
        }
        self.state.get()
    }

    /// Check and, on failure, apply bounded recovery.
    ///
    /// The loop re-raises the health error once the attempt bound is hit,
    /// when the same reason comes back after its recovery, or when the
    /// reason has no recovery action. A failed recovery action is raised
    /// immediately and its message becomes the published `status_msg`.
    pub async fn recover(&self) -> Result<DSHealthState> {
        let cfg = self.config();
        let Some(t) = self.gate(&cfg) else {
            return Ok(self.state.get());
        };
        let checker = checker_for(t);
        let mut attempts = 0;
        let mut last_reason = None;
        loop {
            let err = match checker.check(&self.env, &cfg).await {
                Ok(()) => {
                    self.state.healthy(t);
                    if attempts > 0 {
                        info!(service_type = %t, attempts, "directory services recovered");
                        if cfg.enable_account_cache {
                            if let Err(e) = self.env.host.fill_account_cache().await {
                                warn!(error = %e, "failed to refill directory account cache");
                            }
                        }
                    }
                    return Ok(self.state.get());
                }
                Err(err) => err,
            };

            self.state.faulted(t, err.message.clone());
            if attempts >= self.max_attempts || last_reason == Some(err.reason) || !err.reason.is_recoverable(t) {
                warn!(
                    service_type = %t,
                    reason = %err.reason,
                    attempts,
                    "giving up on directory services recovery: {}",
                    self.state.redaction().scrub(&err.message)
                );
                return Err(err.into());
            }
            last_reason = Some(err.reason);

            info!(service_type = %t, reason = %err.reason, attempt = attempts + 1, "attempting recovery");
            if let Err(e) = checker.recover(&self.env, &cfg, &err).await {
                let msg = match &e {
                    DsError::Recovery { source, .. } => source.message.clone(),
                    other => other.to_string(),
                };
                let msg = self.state.redaction().scrub(&msg);
                warn!(service_type = %t, reason = %err.reason, "recovery failed: {msg}");
                self.state.faulted(t, msg);
                return Err(e);
            }
            attempts += 1;
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// Admin override of the health record. Callers outside a job hold
    /// `ds_recovery`; [`HealthEngine::submit_set_state`] does.
    pub fn set_state(&self, service_type: Option<DsType>, status: DsStatus, msg: Option<String>) -> Result<DSHealthState> {
        DSHealthState::validate_override(status, msg.as_deref())?;
        self.state.set(DSHealthState {
            service_type,
            status,
            status_msg: msg,
        });
        Ok(self.state.get())
    }

    /// Validate and persist a new configuration. Disabling resets the
    /// health record.
    pub fn update_config(&self, new: DSConfig) -> Result<DSConfig> {
        new.validate()?;
        new.validate_update(&self.config.snapshot())?;
        remember_credential(&self.state, &new);
        self.config.replace(new.clone())?;
        info!(service_type = ?new.service_type, enabled = new.enabled, "directory services configuration updated");
        if !new.enabled {
            self.state.reset();
        }
        Ok(new)
    }

    /// Queue a check pass under the recovery lock.
    pub fn submit_check(self: &Arc<Self>, queue: &JobQueue) -> hastor_jobs::Result<JobId> {
        let engine = self.clone();
        let spec = JobSpec::new(CHECK_METHOD)
            .lock(locks::DS_RECOVERY)
            .description("Directory services health check");
        queue.submit(spec, move |ctx| async move {
            let health = engine.check().await;
            job_log!(ctx, info, "directory services status {}", health.status);
            Ok(serde_json::to_value(health)?)
        })
    }

    /// Queue check plus recovery. Refused while another one is queued or
    /// running.
    pub fn submit_recover(self: &Arc<Self>, queue: &JobQueue) -> hastor_jobs::Result<JobId> {
        self.submit_recover_inner(queue, None)
    }

    fn submit_recover_inner(self: &Arc<Self>, queue: &JobQueue, renew_window: Option<Duration>) -> hastor_jobs::Result<JobId> {
        let engine = self.clone();
        let spec = JobSpec::new(RECOVER_METHOD)
            .lock(locks::DS_RECOVERY)
            .lock_queue_size(0)
            .description("Directory services health recovery");
        queue.submit(spec, move |ctx| async move {
            if let Some(window) = renew_window {
                let cfg = engine.config();
                if cfg.enabled && cfg.uses_kerberos() {
                    match renew_if_due(&engine.env, &cfg, window).await {
                        Ok(true) => job_log!(ctx, info, "renewed system kerberos ticket"),
                        Ok(false) => {}
                        Err(e) => job_log!(ctx, warn, "kerberos ticket renewal failed: {}", e.message),
                    }
                }
            }
            let health = engine.recover().await.map_err(job_error)?;
            job_log!(ctx, info, "directory services status {}", health.status);
            Ok(serde_json::to_value(health)?)
        })
    }

    /// Queue a configuration update under the recovery lock.
    pub fn submit_update(self: &Arc<Self>, queue: &JobQueue, new: DSConfig) -> hastor_jobs::Result<JobId> {
        let engine = self.clone();
        let arguments = serde_json::to_value(&new).unwrap_or_default();
        let spec = JobSpec::new(UPDATE_METHOD)
            .lock(locks::DS_RECOVERY)
            .arguments(arguments)
            .description("Update directory services configuration");
        queue.submit(spec, move |ctx| async move {
            let cfg = engine.update_config(new).map_err(job_error)?;
            job_log!(ctx, info, "directory services configuration saved");
            Ok(serde_json::to_value(cfg)?)
        })
    }

    /// Queue an admin override under the recovery lock, so it lands after
    /// any check or recovery already running.
    pub fn submit_set_state(
        self: &Arc<Self>,
        queue: &JobQueue,
        service_type: Option<DsType>,
        status: DsStatus,
        msg: Option<String>,
    ) -> hastor_jobs::Result<JobId> {
        let engine = self.clone();
        let arguments = serde_json::json!({
            "service_type": service_type,
            "status": status,
            "status_msg": msg,
        });
        let spec = JobSpec::new(SET_STATE_METHOD)
            .lock(locks::DS_RECOVERY)
            .arguments(arguments)
            .description("Override directory services health");
        queue.submit(spec, move |ctx| async move {
            let health = engine.set_state(service_type, status, msg).map_err(job_error)?;
            job_log!(ctx, info, "directory services status set to {}", health.status);
            Ok(serde_json::to_value(health)?)
        })
    }

    /// Run a recovery pass every `interval` until `token` is cancelled,
    /// renewing the system ticket first when it expires within
    /// `renew_window`. Passes that find one already queued are skipped.
    pub async fn supervise(
        self: Arc<Self>,
        queue: Arc<JobQueue>,
        interval: Duration,
        renew_window: Duration,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "directory services supervisor started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if queue.is_halted() {
                debug!("job queue halted, stopping directory services supervisor");
                break;
            }
            match self.submit_recover_inner(&queue, Some(renew_window)) {
                Ok(id) => debug!(job_id = id, "queued periodic directory services recovery"),
                Err(JobError::AlreadyRunning { .. }) => debug!("directory services recovery already in progress"),
                Err(e) => warn!(error = %e, "failed to queue directory services recovery"),
            }
        }
        info!("directory services supervisor stopped");
    }
}

fn remember_credential(state: &HealthState, cfg: &DSConfig) {
    if let Some(secret) = cfg.credential.as_ref().and_then(|c| c.secret()) {
        state.redaction().remember(secret);
    }
}

/// Job functions surface validation failures as such and everything else
/// as a `CallError` carrying the fault reason.
fn job_error(err: DsError) -> anyhow::Error {
    match err {
        DsError::Validation(v) => v.into(),
        other => CallError::from(other).into(),
    }
}
