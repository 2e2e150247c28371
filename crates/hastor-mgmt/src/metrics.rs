//! Prometheus exporter: VRRP event verdicts, job terminal states,
//! directory services health and controller state.

use hastor_ds::{DSHealthState, DsStatus, HEALTH_TOPIC};
use hastor_failover::{ControllerState, FailoverStats};
use hastor_jobs::{EventBus, EventKind, JobState, JOBS_TOPIC};
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DS_STATUSES: [DsStatus; 5] = [
    DsStatus::Disabled,
    DsStatus::Joining,
    DsStatus::Leaving,
    DsStatus::Healthy,
    DsStatus::Faulted,
];

const CONTROLLER_STATES: [ControllerState; 5] = [
    ControllerState::BackupIdle,
    ControllerState::Promoting,
    ControllerState::Master,
    ControllerState::Demoting,
    ControllerState::Faulted,
];

/// Metrics owned by the daemon, on a private registry.
pub struct MgmtMetrics {
    registry: Registry,
    vrrp_events: IntCounterVec,
    jobs_finished: IntCounterVec,
    ds_health: IntGaugeVec,
    controller_state: IntGaugeVec,
    /// Last `(accepted, ignored)` folded into `vrrp_events`.
    seen: Mutex<(u64, u64)>,
}

impl std::fmt::Debug for MgmtMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MgmtMetrics").finish_non_exhaustive()
    }
}

impl MgmtMetrics {
    /// Create and register every metric.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("hastor".to_string()), None)?;
        let vrrp_events = IntCounterVec::new(
            Opts::new("vrrp_events_total", "VRRP events by pipeline verdict"),
            &["verdict"],
        )?;
        let jobs_finished = IntCounterVec::new(
            Opts::new("jobs_finished_total", "Jobs reaching a terminal state"),
            &["method", "state"],
        )?;
        let ds_health = IntGaugeVec::new(
            Opts::new("directoryservices_health", "1 for the current directory services status"),
            &["status"],
        )?;
        let controller_state = IntGaugeVec::new(
            Opts::new("failover_state", "1 for the current controller state"),
            &["state"],
        )?;
        registry.register(Box::new(vrrp_events.clone()))?;
        registry.register(Box::new(jobs_finished.clone()))?;
        registry.register(Box::new(ds_health.clone()))?;
        registry.register(Box::new(controller_state.clone()))?;

        let metrics = Self {
            registry,
            vrrp_events,
            jobs_finished,
            ds_health,
            controller_state,
            seen: Mutex::new((0, 0)),
        };
        metrics.set_health(&DSHealthState::disabled());
        Ok(metrics)
    }

    /// Count a job that reached `state`.
    pub fn job_finished(&self, method: &str, state: JobState) {
        if state.is_terminal() {
            self.jobs_finished
                .with_label_values(&[method, &state.to_string()])
                .inc();
        }
    }

    /// Reflect the published health record.
    pub fn set_health(&self, health: &DSHealthState) {
        for status in DS_STATUSES {
            let v = i64::from(status == health.status);
            self.ds_health.with_label_values(&[&status.to_string()]).set(v);
        }
    }

    /// Fold the coordinator's counters and state into the exported values.
    pub fn sync_failover(&self, stats: &FailoverStats) {
        if let Ok(mut seen) = self.seen.lock() {
            let (accepted, ignored) = *seen;
            self.vrrp_events
                .with_label_values(&["accepted"])
                .inc_by(stats.accepted.saturating_sub(accepted));
            self.vrrp_events
                .with_label_values(&["ignored"])
                .inc_by(stats.ignored.saturating_sub(ignored));
            *seen = (stats.accepted.max(accepted), stats.ignored.max(ignored));
        }
        for state in CONTROLLER_STATES {
            let v = i64::from(state == stats.state);
            self.controller_state.with_label_values(&[&state.to_string()]).set(v);
        }
    }

    /// Render the Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        match encoder.encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode metrics");
                String::new()
            }
        }
    }

    /// Follow job and health events on `bus` until `token` is cancelled.
    pub async fn observe(&self, bus: EventBus, token: CancellationToken) {
        let mut events = bus.subscribe_all();
        loop {
            let ev = tokio::select! {
                _ = token.cancelled() => break,
                ev = events.recv() => match ev {
                    Ok(ev) => ev,
                    Err(_) => break,
                },
            };
            match ev.topic.as_str() {
                JOBS_TOPIC if ev.kind == EventKind::Changed => {
                    let state = serde_json::from_value::<JobState>(ev.fields["state"].clone());
                    let method = ev.fields["method"].as_str().unwrap_or_default();
                    if let Ok(state) = state {
                        self.job_finished(method, state);
                    }
                }
                HEALTH_TOPIC => match serde_json::from_value::<DSHealthState>(ev.fields.clone()) {
                    Ok(health) => self.set_health(&health),
                    Err(e) => debug!(error = %e, "unexpected health event payload"),
                },
                _ => {}
            }
        }
    }
}
