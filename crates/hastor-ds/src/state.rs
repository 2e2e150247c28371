//! The published directory services health record.

use hastor_jobs::{EventBus, EventKind, RedactionTable};
use hastor_sys::ValidationErrors;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::DsType;

/// Topic carrying health transitions.
pub const HEALTH_TOPIC: &str = "directoryservices.health";

/// Directory services status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsStatus {
    /// No service configured or enabled.
    Disabled,
    /// A join is in progress.
    Joining,
    /// A leave is in progress.
    Leaving,
    /// Last health pass succeeded.
    Healthy,
    /// Last health pass failed.
    Faulted,
}

impl std::fmt::Display for DsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DsStatus::Disabled => "DISABLED",
            DsStatus::Joining => "JOINING",
            DsStatus::Leaving => "LEAVING",
            DsStatus::Healthy => "HEALTHY",
            DsStatus::Faulted => "FAULTED",
        })
    }
}

/// Health record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DSHealthState {
    /// Service the record describes.
    pub service_type: Option<DsType>,
    /// Status.
    pub status: DsStatus,
    /// Fault message; set only when `FAULTED`.
    pub status_msg: Option<String>,
}

impl DSHealthState {
    /// `{null, DISABLED, null}`.
    pub fn disabled() -> Self {
        Self {
            service_type: None,
            status: DsStatus::Disabled,
            status_msg: None,
        }
    }

    /// Validate an admin override: a message is required for `FAULTED`
    /// and forbidden otherwise.
    pub fn validate_override(status: DsStatus, msg: Option<&str>) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        match (status, msg) {
            (DsStatus::Faulted, None) => {
                errors.add("directoryservices.health.set_state.status_msg", "Status message is required for FAULTED.");
            }
            (DsStatus::Faulted, Some(_)) | (_, None) => {}
            (_, Some(_)) => {
                errors.add(
                    "directoryservices.health.set_state.status_msg",
                    "Status message may only be set for FAULTED.",
                );
            }
        }
        errors.check()
    }
}

impl Default for DSHealthState {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Holder of the current health record. Every change is broadcast on
/// [`HEALTH_TOPIC`]; setting an identical record emits nothing. Fault
/// messages are scrubbed of known secrets before they are stored.
#[derive(Debug)]
pub struct HealthState {
    current: Mutex<DSHealthState>,
    bus: EventBus,
    redaction: Arc<RedactionTable>,
}

impl HealthState {
    /// Start as `{null, DISABLED, null}`.
    pub fn new(bus: EventBus, redaction: Arc<RedactionTable>) -> Self {
        Self {
            current: Mutex::new(DSHealthState::disabled()),
            bus,
            redaction,
        }
    }

    /// Table used to scrub fault messages.
    pub fn redaction(&self) -> &Arc<RedactionTable> {
        &self.redaction
    }

    /// Current record.
    pub fn get(&self) -> DSHealthState {
        self.current.lock().clone()
    }

    /// Replace the record. Returns whether it changed.
    pub fn set(&self, mut next: DSHealthState) -> bool {
        next.status_msg = next.status_msg.map(|msg| self.redaction.scrub(&msg));
        let mut cur = self.current.lock();
        if *cur == next {
            return false;
        }
        info!(
            from = %cur.status,
            to = %next.status,
            service_type = ?next.service_type,
            msg = next.status_msg.as_deref().unwrap_or(""),
            "directory services health changed"
        );
        *cur = next;
        match serde_json::to_value(&*cur) {
            Ok(fields) => {
                self.bus.publish(HEALTH_TOPIC, EventKind::Changed, fields);
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize health state"),
        }
        true
    }

    /// Mark `service_type` healthy.
    pub fn healthy(&self, service_type: DsType) -> bool {
        self.set(DSHealthState {
            service_type: Some(service_type),
            status: DsStatus::Healthy,
            status_msg: None,
        })
    }

    /// Mark `service_type` faulted with `msg`.
    pub fn faulted(&self, service_type: DsType, msg: impl Into<String>) -> bool {
        self.set(DSHealthState {
            service_type: Some(service_type),
            status: DsStatus::Faulted,
            status_msg: Some(msg.into()),
        })
    }

    /// Reset to `{null, DISABLED, null}`.
    pub fn reset(&self) -> bool {
        self.set(DSHealthState::disabled())
    }
}
