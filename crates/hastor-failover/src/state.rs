//! Controller state machine.
//!
//! `BACKUP_IDLE -> PROMOTING -> MASTER | FAULTED` and
//! `MASTER -> DEMOTING -> BACKUP_IDLE`. A demotion whose export overruns
//! stays in `DEMOTING` until the node reboots.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use hastor_jobs::{EventBus, EventKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

/// Topic carrying controller state changes.
pub const STATUS_TOPIC: &str = "failover.status";

const HISTORY_LEN: usize = 64;

/// Failover state of this controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    /// Standby, volumes exported.
    BackupIdle,
    /// Becoming master.
    Promoting,
    /// Serving volumes.
    Master,
    /// Giving up volumes.
    Demoting,
    /// Last promotion failed; waiting for the next event.
    Faulted,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ControllerState::BackupIdle => "BACKUP_IDLE",
            ControllerState::Promoting => "PROMOTING",
            ControllerState::Master => "MASTER",
            ControllerState::Demoting => "DEMOTING",
            ControllerState::Faulted => "FAULTED",
        })
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Previous state.
    pub from: ControllerState,
    /// New state.
    pub to: ControllerState,
    /// Why, for failures.
    pub reason: Option<String>,
    /// When.
    pub at: DateTime<Utc>,
}

/// Holder of the controller state. Every change is recorded and broadcast
/// on [`STATUS_TOPIC`].
#[derive(Debug)]
pub struct ControllerStateMachine {
    current: Mutex<ControllerState>,
    history: Mutex<VecDeque<StateChange>>,
    bus: EventBus,
}

impl ControllerStateMachine {
    /// Start in `initial`.
    pub fn new(initial: ControllerState, bus: EventBus) -> Self {
        Self {
            current: Mutex::new(initial),
            history: Mutex::new(VecDeque::new()),
            bus,
        }
    }

    /// Current state.
    pub fn get(&self) -> ControllerState {
        *self.current.lock()
    }

    /// Recent changes, oldest first.
    pub fn history(&self) -> Vec<StateChange> {
        self.history.lock().iter().cloned().collect()
    }

    fn set(&self, to: ControllerState, reason: Option<String>) {
        let from = {
            let mut cur = self.current.lock();
            let from = *cur;
            if from == to {
                return;
            }
            *cur = to;
            from
        };
        match &reason {
            Some(r) => warn!(%from, %to, reason = %r, "controller state changed"),
            None => info!(%from, %to, "controller state changed"),
        }
        let change = StateChange {
            from,
            to,
            reason,
            at: Utc::now(),
        };
        self.bus.publish(
            STATUS_TOPIC,
            EventKind::Changed,
            json!({ "state": to, "previous": from, "reason": change.reason }),
        );
        let mut hist = self.history.lock();
        if hist.len() == HISTORY_LEN {
            hist.pop_front();
        }
        hist.push_back(change);
    }

    /// Enter `PROMOTING`.
    pub fn begin_promotion(&self) -> PendingTransition<'_> {
        self.set(ControllerState::Promoting, None);
        PendingTransition { sm: self, settled: false }
    }

    /// Enter `DEMOTING`.
    pub fn begin_demotion(&self) -> PendingTransition<'_> {
        self.set(ControllerState::Demoting, None);
        PendingTransition { sm: self, settled: false }
    }

    /// Force a state, e.g. after a restart that found this node master.
    pub fn reset(&self, state: ControllerState) {
        self.set(state, None);
    }
}

/// An in-flight promotion or demotion. Dropping it unsettled, which
/// happens when the job is aborted, leaves the controller `FAULTED`.
#[derive(Debug)]
pub struct PendingTransition<'a> {
    sm: &'a ControllerStateMachine,
    settled: bool,
}

impl PendingTransition<'_> {
    /// Promotion reached `MASTER`.
    pub fn promoted(mut self) {
        self.settled = true;
        self.sm.set(ControllerState::Master, None);
    }

    /// Demotion reached `BACKUP_IDLE`.
    pub fn demoted(mut self) {
        self.settled = true;
        self.sm.set(ControllerState::BackupIdle, None);
    }

    /// The transition failed.
    pub fn fault(mut self, reason: impl Into<String>) {
        self.settled = true;
        self.sm.set(ControllerState::Faulted, Some(reason.into()));
    }

    /// Leave the current state in place; the node is about to reboot.
    pub fn stall(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingTransition<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.sm.set(ControllerState::Faulted, Some("transition interrupted".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_cycle() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(STATUS_TOPIC);
        let sm = ControllerStateMachine::new(ControllerState::BackupIdle, bus);
        sm.begin_promotion().promoted();
        assert_eq!(sm.get(), ControllerState::Master);
        sm.begin_demotion().demoted();
        assert_eq!(sm.get(), ControllerState::BackupIdle);

        let states: Vec<String> = sub
            .drain()
            .into_iter()
            .map(|e| e.fields["state"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(states, vec!["PROMOTING", "MASTER", "DEMOTING", "BACKUP_IDLE"]);
    }

    #[test]
    fn test_failed_promotion_faults() {
        let sm = ControllerStateMachine::new(ControllerState::BackupIdle, EventBus::default());
        sm.begin_promotion().fault("fenced exited with code 1");
        assert_eq!(sm.get(), ControllerState::Faulted);
        let last = sm.history().pop().unwrap();
        assert_eq!(last.from, ControllerState::Promoting);
        assert_eq!(last.reason.as_deref(), Some("fenced exited with code 1"));
    }

    #[test]
    fn test_dropped_transition_faults() {
        let sm = ControllerStateMachine::new(ControllerState::BackupIdle, EventBus::default());
        drop(sm.begin_promotion());
        assert_eq!(sm.get(), ControllerState::Faulted);
    }

    #[test]
    fn test_stalled_demotion_stays_demoting() {
        let sm = ControllerStateMachine::new(ControllerState::Master, EventBus::default());
        sm.begin_demotion().stall();
        assert_eq!(sm.get(), ControllerState::Demoting);
    }

    #[test]
    fn test_history_is_bounded() {
        let sm = ControllerStateMachine::new(ControllerState::BackupIdle, EventBus::default());
        for _ in 0..HISTORY_LEN {
            sm.begin_promotion().promoted();
            sm.begin_demotion().demoted();
        }
        assert_eq!(sm.history().len(), HISTORY_LEN);
        assert_eq!(serde_json::to_value(sm.get()).unwrap(), "BACKUP_IDLE");
    }
}
