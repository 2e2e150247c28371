//! Property-based tests for the failover coordinator: promotions never
//! overlap, and a stuck demotion ends in a reboot at the watchdog bound.

use crate::harness::Appliance;
use hastor_ds::DSConfig;
use hastor_failover::{EventKind, EventOutcome, FailoverConfig, Volume, VrrpEvent};
use hastor_jobs::{BusEvent, JobState, JOBS_TOPIC};
use hastor_sys::fakes::WatchdogEvent;
use hastor_sys::locks;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

/// Watchdog timeout armed before a demotion exports.
pub const WATCHDOG_SECS: u64 = 4;

/// VRRP event kinds that reach the transition jobs.
pub fn arb_event_kind() -> impl Strategy<Value = EventKind> {
    prop_oneof![
        3 => Just(EventKind::Master),
        2 => Just(EventKind::Backup),
        1 => Just(EventKind::ForceTakeover),
    ]
}

/// A burst of events, each delivered after a short random pause.
pub fn arb_event_burst() -> impl Strategy<Value = Vec<(EventKind, u64)>> {
    proptest::collection::vec((arb_event_kind(), 0u64..15), 2..8)
}

/// Export delays in milliseconds, clear of the watchdog bound.
pub fn arb_export_delay_ms() -> impl Strategy<Value = u64> {
    prop_oneof![0u64..3_500, 4_500u64..12_000]
}

/// Single critical interface `eth0` and one volume in `volume_status`.
pub fn single_group_config(volume_status: &str) -> FailoverConfig {
    let mut tank = Volume::new("tank", "0xAB");
    tank.status = volume_status.to_string();
    FailoverConfig {
        disabled: false,
        critical_groups: BTreeMap::from([(1, BTreeSet::from(["eth0".to_string()]))]),
        volumes: vec![tank],
        ..FailoverConfig::default()
    }
}

/// Largest number of promotion jobs holding their lock at the same time,
/// replayed from the job events in bus order.
pub fn max_concurrent_promotions(events: &[BusEvent]) -> usize {
    let mut running = HashSet::new();
    let mut max = 0;
    for ev in events.iter().filter(|e| e.topic == JOBS_TOPIC) {
        if ev.fields["lock"] != locks::VRRP_MASTER {
            continue;
        }
        let id = ev.fields["id"].as_u64().unwrap_or_default();
        match ev.fields["state"].as_str() {
            Some("RUNNING") => {
                running.insert(id);
                max = max.max(running.len());
            }
            Some("SUCCESS" | "FAILED" | "ABORTED" | "IGNORED") => {
                running.remove(&id);
            }
            _ => {}
        }
    }
    max
}

fn exclusive_promotion(burst: Vec<(EventKind, u64)>) -> usize {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build runtime");
    rt.block_on(async move {
        let app = Appliance::new(single_group_config("OFFLINE"), DSConfig::default());
        app.fakes.pools.add_pool("tank", "0xAB", "OFFLINE");
        let mut sub = app.bus().subscribe(JOBS_TOPIC);

        let mut handles = Vec::new();
        for (kind, pause_ms) in burst {
            let core = app.core.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                core.failover().handle_event(VrrpEvent::new("eth0", kind)).await
            }));
        }
        for handle in handles {
            let outcome = handle.await.expect("event task panicked").expect("event handling failed");
            if let EventOutcome::Accepted(id) = outcome {
                app.core
                    .job_wait(id, Some(Duration::from_secs(60)))
                    .await
                    .expect("transition job never finished");
            }
        }
        max_concurrent_promotions(&sub.drain())
    })
}

/// Outcome of one demotion whose export takes `delay`.
#[derive(Debug)]
pub struct DemotionRun {
    /// Final job state.
    pub state: JobState,
    /// Watchdog operations in order.
    pub watchdog: Vec<WatchdogEvent>,
    /// Time from arming to the reboot, if one happened.
    pub reboot_after_arm: Option<Duration>,
}

fn stuck_demotion(delay: Duration) -> DemotionRun {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("failed to build runtime");
    rt.block_on(async move {
        let app = Appliance::new(single_group_config("ONLINE"), DSConfig::default());
        app.fakes.pools.add_pool("tank", "0xAB", "ONLINE");
        app.fakes.pools.delay_export("tank", delay);

        let rec = app.run("eth0", EventKind::Backup).await;
        let watchdog = app.fakes.watchdog.log();
        let armed_at = watchdog.iter().find_map(|op| match op {
            WatchdogEvent::Arm { at, .. } => Some(*at),
            WatchdogEvent::Disarm { .. } => None,
        });
        let reboot_after_arm = app
            .fakes
            .rebooter
            .rebooted_at()
            .zip(armed_at)
            .map(|(rebooted, armed)| rebooted - armed);
        DemotionRun {
            state: rec.state,
            watchdog,
            reboot_after_arm,
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_exclusive_promotion(burst in arb_event_burst()) {
        prop_assert!(exclusive_promotion(burst) <= 1);
    }

    #[test]
    fn prop_export_bound(delay_ms in arb_export_delay_ms()) {
        let run = stuck_demotion(Duration::from_millis(delay_ms));
        let bound = Duration::from_secs(WATCHDOG_SECS);
        match run.watchdog.as_slice() {
            [WatchdogEvent::Arm { seconds, at: armed }, WatchdogEvent::Disarm { at: disarmed }] => {
                prop_assert_eq!(u64::from(*seconds), WATCHDOG_SECS);
                prop_assert!(*disarmed - *armed < bound);
                prop_assert_eq!(run.state, JobState::Success);
                prop_assert!(run.reboot_after_arm.is_none());
            }
            [WatchdogEvent::Arm { .. }] => {
                prop_assert_eq!(run.state, JobState::Failed);
                prop_assert_eq!(run.reboot_after_arm, Some(bound));
            }
            other => prop_assert!(false, "unexpected watchdog sequence {:?}", other),
        }
    }
}

#[test]
fn test_replay_counts_overlap() {
    use hastor_jobs::EventKind as BusKind;
    use serde_json::json;

    let ev = |seq, id: u64, state: &str| BusEvent {
        seq,
        topic: JOBS_TOPIC.to_string(),
        kind: BusKind::Changed,
        fields: json!({"id": id, "lock": locks::VRRP_MASTER, "state": state}),
    };
    let serial = [ev(1, 1, "RUNNING"), ev(2, 1, "SUCCESS"), ev(3, 2, "RUNNING"), ev(4, 2, "FAILED")];
    assert_eq!(max_concurrent_promotions(&serial), 1);
    let overlapping = [ev(1, 1, "RUNNING"), ev(2, 2, "RUNNING"), ev(3, 1, "SUCCESS")];
    assert_eq!(max_concurrent_promotions(&overlapping), 2);
}

#[test]
fn test_short_export_disarms() {
    let run = stuck_demotion(Duration::from_millis(500));
    assert_eq!(run.state, JobState::Success);
    assert!(matches!(run.watchdog.as_slice(), [WatchdogEvent::Arm { .. }, WatchdogEvent::Disarm { .. }]));
}
