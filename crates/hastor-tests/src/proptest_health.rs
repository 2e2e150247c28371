//! Property-based tests for bounded directory services recovery.

use crate::harness::{ad_config, Appliance};
use hastor_ds::{DSConfig, DsError, DsStatus, HealthEngine, HealthState, MAX_RECOVER_ATTEMPTS};
use hastor_failover::FailoverConfig;
use hastor_sys::JsonState;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

/// Faults injected into an otherwise healthy AD member.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthFaults {
    /// winbindd is stopped.
    pub winbind_stopped: bool,
    /// The live secrets store is gone.
    pub secrets_deleted: bool,
    /// Netlogon pings to the domain controller fail.
    pub netlogon_down: bool,
    /// The system credential cache is empty.
    pub no_ticket: bool,
    /// `krb5.conf` is missing.
    pub krb5_conf_missing: bool,
}

impl HealthFaults {
    /// True if nothing is injected.
    pub fn is_empty(&self) -> bool {
        !(self.winbind_stopped || self.secrets_deleted || self.netlogon_down || self.no_ticket || self.krb5_conf_missing)
    }
}

/// Any combination of faults.
pub fn arb_health_faults() -> impl Strategy<Value = HealthFaults> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(winbind_stopped, secrets_deleted, netlogon_down, no_ticket, krb5_conf_missing)| HealthFaults {
            winbind_stopped,
            secrets_deleted,
            netlogon_down,
            no_ticket,
            krb5_conf_missing,
        },
    )
}

/// Result of one recovery run.
#[derive(Debug)]
pub struct RecoveryRun {
    /// Number of check passes, counted by domain lookups.
    pub passes: usize,
    /// What `recover` returned.
    pub result: Result<DsStatus, String>,
    /// Health record afterwards.
    pub status: DsStatus,
}

fn inject(app: &Appliance, faults: HealthFaults) {
    app.healthy_ad();
    if faults.winbind_stopped {
        app.fakes.services.set_running("winbindd", false);
    }
    if faults.secrets_deleted {
        app.fakes.secrets.delete_live();
    }
    if faults.netlogon_down {
        app.fakes.ad.fail_ping_dc(Some("NT_STATUS_IO_TIMEOUT"));
    }
    if faults.no_ticket {
        app.fakes.kerberos.set_cred(None);
    }
    if faults.krb5_conf_missing {
        std::fs::remove_file(&app.ds_paths.krb5_conf).expect("failed to remove krb5.conf");
    }
}

/// Recover an AD member with `faults`, retrying without delay.
pub fn recover_with(faults: HealthFaults) -> RecoveryRun {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    rt.block_on(async move {
        let app = Appliance::new(FailoverConfig::default(), DSConfig::default());
        inject(&app, faults);
        let engine = HealthEngine::new(
            app.fakes.ds_env(app.ds_paths.clone()),
            Arc::new(JsonState::ephemeral(ad_config())),
            Arc::new(HealthState::new(app.bus(), app.core.queue().redaction().clone())),
        )
        .with_retry(MAX_RECOVER_ATTEMPTS, Duration::from_millis(1));

        let result = engine
            .recover()
            .await
            .map(|h| h.status)
            .map_err(|e: DsError| e.to_string());
        let passes = app
            .fakes
            .ad
            .calls()
            .iter()
            .filter(|c| c.starts_with("domain_info"))
            .count();
        RecoveryRun {
            passes,
            result,
            status: engine.health().status,
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_recovery_is_bounded(faults in arb_health_faults()) {
        let run = recover_with(faults);
        prop_assert!(run.passes >= 1);
        prop_assert!(run.passes <= MAX_RECOVER_ATTEMPTS as usize + 1, "{} check passes", run.passes);
        match &run.result {
            Ok(status) => {
                prop_assert_eq!(*status, DsStatus::Healthy);
                prop_assert_eq!(run.status, DsStatus::Healthy);
            }
            Err(_) => prop_assert_eq!(run.status, DsStatus::Faulted),
        }
        if faults.is_empty() {
            prop_assert_eq!(run.passes, 1);
            prop_assert!(run.result.is_ok());
        }
    }
}

#[test]
fn test_persistent_netlogon_failure_gives_up() {
    let run = recover_with(HealthFaults {
        netlogon_down: true,
        ..HealthFaults::default()
    });
    assert_eq!(run.passes, 2);
    assert!(run.result.unwrap_err().contains("NT_STATUS_IO_TIMEOUT"));
}

#[test]
fn test_missing_secret_is_restored() {
    let run = recover_with(HealthFaults {
        secrets_deleted: true,
        ..HealthFaults::default()
    });
    assert_eq!(run.result, Ok(DsStatus::Healthy));
    assert_eq!(run.passes, 2);
}
