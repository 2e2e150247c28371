//! Property-based tests for secret redaction on the job path.

use crate::harness::Appliance;
use anyhow::anyhow;
use hastor_ds::DSConfig;
use hastor_failover::FailoverConfig;
use hastor_jobs::{job_log, JobSpec, RedactionTable};
use hastor_sys::secret::REDACTED;
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;

/// Field names redacted for every method.
pub fn arb_secret_field() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("password"),
        Just("bindpw"),
        Just("secret"),
        Just("api_key"),
        Just("passphrase"),
        Just("private_key"),
        Just("token"),
    ]
}

/// Secret values that cannot collide with fixed text in records or logs.
pub fn arb_secret_value() -> impl Strategy<Value = String> {
    "[a-z]{4}[0-9]{4}"
}

/// Everything one job exposes, serialized: the finished record, the job
/// log and every bus event published while it ran.
pub fn job_exposure(field: &str, secret: &str) -> Vec<String> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    rt.block_on(async move {
        let app = Appliance::new(FailoverConfig::default(), DSConfig::default());
        let mut sub = app.bus().subscribe_all();
        let spec = JobSpec::new("account.update").arguments(json!({
            "username": "svc",
            "credentials": {field: secret},
        }));
        let leaked = secret.to_string();
        let id = app
            .core
            .queue()
            .submit(spec, move |ctx| async move {
                job_log!(ctx, info, "applying {}", leaked);
                ctx.set_progress(Some(50), Some(&format!("checking {leaked}")));
                Err::<(), _>(anyhow!("backend rejected {leaked}"))
            })
            .expect("submit failed");
        let rec = app
            .core
            .job_wait(id, Some(Duration::from_secs(5)))
            .await
            .expect("job never finished");

        let mut exposed = vec![serde_json::to_string(&rec).expect("record serializes")];
        if let Some(path) = &rec.logs_path {
            exposed.push(std::fs::read_to_string(path).expect("job log readable"));
        }
        exposed.extend(sub.drain().into_iter().map(|e| e.fields.to_string()));
        exposed
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_secrets_never_exposed(field in arb_secret_field(), secret in arb_secret_value()) {
        for text in job_exposure(field, &secret) {
            prop_assert!(!text.contains(&secret), "secret exposed in {}", text);
        }
    }

    #[test]
    fn prop_nested_fields_masked(field in arb_secret_field(), secret in arb_secret_value()) {
        let table = RedactionTable::new();
        let doc = json!({"outer": [{field: secret.clone(), "name": "kept"}]});
        let masked = table.redact("any.method", &doc);
        prop_assert_eq!(&masked["outer"][0][field], REDACTED);
        prop_assert_eq!(&masked["outer"][0]["name"], "kept");
        prop_assert_eq!(table.scrub(&format!("saw {secret} twice: {secret}")), format!("saw {REDACTED} twice: {REDACTED}"));
    }
}
