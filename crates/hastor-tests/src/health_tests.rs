//! Directory services health scenarios through the daemon core.

#[cfg(test)]
mod tests {
    use crate::harness::{ad_config, Appliance};
    use hastor_ds::engine::RECOVER_METHOD;
    use hastor_ds::{checker_for, DSHealthState, DsError, DsStatus, DsType, FaultReason, HEALTH_TOPIC};
    use hastor_failover::FailoverConfig;
    use hastor_jobs::{JobState, Subscription};
    use hastor_mgmt::JobFilter;
    use std::time::Duration;

    fn statuses(sub: &mut Subscription) -> Vec<String> {
        sub.drain()
            .into_iter()
            .map(|e| e.fields["status"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn ad_appliance() -> Appliance {
        let app = Appliance::new(FailoverConfig::default(), ad_config());
        app.healthy_ad();
        app
    }

    #[tokio::test]
    async fn test_recovery_from_missing_secret() {
        let app = ad_appliance();
        app.fakes.secrets.delete_live();
        let mut sub = app.bus().subscribe(HEALTH_TOPIC);

        let err = checker_for(DsType::Ad)
            .check(app.core.health().env(), &app.core.ds_config())
            .await
            .unwrap_err();
        assert_eq!(err.reason, FaultReason::AdSecretFileMissing);
        assert_eq!(app.core.health().check().await.status, DsStatus::Faulted);

        let health = app.core.health_recover().await.unwrap();
        assert_eq!(
            health,
            DSHealthState {
                service_type: Some(DsType::Ad),
                status: DsStatus::Healthy,
                status_msg: None,
            }
        );
        assert!(app.fakes.secrets.calls().iter().any(|c| c == "restore TRUENAS"));
        assert_eq!(app.fakes.services.calls_for("restart"), vec!["winbindd"]);
        assert_eq!(statuses(&mut sub), vec!["FAULTED", "HEALTHY"]);
    }

    #[tokio::test]
    async fn test_same_reason_retry_abort() {
        let app = ad_appliance();
        app.fakes.ad.fail_ping_dc(Some("NT_STATUS_IO_TIMEOUT"));

        let id = app.core.health().submit_recover(app.core.queue()).unwrap();
        let rec = app.core.job_wait(id, Some(Duration::from_secs(30))).await.unwrap();
        assert_eq!(rec.method, RECOVER_METHOD);
        assert_eq!(rec.state, JobState::Failed);
        assert_eq!(rec.exc_info.unwrap().extra.unwrap()["reason"], "AD_NETLOGON_FAILURE");

        // One recovery between two checks; the second check re-raises.
        assert_eq!(app.fakes.host.count("etc_generate smb"), 1);
        assert_eq!(app.fakes.ad.calls().iter().filter(|c| *c == "ping_dc").count(), 2);
        assert_eq!(app.core.health_status().status, DsStatus::Faulted);

        let err = app.core.health().recover().await.unwrap_err();
        assert!(matches!(&err, DsError::Health(h) if h.reason == FaultReason::AdNetlogonFailure));
    }

    #[tokio::test]
    async fn test_admin_recover_surfaces_failure() {
        let app = ad_appliance();
        app.fakes.ad.fail_ping_dc(Some("NT_STATUS_IO_TIMEOUT"));
        let err = app.core.health_recover().await.unwrap_err();
        assert!(err.to_string().contains("NT_STATUS_IO_TIMEOUT"), "{err}");
        let failed = app.core.jobs(&JobFilter {
            method: Some(RECOVER_METHOD.to_string()),
            state: Some(JobState::Failed),
        });
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_healthy_check_is_idempotent() {
        let app = ad_appliance();
        assert_eq!(app.core.health().check().await.status, DsStatus::Healthy);

        let mut sub = app.bus().subscribe_all();
        assert_eq!(app.core.health().check().await.status, DsStatus::Healthy);
        assert_eq!(app.core.health().recover().await.unwrap().status, DsStatus::Healthy);
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn test_supervisor_started_by_core() {
        let app = ad_appliance();
        let token = tokio_util::sync::CancellationToken::new();
        let mut tasks = app.core.start(token.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while app.core.queue().find(RECOVER_METHOD, JobState::Success).is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "supervisor never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(app.core.health_status().status, DsStatus::Healthy);

        token.cancel();
        app.core.queue().shutdown();
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }
}
