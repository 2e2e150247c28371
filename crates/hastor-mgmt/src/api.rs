//! Admin HTTP API: a JSON endpoint per admin call, the peer's status and
//! key endpoints, and the Prometheus scrape target.

use crate::core::{Core, FailoverStatus, JobFilter, SetHealthState};
use crate::error::Result;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hastor_ds::{DSConfig, DSHealthState};
use hastor_failover::{EventOutcome, FailoverConfig};
use hastor_jobs::{JobId, JobRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

/// Body of `failover.force_takeover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceTakeoverRequest {
    /// Interface to take over on.
    pub ifname: String,
}

/// Reply to `failover.force_takeover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceTakeoverReply {
    /// Whether a promotion job was queued.
    pub accepted: bool,
    /// The queued job.
    pub job_id: Option<JobId>,
    /// Why the request was dropped.
    pub reason: Option<String>,
}

impl From<EventOutcome> for ForceTakeoverReply {
    fn from(outcome: EventOutcome) -> Self {
        match outcome {
            EventOutcome::Accepted(id) => Self {
                accepted: true,
                job_id: Some(id),
                reason: None,
            },
            EventOutcome::Ignored(reason) => Self {
                accepted: false,
                job_id: None,
                reason: Some(reason),
            },
        }
    }
}

/// Query of `core.job_wait`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WaitParams {
    /// Give up after this many seconds.
    pub timeout_secs: Option<u64>,
}

/// Admin API server.
#[derive(Clone)]
pub struct AdminApi {
    core: Arc<Core>,
}

impl AdminApi {
    /// API over `core`.
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Routes; everything except `/ready` sits behind the token check.
    pub fn router(self: Arc<Self>) -> Router {
        let protected = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/api/v1/failover/status", get(failover_status_handler))
            .route("/api/v1/failover/refresh_status", post(failover_refresh_handler))
            .route("/api/v1/failover/keys", get(failover_keys_handler))
            .route(
                "/api/v1/failover/config",
                get(failover_config_handler).put(failover_update_handler),
            )
            .route("/api/v1/failover/force_takeover", post(force_takeover_handler))
            .route("/api/v1/directoryservices/health", get(health_status_handler))
            .route("/api/v1/directoryservices/health/check", post(health_check_handler))
            .route("/api/v1/directoryservices/health/recover", post(health_recover_handler))
            .route("/api/v1/directoryservices/health/set_state", post(health_set_state_handler))
            .route(
                "/api/v1/directoryservices/config",
                get(ds_config_handler).put(ds_update_handler),
            )
            .route("/api/v1/jobs", get(jobs_handler))
            .route("/api/v1/jobs/:id", get(job_handler))
            .route("/api/v1/jobs/:id/wait", post(job_wait_handler))
            .route("/api/v1/jobs/:id/abort", post(job_abort_handler))
            .layer(axum::middleware::from_fn_with_state(self.clone(), auth_middleware));

        let public = Router::new().route("/ready", get(ready_handler));

        Router::new().merge(protected).merge(public).with_state(self)
    }

    /// Serve until `token` is cancelled.
    pub async fn serve(self, token: CancellationToken) -> anyhow::Result<()> {
        let addr = self.core.config().bind_addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("admin API listening on {}", addr);

        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;
        Ok(())
    }
}

async fn ready_handler() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_handler(State(api): State<Arc<AdminApi>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        api.core.render_metrics(),
    )
}

async fn failover_status_handler(State(api): State<Arc<AdminApi>>) -> Json<FailoverStatus> {
    Json(api.core.failover_status())
}

async fn failover_refresh_handler(State(api): State<Arc<AdminApi>>) -> StatusCode {
    api.core.refresh_failover_status();
    StatusCode::NO_CONTENT
}

async fn failover_keys_handler(State(api): State<Arc<AdminApi>>) -> Result<Json<Value>> {
    Ok(Json(api.core.pool_keys()?))
}

async fn failover_config_handler(State(api): State<Arc<AdminApi>>) -> Json<FailoverConfig> {
    Json(api.core.failover_config())
}

async fn failover_update_handler(
    State(api): State<Arc<AdminApi>>,
    Json(new): Json<FailoverConfig>,
) -> Result<Json<FailoverConfig>> {
    Ok(Json(api.core.failover_update(new).await?))
}

async fn force_takeover_handler(
    State(api): State<Arc<AdminApi>>,
    Json(req): Json<ForceTakeoverRequest>,
) -> Result<Json<ForceTakeoverReply>> {
    Ok(Json(api.core.force_takeover(&req.ifname).await?.into()))
}

async fn health_status_handler(State(api): State<Arc<AdminApi>>) -> Json<DSHealthState> {
    Json(api.core.health_status())
}

async fn health_check_handler(State(api): State<Arc<AdminApi>>) -> Result<Json<DSHealthState>> {
    Ok(Json(api.core.health_check().await?))
}

async fn health_recover_handler(State(api): State<Arc<AdminApi>>) -> Result<Json<DSHealthState>> {
    Ok(Json(api.core.health_recover().await?))
}

async fn health_set_state_handler(
    State(api): State<Arc<AdminApi>>,
    Json(req): Json<SetHealthState>,
) -> Result<Json<DSHealthState>> {
    Ok(Json(api.core.health_set_state(req).await?))
}

async fn ds_config_handler(State(api): State<Arc<AdminApi>>) -> Json<DSConfig> {
    Json(api.core.ds_config())
}

async fn ds_update_handler(State(api): State<Arc<AdminApi>>, Json(new): Json<DSConfig>) -> Result<Json<DSConfig>> {
    Ok(Json(api.core.ds_update(new).await?))
}

async fn jobs_handler(State(api): State<Arc<AdminApi>>, Query(filter): Query<JobFilter>) -> Json<Vec<JobRecord>> {
    Json(api.core.jobs(&filter))
}

async fn job_handler(State(api): State<Arc<AdminApi>>, Path(id): Path<JobId>) -> Result<Json<JobRecord>> {
    Ok(Json(api.core.job(id)?))
}

async fn job_wait_handler(
    State(api): State<Arc<AdminApi>>,
    Path(id): Path<JobId>,
    Query(params): Query<WaitParams>,
) -> Result<Json<JobRecord>> {
    let timeout = params.timeout_secs.map(Duration::from_secs);
    Ok(Json(api.core.job_wait(id, timeout).await?))
}

async fn job_abort_handler(State(api): State<Arc<AdminApi>>, Path(id): Path<JobId>) -> Result<Json<JobRecord>> {
    Ok(Json(api.core.job_abort(id)?))
}

fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

async fn auth_middleware(State(api): State<Arc<AdminApi>>, request: Request<Body>, next: Next) -> Response {
    let Some(token) = api.core.config().admin_token.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(provided) if token_matches(provided, token) => next.run(request).await,
        _ => {
            tracing::warn!(path = %request.uri().path(), "rejected unauthenticated admin request");
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, r#"Bearer realm="hastord""#)],
                "Unauthorized",
            )
                .into_response()
        }
    }
}
