use crate::metrics::Metrics;
use crate::provision::{ProvisionError, ProvisioningManager, ProvisioningSnapshot};
use crate::schedule::{Tick, TriggerHandle};
use crate::state::{FleetStats, VmRecord};
use crate::telemetry::{DetailRegistry, FleetSource, TelemetryView};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub fleet: Arc<TelemetryView<FleetSource>>,
    pub fleet_trigger: TriggerHandle,
    pub details: Arc<DetailRegistry>,
    pub provisioning: Arc<ProvisioningManager>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetEntry {
    #[serde(flatten)]
    pub record: VmRecord,
    pub heartbeat: String,
    pub disk_usage_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiFleet {
    pub vms: Vec<FleetEntry>,
    pub stats: FleetStats,
    pub loaded: bool,
    pub refreshing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiDetail {
    pub vm: Option<VmRecord>,
    pub loaded: bool,
    pub refreshing: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub vm_name: String,
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/fleet", get(fleet_handler))
        .route("/api/fleet/refresh", post(fleet_refresh_handler))
        .route("/api/vms/:vm_id", get(detail_handler))
        .route(
            "/api/vms/:vm_id/watch",
            post(mount_handler).delete(unmount_handler),
        )
        .route("/api/vms/:vm_id/refresh", post(detail_refresh_handler))
        .route(
            "/api/provision",
            get(provision_handler)
                .post(submit_handler)
                .delete(reset_handler),
        )
        .route("/api/provision/copy", post(copy_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn fleet_handler(State(state): State<HttpAppState>) -> Json<ApiFleet> {
    let snapshot = state.fleet.snapshot().await;
    let now = SystemTime::now();
    let records = snapshot.data.unwrap_or_default();
    let stats = FleetStats::from_records(&records);
    let vms = records
        .into_iter()
        .map(|record| FleetEntry {
            heartbeat: record.heartbeat_label(now),
            disk_usage_percent: record.disk_usage_percent(),
            record,
        })
        .collect();
    Json(ApiFleet {
        vms,
        stats,
        loaded: !snapshot.initialising,
        refreshing: snapshot.refreshing,
    })
}

async fn fleet_refresh_handler(State(state): State<HttpAppState>) -> StatusCode {
    if state.fleet_trigger.fire(Tick::Manual) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn detail_handler(
    State(state): State<HttpAppState>,
    Path(vm_id): Path<String>,
) -> Result<Json<ApiDetail>, StatusCode> {
    let snapshot = state
        .details
        .snapshot(&vm_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(ApiDetail {
        vm: snapshot.data,
        loaded: !snapshot.initialising,
        refreshing: snapshot.refreshing,
        error: snapshot.error,
    }))
}

async fn mount_handler(State(state): State<HttpAppState>, Path(vm_id): Path<String>) -> StatusCode {
    if state.details.mount(&vm_id).await {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

async fn unmount_handler(
    State(state): State<HttpAppState>,
    Path(vm_id): Path<String>,
) -> StatusCode {
    state.details.unmount(&vm_id).await;
    StatusCode::NO_CONTENT
}

async fn detail_refresh_handler(
    State(state): State<HttpAppState>,
    Path(vm_id): Path<String>,
) -> StatusCode {
    if state.details.refresh_now(&vm_id).await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn provision_handler(State(state): State<HttpAppState>) -> Json<ProvisioningSnapshot> {
    Json(state.provisioning.snapshot().await)
}

async fn submit_handler(
    State(state): State<HttpAppState>,
    Json(req): Json<SubmitRequest>,
) -> Response {
    match state.provisioning.submit(&req.vm_name).await {
        Ok(setup) => (StatusCode::CREATED, Json(setup)).into_response(),
        Err(err) => {
            let status = match err {
                ProvisionError::Validation => StatusCode::BAD_REQUEST,
                ProvisionError::Busy | ProvisionError::Cancelled => StatusCode::CONFLICT,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
    }
}

async fn copy_handler(State(state): State<HttpAppState>) -> Json<serde_json::Value> {
    let copied = state.provisioning.copy_command().await;
    Json(serde_json::json!({ "copied": copied }))
}

async fn reset_handler(State(state): State<HttpAppState>) -> StatusCode {
    state.provisioning.reset().await;
    StatusCode::NO_CONTENT
}
