//! Control API handlers
//!
//! Transient delivery problems never surface as error statuses here: they
//! show up as queue backlog and `lastError` in the status payload. Only a
//! failed session start is an error response.

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::envelope::{ApiErrorResponse, ApiResponse};
use crate::sync::{SyncCoordinator, TrackingError};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<SyncCoordinator>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            coordinator,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub bus_id: Option<String>,
    pub driver_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectivityRequest {
    pub online: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub tracking: bool,
    pub backlog: usize,
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        tracking: state.coordinator.is_tracking(),
        backlog: state.coordinator.queue().size(),
    })
}

/// GET /api/v2/status
pub async fn get_status(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.coordinator.status())
}

/// POST /api/v2/tracking/start
///
/// Body is optional; missing ids fall back to the configured device.
pub async fn start_tracking(
    State(state): State<ApiState>,
    body: Option<Json<StartRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let device = state.coordinator.default_device();
    let bus_id = request.bus_id.unwrap_or_else(|| device.bus_id.clone());
    let driver_id = request.driver_id.unwrap_or_else(|| device.driver_id.clone());

    match state.coordinator.start_tracking(&bus_id, &driver_id).await {
        Ok(()) => ApiResponse::ok(state.coordinator.status()),
        Err(e @ TrackingError::PermissionDenied(_)) => ApiErrorResponse::permission_denied(e.to_string()),
        Err(e @ TrackingError::InvalidSession(_)) => ApiErrorResponse::bad_request(e.to_string()),
        Err(e @ (TrackingError::SourceUnavailable(_) | TrackingError::ShutDown)) => {
            ApiErrorResponse::service_unavailable(e.to_string())
        }
    }
}

/// POST /api/v2/tracking/stop
pub async fn stop_tracking(State(state): State<ApiState>) -> Response {
    state.coordinator.stop_tracking();
    ApiResponse::ok(state.coordinator.status())
}

/// GET /api/v2/queue
pub async fn queue_status(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.coordinator.queue().status())
}

/// POST /api/v2/sync
pub async fn sync_now(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.coordinator.drain_now().await)
}

/// POST /api/v2/connectivity (platform online/offline event)
pub async fn set_connectivity(
    State(state): State<ApiState>,
    Json(request): Json<ConnectivityRequest>,
) -> Response {
    let monitor = state.coordinator.monitor();
    if monitor.set_online(request.online) {
        info!(online = request.online, "Connectivity set through control API");
    }
    ApiResponse::ok(monitor.current())
}
