//! Control API route table
//!
//! - GET  /health
//! - GET  /api/v2/status
//! - POST /api/v2/tracking/start
//! - POST /api/v2/tracking/stop
//! - GET  /api/v2/queue
//! - POST /api/v2/sync
//! - POST /api/v2/connectivity

use axum::routing::{get, post};
use axum::Router;

use super::handlers::{self, ApiState};

pub fn v2_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handlers::get_status))
        .route("/tracking/start", post(handlers::start_tracking))
        .route("/tracking/stop", post(handlers::stop_tracking))
        .route("/queue", get(handlers::queue_status))
        .route("/sync", post(handlers::sync_now))
        .route("/connectivity", post(handlers::set_connectivity))
        .with_state(state)
}

pub fn health_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .with_state(state)
}
