//! Local control API using Axum
//!
//! The HTTP face of the tracker for whatever UI runs on the device: start
//! and stop tracking, read status and backlog, force a sync, and report
//! platform online/offline events.

pub mod envelope;
mod handlers;
mod routes;

pub use handlers::ApiState;

use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Same-origin only unless `TRACKER_CORS_ORIGINS` lists allowed origins
/// (comma-separated, e.g. `http://localhost:5173` for a dev UI).
fn build_cors_layer() -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    match std::env::var("TRACKER_CORS_ORIGINS") {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            base.allow_origin(allowed)
        }
        Err(_) => base,
    }
}

/// Build the complete control API router.
pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .nest("/api/v2", routes::v2_routes(state.clone()))
        .merge(routes::health_routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}
