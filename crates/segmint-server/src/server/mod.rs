//! HTTP surface: routing, configuration, request/response shapes.

pub mod config;
pub mod handlers;
pub mod request;
pub mod response;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use segmint::IssuanceEngine;

use handlers::AppState;

/// Build the service router over a running engine.
pub fn router(engine: Arc<IssuanceEngine>) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/api/id/generate", post(handlers::generate))
        .route("/api/id/generate/:business_type", get(handlers::generate_by_path))
        .route("/api/id/single/:business_type", get(handlers::single))
        .route("/api/id/status", get(handlers::status))
        .route("/api/id/health", get(handlers::health))
        .route("/api/id/admin/step-size/change", post(handlers::change_step))
        .route("/api/id/admin/step-size/force-sync", post(handlers::force_step_sync))
        .route("/api/id/admin/step-size/current", get(handlers::current_steps))
        .route("/api/id/admin/step-size/consistency", get(handlers::step_consistency))
        .route("/api/id/admin/refresh/recover", post(handlers::recover_refresh))
        .route("/api/id/admin/conflicts/resolve", post(handlers::resolve_conflicts))
        .route("/api/id/admin/proxies", get(handlers::proxies))
        .route("/api/id/admin/proxies/abandon", post(handlers::abandon_proxies))
        .route("/api/id/segments/expired/:cutoff", delete(handlers::delete_expired))
        .with_state(state)
}
