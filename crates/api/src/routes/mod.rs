//! API routes

pub mod billing;
pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let api_routes = Router::new()
        .route("/billing/purchase", post(billing::purchase))
        .route("/billing/entitlement", get(billing::entitlement))
        .route("/billing/addons/:addon_id", delete(billing::remove_addon))
        // Public: authenticated by Stripe's signature, not the gateway
        .route("/billing/webhook", post(billing::webhook));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
