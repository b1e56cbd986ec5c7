//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use pagecraft_shared::Catalog;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub catalog: String,
}

/// Whether the plan/addon catalog is usable for checkout.
///
/// "incomplete" means at least one plan or addon is missing every
/// Stripe price id, which usually points at unset STRIPE_PRICE_* env
/// vars. That is a configuration problem worth surfacing, but the
/// service can still serve entitlement reads, so it does not gate the
/// overall status.
fn catalog_status(catalog: &Catalog) -> &'static str {
    let plans_priced = catalog
        .plans()
        .iter()
        .all(|p| p.monthly_price_id.is_some() || p.yearly_price_id.is_some());
    let addons_priced = catalog
        .addons()
        .iter()
        .all(|a| a.monthly_price_id.is_some() || a.yearly_price_id.is_some());

    if plans_priced && addons_priced {
        "ready"
    } else {
        "incomplete"
    }
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    let overall_status = if db_status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        overall_status,
        Json(HealthResponse {
            status: if overall_status == StatusCode::OK {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status.to_string(),
            catalog: catalog_status(state.billing.stripe.catalog()).to_string(),
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe (checks if the service is ready to accept traffic)
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
