//! Billing routes for Stripe integration

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

use pagecraft_billing::checkout::{PurchaseOutcome, PurchaseRequest};
use pagecraft_billing::resolver::resolve;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Response from submitting a purchase: either a redirect URL or a
/// direct-application success marker, never both
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PurchaseResponse {
    Checkout { checkout_url: String },
    Applied { success: bool, attached: Vec<String> },
}

/// Entitlement view returned to UI surfaces
#[derive(Debug, Serialize)]
pub struct EntitlementResponse {
    pub plan_id: String,
    pub plan_name: String,
    pub is_paid: bool,
    pub is_canceled: bool,
    pub interval: String,
    pub current_period_end: Option<String>,
    pub addons: Vec<String>,
}

/// Submit a purchase intent.
///
/// Answers with a checkout URL when a redirect is needed, or with the
/// applied-addon list when the live subscription was mutated directly.
pub async fn purchase(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<PurchaseRequest>,
) -> Result<Json<PurchaseResponse>, ApiError> {
    let outcome = state
        .billing
        .purchases
        .submit_purchase(auth_user.user_id, request)
        .await?;

    let response = match outcome {
        PurchaseOutcome::Checkout { url } => PurchaseResponse::Checkout { checkout_url: url },
        PurchaseOutcome::Applied { attached } => PurchaseResponse::Applied {
            success: true,
            attached,
        },
    };

    Ok(Json(response))
}

/// Resolve the current entitlement for the authenticated user.
///
/// Always re-derived from a fresh remote snapshot; cached local fields
/// never decide entitlement on their own.
pub async fn entitlement(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<EntitlementResponse>, ApiError> {
    let record = state.billing.store.require(auth_user.user_id).await?;

    let snapshot = state
        .billing
        .snapshots
        .read(record.stripe_subscription_id.as_deref())
        .await?;

    let resolved = resolve(state.billing.stripe.catalog(), snapshot.as_ref());

    Ok(Json(EntitlementResponse {
        plan_id: resolved.plan.id,
        plan_name: resolved.plan.name,
        is_paid: resolved.is_paid,
        is_canceled: resolved.is_canceled,
        interval: resolved.interval.as_str().to_string(),
        current_period_end: resolved
            .current_period_end
            .and_then(|t| t.format(&Rfc3339).ok()),
        addons: resolved.addon_ids,
    }))
}

/// Detach an addon from the user's subscription
pub async fn remove_addon(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(addon_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    // Reject ids that were never part of the catalog before touching
    // Stripe; detaching a no-longer-offered addon still works through
    // the ledger.
    if state.billing.stripe.catalog().addon_by_id(&addon_id).is_none() {
        let known = state.billing.addons.active_addons(auth_user.user_id).await?;
        if !known.iter().any(|e| e.addon_id == addon_id) {
            return Err(ApiError::NotFound);
        }
    }

    state
        .billing
        .addons
        .detach(auth_user.user_id, &addon_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Handle Stripe webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    // A processing failure answers 5xx so Stripe redelivers
    state.billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!("Webhook handling error: {}", e);
        ApiError::Database(format!("Webhook handling error: {}", e))
    })?;

    Ok(StatusCode::OK)
}
