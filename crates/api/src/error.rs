//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use pagecraft_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),

    // Billing errors
    #[error("Subscription required: {0}")]
    SubscriptionRequired(String),
    #[error("Unknown or retired price: {0}")]
    InvalidPrice(String),
    /// Some addons attached, some failed; body enumerates both sides
    /// so the client can retry only the remainder
    #[error("Addon attachment partially failed")]
    PartialAttach {
        attached: Vec<String>,
        failed: Vec<(String, String)>,
    },
    #[error("Billing provider error")]
    BillingProvider(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // PartialAttach carries structure no (code, message) pair can
        let (status, body) = match &self {
            ApiError::Unauthorized => error_body(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Validation(msg) => error_body(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => error_body(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => error_body(StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => error_body(StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::SubscriptionRequired(msg) => error_body(StatusCode::PAYMENT_REQUIRED, "SUBSCRIPTION_REQUIRED", msg.clone()),
            ApiError::InvalidPrice(price_id) => error_body(
                StatusCode::BAD_REQUEST,
                "INVALID_PRICE",
                format!("Unknown or retired price: {}", price_id),
            ),
            ApiError::PartialAttach { attached, failed } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": {
                        "code": "PARTIAL_ATTACH",
                        "message": "Some addons could not be attached",
                        "attached": attached,
                        "failed": failed.iter().map(|(addon_id, reason)| json!({
                            "addon_id": addon_id,
                            "reason": reason,
                        })).collect::<Vec<_>>(),
                    }
                })),
            ),
            ApiError::BillingProvider(msg) => {
                tracing::error!("Billing provider error: {}", msg);
                error_body(StatusCode::BAD_GATEWAY, "BILLING_PROVIDER_ERROR", "Billing provider error".to_string())
            }
            ApiError::Database(_) => error_body(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => error_body(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        (status, body).into_response()
    }
}

fn error_body(status: StatusCode, code: &str, message: String) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        })),
    )
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    ApiError::Conflict("Resource already exists".to_string())
                } else {
                    ApiError::Database(db_err.to_string())
                }
            }
            other => ApiError::Database(other.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::InvalidPrice(price_id) => ApiError::InvalidPrice(price_id),
            BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::CustomerNotFound(_) => ApiError::NotFound,
            BillingError::SubscriptionRequired(msg) => ApiError::SubscriptionRequired(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::PartialAttach { attached, failed } => {
                ApiError::PartialAttach { attached, failed }
            }
            BillingError::StripeApi(msg) => ApiError::BillingProvider(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) => {
                tracing::error!("Billing configuration error: {}", msg);
                ApiError::Internal
            }
            BillingError::Internal(msg) => {
                tracing::error!("Billing internal error: {}", msg);
                ApiError::Internal
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
