//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription required: {0}")]
    SubscriptionRequired(String),

    #[error("Unknown or retired price id: {0}")]
    InvalidPrice(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Some addons attached before a later item failed. The remote
    /// mutation is not transactional; the caller retries the remainder.
    #[error("Attached {} addon(s), {} failed", attached.len(), failed.len())]
    PartialAttach {
        /// Addon ids successfully attached (and ledgered)
        attached: Vec<String>,
        /// (addon id, failure reason) for each addon that did not attach
        failed: Vec<(String, String)>,
    },
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
