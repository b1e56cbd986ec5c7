//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use pagecraft_billing::Billing;

use crate::config::Config;

/// State shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub billing: Billing,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: Billing) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            billing,
        }
    }
}
