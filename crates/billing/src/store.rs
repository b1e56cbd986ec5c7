//! Local user billing records
//!
//! `user_billing` is the minimal local persistence: the Stripe customer
//! id (created lazily, never reassigned), the subscription id, and a
//! few cached fields for cheap listing. The cached status and price id
//! are hints only; entitlement is always re-derived from a live
//! snapshot.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A user's local billing record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserBillingRecord {
    pub user_id: Uuid,
    pub email: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    /// Base-plan price id hint; always re-validated against the snapshot
    pub stripe_price_id: Option<String>,
    /// Cached status label, never authoritative
    pub subscription_status: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Store for reading and mutating `user_billing` rows
#[derive(Clone)]
pub struct BillingStore {
    pool: PgPool,
}

impl BillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<UserBillingRecord>> {
        let record: Option<UserBillingRecord> = sqlx::query_as(
            "SELECT user_id, email, stripe_customer_id, stripe_subscription_id,
                    stripe_price_id, subscription_status, current_period_end,
                    created_at, updated_at
             FROM user_billing
             WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn require(&self, user_id: Uuid) -> BillingResult<UserBillingRecord> {
        self.get(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))
    }

    /// Find the record owning a Stripe subscription id
    ///
    /// Used by webhook handlers when the payload carries no usable
    /// user reference in metadata.
    pub async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<UserBillingRecord>> {
        let record: Option<UserBillingRecord> = sqlx::query_as(
            "SELECT user_id, email, stripe_customer_id, stripe_subscription_id,
                    stripe_price_id, subscription_status, current_period_end,
                    created_at, updated_at
             FROM user_billing
             WHERE stripe_subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Persist a newly created Stripe customer id.
    ///
    /// Invariant: once set, the customer id is never reassigned, so the
    /// update is guarded on the column still being NULL. A lost race
    /// keeps the first writer's id.
    pub async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE user_billing
             SET stripe_customer_id = $2, updated_at = NOW()
             WHERE user_id = $1 AND stripe_customer_id IS NULL",
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write the full subscription linkage after checkout completion.
    ///
    /// Absolute-state write so webhook redelivery is a no-op.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_checkout_completed(
        &self,
        user_id: Uuid,
        subscription_id: &str,
        customer_id: &str,
        price_id: Option<&str>,
        status: &str,
        current_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE user_billing
             SET stripe_subscription_id = $2,
                 stripe_customer_id = COALESCE(stripe_customer_id, $3),
                 stripe_price_id = $4,
                 subscription_status = $5,
                 current_period_end = $6,
                 updated_at = NOW()
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(subscription_id)
        .bind(customer_id)
        .bind(price_id)
        .bind(status)
        .bind(current_period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update cached status and period end only.
    ///
    /// Subscription id and price id are deliberately untouched: an
    /// update event can fire for reasons unrelated to a plan change.
    pub async fn update_status(
        &self,
        user_id: Uuid,
        status: &str,
        current_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE user_billing
             SET subscription_status = $2,
                 current_period_end = COALESCE($3, current_period_end),
                 updated_at = NOW()
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(status)
        .bind(current_period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Clear the subscription linkage after the provider deletes it
    pub async fn clear_subscription(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE user_billing
             SET stripe_subscription_id = NULL,
                 stripe_price_id = NULL,
                 subscription_status = 'canceled',
                 updated_at = NOW()
             WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
