//! Addon ledger
//!
//! Local record of which addons are currently active for a user, kept
//! consistent with the remote subscription's line items. The ledger is
//! append-only: detaching flips the row inactive, re-purchasing creates
//! a fresh active row. A partial unique index in the store guarantees
//! at most one active row per (user, addon) at any time.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{SubscriptionItem, SubscriptionItemId};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::snapshot::SnapshotReader;
use crate::store::BillingStore;

/// One ledger row: an addon attach (or its later detach)
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AddonLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub addon_id: String,
    /// Price the addon was purchased under
    pub stripe_price_id: String,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

/// Service for the addon ledger and user-initiated addon detach
#[derive(Clone)]
pub struct AddonService {
    stripe: StripeClient,
    pool: PgPool,
    store: BillingStore,
    snapshots: SnapshotReader,
}

impl AddonService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            store: BillingStore::new(pool.clone()),
            snapshots: SnapshotReader::new(stripe.clone()),
            stripe,
            pool,
        }
    }

    /// Currently-active ledger rows for a user
    pub async fn active_addons(&self, user_id: Uuid) -> BillingResult<Vec<AddonLedgerEntry>> {
        let entries: Vec<AddonLedgerEntry> = sqlx::query_as(
            "SELECT id, user_id, addon_id, stripe_price_id, active, created_at
             FROM addon_ledger
             WHERE user_id = $1 AND active = true
             ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Record a successful remote attach.
    ///
    /// Any lingering active row for the same addon is flipped inactive
    /// first, so redelivered webhooks and caller retries converge on a
    /// single active row instead of violating the ledger invariant.
    pub async fn mark_attached(
        &self,
        user_id: Uuid,
        addon_id: &str,
        price_id: &str,
    ) -> BillingResult<AddonLedgerEntry> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE addon_ledger SET active = false
             WHERE user_id = $1 AND addon_id = $2 AND active = true",
        )
        .bind(user_id)
        .bind(addon_id)
        .execute(&mut *tx)
        .await?;

        let entry: AddonLedgerEntry = sqlx::query_as(
            "INSERT INTO addon_ledger (user_id, addon_id, stripe_price_id, active)
             VALUES ($1, $2, $3, true)
             RETURNING id, user_id, addon_id, stripe_price_id, active, created_at",
        )
        .bind(user_id)
        .bind(addon_id)
        .bind(price_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            addon_id = %addon_id,
            price_id = %price_id,
            "Ledgered addon attach"
        );

        Ok(entry)
    }

    /// Flip the active row for (user, addon) inactive, if any
    pub async fn mark_detached(&self, user_id: Uuid, addon_id: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE addon_ledger SET active = false
             WHERE user_id = $1 AND addon_id = $2 AND active = true",
        )
        .bind(user_id)
        .bind(addon_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Flip every active row for a user inactive.
    ///
    /// Cancellation of the parent subscription implicitly cancels all
    /// addons: the provider deletes all line items together.
    pub async fn deactivate_all(&self, user_id: Uuid) -> BillingResult<u64> {
        let result = sqlx::query(
            "UPDATE addon_ledger SET active = false
             WHERE user_id = $1 AND active = true",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// User-initiated detach of a single addon.
    ///
    /// Deletes the matching remote subscription item first, then flips
    /// the local row. When the remote item is already gone (e.g. a
    /// prior cancellation removed it), the local row is still flipped
    /// but no second remote deletion is attempted.
    pub async fn detach(&self, user_id: Uuid, addon_id: &str) -> BillingResult<()> {
        let record = self.store.require(user_id).await?;

        let Some(subscription_id) = record.stripe_subscription_id else {
            // No subscription left to mutate; just converge the ledger
            self.mark_detached(user_id, addon_id).await?;
            return Ok(());
        };

        let snapshot = self.snapshots.require(&subscription_id).await?;

        match snapshot.addon_item(addon_id) {
            Some(item) => {
                let item_id = item.item_id.parse::<SubscriptionItemId>().map_err(|e| {
                    BillingError::StripeApi(format!("Invalid subscription item ID: {}", e))
                })?;

                SubscriptionItem::delete(self.stripe.inner(), &item_id).await?;

                tracing::info!(
                    user_id = %user_id,
                    addon_id = %addon_id,
                    item_id = %item.item_id,
                    "Deleted remote addon item"
                );
            }
            None => {
                tracing::info!(
                    user_id = %user_id,
                    addon_id = %addon_id,
                    subscription_id = %subscription_id,
                    "Addon item already absent remotely; converging ledger only"
                );
            }
        }

        self.mark_detached(user_id, addon_id).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{StripeConfig, StripeClient};
    use pagecraft_shared::Catalog;

    fn test_service(pool: PgPool) -> AddonService {
        let stripe = StripeClient::new(StripeConfig {
            secret_key: "sk_test_unused".to_string(),
            webhook_secret: "whsec_unused".to_string(),
            app_base_url: "http://localhost:3000".to_string(),
            catalog: Catalog::new(Vec::new(), Vec::new()),
        });
        AddonService::new(stripe, pool)
    }

    async fn insert_user(pool: &PgPool) -> Uuid {
        let user_id = Uuid::new_v4();
        sqlx::query("INSERT INTO user_billing (user_id, email) VALUES ($1, $2)")
            .bind(user_id)
            .bind(format!("{}@example.com", user_id))
            .execute(pool)
            .await
            .unwrap();
        user_id
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_attach_detach_attach_keeps_single_active_row() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = pagecraft_shared::create_pool(&url).await.unwrap();
        let service = test_service(pool.clone());
        let user_id = insert_user(&pool).await;

        service
            .mark_attached(user_id, "ecommerce", "price_ecom_m")
            .await
            .unwrap();
        service.mark_detached(user_id, "ecommerce").await.unwrap();
        service
            .mark_attached(user_id, "ecommerce", "price_ecom_m")
            .await
            .unwrap();

        let active = service.active_addons(user_id).await.unwrap();
        assert_eq!(active.len(), 1);

        // History is preserved: two rows total, one active
        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM addon_ledger WHERE user_id = $1 AND addon_id = 'ecommerce'",
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(total.0, 2);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_deactivate_all_cascades() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = pagecraft_shared::create_pool(&url).await.unwrap();
        let service = test_service(pool.clone());
        let user_id = insert_user(&pool).await;

        service
            .mark_attached(user_id, "ecommerce", "price_ecom_m")
            .await
            .unwrap();
        service
            .mark_attached(user_id, "content-manager", "price_cm_m")
            .await
            .unwrap();

        let flipped = service.deactivate_all(user_id).await.unwrap();
        assert_eq!(flipped, 2);
        assert!(service.active_addons(user_id).await.unwrap().is_empty());
    }
}
