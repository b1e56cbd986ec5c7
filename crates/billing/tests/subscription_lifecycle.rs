//! Integration tests for the local subscription lifecycle
//!
//! These tests exercise the database side of the billing flow: the
//! absolute-state writes that webhook handlers perform, and the addon
//! ledger bookkeeping around them. They verify that redelivered writes
//! converge instead of drifting.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://..."
//! cargo test --test subscription_lifecycle -- --ignored
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use pagecraft_billing::addons::AddonService;
use pagecraft_billing::client::{StripeClient, StripeConfig};
use pagecraft_billing::store::BillingStore;
use pagecraft_shared::Catalog;

async fn setup() -> (PgPool, BillingStore, AddonService) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = pagecraft_shared::create_pool(&database_url)
        .await
        .expect("Failed to connect to test database");
    pagecraft_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let stripe = StripeClient::new(StripeConfig {
        secret_key: "sk_test_unused".to_string(),
        webhook_secret: "whsec_unused".to_string(),
        app_base_url: "http://localhost:3000".to_string(),
        catalog: Catalog::new(Vec::new(), Vec::new()),
    });

    let store = BillingStore::new(pool.clone());
    let addons = AddonService::new(stripe, pool.clone());
    (pool, store, addons)
}

async fn create_test_user(pool: &PgPool) -> Uuid {
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO user_billing (user_id, email) VALUES ($1, $2)")
        .bind(user_id)
        .bind(format!("user-{}@example.com", user_id))
        .execute(pool)
        .await
        .unwrap();
    user_id
}

#[tokio::test]
#[ignore] // Requires database
async fn test_checkout_completion_write_is_idempotent() {
    let (_pool, store, _addons) = setup().await;
    let user_id = create_test_user(&_pool).await;

    let period_end = OffsetDateTime::from_unix_timestamp(1_893_456_000).unwrap();

    // Same absolute write twice, as a redelivered webhook would do
    for _ in 0..2 {
        store
            .apply_checkout_completed(
                user_id,
                "sub_test_1",
                "cus_test_1",
                Some("price_starter_m"),
                "active",
                Some(period_end),
            )
            .await
            .unwrap();
    }

    let record = store.require(user_id).await.unwrap();
    assert_eq!(record.stripe_subscription_id.as_deref(), Some("sub_test_1"));
    assert_eq!(record.stripe_customer_id.as_deref(), Some("cus_test_1"));
    assert_eq!(record.subscription_status.as_deref(), Some("active"));
    assert_eq!(record.current_period_end, Some(period_end));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_customer_id_never_reassigned() {
    let (_pool, store, _addons) = setup().await;
    let user_id = create_test_user(&_pool).await;

    store.set_customer_id(user_id, "cus_first").await.unwrap();
    store.set_customer_id(user_id, "cus_second").await.unwrap();

    let record = store.require(user_id).await.unwrap();
    assert_eq!(record.stripe_customer_id.as_deref(), Some("cus_first"));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_deletion_clears_subscription_and_ledger() {
    let (_pool, store, addons) = setup().await;
    let user_id = create_test_user(&_pool).await;

    store
        .apply_checkout_completed(
            user_id,
            "sub_test_2",
            "cus_test_2",
            Some("price_starter_m"),
            "active",
            None,
        )
        .await
        .unwrap();
    addons
        .mark_attached(user_id, "ecommerce", "price_ecom_m")
        .await
        .unwrap();

    // What the subscription-deleted handler does
    store.clear_subscription(user_id).await.unwrap();
    let deactivated = addons.deactivate_all(user_id).await.unwrap();

    assert_eq!(deactivated, 1);
    let record = store.require(user_id).await.unwrap();
    assert!(record.stripe_subscription_id.is_none());
    assert!(record.stripe_price_id.is_none());
    assert_eq!(record.subscription_status.as_deref(), Some("canceled"));
    assert!(addons.active_addons(user_id).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_find_by_subscription_matches_linked_user() {
    let (_pool, store, _addons) = setup().await;
    let user_id = create_test_user(&_pool).await;

    store
        .apply_checkout_completed(user_id, "sub_lookup", "cus_lookup", None, "active", None)
        .await
        .unwrap();

    let found = store.find_by_subscription("sub_lookup").await.unwrap();
    assert_eq!(found.map(|r| r.user_id), Some(user_id));

    let missing = store.find_by_subscription("sub_absent").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_webhook_event_claim_is_exclusive() {
    let (pool, _store, _addons) = setup().await;
    let event_id = format!("evt_{}", Uuid::new_v4());

    let claim = |pool: PgPool| {
        let event_id = event_id.clone();
        async move {
            sqlx::query_as::<_, (Uuid,)>(
            "INSERT INTO stripe_webhook_events (stripe_event_id, event_type)
             VALUES ($1, 'customer.subscription.updated')
             ON CONFLICT (stripe_event_id) DO NOTHING
             RETURNING id",
            )
            .bind(event_id)
            .fetch_optional(&pool)
            .await
        }
    };

    let first = claim(pool.clone()).await.unwrap();
    let second = claim(pool.clone()).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
}
