#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PageCraft billing core
//!
//! Derives the authoritative "what is this user entitled to right now"
//! view from two independently-mutable sources of truth: the local
//! `user_billing` record and the live Stripe subscription. Purchase
//! flows, the addon ledger, and webhook-driven reconciliation all live
//! here; the API crate is a thin HTTP surface over these services.

pub mod addons;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod webhooks;

pub use error::{BillingError, BillingResult};

use sqlx::PgPool;

use crate::addons::AddonService;
use crate::checkout::PurchaseService;
use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::snapshot::SnapshotReader;
use crate::store::BillingStore;
use crate::webhooks::WebhookService;

/// All billing services bundled for the API layer
#[derive(Clone)]
pub struct Billing {
    pub stripe: StripeClient,
    pub store: BillingStore,
    pub customers: CustomerService,
    pub snapshots: SnapshotReader,
    pub addons: AddonService,
    pub purchases: PurchaseService,
    pub webhooks: WebhookService,
}

impl Billing {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let store = BillingStore::new(pool.clone());
        let customers = CustomerService::new(stripe.clone(), pool.clone());
        let snapshots = SnapshotReader::new(stripe.clone());
        let addons = AddonService::new(stripe.clone(), pool.clone());
        let purchases = PurchaseService::new(stripe.clone(), pool.clone());
        let webhooks = WebhookService::new(stripe.clone(), pool);
        Self {
            stripe,
            store,
            customers,
            snapshots,
            addons,
            purchases,
            webhooks,
        }
    }
}
