//! Stripe customer management

use sqlx::PgPool;
use stripe::{CreateCustomer, Customer, CustomerId};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Customer service for managing Stripe customers
#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeClient,
    store: BillingStore,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            stripe,
            store: BillingStore::new(pool),
        }
    }

    /// Get the user's Stripe customer id, creating the customer lazily
    /// on first need.
    ///
    /// The new id is persisted before returning so that a retry after a
    /// partial failure reuses the same customer instead of creating
    /// duplicates.
    pub async fn get_or_create_customer_id(&self, user_id: Uuid) -> BillingResult<String> {
        let record = self.store.require(user_id).await?;

        if let Some(customer_id) = record.stripe_customer_id {
            return Ok(customer_id);
        }

        let customer = self.create_customer(user_id, &record.email).await?;
        Ok(customer.id.to_string())
    }

    /// Create a new Stripe customer for a user
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<Customer> {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("platform".to_string(), "pagecraft".to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        self.store
            .set_customer_id(user_id, customer.id.as_str())
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer)
    }

    /// Get the Stripe customer id for a user, erroring when absent
    pub async fn get_customer_id(&self, user_id: Uuid) -> BillingResult<CustomerId> {
        let record = self.store.require(user_id).await?;

        match record.stripe_customer_id {
            Some(id) => id
                .parse::<CustomerId>()
                .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e))),
            None => Err(BillingError::CustomerNotFound(user_id.to_string())),
        }
    }
}
