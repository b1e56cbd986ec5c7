//! Checkout and subscription-modification orchestrator
//!
//! Decides, for a purchase intent, whether to start a new Stripe
//! checkout session or mutate the existing subscription in place, then
//! executes the remote calls plus local bookkeeping. The webhook (not
//! the checkout redirect) is the source of truth for completion.

use serde::Deserialize;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CreateSubscriptionItem, CustomerId, PriceId,
    SubscriptionId, SubscriptionItem,
};
use uuid::Uuid;

use pagecraft_shared::PriceKind;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::addons::AddonService;
use crate::snapshot::{SnapshotReader, SubscriptionSnapshot};
use crate::store::BillingStore;

fn default_quantity() -> u64 {
    1
}

/// One addon in a purchase intent
#[derive(Debug, Clone, Deserialize)]
pub struct AddonSelection {
    pub price_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u64,
}

/// A purchase intent: a base-plan selection and/or addon selections
#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseRequest {
    /// Stripe price id of the selected base plan, if any
    pub plan_price_id: Option<String>,
    #[serde(default)]
    pub addons: Vec<AddonSelection>,
}

/// Result of a purchase submission
#[derive(Debug, Clone)]
pub enum PurchaseOutcome {
    /// A new checkout session was created; redirect the user
    Checkout { url: String },
    /// The existing subscription was mutated in place
    Applied { attached: Vec<String> },
}

/// Which flow a purchase intent takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchasePath {
    /// Create a new checkout session for the full line-item set.
    /// The only path that can establish a brand-new subscription.
    NewCheckout,
    /// Attach addon items to the live subscription, no redirect
    DirectAttach,
}

/// The core branch: a new checkout whenever there is no live
/// subscription or a base plan is being (re)selected; otherwise the
/// addons-only intent mutates the live subscription directly.
pub fn decide_path(has_subscription: bool, base_plan_selected: bool) -> PurchasePath {
    if !has_subscription || base_plan_selected {
        PurchasePath::NewCheckout
    } else {
        PurchasePath::DirectAttach
    }
}

/// A validated addon selection with its catalog identity
#[derive(Debug, Clone)]
pub struct ValidatedAddon {
    pub addon_id: String,
    pub price_id: String,
    pub quantity: u64,
}

/// A purchase request after catalog validation
#[derive(Debug, Clone)]
pub struct ValidatedPurchase {
    pub plan_price_id: Option<String>,
    pub addons: Vec<ValidatedAddon>,
}

/// Validate a purchase request against the configured catalog.
///
/// Caller-supplied price ids are never trusted blindly: every id must
/// resolve to a configured plan or addon (remote validation against
/// Stripe's price catalog happens separately, before any mutation).
pub fn validate_request(
    catalog: &pagecraft_shared::Catalog,
    request: &PurchaseRequest,
) -> BillingResult<ValidatedPurchase> {
    if request.plan_price_id.is_none() && request.addons.is_empty() {
        return Err(BillingError::InvalidInput(
            "Select a plan or at least one addon".to_string(),
        ));
    }

    if let Some(ref price_id) = request.plan_price_id {
        if catalog.price_kind(price_id) != Some(PriceKind::Plan) {
            return Err(BillingError::InvalidPrice(price_id.clone()));
        }
    }

    let mut addons = Vec::with_capacity(request.addons.len());
    for selection in &request.addons {
        if selection.quantity == 0 {
            return Err(BillingError::InvalidInput(format!(
                "Quantity for {} must be at least 1",
                selection.price_id
            )));
        }

        let addon = catalog
            .addon_for_price(&selection.price_id)
            .ok_or_else(|| BillingError::InvalidPrice(selection.price_id.clone()))?;

        if addons
            .iter()
            .any(|a: &ValidatedAddon| a.addon_id == addon.id)
        {
            return Err(BillingError::InvalidInput(format!(
                "Addon {} selected more than once",
                addon.id
            )));
        }

        addons.push(ValidatedAddon {
            addon_id: addon.id.clone(),
            price_id: selection.price_id.clone(),
            quantity: selection.quantity,
        });
    }

    Ok(ValidatedPurchase {
        plan_price_id: request.plan_price_id.clone(),
        addons,
    })
}

/// How the checkout session identifies the payer: by customer id when
/// known, otherwise by email. Never both.
#[derive(Debug, Clone)]
pub enum CustomerRef {
    Id(CustomerId),
    Email(String),
}

/// Assemble the checkout session parameters in one step.
///
/// The user id is stamped on both the session metadata and the
/// subscription metadata: the former routes the checkout-completed
/// webhook, the latter lets later subscription lifecycle events
/// resolve their owner without a local subscription-id lookup.
fn checkout_session_params<'a>(
    customer: &'a CustomerRef,
    billing_url: &'a str,
    purchase: &ValidatedPurchase,
    user_id: Uuid,
) -> CreateCheckoutSession<'a> {
    let mut line_items = Vec::new();
    if let Some(ref price_id) = purchase.plan_price_id {
        line_items.push(CreateCheckoutSessionLineItems {
            price: Some(price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        });
    }
    for addon in &purchase.addons {
        line_items.push(CreateCheckoutSessionLineItems {
            price: Some(addon.price_id.clone()),
            quantity: Some(addon.quantity),
            ..Default::default()
        });
    }

    let mut metadata = std::collections::HashMap::new();
    metadata.insert("user_id".to_string(), user_id.to_string());

    let mut params = CreateCheckoutSession {
        mode: Some(CheckoutSessionMode::Subscription),
        line_items: Some(line_items),
        success_url: Some(billing_url),
        cancel_url: Some(billing_url),
        metadata: Some(metadata.clone()),
        subscription_data: Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata),
            ..Default::default()
        }),
        allow_promotion_codes: Some(true),
        ..Default::default()
    };
    match customer {
        CustomerRef::Id(id) => params.customer = Some(id.clone()),
        CustomerRef::Email(email) => params.customer_email = Some(email),
    }

    params
}

/// Purchase orchestration service
#[derive(Clone)]
pub struct PurchaseService {
    stripe: StripeClient,
    store: BillingStore,
    customers: CustomerService,
    snapshots: SnapshotReader,
    ledger: AddonService,
}

impl PurchaseService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            store: BillingStore::new(pool.clone()),
            customers: CustomerService::new(stripe.clone(), pool.clone()),
            snapshots: SnapshotReader::new(stripe.clone()),
            ledger: AddonService::new(stripe.clone(), pool),
            stripe,
        }
    }

    /// Submit a purchase intent for a user.
    ///
    /// Returns a checkout URL for new-subscription flows, or applies
    /// addon attaches directly to a live subscription ("silent upsell").
    pub async fn submit_purchase(
        &self,
        user_id: Uuid,
        request: PurchaseRequest,
    ) -> BillingResult<PurchaseOutcome> {
        let validated = validate_request(self.stripe.catalog(), &request)?;

        // Validate every submitted price against the live Stripe price
        // catalog before use, so a retired id cannot be purchased even
        // if it lingers in local configuration.
        if let Some(ref price_id) = validated.plan_price_id {
            self.verify_live_price(price_id).await?;
        }
        for addon in &validated.addons {
            self.verify_live_price(&addon.price_id).await?;
        }

        let record = self.store.require(user_id).await?;
        let snapshot = self
            .snapshots
            .read(record.stripe_subscription_id.as_deref())
            .await?;

        // A local subscription id with an unreadable remote state must
        // not silently fork into a second subscription on an
        // addons-only purchase.
        if snapshot.is_none()
            && record.stripe_subscription_id.is_some()
            && validated.plan_price_id.is_none()
        {
            return Err(BillingError::SubscriptionRequired(
                "Existing subscription could not be read; try again".to_string(),
            ));
        }

        match decide_path(snapshot.is_some(), validated.plan_price_id.is_some()) {
            PurchasePath::NewCheckout => self.create_checkout(user_id, &record.email, &validated).await,
            PurchasePath::DirectAttach => {
                // decide_path only picks DirectAttach when a snapshot exists
                let snapshot = snapshot.ok_or_else(|| {
                    BillingError::Internal("Direct attach without live subscription".to_string())
                })?;
                self.attach_addons(user_id, &snapshot, &validated.addons).await
            }
        }
    }

    /// Check a price id against Stripe's live catalog
    async fn verify_live_price(&self, price_id: &str) -> BillingResult<()> {
        let parsed = price_id
            .parse::<PriceId>()
            .map_err(|_| BillingError::InvalidPrice(price_id.to_string()))?;

        let price = match stripe::Price::retrieve(self.stripe.inner(), &parsed, &[]).await {
            Ok(price) => price,
            Err(stripe::StripeError::Stripe(ref req)) if req.http_status == 404 => {
                return Err(BillingError::InvalidPrice(price_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if price.active == Some(false) {
            return Err(BillingError::InvalidPrice(price_id.to_string()));
        }

        Ok(())
    }

    /// Create a checkout session covering the full desired line-item set
    async fn create_checkout(
        &self,
        user_id: Uuid,
        email: &str,
        purchase: &ValidatedPurchase,
    ) -> BillingResult<PurchaseOutcome> {
        // Create the customer up front and persist immediately, so a
        // retry after partial failure reuses it instead of duplicating.
        let customer = match self.customers.get_or_create_customer_id(user_id).await {
            Ok(id) => {
                let parsed = id.parse::<CustomerId>().map_err(|e| {
                    BillingError::StripeApi(format!("Invalid customer ID: {}", e))
                })?;
                CustomerRef::Id(parsed)
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Customer creation failed; falling back to email checkout"
                );
                CustomerRef::Email(email.to_string())
            }
        };

        // Success and cancel both route to the billing page: the
        // webhook, not the redirect, confirms completion.
        let billing_url = self.stripe.config().billing_url();

        let params = checkout_session_params(&customer, &billing_url, purchase, user_id);
        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        let url = session
            .url
            .clone()
            .ok_or_else(|| BillingError::StripeApi("Checkout session has no URL".to_string()))?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            plan_price = ?purchase.plan_price_id,
            addon_count = purchase.addons.len(),
            "Created checkout session"
        );

        Ok(PurchaseOutcome::Checkout { url })
    }

    /// Attach addons directly to the live subscription.
    ///
    /// Not transactional against Stripe: items attached before a later
    /// failure stay attached and ledgered, and the structured error
    /// enumerates both sides so the caller retries only the remainder.
    async fn attach_addons(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        addons: &[ValidatedAddon],
    ) -> BillingResult<PurchaseOutcome> {
        let sub_id = snapshot
            .subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let mut attached = Vec::new();
        let mut failed = Vec::new();

        for addon in addons {
            // Already live on the subscription: no-op success
            if snapshot.has_addon_price(&addon.price_id)
                || snapshot.addon_item(&addon.addon_id).is_some()
            {
                tracing::info!(
                    user_id = %user_id,
                    addon_id = %addon.addon_id,
                    "Addon already attached; skipping"
                );
                attached.push(addon.addon_id.clone());
                continue;
            }

            let price_id = match addon.price_id.parse::<PriceId>() {
                Ok(id) => id,
                Err(e) => {
                    failed.push((addon.addon_id.clone(), format!("Invalid price ID: {}", e)));
                    continue;
                }
            };

            let mut create_item = CreateSubscriptionItem::new(sub_id.clone());
            create_item.price = Some(price_id);
            create_item.quantity = Some(addon.quantity);

            match SubscriptionItem::create(self.stripe.inner(), create_item).await {
                Ok(item) => {
                    tracing::info!(
                        user_id = %user_id,
                        addon_id = %addon.addon_id,
                        item_id = %item.id,
                        "Attached addon to subscription"
                    );

                    if let Err(e) = self
                        .ledger
                        .mark_attached(user_id, &addon.addon_id, &addon.price_id)
                        .await
                    {
                        // Remote attach succeeded; the resolver derives
                        // entitlement from the snapshot, so the ledger
                        // converges on the next webhook.
                        tracing::error!(
                            user_id = %user_id,
                            addon_id = %addon.addon_id,
                            error = %e,
                            "Addon attached remotely but ledger write failed"
                        );
                    }

                    attached.push(addon.addon_id.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        addon_id = %addon.addon_id,
                        error = %e,
                        "Failed to attach addon"
                    );
                    failed.push((addon.addon_id.clone(), e.to_string()));
                }
            }
        }

        if failed.is_empty() {
            Ok(PurchaseOutcome::Applied { attached })
        } else {
            Err(BillingError::PartialAttach { attached, failed })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagecraft_shared::{AddonDefinition, Catalog, PlanDefinition};

    fn test_catalog() -> Catalog {
        Catalog::new(
            vec![PlanDefinition {
                id: "starter".to_string(),
                name: "Starter".to_string(),
                description: String::new(),
                monthly_price_cents: 1900,
                yearly_price_cents: 19000,
                monthly_price_id: Some("price_starter_m".to_string()),
                yearly_price_id: Some("price_starter_y".to_string()),
            }],
            vec![AddonDefinition {
                id: "ecommerce".to_string(),
                name: "Ecommerce".to_string(),
                description: String::new(),
                monthly_price_cents: 1500,
                yearly_price_cents: 15000,
                monthly_price_id: Some("price_ecom_m".to_string()),
                yearly_price_id: None,
            }],
        )
    }

    #[test]
    fn test_decide_path_new_subscriber_always_checks_out() {
        assert_eq!(decide_path(false, true), PurchasePath::NewCheckout);
        assert_eq!(decide_path(false, false), PurchasePath::NewCheckout);
    }

    #[test]
    fn test_decide_path_base_reselect_checks_out() {
        assert_eq!(decide_path(true, true), PurchasePath::NewCheckout);
    }

    #[test]
    fn test_decide_path_addons_only_attach_directly() {
        assert_eq!(decide_path(true, false), PurchasePath::DirectAttach);
    }

    #[test]
    fn test_validate_rejects_empty_request() {
        let catalog = test_catalog();
        let result = validate_request(
            &catalog,
            &PurchaseRequest {
                plan_price_id: None,
                addons: Vec::new(),
            },
        );
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_plan_price() {
        let catalog = test_catalog();
        let result = validate_request(
            &catalog,
            &PurchaseRequest {
                plan_price_id: Some("price_retired".to_string()),
                addons: Vec::new(),
            },
        );
        match result {
            Err(BillingError::InvalidPrice(id)) => assert_eq!(id, "price_retired"),
            other => panic!("expected InvalidPrice, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_validate_rejects_addon_price_as_plan() {
        let catalog = test_catalog();
        let result = validate_request(
            &catalog,
            &PurchaseRequest {
                plan_price_id: Some("price_ecom_m".to_string()),
                addons: Vec::new(),
            },
        );
        assert!(matches!(result, Err(BillingError::InvalidPrice(_))));
    }

    #[test]
    fn test_validate_resolves_addon_identity() {
        let catalog = test_catalog();
        let validated = validate_request(
            &catalog,
            &PurchaseRequest {
                plan_price_id: Some("price_starter_m".to_string()),
                addons: vec![AddonSelection {
                    price_id: "price_ecom_m".to_string(),
                    quantity: 1,
                }],
            },
        )
        .unwrap();

        assert_eq!(validated.addons.len(), 1);
        assert_eq!(validated.addons[0].addon_id, "ecommerce");
    }

    #[test]
    fn test_validate_rejects_zero_quantity() {
        let catalog = test_catalog();
        let result = validate_request(
            &catalog,
            &PurchaseRequest {
                plan_price_id: None,
                addons: vec![AddonSelection {
                    price_id: "price_ecom_m".to_string(),
                    quantity: 0,
                }],
            },
        );
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_addon() {
        let catalog = test_catalog();
        let result = validate_request(
            &catalog,
            &PurchaseRequest {
                plan_price_id: None,
                addons: vec![
                    AddonSelection {
                        price_id: "price_ecom_m".to_string(),
                        quantity: 1,
                    },
                    AddonSelection {
                        price_id: "price_ecom_m".to_string(),
                        quantity: 1,
                    },
                ],
            },
        );
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
    }

    #[test]
    fn test_session_params_stamp_user_on_session_and_subscription() {
        let user_id = Uuid::new_v4();
        let customer = CustomerRef::Email("owner@example.com".to_string());
        let purchase = ValidatedPurchase {
            plan_price_id: Some("price_starter_m".to_string()),
            addons: vec![ValidatedAddon {
                addon_id: "ecommerce".to_string(),
                price_id: "price_ecom_m".to_string(),
                quantity: 2,
            }],
        };

        let params = checkout_session_params(
            &customer,
            "https://pagecraft.test/account/billing",
            &purchase,
            user_id,
        );

        let items = params.line_items.unwrap();
        assert_eq!(items.len(), 2);
        let session_meta = params.metadata.unwrap();
        assert_eq!(session_meta.get("user_id"), Some(&user_id.to_string()));
        let sub_meta = params.subscription_data.unwrap().metadata.unwrap();
        assert_eq!(sub_meta.get("user_id"), Some(&user_id.to_string()));
    }

    #[test]
    fn test_session_params_set_customer_id_or_email() {
        let user_id = Uuid::new_v4();
        let purchase = ValidatedPurchase {
            plan_price_id: Some("price_starter_m".to_string()),
            addons: Vec::new(),
        };

        let customer_id: stripe::CustomerId = "cus_123".parse().unwrap();
        let id_ref = CustomerRef::Id(customer_id.clone());
        let by_id = checkout_session_params(
            &id_ref,
            "https://pagecraft.test/account/billing",
            &purchase,
            user_id,
        );
        assert_eq!(by_id.customer, Some(customer_id));
        assert!(by_id.customer_email.is_none());

        let email_ref = CustomerRef::Email("owner@example.com".to_string());
        let by_email = checkout_session_params(
            &email_ref,
            "https://pagecraft.test/account/billing",
            &purchase,
            user_id,
        );
        assert!(by_email.customer.is_none());
        assert_eq!(by_email.customer_email, Some("owner@example.com"));
    }
}
