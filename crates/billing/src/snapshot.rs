//! Remote subscription reader
//!
//! Normalizes the live Stripe subscription into a point-in-time
//! snapshot: base-plan line item, addon line items, status, cancellation
//! flag, period end, interval. The snapshot is a pure value derived
//! fresh on every read and never persisted.
//!
//! Classification rule: a line item is an addon iff the product behind
//! its price carries `metadata["addon"]`; otherwise it is treated as
//! the base-plan item. This product-level marker, not the price id, is
//! the discriminator, so the fetch expands `items.data.price.product`.

use pagecraft_shared::{BillingInterval, ADDON_METADATA_KEY};
use serde::{Deserialize, Serialize};
use stripe::SubscriptionId;
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Normalized subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    Canceled,
    Unpaid,
    /// Provider statuses with no local meaning (paused, incomplete_expired, ...)
    Other,
}

impl SubscriptionStatus {
    /// Statuses that grant paid entitlement. `past_due` and `incomplete`
    /// must NOT be entitled even though a subscription id exists.
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Incomplete => "incomplete",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Other => "unknown",
        }
    }
}

impl From<stripe::SubscriptionStatus> for SubscriptionStatus {
    fn from(status: stripe::SubscriptionStatus) -> Self {
        match status {
            stripe::SubscriptionStatus::Active => Self::Active,
            stripe::SubscriptionStatus::Trialing => Self::Trialing,
            stripe::SubscriptionStatus::PastDue => Self::PastDue,
            stripe::SubscriptionStatus::Incomplete => Self::Incomplete,
            stripe::SubscriptionStatus::Canceled => Self::Canceled,
            stripe::SubscriptionStatus::Unpaid => Self::Unpaid,
            _ => Self::Other,
        }
    }
}

/// An addon line item on the remote subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonItem {
    /// Stripe subscription item id (needed for detach)
    pub item_id: String,
    pub price_id: String,
    /// Addon id from the product marker
    pub addon_id: String,
}

/// A raw line item before base/addon classification
#[derive(Debug, Clone)]
pub struct RawLineItem {
    pub item_id: String,
    pub price_id: String,
    /// Value of the product's addon marker, when present
    pub addon_marker: Option<String>,
}

/// Normalized point-in-time view of the remote subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<OffsetDateTime>,
    /// Interval reported by the base item's recurring price
    pub interval: BillingInterval,
    /// Base-plan price id; absent when the subscription only carries addons
    pub base_price_id: Option<String>,
    pub base_item_id: Option<String>,
    /// Addon items in the order the provider lists them
    pub addons: Vec<AddonItem>,
}

impl SubscriptionSnapshot {
    pub fn addon_price_ids(&self) -> Vec<&str> {
        self.addons.iter().map(|a| a.price_id.as_str()).collect()
    }

    pub fn has_addon_price(&self, price_id: &str) -> bool {
        self.addons.iter().any(|a| a.price_id == price_id)
    }

    /// Find the remote item carrying a given addon marker
    pub fn addon_item(&self, addon_id: &str) -> Option<&AddonItem> {
        self.addons.iter().find(|a| a.addon_id == addon_id)
    }
}

/// Classify raw line items into (base item, addon items).
///
/// At most one base item is expected; when more than one is present the
/// first encountered is used and the condition is logged as anomalous.
pub fn classify_items(
    subscription_id: &str,
    items: Vec<RawLineItem>,
) -> (Option<RawLineItem>, Vec<AddonItem>) {
    let mut base: Option<RawLineItem> = None;
    let mut addons = Vec::new();

    for item in items {
        match item.addon_marker {
            Some(ref addon_id) => addons.push(AddonItem {
                item_id: item.item_id.clone(),
                price_id: item.price_id.clone(),
                addon_id: addon_id.clone(),
            }),
            None => {
                if let Some(ref existing) = base {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        kept_price_id = %existing.price_id,
                        extra_price_id = %item.price_id,
                        "Multiple base-plan items on subscription; keeping first"
                    );
                } else {
                    base = Some(item);
                }
            }
        }
    }

    (base, addons)
}

/// Reader for the remote subscription state
#[derive(Clone)]
pub struct SnapshotReader {
    stripe: StripeClient,
}

impl SnapshotReader {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Read the remote subscription for read paths.
    ///
    /// No id means the user never subscribed; a failed remote call is
    /// treated the same way (logged), so stale local hints can never
    /// grant entitlement the provider would not confirm.
    pub async fn read(
        &self,
        subscription_id: Option<&str>,
    ) -> BillingResult<Option<SubscriptionSnapshot>> {
        let Some(id) = subscription_id else {
            return Ok(None);
        };

        match self.fetch(id).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %id,
                    error = %e,
                    "Failed to read remote subscription; treating as absent"
                );
                Ok(None)
            }
        }
    }

    /// Read the remote subscription for write paths, which need a
    /// known-good subscription to mutate.
    pub async fn require(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        self.fetch(subscription_id).await
    }

    async fn fetch(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let subscription = stripe::Subscription::retrieve(
            self.stripe.inner(),
            &sub_id,
            &["items.data.price.product"],
        )
        .await?;

        Ok(normalize(&subscription))
    }
}

/// Build a snapshot from a fetched subscription
pub fn normalize(subscription: &stripe::Subscription) -> SubscriptionSnapshot {
    let subscription_id = subscription.id.to_string();

    let customer_id = Some(match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    });

    let raw: Vec<RawLineItem> = subscription
        .items
        .data
        .iter()
        .filter_map(|item| {
            let price = item.price.as_ref()?;
            let addon_marker = price.product.as_ref().and_then(|product| match product {
                stripe::Expandable::Object(p) => p
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get(ADDON_METADATA_KEY))
                    .cloned(),
                // Unexpanded product: cannot carry the marker, treat as base
                stripe::Expandable::Id(_) => None,
            });
            Some(RawLineItem {
                item_id: item.id.to_string(),
                price_id: price.id.to_string(),
                addon_marker,
            })
        })
        .collect();

    let interval = subscription
        .items
        .data
        .iter()
        .filter_map(|item| item.price.as_ref())
        .filter_map(|price| price.recurring.as_ref())
        .map(|recurring| match recurring.interval {
            stripe::RecurringInterval::Year => BillingInterval::Yearly,
            _ => BillingInterval::Monthly,
        })
        .next()
        .unwrap_or_default();

    let (base, addons) = classify_items(&subscription_id, raw);

    SubscriptionSnapshot {
        subscription_id,
        customer_id,
        status: subscription.status.into(),
        cancel_at_period_end: subscription.cancel_at_period_end,
        current_period_end: OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
            .ok(),
        interval,
        base_price_id: base.as_ref().map(|b| b.price_id.clone()),
        base_item_id: base.map(|b| b.item_id),
        addons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(item_id: &str, price_id: &str, marker: Option<&str>) -> RawLineItem {
        RawLineItem {
            item_id: item_id.to_string(),
            price_id: price_id.to_string(),
            addon_marker: marker.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_classify_base_and_addons() {
        let (base, addons) = classify_items(
            "sub_1",
            vec![
                raw("si_1", "price_starter_m", None),
                raw("si_2", "price_ecom_m", Some("ecommerce")),
                raw("si_3", "price_cm_m", Some("content-manager")),
            ],
        );

        let base = base.unwrap();
        assert_eq!(base.price_id, "price_starter_m");
        assert_eq!(addons.len(), 2);
        assert_eq!(addons[0].addon_id, "ecommerce");
        assert_eq!(addons[1].addon_id, "content-manager");
    }

    #[test]
    fn test_classify_keeps_first_of_multiple_base_items() {
        let (base, addons) = classify_items(
            "sub_1",
            vec![
                raw("si_1", "price_a", None),
                raw("si_2", "price_b", None),
            ],
        );

        assert_eq!(base.unwrap().price_id, "price_a");
        assert!(addons.is_empty());
    }

    #[test]
    fn test_classify_addon_only_subscription() {
        let (base, addons) =
            classify_items("sub_1", vec![raw("si_1", "price_ecom_m", Some("ecommerce"))]);

        assert!(base.is_none());
        assert_eq!(addons.len(), 1);
    }

    #[test]
    fn test_status_entitlement_gating() {
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::Trialing.is_entitled());
        assert!(!SubscriptionStatus::PastDue.is_entitled());
        assert!(!SubscriptionStatus::Incomplete.is_entitled());
        assert!(!SubscriptionStatus::Canceled.is_entitled());
        assert!(!SubscriptionStatus::Unpaid.is_entitled());
    }

    #[test]
    fn test_snapshot_addon_lookup() {
        let snapshot = SubscriptionSnapshot {
            subscription_id: "sub_1".to_string(),
            customer_id: Some("cus_1".to_string()),
            status: SubscriptionStatus::Active,
            cancel_at_period_end: false,
            current_period_end: None,
            interval: BillingInterval::Monthly,
            base_price_id: Some("price_starter_m".to_string()),
            base_item_id: Some("si_1".to_string()),
            addons: vec![AddonItem {
                item_id: "si_2".to_string(),
                price_id: "price_ecom_m".to_string(),
                addon_id: "ecommerce".to_string(),
            }],
        };

        assert!(snapshot.has_addon_price("price_ecom_m"));
        assert!(!snapshot.has_addon_price("price_cm_m"));
        assert_eq!(
            snapshot.addon_item("ecommerce").map(|a| a.item_id.as_str()),
            Some("si_2")
        );
    }
}
