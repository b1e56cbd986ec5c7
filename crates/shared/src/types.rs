//! Core catalog types: plans, addons, billing intervals
//!
//! The catalog is the static configuration side of entitlement resolution.
//! Plan and addon definitions are immutable; their Stripe price ids are
//! loaded from the environment at startup, the prices themselves live in
//! Stripe.

use serde::{Deserialize, Serialize};

/// Billing interval for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Monthly,
    Yearly,
}

impl BillingInterval {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "yearly" | "annual" | "year" => Some(Self::Yearly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

/// A subscription plan definition
///
/// Exactly one plan in the catalog is the base (default) plan that
/// unpaid users resolve to; the catalog supports any number of plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    /// Stable plan slug (e.g. "starter")
    pub id: String,
    pub name: String,
    pub description: String,
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    /// Stripe price id for monthly billing
    pub monthly_price_id: Option<String>,
    /// Stripe price id for yearly billing
    pub yearly_price_id: Option<String>,
}

impl PlanDefinition {
    /// Check whether a Stripe price id belongs to this plan
    pub fn matches_price(&self, price_id: &str) -> bool {
        self.monthly_price_id.as_deref() == Some(price_id)
            || self.yearly_price_id.as_deref() == Some(price_id)
    }

    /// Derive the billing interval from one of this plan's price ids
    pub fn interval_for_price(&self, price_id: &str) -> Option<BillingInterval> {
        if self.monthly_price_id.as_deref() == Some(price_id) {
            Some(BillingInterval::Monthly)
        } else if self.yearly_price_id.as_deref() == Some(price_id) {
            Some(BillingInterval::Yearly)
        } else {
            None
        }
    }
}

/// An addon definition
///
/// Addons are separately priced line items layered on top of an active
/// base-plan subscription. The Stripe *product* behind each addon price
/// carries `metadata["addon"] = <addon id>`; that marker is how remote
/// line items are classified as addon vs. base plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonDefinition {
    /// Stable addon slug (e.g. "ecommerce")
    pub id: String,
    pub name: String,
    pub description: String,
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    pub monthly_price_id: Option<String>,
    pub yearly_price_id: Option<String>,
}

impl AddonDefinition {
    pub fn matches_price(&self, price_id: &str) -> bool {
        self.monthly_price_id.as_deref() == Some(price_id)
            || self.yearly_price_id.as_deref() == Some(price_id)
    }
}

/// What a submitted Stripe price id resolves to in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceKind {
    Plan,
    Addon,
}

/// The product metadata key that marks a Stripe product as an addon
pub const ADDON_METADATA_KEY: &str = "addon";

/// Static billing catalog: all configured plans and addons
#[derive(Debug, Clone)]
pub struct Catalog {
    plans: Vec<PlanDefinition>,
    addons: Vec<AddonDefinition>,
    /// Index into `plans` of the base (default) plan
    base_plan: usize,
}

impl Catalog {
    /// Build the catalog with price ids from environment variables
    ///
    /// Price id env vars are optional so that development environments
    /// without a full Stripe setup can still boot; a plan or addon with
    /// no configured price simply cannot be purchased.
    pub fn from_env() -> Self {
        let plans = vec![
            PlanDefinition {
                id: "starter".to_string(),
                name: "Starter".to_string(),
                description: "Everything you need to launch your site".to_string(),
                monthly_price_cents: 1900,
                yearly_price_cents: 19000,
                monthly_price_id: std::env::var("STRIPE_PRICE_STARTER_MONTHLY").ok(),
                yearly_price_id: std::env::var("STRIPE_PRICE_STARTER_YEARLY").ok(),
            },
            PlanDefinition {
                id: "business".to_string(),
                name: "Business".to_string(),
                description: "Advanced features for growing teams".to_string(),
                monthly_price_cents: 4900,
                yearly_price_cents: 49000,
                monthly_price_id: std::env::var("STRIPE_PRICE_BUSINESS_MONTHLY").ok(),
                yearly_price_id: std::env::var("STRIPE_PRICE_BUSINESS_YEARLY").ok(),
            },
        ];

        let addons = vec![
            AddonDefinition {
                id: "ecommerce".to_string(),
                name: "Ecommerce".to_string(),
                description: "Sell products with carts, checkout, and inventory".to_string(),
                monthly_price_cents: 1500,
                yearly_price_cents: 15000,
                monthly_price_id: std::env::var("STRIPE_PRICE_ECOMMERCE_MONTHLY").ok(),
                yearly_price_id: std::env::var("STRIPE_PRICE_ECOMMERCE_YEARLY").ok(),
            },
            AddonDefinition {
                id: "content-manager".to_string(),
                name: "Content Manager".to_string(),
                description: "Structured content collections and scheduling".to_string(),
                monthly_price_cents: 900,
                yearly_price_cents: 9000,
                monthly_price_id: std::env::var("STRIPE_PRICE_CONTENT_MANAGER_MONTHLY").ok(),
                yearly_price_id: std::env::var("STRIPE_PRICE_CONTENT_MANAGER_YEARLY").ok(),
            },
        ];

        Self {
            plans,
            addons,
            base_plan: 0,
        }
    }

    /// Construct a catalog from explicit definitions (used in tests)
    pub fn new(plans: Vec<PlanDefinition>, addons: Vec<AddonDefinition>) -> Self {
        Self {
            plans,
            addons,
            base_plan: 0,
        }
    }

    pub fn plans(&self) -> &[PlanDefinition] {
        &self.plans
    }

    pub fn addons(&self) -> &[AddonDefinition] {
        &self.addons
    }

    /// The base (default) plan unpaid users resolve to
    pub fn base_plan(&self) -> &PlanDefinition {
        &self.plans[self.base_plan]
    }

    /// Find the plan a Stripe price id belongs to
    pub fn plan_for_price(&self, price_id: &str) -> Option<&PlanDefinition> {
        self.plans.iter().find(|p| p.matches_price(price_id))
    }

    /// Find the addon a Stripe price id belongs to
    pub fn addon_for_price(&self, price_id: &str) -> Option<&AddonDefinition> {
        self.addons.iter().find(|a| a.matches_price(price_id))
    }

    pub fn addon_by_id(&self, addon_id: &str) -> Option<&AddonDefinition> {
        self.addons.iter().find(|a| a.id == addon_id)
    }

    /// Classify a submitted price id against the configured catalog
    pub fn price_kind(&self, price_id: &str) -> Option<PriceKind> {
        if self.plan_for_price(price_id).is_some() {
            Some(PriceKind::Plan)
        } else if self.addon_for_price(price_id).is_some() {
            Some(PriceKind::Addon)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_catalog() -> Catalog {
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
    fn test_billing_interval_from_str() {
        assert_eq!(
            BillingInterval::from_str("month"),
            Some(BillingInterval::Monthly)
        );
        assert_eq!(
            BillingInterval::from_str("annual"),
            Some(BillingInterval::Yearly)
        );
        assert_eq!(BillingInterval::from_str("weekly"), None);
    }

    #[test]
    fn test_plan_interval_for_price() {
        let catalog = test_catalog();
        let plan = catalog.base_plan();
        assert_eq!(
            plan.interval_for_price("price_starter_m"),
            Some(BillingInterval::Monthly)
        );
        assert_eq!(
            plan.interval_for_price("price_starter_y"),
            Some(BillingInterval::Yearly)
        );
        assert_eq!(plan.interval_for_price("price_other"), None);
    }

    #[test]
    fn test_price_kind_classification() {
        let catalog = test_catalog();
        assert_eq!(catalog.price_kind("price_starter_m"), Some(PriceKind::Plan));
        assert_eq!(catalog.price_kind("price_ecom_m"), Some(PriceKind::Addon));
        assert_eq!(catalog.price_kind("price_retired"), None);
    }

    #[test]
    fn test_addon_lookup_by_id() {
        let catalog = test_catalog();
        assert!(catalog.addon_by_id("ecommerce").is_some());
        assert!(catalog.addon_by_id("unknown").is_none());
    }
}
