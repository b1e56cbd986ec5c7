//! Plan resolver
//!
//! Maps a normalized remote snapshot (or its absence) onto the
//! configured catalog, producing the resolved entitlement view that
//! every UI surface and authorization check consults. Nothing should
//! branch on cached local database fields for entitlement directly.
//!
//! `resolve` is pure and deterministic given its inputs: no side
//! effects, no network calls. That is what makes it independently
//! testable.

use pagecraft_shared::{BillingInterval, Catalog, PlanDefinition};
use serde::Serialize;
use time::OffsetDateTime;

use crate::snapshot::SubscriptionSnapshot;

/// The single authoritative answer to "what can this user do right now"
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEntitlement {
    /// Matched plan, or the base plan when no paid subscription exists
    /// or the remote price matches nothing configured
    pub plan: PlanDefinition,
    pub is_paid: bool,
    pub is_canceled: bool,
    pub interval: BillingInterval,
    pub current_period_end: Option<OffsetDateTime>,
    /// Active addon ids, mapped from the snapshot's addon price ids
    pub addon_ids: Vec<String>,
}

/// Resolve the entitlement view from the catalog and a fresh snapshot.
///
/// Absent snapshot means never subscribed (or the remote read failed on
/// a read path): the default unpaid entitlement on the base plan.
pub fn resolve(catalog: &Catalog, snapshot: Option<&SubscriptionSnapshot>) -> ResolvedEntitlement {
    let Some(snapshot) = snapshot else {
        return unpaid_default(catalog);
    };

    // past_due / incomplete must resolve unpaid even though a
    // subscription id exists: no access during failed billing.
    let is_paid = snapshot.status.is_entitled();

    // Historical/deprecated prices legitimately match nothing
    // configured; fall back to the base plan, never error.
    let plan = snapshot
        .base_price_id
        .as_deref()
        .and_then(|price_id| catalog.plan_for_price(price_id))
        .unwrap_or_else(|| catalog.base_plan())
        .clone();

    let interval = snapshot
        .base_price_id
        .as_deref()
        .and_then(|price_id| plan.interval_for_price(price_id))
        .unwrap_or_default();

    // Addon prices that match no configured addon are deprecated addons
    // no longer offered; drop them silently.
    let addon_ids = snapshot
        .addons
        .iter()
        .filter_map(|item| catalog.addon_for_price(&item.price_id))
        .map(|addon| addon.id.clone())
        .collect();

    ResolvedEntitlement {
        plan,
        is_paid,
        is_canceled: snapshot.cancel_at_period_end,
        interval,
        current_period_end: snapshot.current_period_end,
        addon_ids,
    }
}

fn unpaid_default(catalog: &Catalog) -> ResolvedEntitlement {
    ResolvedEntitlement {
        plan: catalog.base_plan().clone(),
        is_paid: false,
        is_canceled: false,
        interval: BillingInterval::default(),
        current_period_end: None,
        addon_ids: Vec::new(),
    }
}
