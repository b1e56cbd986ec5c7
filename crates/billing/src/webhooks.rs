//! Stripe webhook handling
//!
//! Webhook events are the source of truth for subscription lifecycle:
//! checkout completion links the subscription, update events refresh
//! the cached status, deletion clears the linkage and the addon
//! ledger. Handlers are idempotent (absolute-state writes plus an
//! event claim table), so provider redelivery is harmless.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{CheckoutSession, Event, EventObject, EventType, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::addons::AddonService;
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::snapshot::{SnapshotReader, SubscriptionSnapshot, SubscriptionStatus};
use crate::store::BillingStore;

type HmacSha256 = Hmac<Sha256>;

/// Timestamp tolerance for signature verification
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a Stripe signature header against a payload.
///
/// Manual verification, used when `Webhook::construct_event` rejects a
/// payload from a newer Stripe API version than the SDK pins. The
/// header format is `t=<timestamp>,v1=<hex hmac>`; the signed payload
/// is `"{timestamp}.{payload}"` keyed by the webhook secret without
/// its `whsec_` prefix.
pub fn check_signature(payload: &str, signature: &str, secret: &str) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::warn!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| BillingError::WebhookSignatureInvalid)?
        .as_secs() as i64;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            skew = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let expected = hex::decode(&v1_signature).map_err(|_| {
        tracing::warn!("Non-hex v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    // verify_slice compares in constant time.
    mac.verify_slice(&expected).map_err(|_| {
        tracing::warn!("Webhook signature mismatch");
        BillingError::WebhookSignatureInvalid
    })?;

    Ok(())
}

/// Verify a signature manually and parse the payload into an event.
///
/// The lenient path behind [`WebhookService::verify_event`]: checks the
/// signature ourselves, then parses the event JSON directly so fields
/// the SDK's pinned API version does not know about are ignored rather
/// than fatal.
pub fn verify_signed_payload(payload: &str, signature: &str, secret: &str) -> BillingResult<Event> {
    check_signature(payload, signature, secret)?;

    let event: Event = serde_json::from_str(payload).map_err(|e| {
        tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
        BillingError::WebhookSignatureInvalid
    })?;

    Ok(event)
}

/// Webhook verification and dispatch service
#[derive(Clone)]
pub struct WebhookService {
    stripe: StripeClient,
    pool: PgPool,
    store: BillingStore,
    snapshots: SnapshotReader,
    ledger: AddonService,
}

impl WebhookService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            store: BillingStore::new(pool.clone()),
            snapshots: SnapshotReader::new(stripe.clone()),
            ledger: AddonService::new(stripe.clone(), pool.clone()),
            stripe,
            pool,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the SDK's verification first, then falls back to manual
    /// signature verification so payloads from newer Stripe API
    /// versions are not rejected on deserialization quirks alone.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "SDK webhook verification failed, trying manual verification"
                );
            }
        }

        verify_signed_payload(payload, signature, webhook_secret)
    }

    /// Handle a verified Stripe event.
    ///
    /// Claims the event id atomically before processing; a duplicate
    /// delivery finds the claim and returns Ok. A processing failure
    /// releases the claim and returns the error, so the HTTP layer can
    /// answer 5xx and let Stripe redeliver.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO stripe_webhook_events (stripe_event_id, event_type)
             VALUES ($1, $2)
             ON CONFLICT (stripe_event_id) DO NOTHING
             RETURNING id",
        )
        .bind(&event_id)
        .bind(&event_type)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing webhook event"
        );

        let result = self.dispatch(&event).await;

        if let Err(ref e) = result {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "Webhook processing failed, releasing claim for redelivery"
            );
            sqlx::query("DELETE FROM stripe_webhook_events WHERE stripe_event_id = $1")
                .bind(&event_id)
                .execute(&self.pool)
                .await?;
        }

        result
    }

    async fn dispatch(&self, event: &Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                if let EventObject::CheckoutSession(ref session) = event.data.object {
                    self.handle_checkout_completed(session).await
                } else {
                    tracing::warn!(event_id = %event.id, "Unexpected object for checkout event");
                    Ok(())
                }
            }
            EventType::CustomerSubscriptionUpdated => {
                if let EventObject::Subscription(ref subscription) = event.data.object {
                    self.handle_subscription_updated(subscription).await
                } else {
                    tracing::warn!(event_id = %event.id, "Unexpected object for subscription event");
                    Ok(())
                }
            }
            EventType::CustomerSubscriptionDeleted => {
                if let EventObject::Subscription(ref subscription) = event.data.object {
                    self.handle_subscription_deleted(subscription).await
                } else {
                    tracing::warn!(event_id = %event.id, "Unexpected object for subscription event");
                    Ok(())
                }
            }
            _ => {
                tracing::debug!(event_type = %event.type_, "Ignoring unhandled event type");
                Ok(())
            }
        }
    }

    /// Link the subscription created by a completed checkout.
    ///
    /// The session metadata carries the user id stamped at session
    /// creation. The subscription is re-fetched so the write reflects
    /// current remote state rather than the event payload.
    async fn handle_checkout_completed(&self, session: &CheckoutSession) -> BillingResult<()> {
        let Some(user_id) = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(|v| Uuid::parse_str(v).ok())
        else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout session without user_id metadata, ignoring"
            );
            return Ok(());
        };

        let Some(subscription_id) = session.subscription.as_ref().map(|s| match s {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(sub) => sub.id.to_string(),
        }) else {
            tracing::warn!(
                session_id = %session.id,
                user_id = %user_id,
                "Completed checkout session carries no subscription"
            );
            return Ok(());
        };

        let snapshot = self.snapshots.require(&subscription_id).await?;

        let customer_id = snapshot
            .customer_id
            .clone()
            .or_else(|| {
                session.customer.as_ref().map(|c| match c {
                    stripe::Expandable::Id(id) => id.to_string(),
                    stripe::Expandable::Object(customer) => customer.id.to_string(),
                })
            })
            .ok_or_else(|| {
                BillingError::StripeApi("Subscription has no customer".to_string())
            })?;

        self.store
            .apply_checkout_completed(
                user_id,
                &subscription_id,
                &customer_id,
                snapshot.base_price_id.as_deref(),
                snapshot.status.as_str(),
                snapshot.current_period_end,
            )
            .await?;

        self.sync_addon_ledger(user_id, &snapshot).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            status = snapshot.status.as_str(),
            addon_count = snapshot.addons.len(),
            "Linked subscription from completed checkout"
        );

        Ok(())
    }

    /// Refresh the cached status and period end.
    ///
    /// Deliberately narrow: update events fire for many reasons and
    /// the cached price id is only a hint, so only the status fields
    /// are written.
    async fn handle_subscription_updated(&self, subscription: &Subscription) -> BillingResult<()> {
        let Some(user_id) = self.resolve_user(subscription).await? else {
            tracing::info!(
                subscription_id = %subscription.id,
                "Subscription update for unknown user, ignoring"
            );
            return Ok(());
        };

        let status = SubscriptionStatus::from(subscription.status);
        let period_end =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok();

        self.store
            .update_status(user_id, status.as_str(), period_end)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            status = status.as_str(),
            "Updated cached subscription status"
        );

        Ok(())
    }

    /// Clear the subscription linkage and deactivate the addon ledger
    async fn handle_subscription_deleted(&self, subscription: &Subscription) -> BillingResult<()> {
        let Some(user_id) = self.resolve_user(subscription).await? else {
            tracing::info!(
                subscription_id = %subscription.id,
                "Subscription deletion for unknown user, ignoring"
            );
            return Ok(());
        };

        self.store.clear_subscription(user_id).await?;
        let deactivated = self.ledger.deactivate_all(user_id).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            addons_deactivated = deactivated,
            "Cleared deleted subscription"
        );

        Ok(())
    }

    /// Resolve the owning user from subscription metadata, falling back
    /// to the local record keyed by subscription id.
    async fn resolve_user(&self, subscription: &Subscription) -> BillingResult<Option<Uuid>> {
        if let Some(user_id) = subscription
            .metadata
            .get("user_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        {
            return Ok(Some(user_id));
        }

        let record = self
            .store
            .find_by_subscription(subscription.id.as_str())
            .await?;
        Ok(record.map(|r| r.user_id))
    }

    /// Converge the local addon ledger onto the snapshot's addon set
    async fn sync_addon_ledger(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
    ) -> BillingResult<()> {
        let active = self.ledger.active_addons(user_id).await?;

        for entry in &active {
            if snapshot.addon_item(&entry.addon_id).is_none() {
                self.ledger.mark_detached(user_id, &entry.addon_id).await?;
            }
        }

        for addon in &snapshot.addons {
            if !active.iter().any(|e| e.addon_id == addon.addon_id) {
                self.ledger
                    .mark_attached(user_id, &addon.addon_id, &addon.price_id)
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    const SECRET: &str = "whsec_test_signing_secret";

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let t = now();
        let header = format!("t={},v1={}", t, sign(payload, t, SECRET));
        assert!(check_signature(payload, &header, SECRET).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let t = now();
        let header = format!("t={},v1={}", t, sign(payload, t, SECRET));
        let result = check_signature(r#"{"id":"evt_2"}"#, &header, SECRET);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let t = now();
        let header = format!("t={},v1={}", t, sign(payload, t, "whsec_other_secret"));
        let result = check_signature(payload, &header, SECRET);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let t = now() - SIGNATURE_TOLERANCE_SECS - 60;
        let header = format!("t={},v1={}", t, sign(payload, t, SECRET));
        let result = check_signature(payload, &header, SECRET);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_malformed_header_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        for header in ["", "t=abc", "v1=deadbeef", "not a header"] {
            let result = check_signature(payload, header, SECRET);
            assert!(
                matches!(result, Err(BillingError::WebhookSignatureInvalid)),
                "header {:?} should be rejected",
                header
            );
        }
    }

    #[test]
    fn test_unprefixed_secret_accepted() {
        // Secrets without the whsec_ prefix are used as-is
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "raw_signing_key";
        let t = now();
        let header = format!("t={},v1={}", t, sign(payload, t, secret));
        assert!(check_signature(payload, &header, secret).is_ok());
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = format!("t={},v1=not-hex-at-all", now());
        let result = check_signature(payload, &header, SECRET);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_manual_fallback_parses_signed_event() {
        let payload = r#"{
            "id": "evt_manual_1",
            "object": "event",
            "api_version": "2023-10-16",
            "created": 1700000000,
            "data": {"object": {"object": "price", "id": "price_123"}},
            "livemode": false,
            "pending_webhooks": 0,
            "type": "price.created"
        }"#;
        let t = now();
        let header = format!("t={},v1={}", t, sign(payload, t, SECRET));

        let event = verify_signed_payload(payload, &header, SECRET).unwrap();
        assert_eq!(event.id.as_str(), "evt_manual_1");
        assert_eq!(event.type_, EventType::PriceCreated);
    }

    #[test]
    fn test_manual_fallback_rejects_unsigned_event() {
        let payload = r#"{"id":"evt_manual_2","object":"event"}"#;
        let result = verify_signed_payload(payload, "t=1,v1=deadbeef", SECRET);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }
}
