//! Billing webhook pipeline
//!
//! Inbound subscription webhooks are verified with HMAC-SHA256 over the
//! raw body before anything else happens; a missing or invalid signature
//! rejects with no side effects. Accepted bodies are matched to a local
//! subscription by external id and applied as a state transition under a
//! row-level lock. Replays of the same external event id are no-ops.
//! Webhooks for unknown shop domains are acknowledged without mutation.

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditSource};
use crate::connectors::normalize_shop_domain;
use crate::core::{Clock, SystemClock};
use crate::entitlements::EntitlementCache;

use super::{
    subscriptions::{SubscriptionEvent, SubscriptionStore},
    BillingError, Result, SubscriptionStanding,
};

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// Signature Verification
// ============================================================================

/// Verify a platform HMAC-SHA256 signature (base64) over the raw body.
///
/// Uses the `Mac` verification API, which compares in constant time.
pub fn verify_webhook_hmac(secret: &str, raw_body: &[u8], signature_b64: &str) -> bool {
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the base64 signature for a body (test fixtures, outbound
/// deliveries).
pub fn sign_webhook_body(secret: &str, raw_body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(raw_body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

// ============================================================================
// Headers & Payload
// ============================================================================

/// Required webhook headers.
#[derive(Debug, Clone)]
pub struct WebhookHeaders {
    /// Base64 HMAC-SHA256 of the raw body (`X-Shopify-Hmac-Sha256`)
    pub hmac_sha256: String,

    /// Shop domain the event concerns (`X-Shopify-Shop-Domain`)
    pub shop_domain: String,

    /// Delivery id (`X-Shopify-Webhook-Id`), the idempotency anchor
    pub webhook_id: String,
}

/// Platform-native subscription payload (the fields this pipeline
/// consumes).
#[derive(Debug, Clone, Deserialize)]
struct SubscriptionWebhookBody {
    app_subscription: AppSubscription,
}

#[derive(Debug, Clone, Deserialize)]
struct AppSubscription {
    admin_graphql_api_id: String,
    status: String,
    #[serde(default)]
    current_period_end: Option<DateTime<Utc>>,
}

/// Map a platform status string to the normalized event.
fn event_for_status(status: &str) -> Option<SubscriptionEvent> {
    match status.to_uppercase().as_str() {
        "ACTIVE" => Some(SubscriptionEvent::Activated),
        "FROZEN" => Some(SubscriptionEvent::PaymentFailed),
        "UNFROZEN" => Some(SubscriptionEvent::PaymentRecovered),
        "CANCELLED" | "CANCELED" => Some(SubscriptionEvent::Cancelled),
        "EXPIRED" => Some(SubscriptionEvent::Expired),
        _ => None,
    }
}

// ============================================================================
// Disposition
// ============================================================================

/// Outcome of webhook processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "disposition")]
pub enum WebhookDisposition {
    /// State transition applied
    Applied {
        /// Tenant whose subscription changed
        tenant_id: Uuid,
        /// Event applied
        event: String,
        /// New status
        new_status: SubscriptionStanding,
    },
    /// Replay or out-of-order event; no state change
    NoOp,
    /// Shop domain not registered; acknowledged without mutation
    UnknownShop,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Processes verified subscription webhooks into state transitions.
pub struct WebhookPipeline {
    pool: PgPool,
    store: SubscriptionStore,
    cache: Arc<EntitlementCache>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    secret: String,
    grace_period_days: i64,
}

impl WebhookPipeline {
    /// Create a pipeline.
    pub fn new(
        pool: PgPool,
        cache: Arc<EntitlementCache>,
        audit: Arc<AuditLog>,
        secret: impl Into<String>,
        grace_period_days: i64,
    ) -> Self {
        Self {
            store: SubscriptionStore::new(pool.clone()),
            pool,
            cache,
            audit,
            clock: Arc::new(SystemClock),
            secret: secret.into(),
            grace_period_days,
        }
    }

    /// Create a pipeline with an injected clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Process a webhook delivery.
    ///
    /// Verification happens first: a bad signature returns
    /// [`BillingError::InvalidSignature`] and nothing is written.
    pub async fn handle(
        &self,
        headers: &WebhookHeaders,
        raw_body: &[u8],
    ) -> Result<WebhookDisposition> {
        if headers.hmac_sha256.is_empty()
            || !verify_webhook_hmac(&self.secret, raw_body, &headers.hmac_sha256)
        {
            tracing::warn!(
                shop_domain = headers.shop_domain,
                webhook_id = headers.webhook_id,
                "webhook signature verification failed"
            );
            return Err(BillingError::InvalidSignature);
        }

        let body: SubscriptionWebhookBody = serde_json::from_slice(raw_body)
            .map_err(|err| BillingError::InvalidPayload(err.to_string()))?;

        let event = event_for_status(&body.app_subscription.status).ok_or_else(|| {
            BillingError::InvalidPayload(format!(
                "unknown subscription status {}",
                body.app_subscription.status
            ))
        })?;

        // The shop-domain → tenant mapping is unique (duplicate-shop
        // guard), which is what prevents cross-tenant webhook leakage.
        let Some(tenant_id) = self.tenant_for_shop(&headers.shop_domain).await? else {
            tracing::info!(
                shop_domain = headers.shop_domain,
                webhook_id = headers.webhook_id,
                "webhook for unknown store acknowledged without mutation"
            );
            return Ok(WebhookDisposition::UnknownShop);
        };

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        // Delivery-level idempotency before any state read.
        if self
            .store
            .event_already_applied(&mut tx, &headers.webhook_id)
            .await?
        {
            tx.rollback().await?;
            return Ok(WebhookDisposition::NoOp);
        }

        let Some(subscription) = self
            .store
            .lock_by_external_id(&mut tx, &body.app_subscription.admin_graphql_api_id)
            .await?
        else {
            tx.rollback().await?;
            return Err(BillingError::SubscriptionNotFound(
                body.app_subscription.admin_graphql_api_id.clone(),
            ));
        };

        let (updated, applied) = self
            .store
            .apply_event(
                &mut tx,
                &subscription,
                event,
                &headers.webhook_id,
                self.grace_period_days,
                body.app_subscription.current_period_end,
                now,
            )
            .await?;

        tx.commit().await?;

        if !applied {
            return Ok(WebhookDisposition::NoOp);
        }

        // Immediate revocation path: the next entitlement read recomputes.
        self.cache
            .invalidate(tenant_id, &format!("billing_webhook:{}", event.as_str()));

        self.audit
            .write(
                AuditEvent::new(tenant_id, action_for_event(event))
                    .with_source(AuditSource::Webhook)
                    .with_resource("subscription", updated.id.to_string())
                    .with_metadata(serde_json::json!({
                        "event": event.as_str(),
                        "new_status": updated.status,
                        "external_subscription_id": updated.external_subscription_id,
                        "webhook_id": headers.webhook_id,
                        "grace_period_ends_on": updated.grace_period_ends_on.map(|t| t.to_rfc3339()),
                        "current_period_end": updated.current_period_end.map(|t| t.to_rfc3339()),
                    })),
            )
            .await;

        Ok(WebhookDisposition::Applied {
            tenant_id,
            event: event.as_str().to_string(),
            new_status: updated.status,
        })
    }

    /// Resolve the tenant owning a shop domain via the active enabled
    /// connection with that normalized domain.
    async fn tenant_for_shop(&self, shop_domain: &str) -> Result<Option<Uuid>> {
        let normalized = normalize_shop_domain(shop_domain);
        if normalized.is_empty() {
            return Ok(None);
        }

        let row: Option<(Uuid,)> = sqlx::query_as(
            r"
            SELECT tenant_id
            FROM connector_connections
            WHERE lower(
                    trim(
                        trailing '/' from
                        regexp_replace(
                            coalesce(configuration->>'shop_domain', ''),
                            '^https?://', '', 'i'
                        )
                    )
                ) = $1
              AND source_type IN ('shopify', 'source-shopify')
              AND status = 'active'
              AND is_enabled = TRUE
            LIMIT 1
            ",
        )
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(tenant_id,)| tenant_id))
    }
}

/// Audit action for an applied event.
fn action_for_event(event: SubscriptionEvent) -> AuditAction {
    match event {
        SubscriptionEvent::Activated => AuditAction::BillingSubscriptionActivated,
        SubscriptionEvent::PaymentFailed => AuditAction::BillingSubscriptionFrozen,
        SubscriptionEvent::PaymentRecovered => AuditAction::BillingSubscriptionRecovered,
        SubscriptionEvent::Cancelled => AuditAction::BillingSubscriptionCancelled,
        SubscriptionEvent::Expired => AuditAction::BillingSubscriptionExpired,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"app_subscription":{"admin_graphql_api_id":"gid://shopify/AppSubscription/1","status":"ACTIVE"}}"#;
        let signature = sign_webhook_body(SECRET, body);
        assert!(verify_webhook_hmac(SECRET, body, &signature));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let body = b"{}";
        let signature = sign_webhook_body(SECRET, body);
        assert!(!verify_webhook_hmac("other_secret", body, &signature));
        assert!(!verify_webhook_hmac(SECRET, b"tampered", &signature));
        assert!(!verify_webhook_hmac(SECRET, body, "not-base64!!!"));
        assert!(!verify_webhook_hmac(SECRET, body, ""));
    }

    #[test]
    fn test_event_mapping() {
        assert_eq!(event_for_status("ACTIVE"), Some(SubscriptionEvent::Activated));
        assert_eq!(
            event_for_status("frozen"),
            Some(SubscriptionEvent::PaymentFailed)
        );
        assert_eq!(
            event_for_status("UNFROZEN"),
            Some(SubscriptionEvent::PaymentRecovered)
        );
        assert_eq!(
            event_for_status("CANCELLED"),
            Some(SubscriptionEvent::Cancelled)
        );
        assert_eq!(
            event_for_status("CANCELED"),
            Some(SubscriptionEvent::Cancelled)
        );
        assert_eq!(event_for_status("EXPIRED"), Some(SubscriptionEvent::Expired));
        assert_eq!(event_for_status("DECLINED"), None);
    }

    #[test]
    fn test_body_parsing() {
        let body = br#"{
            "app_subscription": {
                "admin_graphql_api_id": "gid://shopify/AppSubscription/123",
                "status": "CANCELLED",
                "current_period_end": "2025-07-01T00:00:00Z"
            }
        }"#;
        let parsed: SubscriptionWebhookBody = serde_json::from_slice(body).unwrap();
        assert_eq!(
            parsed.app_subscription.admin_graphql_api_id,
            "gid://shopify/AppSubscription/123"
        );
        assert!(parsed.app_subscription.current_period_end.is_some());
    }

    #[test]
    fn test_action_for_event_covers_all() {
        assert_eq!(
            action_for_event(SubscriptionEvent::Cancelled),
            AuditAction::BillingSubscriptionCancelled
        );
        assert_eq!(
            action_for_event(SubscriptionEvent::PaymentFailed),
            AuditAction::BillingSubscriptionFrozen
        );
    }
}
