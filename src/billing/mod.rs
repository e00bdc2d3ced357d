//! Billing state machine and webhook pipeline
//!
//! Subscription lifecycle driven by HMAC-verified platform webhooks, with
//! a periodic reconciliation backstop:
//!
//! - **Subscriptions** (`subscriptions`): the persisted state machine;
//!   transitions are serialized by row-level lock
//! - **Webhook** (`webhook`): HMAC-SHA256 verification over the raw body,
//!   idempotent event application, unknown-shop acknowledgement
//! - **Reconciliation** (`reconciliation`): drift correction against the
//!   provider of record for missed webhooks
//!
//! Every transition writes a billing event record and invalidates the
//! tenant's entitlement cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use crate::entitlements::SubscriptionStanding;

pub mod plans;
pub mod reconciliation;
pub mod subscriptions;
pub mod webhook;

pub use plans::{Plan, PlanAdminService};
pub use reconciliation::{BillingProvider, ProviderSubscriptionState, Reconciler};
pub use subscriptions::{next_status, SubscriptionEvent, SubscriptionStore};
pub use webhook::{verify_webhook_hmac, WebhookDisposition, WebhookHeaders, WebhookPipeline};

// ============================================================================
// Error Types
// ============================================================================

/// Billing subsystem errors
#[derive(Error, Debug)]
pub enum BillingError {
    /// HMAC signature missing or invalid; reject with no side effects
    #[error("Webhook signature verification failed")]
    InvalidSignature,

    /// Webhook body could not be parsed
    #[error("Webhook payload invalid: {0}")]
    InvalidPayload(String),

    /// Subscription not found
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Provider lookup failed during reconciliation
    #[error("Billing provider error: {0}")]
    Provider(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for billing operations
pub type Result<T> = std::result::Result<T, BillingError>;

// ============================================================================
// Rows
// ============================================================================

/// A tenant's subscription to a plan. At most one non-terminal
/// subscription per tenant; when multiple are live the entitlement engine
/// picks deterministically by tier rank then recency.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    /// Subscription id
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Plan subscribed to
    pub plan_id: String,

    /// Raw status
    pub status: SubscriptionStanding,

    /// Grace window end, set on payment failure
    pub grace_period_ends_on: Option<DateTime<Utc>>,

    /// End of the paid period
    pub current_period_end: Option<DateTime<Utc>>,

    /// Id of the subscription at the billing platform
    pub external_subscription_id: String,

    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// Persisted record of an applied billing event (idempotency anchor).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEventRecord {
    /// Event record id
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Subscription affected
    pub subscription_id: Uuid,

    /// Platform event id (unique per delivery)
    pub external_event_id: String,

    /// Event type applied
    pub event_type: String,

    /// Whether the event changed state (false for idempotent replays)
    pub applied: bool,

    /// Receipt instant
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_serializes() {
        let subscription = Subscription {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            plan_id: "plan_growth".to_string(),
            status: SubscriptionStanding::Active,
            grace_period_ends_on: None,
            current_period_end: Some(Utc::now()),
            external_subscription_id: "gid://shopify/AppSubscription/1".to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&subscription).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["plan_id"], "plan_growth");
    }
}
