//! Subscription state machine
//!
//! Transitions:
//!
//! - `pending → active` on activation
//! - `active → frozen` on payment failure (grace window opens)
//! - `frozen → active` on payment recovery (grace cleared)
//! - `active | frozen → canceled` on cancellation (access retained until
//!   period end)
//! - `* → expired` on a provider-expired notice
//!
//! Transitions for one subscription are serialized by row-level lock;
//! webhook and reconciliation writers converge deterministically because
//! both read by `external_subscription_id` then lock-then-write. Replays
//! of an already-applied event are no-ops.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{BillingError, BillingEventRecord, Result, Subscription, SubscriptionStanding};

// ============================================================================
// Events
// ============================================================================

/// Normalized billing events applied to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEvent {
    /// Activation notice
    Activated,
    /// Payment failed
    PaymentFailed,
    /// Payment recovered
    PaymentRecovered,
    /// Cancellation notice
    Cancelled,
    /// Provider-expired notice
    Expired,
}

impl SubscriptionEvent {
    /// Stable string form for event records and audit metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activated => "activated",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentRecovered => "payment_recovered",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

/// Next status for `(current, event)`, or `None` when the event does not
/// apply to the current state (idempotent replay or out-of-order
/// delivery).
pub fn next_status(
    current: SubscriptionStanding,
    event: SubscriptionEvent,
) -> Option<SubscriptionStanding> {
    use SubscriptionEvent as E;
    use SubscriptionStanding as S;

    match (current, event) {
        (S::Pending, E::Activated) => Some(S::Active),
        (S::Active, E::PaymentFailed) => Some(S::Frozen),
        (S::Frozen, E::PaymentRecovered) => Some(S::Active),
        (S::Active | S::Frozen, E::Cancelled) => Some(S::Canceled),
        (current, E::Expired) if current != S::Expired => Some(S::Expired),
        _ => None,
    }
}

// ============================================================================
// Store
// ============================================================================

/// Persistence for subscriptions and their event records.
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    /// Create a store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool, for transaction composition.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a pending subscription for a tenant.
    pub async fn create(
        &self,
        tenant_id: Uuid,
        plan_id: &str,
        external_subscription_id: &str,
        current_period_end: Option<DateTime<Utc>>,
    ) -> Result<Subscription> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r"
            INSERT INTO subscriptions (
                id, tenant_id, plan_id, status, grace_period_ends_on,
                current_period_end, external_subscription_id, created_at
            )
            VALUES ($1, $2, $3, $4, NULL, $5, $6, $7)
            RETURNING id, tenant_id, plan_id, status, grace_period_ends_on,
                      current_period_end, external_subscription_id, created_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(plan_id)
        .bind(SubscriptionStanding::Pending)
        .bind(current_period_end)
        .bind(external_subscription_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(subscription)
    }

    /// Fetch a subscription by platform id with a row-level lock inside
    /// the given transaction.
    pub async fn lock_by_external_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r"
            SELECT id, tenant_id, plan_id, status, grace_period_ends_on,
                   current_period_end, external_subscription_id, created_at
            FROM subscriptions
            WHERE external_subscription_id = $1
            FOR UPDATE
            ",
        )
        .bind(external_subscription_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(subscription)
    }

    /// Whether an external event id was already applied (webhook replay).
    pub async fn event_already_applied(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        external_event_id: &str,
    ) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM billing_events WHERE external_event_id = $1
            ",
        )
        .bind(external_event_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|(count,)| count > 0).unwrap_or(false))
    }

    /// Apply a normalized event to a locked subscription.
    ///
    /// Returns the updated row and whether state actually changed. Events
    /// that do not apply to the current state are recorded as no-ops.
    pub async fn apply_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
        event: SubscriptionEvent,
        external_event_id: &str,
        grace_period_days: i64,
        period_end_from_event: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(Subscription, bool)> {
        let next = next_status(subscription.status, event);

        let (updated, applied) = match next {
            None => (subscription.clone(), false),
            Some(new_status) => {
                let grace: Option<DateTime<Utc>> = match event {
                    SubscriptionEvent::PaymentFailed => {
                        Some(now + Duration::days(grace_period_days))
                    }
                    SubscriptionEvent::PaymentRecovered => None,
                    _ => subscription.grace_period_ends_on,
                };
                let period_end = period_end_from_event.or(subscription.current_period_end);

                let row = sqlx::query_as::<_, Subscription>(
                    r"
                    UPDATE subscriptions
                    SET status = $2, grace_period_ends_on = $3, current_period_end = $4
                    WHERE id = $1
                    RETURNING id, tenant_id, plan_id, status, grace_period_ends_on,
                              current_period_end, external_subscription_id, created_at
                    ",
                )
                .bind(subscription.id)
                .bind(new_status)
                .bind(grace)
                .bind(period_end)
                .fetch_one(&mut **tx)
                .await?;

                (row, true)
            }
        };

        sqlx::query(
            r"
            INSERT INTO billing_events (
                id, tenant_id, subscription_id, external_event_id,
                event_type, applied, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(Uuid::new_v4())
        .bind(subscription.tenant_id)
        .bind(subscription.id)
        .bind(external_event_id)
        .bind(event.as_str())
        .bind(applied)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok((updated, applied))
    }

    /// All active or frozen subscriptions (reconciliation scope).
    pub async fn live_subscriptions(&self) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r"
            SELECT id, tenant_id, plan_id, status, grace_period_ends_on,
                   current_period_end, external_subscription_id, created_at
            FROM subscriptions
            WHERE status IN ('active', 'frozen')
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Event records for a subscription, newest first.
    pub async fn events_for(&self, subscription_id: Uuid) -> Result<Vec<BillingEventRecord>> {
        let events = sqlx::query_as::<_, BillingEventRecord>(
            r"
            SELECT id, tenant_id, subscription_id, external_event_id,
                   event_type, applied, created_at
            FROM billing_events
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            ",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Fetch a subscription by id.
    pub async fn get(&self, subscription_id: Uuid) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r"
            SELECT id, tenant_id, plan_id, status, grace_period_ends_on,
                   current_period_end, external_subscription_id, created_at
            FROM subscriptions
            WHERE id = $1
            ",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionEvent as E;
    use SubscriptionStanding as S;

    #[test]
    fn test_activation() {
        assert_eq!(next_status(S::Pending, E::Activated), Some(S::Active));
        // Replay against the current state is a no-op
        assert_eq!(next_status(S::Active, E::Activated), None);
    }

    #[test]
    fn test_payment_failure_and_recovery() {
        assert_eq!(next_status(S::Active, E::PaymentFailed), Some(S::Frozen));
        assert_eq!(next_status(S::Frozen, E::PaymentRecovered), Some(S::Active));
        // Recovery without a freeze is a no-op
        assert_eq!(next_status(S::Active, E::PaymentRecovered), None);
        // Double failure is a no-op
        assert_eq!(next_status(S::Frozen, E::PaymentFailed), None);
    }

    #[test]
    fn test_cancellation_paths() {
        assert_eq!(next_status(S::Active, E::Cancelled), Some(S::Canceled));
        assert_eq!(next_status(S::Frozen, E::Cancelled), Some(S::Canceled));
        assert_eq!(next_status(S::Canceled, E::Cancelled), None);
        assert_eq!(next_status(S::Pending, E::Cancelled), None);
    }

    #[test]
    fn test_expiry_from_any_state() {
        for state in [S::Pending, S::Active, S::Frozen, S::Canceled] {
            assert_eq!(next_status(state, E::Expired), Some(S::Expired));
        }
        assert_eq!(next_status(S::Expired, E::Expired), None);
    }

    #[test]
    fn test_terminal_states_reject_lifecycle_events() {
        for event in [E::Activated, E::PaymentFailed, E::PaymentRecovered, E::Cancelled] {
            assert_eq!(next_status(S::Expired, event), None);
        }
    }
}
