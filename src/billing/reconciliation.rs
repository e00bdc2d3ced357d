//! Billing reconciliation
//!
//! Periodic comparison of local subscription status against the provider
//! of record. Drift is corrected with the same locked transition path the
//! webhook uses, audited with `metadata.source = "reconciliation"`. This
//! is the backstop for missed webhooks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditSource};
use crate::core::{Clock, SystemClock};
use crate::entitlements::EntitlementCache;

use super::{
    subscriptions::{next_status, SubscriptionEvent, SubscriptionStore},
    Result, SubscriptionStanding,
};

// ============================================================================
// Provider Boundary
// ============================================================================

/// Subscription state at the billing provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSubscriptionState {
    /// Status at the provider
    pub status: SubscriptionStanding,

    /// Period end at the provider
    pub current_period_end: Option<DateTime<Utc>>,
}

/// Provider-of-record lookup boundary.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Fetch the current state of a subscription at the provider.
    async fn fetch_subscription(
        &self,
        external_subscription_id: &str,
    ) -> std::result::Result<Option<ProviderSubscriptionState>, String>;
}

// ============================================================================
// Reconciler
// ============================================================================

/// Summary of one reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationStats {
    /// Subscriptions compared
    pub checked: usize,

    /// Drift corrections applied
    pub corrected: usize,

    /// Provider lookups that failed
    pub lookup_failures: usize,
}

/// Compares local state to the provider and corrects drift.
pub struct Reconciler {
    pool: PgPool,
    store: SubscriptionStore,
    provider: Arc<dyn BillingProvider>,
    cache: Arc<EntitlementCache>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    grace_period_days: i64,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn BillingProvider>,
        cache: Arc<EntitlementCache>,
        audit: Arc<AuditLog>,
        grace_period_days: i64,
    ) -> Self {
        Self {
            store: SubscriptionStore::new(pool.clone()),
            pool,
            provider,
            cache,
            audit,
            clock: Arc::new(SystemClock),
            grace_period_days,
        }
    }

    /// Create a reconciler with an injected clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reconcile every active or frozen subscription.
    pub async fn run(&self) -> Result<ReconciliationStats> {
        let mut stats = ReconciliationStats::default();

        for subscription in self.store.live_subscriptions().await? {
            stats.checked += 1;

            let provider_state = match self
                .provider
                .fetch_subscription(&subscription.external_subscription_id)
                .await
            {
                Ok(Some(state)) => state,
                Ok(None) => {
                    // The provider no longer knows the subscription.
                    ProviderSubscriptionState {
                        status: SubscriptionStanding::Expired,
                        current_period_end: subscription.current_period_end,
                    }
                }
                Err(err) => {
                    stats.lookup_failures += 1;
                    tracing::warn!(
                        external_subscription_id = subscription.external_subscription_id,
                        error = err,
                        "provider lookup failed during reconciliation"
                    );
                    continue;
                }
            };

            if provider_state.status == subscription.status {
                continue;
            }

            let Some(event) = correction_event(subscription.status, provider_state.status) else {
                continue;
            };

            // Same lock-then-write path as the webhook, so concurrent
            // transitions converge deterministically.
            let now = self.clock.now();
            let mut tx = self.pool.begin().await?;
            let Some(locked) = self
                .store
                .lock_by_external_id(&mut tx, &subscription.external_subscription_id)
                .await?
            else {
                tx.rollback().await?;
                continue;
            };

            let event_id = format!("reconciliation:{}:{}", locked.id, now.timestamp());
            let (updated, applied) = self
                .store
                .apply_event(
                    &mut tx,
                    &locked,
                    event,
                    &event_id,
                    self.grace_period_days,
                    provider_state.current_period_end,
                    now,
                )
                .await?;
            tx.commit().await?;

            if !applied {
                continue;
            }

            stats.corrected += 1;
            self.cache
                .invalidate(updated.tenant_id, "billing_reconciliation");

            self.audit
                .write(
                    AuditEvent::new(updated.tenant_id, AuditAction::BillingPlanChanged)
                        .with_source(AuditSource::Worker)
                        .with_resource("subscription", updated.id.to_string())
                        .with_metadata(serde_json::json!({
                            "source": "reconciliation",
                            "previous_status": subscription.status,
                            "corrected_status": updated.status,
                            "external_subscription_id": updated.external_subscription_id,
                        })),
                )
                .await;
        }

        tracing::info!(
            checked = stats.checked,
            corrected = stats.corrected,
            lookup_failures = stats.lookup_failures,
            "billing reconciliation completed"
        );

        Ok(stats)
    }
}

/// The event that moves `local` to the provider's status, if the state
/// machine allows it.
fn correction_event(
    local: SubscriptionStanding,
    provider: SubscriptionStanding,
) -> Option<SubscriptionEvent> {
    let candidates = [
        SubscriptionEvent::Activated,
        SubscriptionEvent::PaymentFailed,
        SubscriptionEvent::PaymentRecovered,
        SubscriptionEvent::Cancelled,
        SubscriptionEvent::Expired,
    ];
    candidates
        .into_iter()
        .find(|event| next_status(local, *event) == Some(provider))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStanding as S;

    #[test]
    fn test_correction_event_selection() {
        assert_eq!(
            correction_event(S::Active, S::Frozen),
            Some(SubscriptionEvent::PaymentFailed)
        );
        assert_eq!(
            correction_event(S::Frozen, S::Active),
            Some(SubscriptionEvent::PaymentRecovered)
        );
        assert_eq!(
            correction_event(S::Active, S::Canceled),
            Some(SubscriptionEvent::Cancelled)
        );
        assert_eq!(
            correction_event(S::Active, S::Expired),
            Some(SubscriptionEvent::Expired)
        );
    }

    #[test]
    fn test_no_correction_for_unreachable_states() {
        // The state machine has no event moving frozen directly to pending
        assert_eq!(correction_event(S::Frozen, S::Pending), None);
        // Nor expired back to active
        assert_eq!(correction_event(S::Expired, S::Active), None);
    }
}
