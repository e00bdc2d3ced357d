//! Entitlement engine
//!
//! Cached, single-flight entitlement resolution. The resolve path:
//!
//! 1. Cache read → return on hit
//! 2. Acquire the per-tenant single-flight lock (5 s timeout; a timeout is
//!    an evaluation failure)
//! 3. Re-check the cache (the winner may have populated it)
//! 4. Compute from the database: deterministic subscription selection,
//!    billing-state derivation, plan config deep copy, non-expired
//!    overrides, feature resolution, access level, warnings
//! 5. Cache the result and release the lock
//!
//! Any failure raises `EvalFailed` (fail-closed): the middleware boundary
//! renders it as a retryable denial, never an implicit allow.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditSource};
use crate::config::PlanCatalogConfig;
use crate::core::{Clock, SystemClock};

use super::{
    cache::EntitlementCache, default_access_level, default_warnings, overrides::OverrideStore,
    resolve_features, AccessLevel, BillingState, EntitlementError, FeatureGrant,
    ResolvedEntitlement, Result, SubscriptionStanding, TenantOverride,
};

/// Seconds a caller waits on the single-flight lock before failing closed.
const SINGLE_FLIGHT_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// Engine
// ============================================================================

/// Central entitlement engine. One instance per process, injected where
/// entitlement checks are needed.
pub struct EntitlementEngine {
    pool: PgPool,
    cache: Arc<EntitlementCache>,
    overrides: OverrideStore,
    catalog: Arc<PlanCatalogConfig>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    flights: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl EntitlementEngine {
    /// Create an engine with the system clock.
    pub fn new(
        pool: PgPool,
        cache: Arc<EntitlementCache>,
        catalog: Arc<PlanCatalogConfig>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self::with_clock(pool, cache, catalog, audit, Arc::new(SystemClock))
    }

    /// Create an engine with an injected clock.
    pub fn with_clock(
        pool: PgPool,
        cache: Arc<EntitlementCache>,
        catalog: Arc<PlanCatalogConfig>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            overrides: OverrideStore::new(pool.clone()),
            pool,
            cache,
            catalog,
            audit,
            clock,
            flights: DashMap::new(),
        }
    }

    // ========================================================================
    // Primary API
    // ========================================================================

    /// Resolve the current entitlements for a tenant.
    ///
    /// Fail-closed: every internal error surfaces as
    /// [`EntitlementError::EvalFailed`].
    pub async fn get_entitlements(&self, tenant_id: Uuid) -> Result<ResolvedEntitlement> {
        let now = self.clock.now();

        // 1. Cache hit
        if let Some(cached) = self.cache.get(tenant_id, now) {
            return Ok(cached);
        }

        // 2. Single-flight lock
        let lock = self
            .flights
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = tokio::time::timeout(
            StdDuration::from_secs(SINGLE_FLIGHT_TIMEOUT_SECS),
            lock.lock(),
        )
        .await
        .map_err(|_| EntitlementError::EvalFailed {
            tenant_id,
            detail: "Timed out waiting for entitlement computation".to_string(),
        })?;

        let result = self.resolve_locked(tenant_id).await;

        drop(guard);
        self.flights.remove(&tenant_id);

        match result {
            Ok(resolved) => Ok(resolved),
            Err(EntitlementError::EvalFailed { tenant_id, detail }) => {
                self.emit_eval_failed_alert(tenant_id, &detail).await;
                Err(EntitlementError::EvalFailed { tenant_id, detail })
            }
            Err(other) => {
                let detail = other.to_string();
                self.emit_eval_failed_alert(tenant_id, &detail).await;
                Err(EntitlementError::EvalFailed { tenant_id, detail })
            }
        }
    }

    /// Check a single feature for a tenant. Unknown features return an
    /// explicit deny grant.
    pub async fn check_feature(&self, tenant_id: Uuid, feature_key: &str) -> Result<FeatureGrant> {
        let resolved = self.get_entitlements(tenant_id).await?;
        Ok(resolved.feature(feature_key))
    }

    /// Invalidate the cached entitlements for a tenant.
    ///
    /// Call after every override write and billing webhook.
    pub fn invalidate(&self, tenant_id: Uuid, reason: &str) -> bool {
        self.cache.invalidate(tenant_id, reason)
    }

    // ========================================================================
    // Override CRUD
    // ========================================================================

    /// Create or update a feature override, invalidate the cache, and
    /// audit the write.
    pub async fn create_override(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
        enabled: bool,
        expires_at: DateTime<Utc>,
        reason: &str,
        created_by: &str,
    ) -> Result<TenantOverride> {
        let now = self.clock.now();
        let written = self
            .overrides
            .upsert(tenant_id, feature_key, enabled, expires_at, reason, created_by, now)
            .await?;

        self.invalidate(tenant_id, &format!("override_written:{feature_key}={enabled}"));

        self.audit
            .write(
                AuditEvent::new(tenant_id, AuditAction::EntitlementOverrideWritten)
                    .with_resource("entitlement_override", feature_key)
                    .with_metadata(serde_json::json!({
                        "feature_key": feature_key,
                        "enabled": enabled,
                        "expires_at": expires_at.to_rfc3339(),
                        "created_by": created_by,
                        "reason": reason,
                    })),
            )
            .await;

        Ok(written)
    }

    /// Delete an override. Idempotent; invalidates and audits only when a
    /// row existed.
    pub async fn delete_override(&self, tenant_id: Uuid, feature_key: &str) -> Result<bool> {
        let deleted = self.overrides.delete(tenant_id, feature_key).await?;
        if deleted {
            self.invalidate(tenant_id, &format!("override_deleted:{feature_key}"));
            self.audit
                .write(
                    AuditEvent::new(tenant_id, AuditAction::EntitlementOverrideDeleted)
                        .with_resource("entitlement_override", feature_key),
                )
                .await;
        }
        Ok(deleted)
    }

    /// Sweep expired overrides and invalidate every affected tenant.
    /// Returns the number of tenants invalidated.
    pub async fn cleanup_expired_overrides(&self) -> Result<usize> {
        let now = self.clock.now();
        let affected = self.overrides.cleanup_expired(now).await?;
        for tenant_id in &affected {
            self.invalidate(*tenant_id, "override_expired");
        }
        Ok(affected.len())
    }

    // ========================================================================
    // Internal: Resolution
    // ========================================================================

    /// Compute under the single-flight lock: re-check the cache first.
    async fn resolve_locked(&self, tenant_id: Uuid) -> Result<ResolvedEntitlement> {
        let now = self.clock.now();
        if let Some(cached) = self.cache.get(tenant_id, now) {
            return Ok(cached);
        }

        let resolved = self.compute(tenant_id, now).await?;
        self.cache.set(tenant_id, resolved.clone(), now);
        Ok(resolved)
    }

    /// Full computation from the database.
    async fn compute(&self, tenant_id: Uuid, now: DateTime<Utc>) -> Result<ResolvedEntitlement> {
        // 1. Deterministic subscription selection: statuses that can still
        //    carry access, ordered by plan tier rank then recency.
        let winner: Option<SubscriptionPick> = sqlx::query_as(
            r"
            SELECT s.plan_id, s.status, s.grace_period_ends_on, s.current_period_end
            FROM subscriptions s
            JOIN plans p ON p.id = s.plan_id
            WHERE s.tenant_id = $1
              AND s.status IN ('active', 'frozen', 'pending', 'canceled')
            ORDER BY p.tier_rank DESC, s.created_at DESC
            LIMIT 1
            ",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        // 2. Billing state
        let (billing_state, plan_id) = match &winner {
            Some(pick) => (
                BillingState::derive(
                    pick.status,
                    pick.grace_period_ends_on,
                    pick.current_period_end,
                    now,
                ),
                pick.plan_id.clone(),
            ),
            // No subscription → free tier, always active
            None => (
                BillingState::Active,
                PlanCatalogConfig::FREE_PLAN_ID.to_string(),
            ),
        };

        // 3. Plan config; unknown plan falls back to free, missing free is
        //    an evaluation failure.
        let plan = self
            .catalog
            .plan(&plan_id)
            .or_else(|| self.catalog.free_plan())
            .ok_or_else(|| EntitlementError::EvalFailed {
                tenant_id,
                detail: format!("Plan config not found for {plan_id}"),
            })?
            .clone();

        // 4. Non-expired overrides
        let overrides = self.overrides.active_for_tenant(tenant_id, now).await?;

        // 5. Feature resolution
        let features = resolve_features(&plan.features, &overrides, now);
        let overrides_applied = overrides
            .iter()
            .filter(|o| o.expires_at > now)
            .map(|o| o.feature_key.clone())
            .collect();

        // 6. Access level + warnings (config rules win over the defaults)
        let rule = self.catalog.access_rules.get(billing_state.as_str());
        let access_level = rule
            .and_then(|r| AccessLevel::parse(&r.access_level))
            .unwrap_or_else(|| default_access_level(billing_state));
        let warnings = rule
            .map(|r| r.warnings.clone())
            .unwrap_or_else(|| default_warnings(billing_state));

        Ok(ResolvedEntitlement {
            tenant_id,
            plan_id: plan.plan_id.clone(),
            plan_name: plan.display_name.clone(),
            billing_state,
            access_level,
            features,
            limits: plan.limits,
            overrides_applied,
            warnings,
            resolved_at: now,
        })
    }

    /// Critical alert + audit denial for a fail-closed evaluation error.
    async fn emit_eval_failed_alert(&self, tenant_id: Uuid, detail: &str) {
        tracing::error!(
            alert_type = "entitlement_eval_failed",
            tenant_id = %tenant_id,
            detail,
            "entitlement evaluation failed; denying access"
        );
        self.audit
            .write(
                AuditEvent::new(tenant_id, AuditAction::EntitlementDenied)
                    .with_source(AuditSource::System)
                    .with_metadata(serde_json::json!({
                        "support_alert": true,
                        "detail": detail,
                    }))
                    .failed("entitlement_eval_failed"),
            )
            .await;
    }
}

/// Projection of the winning subscription used during resolution.
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionPick {
    plan_id: String,
    status: SubscriptionStanding,
    grace_period_ends_on: Option<DateTime<Utc>>,
    current_period_end: Option<DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight_timeout_is_eval_failed() {
        // The timeout constant is part of the contract: callers blocked
        // longer than this observe a fail-closed denial, not a hang.
        assert_eq!(SINGLE_FLIGHT_TIMEOUT_SECS, 5);
        let err = EntitlementError::EvalFailed {
            tenant_id: Uuid::new_v4(),
            detail: "Timed out waiting for entitlement computation".to_string(),
        };
        let denial = err.to_denial();
        assert!(denial.error_code.is_retryable_server_failure());
    }

    // Resolution against live subscription/plan rows requires Postgres;
    // the pure pieces (billing-state derivation, feature resolution,
    // access table, cache TTL) are covered in their own modules, and the
    // end-to-end paths in the integration environment.
}
