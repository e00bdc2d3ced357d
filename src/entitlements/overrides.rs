//! Tenant entitlement overrides
//!
//! Time-bounded per-tenant feature flags that win over the plan. Unique on
//! `(tenant_id, feature_key)`. Only non-expired overrides apply;
//! `expires_at` must be in the future at write time and carry an explicit
//! UTC offset (enforced by the `DateTime<Utc>` type).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::{EntitlementError, Result};

// ============================================================================
// Override Row
// ============================================================================

/// A per-tenant feature override.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantOverride {
    /// Tenant the override applies to
    pub tenant_id: Uuid,

    /// Feature key overridden
    pub feature_key: String,

    /// Forced grant value
    pub enabled: bool,

    /// Expiry; overrides never apply past this instant
    pub expires_at: DateTime<Utc>,

    /// Operator-supplied reason
    pub reason: String,

    /// Who created the override
    pub created_by: String,
}

// ============================================================================
// Override Store
// ============================================================================

/// Persistence for tenant overrides.
pub struct OverrideStore {
    pool: PgPool,
}

impl OverrideStore {
    /// Create an override store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or update an override for `(tenant, feature)`.
    ///
    /// Validates that `expires_at` is in the future. Returns the written
    /// override. The caller must invalidate the entitlement cache.
    pub async fn upsert(
        &self,
        tenant_id: Uuid,
        feature_key: &str,
        enabled: bool,
        expires_at: DateTime<Utc>,
        reason: &str,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Result<TenantOverride> {
        if expires_at <= now {
            return Err(EntitlementError::InvalidOverride(
                "expires_at must be in the future".to_string(),
            ));
        }
        if feature_key.is_empty() {
            return Err(EntitlementError::InvalidOverride(
                "feature_key is required".to_string(),
            ));
        }

        let row = sqlx::query_as::<_, TenantOverride>(
            r"
            INSERT INTO tenant_entitlement_overrides (
                tenant_id, feature_key, enabled, expires_at, reason, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, feature_key)
            DO UPDATE SET
                enabled = EXCLUDED.enabled,
                expires_at = EXCLUDED.expires_at,
                reason = EXCLUDED.reason,
                created_by = EXCLUDED.created_by
            RETURNING tenant_id, feature_key, enabled, expires_at, reason, created_by
            ",
        )
        .bind(tenant_id)
        .bind(feature_key)
        .bind(enabled)
        .bind(expires_at)
        .bind(reason)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Delete an override. Idempotent; returns whether a row existed.
    pub async fn delete(&self, tenant_id: Uuid, feature_key: &str) -> Result<bool> {
        let result = sqlx::query(
            r"
            DELETE FROM tenant_entitlement_overrides
            WHERE tenant_id = $1 AND feature_key = $2
            ",
        )
        .bind(tenant_id)
        .bind(feature_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Non-expired overrides for a tenant.
    pub async fn active_for_tenant(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<TenantOverride>> {
        let rows = sqlx::query_as::<_, TenantOverride>(
            r"
            SELECT tenant_id, feature_key, enabled, expires_at, reason, created_by
            FROM tenant_entitlement_overrides
            WHERE tenant_id = $1 AND expires_at > $2
            ",
        )
        .bind(tenant_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Delete all expired overrides, returning the distinct tenants
    /// affected so the caller can invalidate their caches.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let tenants: Vec<(Uuid,)> = sqlx::query_as(
            r"
            DELETE FROM tenant_entitlement_overrides
            WHERE expires_at <= $1
            RETURNING tenant_id
            ",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut affected: Vec<Uuid> = tenants.into_iter().map(|t| t.0).collect();
        affected.sort();
        affected.dedup();

        if !affected.is_empty() {
            tracing::info!(
                tenants_affected = affected.len(),
                "expired entitlement overrides cleaned up"
            );
        }

        Ok(affected)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_override_round_trips_through_serde() {
        let now = Utc::now();
        let override_row = TenantOverride {
            tenant_id: Uuid::new_v4(),
            feature_key: "ai_insights".to_string(),
            enabled: true,
            expires_at: now + Duration::days(7),
            reason: "pilot".to_string(),
            created_by: "ops@internal".to_string(),
        };
        let json = serde_json::to_string(&override_row).unwrap();
        let back: TenantOverride = serde_json::from_str(&json).unwrap();
        assert_eq!(back.enabled, override_row.enabled);
        // Round-trip preserves the expiry to the millisecond
        assert_eq!(
            back.expires_at.timestamp_millis(),
            override_row.expires_at.timestamp_millis()
        );
    }

    // Upsert/delete/cleanup paths exercise the unique (tenant, feature)
    // constraint and require Postgres; covered by integration environments.
}
