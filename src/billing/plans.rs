//! Plan administration
//!
//! Operator CRUD over the global plan table. Plans are not tenant-scoped;
//! every mutation is audited under the operator's identity. Deleting a
//! plan with live subscriptions is rejected.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog};

use super::{BillingError, Result};

// ============================================================================
// Rows
// ============================================================================

/// A persisted plan.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    /// Stable plan id (e.g. `plan_growth`)
    pub id: String,

    /// Merchant-facing name
    pub name: String,

    /// Ordering rank; higher wins in subscription selection
    pub tier_rank: i32,

    /// Monthly price in cents
    pub price_cents: i64,

    /// Feature key → enabled
    pub features: serde_json::Value,

    /// Resource limits
    pub limits: serde_json::Value,
}

// ============================================================================
// Service
// ============================================================================

/// Operator-facing plan administration.
pub struct PlanAdminService {
    pool: PgPool,
    audit: Arc<AuditLog>,
}

impl PlanAdminService {
    /// Create the service.
    pub fn new(pool: PgPool, audit: Arc<AuditLog>) -> Self {
        Self { pool, audit }
    }

    /// Fetch a plan.
    pub async fn get(&self, plan_id: &str) -> Result<Plan> {
        sqlx::query_as::<_, Plan>(
            r"
            SELECT id, name, tier_rank, price_cents, features, limits
            FROM plans
            WHERE id = $1
            ",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(format!("plan {plan_id}")))
    }

    /// All plans ordered by tier rank.
    pub async fn list(&self) -> Result<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(
            r"
            SELECT id, name, tier_rank, price_cents, features, limits
            FROM plans
            ORDER BY tier_rank
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    /// Create a plan.
    pub async fn create(&self, plan: Plan, operator: Uuid) -> Result<Plan> {
        validate_plan(&plan)?;

        let created = sqlx::query_as::<_, Plan>(
            r"
            INSERT INTO plans (id, name, tier_rank, price_cents, features, limits)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, tier_rank, price_cents, features, limits
            ",
        )
        .bind(&plan.id)
        .bind(&plan.name)
        .bind(plan.tier_rank)
        .bind(plan.price_cents)
        .bind(&plan.features)
        .bind(&plan.limits)
        .fetch_one(&self.pool)
        .await?;

        self.audit_plan(AuditAction::AdminPlanCreated, &created.id, operator, None)
            .await;
        Ok(created)
    }

    /// Update a plan's name, rank, price, features, and limits.
    pub async fn update(&self, plan: Plan, operator: Uuid) -> Result<Plan> {
        validate_plan(&plan)?;

        let updated = sqlx::query_as::<_, Plan>(
            r"
            UPDATE plans
            SET name = $2, tier_rank = $3, price_cents = $4,
                features = $5, limits = $6
            WHERE id = $1
            RETURNING id, name, tier_rank, price_cents, features, limits
            ",
        )
        .bind(&plan.id)
        .bind(&plan.name)
        .bind(plan.tier_rank)
        .bind(plan.price_cents)
        .bind(&plan.features)
        .bind(&plan.limits)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(format!("plan {}", plan.id)))?;

        self.audit_plan(AuditAction::AdminPlanUpdated, &updated.id, operator, None)
            .await;
        Ok(updated)
    }

    /// Flip a single feature flag on a plan.
    pub async fn toggle_feature(
        &self,
        plan_id: &str,
        feature_key: &str,
        operator: Uuid,
    ) -> Result<Plan> {
        let mut plan = self.get(plan_id).await?;

        let current = plan
            .features
            .get(feature_key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if let Some(map) = plan.features.as_object_mut() {
            map.insert(feature_key.to_string(), serde_json::Value::Bool(!current));
        }

        let updated = self.update(plan, operator).await?;
        self.audit_plan(
            AuditAction::AdminPlanUpdated,
            plan_id,
            operator,
            Some(serde_json::json!({
                "feature_key": feature_key,
                "enabled": !current,
            })),
        )
        .await;
        Ok(updated)
    }

    /// Delete a plan. Plans with live subscriptions cannot be deleted.
    pub async fn delete(&self, plan_id: &str, operator: Uuid) -> Result<bool> {
        let live: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM subscriptions
            WHERE plan_id = $1 AND status IN ('pending', 'active', 'frozen', 'canceled')
            ",
        )
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await?;

        if live.0 > 0 {
            return Err(BillingError::InvalidPayload(format!(
                "plan {plan_id} has {} live subscriptions",
                live.0
            )));
        }

        let result = sqlx::query(r"DELETE FROM plans WHERE id = $1")
            .bind(plan_id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.audit_plan(AuditAction::AdminPlanDeleted, plan_id, operator, None)
                .await;
        }
        Ok(deleted)
    }

    async fn audit_plan(
        &self,
        action: AuditAction,
        plan_id: &str,
        operator: Uuid,
        metadata: Option<serde_json::Value>,
    ) {
        // Plan changes are platform-wide; recorded under the nil tenant.
        let mut event = AuditEvent::new(Uuid::nil(), action)
            .with_user(operator)
            .with_resource("plan", plan_id);
        if let Some(metadata) = metadata {
            event = event.with_metadata(metadata);
        }
        self.audit.write(event).await;
    }
}

fn validate_plan(plan: &Plan) -> Result<()> {
    if plan.id.is_empty() || plan.name.is_empty() {
        return Err(BillingError::InvalidPayload(
            "plan id and name are required".to_string(),
        ));
    }
    if plan.price_cents < 0 {
        return Err(BillingError::InvalidPayload(
            "price_cents must be non-negative".to_string(),
        ));
    }
    if !plan.features.is_object() {
        return Err(BillingError::InvalidPayload(
            "features must be an object".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Plan {
        Plan {
            id: "plan_growth".to_string(),
            name: "Growth".to_string(),
            tier_rank: 1,
            price_cents: 9900,
            features: serde_json::json!({"ai_insights": true}),
            limits: serde_json::json!({"max_dashboards": 10}),
        }
    }

    #[test]
    fn test_plan_validation() {
        assert!(validate_plan(&plan()).is_ok());

        let mut bad = plan();
        bad.id = String::new();
        assert!(validate_plan(&bad).is_err());

        let mut bad = plan();
        bad.price_cents = -1;
        assert!(validate_plan(&bad).is_err());

        let mut bad = plan();
        bad.features = serde_json::json!([]);
        assert!(validate_plan(&bad).is_err());
    }
}
