//! Data availability service
//!
//! Evaluates and persists the availability state per (tenant, source).
//! State is a pure function of sync metadata and SLA thresholds; this
//! service adds persistence (upsert unique on tenant + source), the
//! backfill override, and audit events on genuine transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditSource};
use crate::config::FreshnessSlaConfig;
use crate::core::{time::minutes_since, Clock, SystemClock};

use super::{compute_state, resolve_sla_key, AvailabilityReason, AvailabilityState, Result};

// ============================================================================
// Result Shape
// ============================================================================

/// Result of one availability evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityResult {
    /// Tenant evaluated
    pub tenant_id: Uuid,

    /// SLA source key (e.g. `shopify_orders`)
    pub source_type: String,

    /// Computed state
    pub state: AvailabilityState,

    /// Why the source is in this state
    pub reason: AvailabilityReason,

    /// Warn threshold applied
    pub warn_threshold_minutes: i64,

    /// Error threshold applied
    pub error_threshold_minutes: i64,

    /// Latest sync instant
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Latest sync status
    pub last_sync_status: Option<String>,

    /// Minutes since the latest sync
    pub minutes_since_sync: Option<i64>,

    /// When the state last changed
    pub state_changed_at: DateTime<Utc>,

    /// State before this evaluation, if any
    pub previous_state: Option<AvailabilityState>,

    /// Evaluation instant
    pub evaluated_at: DateTime<Utc>,

    /// Billing tier the thresholds were read for
    pub billing_tier: String,
}

/// Persisted availability row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct AvailabilityRow {
    state: AvailabilityState,
    state_changed_at: DateTime<Utc>,
}

// ============================================================================
// Service
// ============================================================================

/// Computes and persists availability per tenant and source.
pub struct DataAvailabilityService {
    pool: PgPool,
    sla: Arc<FreshnessSlaConfig>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    tenant_id: Uuid,
    billing_tier: String,
}

impl DataAvailabilityService {
    /// Create a service scoped to one tenant.
    pub fn new(
        pool: PgPool,
        sla: Arc<FreshnessSlaConfig>,
        audit: Arc<AuditLog>,
        tenant_id: Uuid,
        billing_tier: impl Into<String>,
    ) -> Self {
        Self::with_clock(pool, sla, audit, tenant_id, billing_tier, Arc::new(SystemClock))
    }

    /// Create a service with an injected clock.
    pub fn with_clock(
        pool: PgPool,
        sla: Arc<FreshnessSlaConfig>,
        audit: Arc<AuditLog>,
        tenant_id: Uuid,
        billing_tier: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            sla,
            audit,
            clock,
            tenant_id,
            billing_tier: billing_tier.into(),
        }
    }

    /// Evaluate and persist the availability state for one SLA source.
    pub async fn evaluate(&self, source_type: &str) -> Result<AvailabilityResult> {
        let now = self.clock.now();
        let thresholds = self.sla.thresholds(source_type, &self.billing_tier);

        let (last_sync_at, last_sync_status) = self.latest_sync(source_type).await?;
        let minutes = minutes_since(last_sync_at, now);

        let (mut state, mut reason) = compute_state(
            last_sync_status.as_deref(),
            minutes,
            thresholds.warn_after_minutes,
            thresholds.error_after_minutes,
        );

        // Backfill override: a fresh source with an active historical
        // backfill reads as stale. Worse states are not overridden.
        if state == AvailabilityState::Fresh && self.backfill_in_progress(source_type).await? {
            state = AvailabilityState::Stale;
            reason = AvailabilityReason::BackfillInProgress;
        }

        let existing = self.existing_row(source_type).await?;
        let previous_state = existing.as_ref().map(|row| row.state);
        let state_changed = previous_state != Some(state);
        let state_changed_at = if state_changed {
            now
        } else {
            existing
                .as_ref()
                .map(|row| row.state_changed_at)
                .unwrap_or(now)
        };

        self.upsert(
            source_type,
            state,
            reason,
            thresholds.warn_after_minutes,
            thresholds.error_after_minutes,
            state_changed_at,
            previous_state,
        )
        .await?;

        if state_changed {
            tracing::info!(
                tenant_id = %self.tenant_id,
                source_type,
                previous_state = ?previous_state.map(|s| s.as_str()),
                new_state = state.as_str(),
                reason = reason.as_str(),
                minutes_since_sync = minutes,
                "availability state transitioned"
            );
            self.emit_transition_audit(source_type, previous_state, state, reason, now)
                .await;
        }

        Ok(AvailabilityResult {
            tenant_id: self.tenant_id,
            source_type: source_type.to_string(),
            state,
            reason,
            warn_threshold_minutes: thresholds.warn_after_minutes,
            error_threshold_minutes: thresholds.error_after_minutes,
            last_sync_at,
            last_sync_status,
            minutes_since_sync: minutes,
            state_changed_at,
            previous_state,
            evaluated_at: now,
            billing_tier: self.billing_tier.clone(),
        })
    }

    /// Evaluate every enabled connection's SLA source for the tenant.
    pub async fn evaluate_all(&self) -> Result<Vec<AvailabilityResult>> {
        let source_types: Vec<(String,)> = sqlx::query_as(
            r"
            SELECT DISTINCT source_type
            FROM connector_connections
            WHERE tenant_id = $1 AND is_enabled = TRUE AND status <> 'deleted'
            ",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::new();
        for (source,) in source_types {
            let Some(sla_key) = resolve_sla_key(&source) else {
                continue;
            };
            results.push(self.evaluate(sla_key).await?);
        }
        Ok(results)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Latest sync metadata across the tenant's connections mapping to
    /// this SLA source key.
    async fn latest_sync(
        &self,
        sla_key: &str,
    ) -> Result<(Option<DateTime<Utc>>, Option<String>)> {
        let rows: Vec<(String, Option<DateTime<Utc>>, Option<String>)> = sqlx::query_as(
            r"
            SELECT source_type, last_sync_at, last_sync_status
            FROM connector_connections
            WHERE tenant_id = $1 AND is_enabled = TRUE AND status <> 'deleted'
            ",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut latest: (Option<DateTime<Utc>>, Option<String>) = (None, None);
        for (source, sync_at, sync_status) in rows {
            if resolve_sla_key(&source) != Some(sla_key) {
                continue;
            }
            match (latest.0, sync_at) {
                (None, Some(_)) => latest = (sync_at, sync_status),
                (Some(current), Some(candidate)) if candidate > current => {
                    latest = (sync_at, sync_status)
                }
                _ => {
                    if latest.1.is_none() {
                        latest.1 = sync_status;
                    }
                }
            }
        }
        Ok(latest)
    }

    /// Whether a historical backfill is running for this source.
    async fn backfill_in_progress(&self, sla_key: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM backfill_jobs
            WHERE tenant_id = $1 AND source_type = $2 AND status = 'running'
            ",
        )
        .bind(self.tenant_id)
        .bind(sla_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(count,)| count > 0).unwrap_or(false))
    }

    async fn existing_row(&self, source_type: &str) -> Result<Option<AvailabilityRow>> {
        let row = sqlx::query_as::<_, AvailabilityRow>(
            r"
            SELECT state, state_changed_at
            FROM data_availability
            WHERE tenant_id = $1 AND source_type = $2
            ",
        )
        .bind(self.tenant_id)
        .bind(source_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert(
        &self,
        source_type: &str,
        state: AvailabilityState,
        reason: AvailabilityReason,
        warn: i64,
        error: i64,
        state_changed_at: DateTime<Utc>,
        previous_state: Option<AvailabilityState>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO data_availability (
                tenant_id, source_type, state, reason,
                warn_threshold_minutes, error_threshold_minutes,
                state_changed_at, previous_state, billing_tier
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, source_type)
            DO UPDATE SET
                state = EXCLUDED.state,
                reason = EXCLUDED.reason,
                warn_threshold_minutes = EXCLUDED.warn_threshold_minutes,
                error_threshold_minutes = EXCLUDED.error_threshold_minutes,
                state_changed_at = EXCLUDED.state_changed_at,
                previous_state = EXCLUDED.previous_state,
                billing_tier = EXCLUDED.billing_tier
            ",
        )
        .bind(self.tenant_id)
        .bind(source_type)
        .bind(state)
        .bind(reason)
        .bind(warn)
        .bind(error)
        .bind(state_changed_at)
        .bind(previous_state)
        .bind(&self.billing_tier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn emit_transition_audit(
        &self,
        source_type: &str,
        previous: Option<AvailabilityState>,
        new_state: AvailabilityState,
        reason: AvailabilityReason,
        detected_at: DateTime<Utc>,
    ) {
        let action = match new_state {
            AvailabilityState::Stale => AuditAction::DataFreshnessStale,
            AvailabilityState::Unavailable => AuditAction::DataFreshnessUnavailable,
            AvailabilityState::Fresh => AuditAction::DataFreshnessRecovered,
        };

        self.audit
            .write(
                AuditEvent::new(self.tenant_id, action)
                    .with_source(AuditSource::Worker)
                    .with_resource("data_availability", source_type)
                    .with_metadata(serde_json::json!({
                        "previous_state": previous.map(|s| s.as_str()),
                        "new_state": new_state.as_str(),
                        "reason": reason.as_str(),
                        "detected_at": detected_at.to_rfc3339(),
                    })),
            )
            .await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_action_selection() {
        // The audit action is derived from the new state only; the
        // previous state travels in metadata.
        for (state, expected) in [
            (AvailabilityState::Stale, AuditAction::DataFreshnessStale),
            (
                AvailabilityState::Unavailable,
                AuditAction::DataFreshnessUnavailable,
            ),
            (AvailabilityState::Fresh, AuditAction::DataFreshnessRecovered),
        ] {
            let action = match state {
                AvailabilityState::Stale => AuditAction::DataFreshnessStale,
                AvailabilityState::Unavailable => AuditAction::DataFreshnessUnavailable,
                AvailabilityState::Fresh => AuditAction::DataFreshnessRecovered,
            };
            assert_eq!(action, expected);
        }
    }

    // Upsert and transition persistence run against the (tenant, source)
    // unique index in Postgres; exercised in the integration environment.
    // The pure ladder including exact boundaries is covered in the parent
    // module tests.
}
