//! DQ incidents
//!
//! Incident lifecycle (`open → acknowledged → resolved | auto_resolved`),
//! dashboard blocking, and the tenant sync-health summary. Scope and ETA
//! strings are derived deterministically from severity and source name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditSource};
use crate::core::{Clock, SystemClock};

use super::{
    availability::AvailabilityResult, severity_for_staleness, AvailabilityState, DqSeverity,
    FreshnessError, Result,
};

// ============================================================================
// Incident Row
// ============================================================================

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dq_incident_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Newly opened
    Open,
    /// Seen by a human
    Acknowledged,
    /// Resolved by a human
    Resolved,
    /// Resolved automatically on recovery
    AutoResolved,
}

/// A data-quality incident.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DqIncident {
    /// Incident id
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Connector the incident concerns
    pub connector_id: Option<Uuid>,

    /// Severity
    pub severity: DqSeverity,

    /// Lifecycle status
    pub status: IncidentStatus,

    /// Short internal title
    pub title: String,

    /// Merchant-facing message; no internals
    pub merchant_message: String,

    /// Support-facing detail
    pub support_details: String,

    /// Whether dashboards display a block banner
    pub is_blocking: bool,

    /// Opened instant
    pub opened_at: DateTime<Utc>,

    /// Resolution instant
    pub resolved_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Deterministic Strings
// ============================================================================

/// Scope string shown in the block banner.
pub fn incident_scope(severity: DqSeverity, source_name: &str) -> String {
    match severity {
        DqSeverity::Critical => format!("All dashboards using {source_name} data"),
        DqSeverity::High => format!("Reports based on {source_name} data"),
        DqSeverity::Warning => format!("Some {source_name} metrics"),
    }
}

/// ETA string shown in the block banner.
pub fn incident_eta(severity: DqSeverity) -> &'static str {
    match severity {
        DqSeverity::Critical => "Typically resolved within 2 hours",
        DqSeverity::High => "Typically resolved within 12 hours",
        DqSeverity::Warning => "Typically resolved within 24 hours",
    }
}

// ============================================================================
// Sync Health
// ============================================================================

/// Health of one connector, derived from its recent runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSyncHealth {
    /// Connector id
    pub connector_id: Uuid,

    /// Connection name
    pub connection_name: String,

    /// Source type
    pub source_type: String,

    /// Latest run instant
    pub last_run_at: Option<DateTime<Utc>>,

    /// Latest run status
    pub last_status: Option<String>,

    /// Consecutive failed runs (newest backwards)
    pub failure_streak: i64,

    /// Rows synced in the latest successful run
    pub rows_synced_last: Option<i64>,
}

/// Tenant-wide sync health rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHealthSummary {
    /// Connectors examined
    pub total_connectors: usize,

    /// Connectors whose latest run succeeded
    pub healthy: usize,

    /// Connectors whose latest run failed
    pub failing: usize,

    /// Most recent sync across the tenant
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Per-connector detail
    pub connectors: Vec<ConnectorSyncHealth>,
}

// ============================================================================
// Service
// ============================================================================

/// Tenant-scoped incident lifecycle and sync health.
pub struct IncidentService {
    pool: PgPool,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    tenant_id: Uuid,
}

impl IncidentService {
    /// Create a service scoped to one tenant.
    pub fn new(pool: PgPool, audit: Arc<AuditLog>, tenant_id: Uuid) -> Self {
        Self::with_clock(pool, audit, tenant_id, Arc::new(SystemClock))
    }

    /// Create a service with an injected clock.
    pub fn with_clock(
        pool: PgPool,
        audit: Arc<AuditLog>,
        tenant_id: Uuid,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            audit,
            clock,
            tenant_id,
        }
    }

    /// Open an incident. Critical incidents block dashboards.
    pub async fn open(
        &self,
        connector_id: Option<Uuid>,
        severity: DqSeverity,
        title: &str,
        merchant_message: &str,
        support_details: &str,
    ) -> Result<DqIncident> {
        let is_blocking = severity == DqSeverity::Critical;
        let incident = sqlx::query_as::<_, DqIncident>(
            r"
            INSERT INTO dq_incidents (
                id, tenant_id, connector_id, severity, status, title,
                merchant_message, support_details, is_blocking, opened_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, tenant_id, connector_id, severity, status, title,
                      merchant_message, support_details, is_blocking,
                      opened_at, resolved_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(self.tenant_id)
        .bind(connector_id)
        .bind(severity)
        .bind(IncidentStatus::Open)
        .bind(title)
        .bind(merchant_message)
        .bind(support_details)
        .bind(is_blocking)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;

        self.audit
            .write(
                AuditEvent::new(self.tenant_id, AuditAction::DqIncidentOpened)
                    .with_source(AuditSource::Worker)
                    .with_resource("dq_incident", incident.id.to_string())
                    .with_metadata(serde_json::json!({
                        "severity": severity.as_str(),
                        "is_blocking": is_blocking,
                        "title": title,
                    })),
            )
            .await;

        Ok(incident)
    }

    /// Open an incident for a non-fresh availability result, with
    /// severity derived from how far past the warn threshold the source
    /// is. Fresh results resolve any open incidents for the source
    /// instead (auto-resolution on recovery).
    pub async fn open_for_staleness(
        &self,
        result: &AvailabilityResult,
        is_critical_source: bool,
    ) -> Result<Option<DqIncident>> {
        if result.state == AvailabilityState::Fresh {
            for incident in self.open_incidents().await? {
                if incident.title == result.source_type {
                    self.resolve(incident.id, true).await?;
                }
            }
            return Ok(None);
        }

        let minutes = result.minutes_since_sync.unwrap_or(i64::MAX);
        let severity = severity_for_staleness(
            minutes,
            result.warn_threshold_minutes,
            is_critical_source,
        );

        // One open incident per source; re-evaluation does not stack.
        let already_open = self
            .open_incidents()
            .await?
            .into_iter()
            .any(|incident| incident.title == result.source_type);
        if already_open {
            return Ok(None);
        }

        let incident = self
            .open(
                None,
                severity,
                &result.source_type,
                "This data source is running behind. Recent numbers may be incomplete.",
                &format!(
                    "source {} is {} ({}); {} minutes since sync against warn threshold {}",
                    result.source_type,
                    result.state.as_str(),
                    result.reason.as_str(),
                    result
                        .minutes_since_sync
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "n/a".to_string()),
                    result.warn_threshold_minutes,
                ),
            )
            .await?;

        Ok(Some(incident))
    }

    /// Acknowledge an open incident.
    pub async fn acknowledge(&self, incident_id: Uuid) -> Result<DqIncident> {
        sqlx::query_as::<_, DqIncident>(
            r"
            UPDATE dq_incidents
            SET status = 'acknowledged'
            WHERE id = $1 AND tenant_id = $2 AND status = 'open'
            RETURNING id, tenant_id, connector_id, severity, status, title,
                      merchant_message, support_details, is_blocking,
                      opened_at, resolved_at
            ",
        )
        .bind(incident_id)
        .bind(self.tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FreshnessError::NotFound(format!("open incident {incident_id}")))
    }

    /// Resolve an incident. Idempotent: resolving an already-resolved
    /// incident returns it unchanged.
    pub async fn resolve(&self, incident_id: Uuid, auto: bool) -> Result<DqIncident> {
        let existing = sqlx::query_as::<_, DqIncident>(
            r"
            SELECT id, tenant_id, connector_id, severity, status, title,
                   merchant_message, support_details, is_blocking,
                   opened_at, resolved_at
            FROM dq_incidents
            WHERE id = $1 AND tenant_id = $2
            ",
        )
        .bind(incident_id)
        .bind(self.tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FreshnessError::NotFound(format!("incident {incident_id}")))?;

        if matches!(
            existing.status,
            IncidentStatus::Resolved | IncidentStatus::AutoResolved
        ) {
            return Ok(existing);
        }

        let status = if auto {
            IncidentStatus::AutoResolved
        } else {
            IncidentStatus::Resolved
        };

        let resolved = sqlx::query_as::<_, DqIncident>(
            r"
            UPDATE dq_incidents
            SET status = $3, resolved_at = $4
            WHERE id = $1 AND tenant_id = $2
            RETURNING id, tenant_id, connector_id, severity, status, title,
                      merchant_message, support_details, is_blocking,
                      opened_at, resolved_at
            ",
        )
        .bind(incident_id)
        .bind(self.tenant_id)
        .bind(status)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;

        self.audit
            .write(
                AuditEvent::new(self.tenant_id, AuditAction::DqIncidentResolved)
                    .with_source(if auto {
                        AuditSource::Worker
                    } else {
                        AuditSource::Api
                    })
                    .with_resource("dq_incident", incident_id.to_string())
                    .with_metadata(serde_json::json!({"auto": auto})),
            )
            .await;

        Ok(resolved)
    }

    /// Open or acknowledged incidents for the tenant, most severe first.
    pub async fn open_incidents(&self) -> Result<Vec<DqIncident>> {
        let incidents = sqlx::query_as::<_, DqIncident>(
            r"
            SELECT id, tenant_id, connector_id, severity, status, title,
                   merchant_message, support_details, is_blocking,
                   opened_at, resolved_at
            FROM dq_incidents
            WHERE tenant_id = $1 AND status IN ('open', 'acknowledged')
            ORDER BY severity DESC, opened_at DESC
            ",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(incidents)
    }

    /// Whether dashboards are blocked, plus banner lines for each
    /// blocking incident.
    pub async fn dashboard_block(&self) -> Result<(bool, Vec<String>)> {
        let blocking: Vec<DqIncident> = self
            .open_incidents()
            .await?
            .into_iter()
            .filter(|incident| incident.is_blocking)
            .collect();

        let banners = blocking
            .iter()
            .map(|incident| {
                format!(
                    "{} — {}",
                    incident_scope(incident.severity, &incident.title),
                    incident_eta(incident.severity)
                )
            })
            .collect::<Vec<_>>();

        Ok((!blocking.is_empty(), banners))
    }

    /// Per-connector health rollup from recent sync runs.
    pub async fn sync_health_summary(&self) -> Result<SyncHealthSummary> {
        let connections: Vec<(Uuid, String, String)> = sqlx::query_as(
            r"
            SELECT id, connection_name, source_type
            FROM connector_connections
            WHERE tenant_id = $1 AND status <> 'deleted'
            ",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut connectors = Vec::with_capacity(connections.len());
        for (connector_id, connection_name, source_type) in connections {
            let runs: Vec<(String, DateTime<Utc>, Option<i64>)> = sqlx::query_as(
                r"
                SELECT status::text, started_at, rows_synced
                FROM sync_runs
                WHERE tenant_id = $1 AND connector_id = $2
                ORDER BY started_at DESC
                LIMIT 20
                ",
            )
            .bind(self.tenant_id)
            .bind(connector_id)
            .fetch_all(&self.pool)
            .await?;

            let failure_streak = runs
                .iter()
                .take_while(|(status, _, _)| status == "failed")
                .count() as i64;
            let rows_synced_last = runs
                .iter()
                .find(|(status, _, _)| status == "succeeded")
                .and_then(|(_, _, rows)| *rows);

            connectors.push(ConnectorSyncHealth {
                connector_id,
                connection_name,
                source_type,
                last_run_at: runs.first().map(|(_, at, _)| *at),
                last_status: runs.first().map(|(status, _, _)| status.clone()),
                failure_streak,
                rows_synced_last,
            });
        }

        Ok(summarize_health(connectors))
    }
}

/// Roll up per-connector health into the tenant summary.
pub fn summarize_health(connectors: Vec<ConnectorSyncHealth>) -> SyncHealthSummary {
    let healthy = connectors
        .iter()
        .filter(|c| c.last_status.as_deref() == Some("succeeded"))
        .count();
    let failing = connectors
        .iter()
        .filter(|c| c.last_status.as_deref() == Some("failed"))
        .count();
    let last_sync_at = connectors.iter().filter_map(|c| c.last_run_at).max();

    SyncHealthSummary {
        total_connectors: connectors.len(),
        healthy,
        failing,
        last_sync_at,
        connectors,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scope_strings_by_severity() {
        assert_eq!(
            incident_scope(DqSeverity::Critical, "Shopify orders"),
            "All dashboards using Shopify orders data"
        );
        assert_eq!(
            incident_scope(DqSeverity::High, "Facebook ads"),
            "Reports based on Facebook ads data"
        );
        assert_eq!(
            incident_scope(DqSeverity::Warning, "email"),
            "Some email metrics"
        );
    }

    #[test]
    fn test_eta_strings_by_severity() {
        assert!(incident_eta(DqSeverity::Critical).contains("2 hours"));
        assert!(incident_eta(DqSeverity::High).contains("12 hours"));
        assert!(incident_eta(DqSeverity::Warning).contains("24 hours"));
    }

    #[test]
    fn test_health_summary_rollup() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let connectors = vec![
            ConnectorSyncHealth {
                connector_id: Uuid::new_v4(),
                connection_name: "Store".to_string(),
                source_type: "shopify".to_string(),
                last_run_at: Some(now),
                last_status: Some("succeeded".to_string()),
                failure_streak: 0,
                rows_synced_last: Some(500),
            },
            ConnectorSyncHealth {
                connector_id: Uuid::new_v4(),
                connection_name: "Ads".to_string(),
                source_type: "facebook".to_string(),
                last_run_at: Some(now - chrono::Duration::hours(4)),
                last_status: Some("failed".to_string()),
                failure_streak: 3,
                rows_synced_last: None,
            },
        ];

        let summary = summarize_health(connectors);
        assert_eq!(summary.total_connectors, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.failing, 1);
        assert_eq!(summary.last_sync_at, Some(now));
    }

    #[test]
    fn test_empty_health_summary() {
        let summary = summarize_health(vec![]);
        assert_eq!(summary.total_connectors, 0);
        assert!(summary.last_sync_at.is_none());
    }
}
