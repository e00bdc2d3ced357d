//! Connection registry
//!
//! Registration and lifecycle of ingestion connections, including the
//! cross-tenant duplicate-shop guard. The guard is a friendly precheck
//! and defense-in-depth: the same normalized-domain uniqueness is also
//! enforced by a partial unique index at the database level.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditSource};

use super::{
    is_shopify_source, normalize_shop_domain, ConnectionStatus, ConnectorConnection,
    ConnectorError, Result, SyncRun, SyncRunStatus,
};

/// Bounds for the scheduled sync cadence.
const MIN_SYNC_FREQUENCY_MINUTES: i32 = 15;
const MAX_SYNC_FREQUENCY_MINUTES: i32 = 1440;

// ============================================================================
// Inputs
// ============================================================================

/// Input to connection registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConnection {
    /// Id of the connection at the ingestion platform
    pub external_connection_id: String,

    /// Source type
    pub source_type: String,

    /// Merchant-facing name
    pub connection_name: String,

    /// Source configuration; `shop_domain` required for Shopify sources
    pub configuration: serde_json::Value,

    /// Scheduled sync cadence in minutes
    pub sync_frequency_minutes: i32,
}

// ============================================================================
// Registry
// ============================================================================

/// Tenant-scoped connection registry.
pub struct ConnectionRegistry {
    pool: PgPool,
    audit: Arc<AuditLog>,
    tenant_id: Uuid,
}

impl ConnectionRegistry {
    /// Create a registry scoped to one tenant.
    pub fn new(pool: PgPool, audit: Arc<AuditLog>, tenant_id: Uuid) -> Self {
        Self {
            pool,
            audit,
            tenant_id,
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a new connection.
    ///
    /// Rejects a duplicate `external_connection_id` within the tenant
    /// without mutation, and for Shopify sources enforces global
    /// normalized-shop-domain uniqueness across active enabled
    /// connections. A cross-tenant duplicate is a security event audited
    /// at critical severity; the error shown to the caller never names
    /// the owning tenant.
    pub async fn register(&self, input: RegisterConnection) -> Result<ConnectorConnection> {
        if input.external_connection_id.is_empty() {
            return Err(ConnectorError::InvalidInput(
                "external_connection_id is required".to_string(),
            ));
        }
        validate_sync_frequency(input.sync_frequency_minutes)?;

        if self
            .get_by_external_id(&input.external_connection_id)
            .await?
            .is_some()
        {
            return Err(ConnectorError::DuplicateConnection);
        }

        if is_shopify_source(&input.source_type) {
            let shop_domain = input
                .configuration
                .get("shop_domain")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            self.check_shop_domain_unique(shop_domain).await?;
        }

        let connection = sqlx::query_as::<_, ConnectorConnection>(
            r"
            INSERT INTO connector_connections (
                id, tenant_id, external_connection_id, source_type,
                connection_name, configuration, status, is_enabled,
                sync_frequency_minutes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9)
            RETURNING id, tenant_id, external_connection_id, source_type,
                      connection_name, configuration, status, is_enabled,
                      last_sync_at, last_sync_status, sync_frequency_minutes,
                      created_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(self.tenant_id)
        .bind(&input.external_connection_id)
        .bind(&input.source_type)
        .bind(&input.connection_name)
        .bind(&input.configuration)
        .bind(ConnectionStatus::Pending)
        .bind(input.sync_frequency_minutes)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        self.audit
            .write(
                AuditEvent::new(self.tenant_id, AuditAction::StoreConnected)
                    .with_resource("connection", connection.id.to_string())
                    .with_metadata(serde_json::json!({
                        "source_type": input.source_type,
                        "connection_name": input.connection_name,
                        "external_connection_id": input.external_connection_id,
                    })),
            )
            .await;

        Ok(connection)
    }

    /// Check that a shop domain is not already connected anywhere.
    ///
    /// Uses the EXACT normalization of the database constraint so the
    /// precheck and the index can never disagree.
    async fn check_shop_domain_unique(&self, shop_domain: &str) -> Result<()> {
        let normalized = normalize_shop_domain(shop_domain);
        if normalized.is_empty() {
            return Err(ConnectorError::InvalidInput(
                "shop_domain is required for Shopify connections".to_string(),
            ));
        }

        let existing: Option<(Uuid, String)> = sqlx::query_as(
            r"
            SELECT tenant_id, connection_name
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

        let Some((owning_tenant, existing_name)) = existing else {
            return Ok(());
        };

        if owning_tenant != self.tenant_id {
            tracing::error!(
                event = "duplicate_shop_domain_blocked",
                attempted_tenant_id = %self.tenant_id,
                existing_tenant_id = %owning_tenant,
                shop_domain = normalized,
                severity = "critical",
                "duplicate shop domain attempted by different tenant"
            );
            self.audit
                .write(
                    AuditEvent::new(self.tenant_id, AuditAction::DuplicateShopDomainBlocked)
                        .with_resource("shop_domain", normalized.as_str())
                        .with_metadata(serde_json::json!({
                            "attempted_tenant_id": self.tenant_id,
                            "existing_tenant_id": owning_tenant,
                            "shop_domain": normalized,
                            "severity": "critical",
                        }))
                        .denied("duplicate_shop_domain"),
                )
                .await;
            return Err(ConnectorError::DuplicateShopDomainOtherTenant);
        }

        tracing::warn!(
            tenant_id = %self.tenant_id,
            shop_domain = normalized,
            existing_name,
            "tenant attempting to reconnect an already-connected shop"
        );
        Err(ConnectorError::DuplicateShopDomainSameTenant { existing_name })
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Fetch a connection by id within the tenant scope. A connection
    /// owned by another tenant is indistinguishable from a missing one.
    pub async fn get(&self, connection_id: Uuid) -> Result<Option<ConnectorConnection>> {
        let connection = sqlx::query_as::<_, ConnectorConnection>(
            r"
            SELECT id, tenant_id, external_connection_id, source_type,
                   connection_name, configuration, status, is_enabled,
                   last_sync_at, last_sync_status, sync_frequency_minutes,
                   created_at
            FROM connector_connections
            WHERE id = $1 AND tenant_id = $2 AND status <> 'deleted'
            ",
        )
        .bind(connection_id)
        .bind(self.tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(connection)
    }

    /// Fetch by external platform id within the tenant scope.
    pub async fn get_by_external_id(
        &self,
        external_connection_id: &str,
    ) -> Result<Option<ConnectorConnection>> {
        let connection = sqlx::query_as::<_, ConnectorConnection>(
            r"
            SELECT id, tenant_id, external_connection_id, source_type,
                   connection_name, configuration, status, is_enabled,
                   last_sync_at, last_sync_status, sync_frequency_minutes,
                   created_at
            FROM connector_connections
            WHERE external_connection_id = $1 AND tenant_id = $2
              AND status <> 'deleted'
            ",
        )
        .bind(external_connection_id)
        .bind(self.tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(connection)
    }

    /// Enabled, non-deleted connections for the tenant.
    pub async fn list_enabled(&self) -> Result<Vec<ConnectorConnection>> {
        let connections = sqlx::query_as::<_, ConnectorConnection>(
            r"
            SELECT id, tenant_id, external_connection_id, source_type,
                   connection_name, configuration, status, is_enabled,
                   last_sync_at, last_sync_status, sync_frequency_minutes,
                   created_at
            FROM connector_connections
            WHERE tenant_id = $1 AND is_enabled = TRUE AND status <> 'deleted'
            ORDER BY created_at
            ",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(connections)
    }

    /// Whether an external connection id belongs to this tenant.
    pub async fn belongs_to_tenant(&self, external_connection_id: &str) -> Result<bool> {
        Ok(self
            .get_by_external_id(external_connection_id)
            .await?
            .is_some())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Mark a connection active.
    pub async fn activate(&self, connection_id: Uuid) -> Result<ConnectorConnection> {
        self.set_status(connection_id, ConnectionStatus::Active).await
    }

    /// Mark a connection inactive.
    pub async fn deactivate(&self, connection_id: Uuid) -> Result<ConnectorConnection> {
        self.set_status(connection_id, ConnectionStatus::Inactive).await
    }

    /// Enable scheduled syncs.
    pub async fn enable(&self, connection_id: Uuid) -> Result<ConnectorConnection> {
        self.set_enabled(connection_id, true).await
    }

    /// Disable scheduled syncs.
    pub async fn disable(&self, connection_id: Uuid) -> Result<ConnectorConnection> {
        self.set_enabled(connection_id, false).await
    }

    /// Soft-delete a connection and audit the disconnect.
    pub async fn delete(&self, connection_id: Uuid) -> Result<ConnectorConnection> {
        let connection = self.set_status(connection_id, ConnectionStatus::Deleted).await?;
        self.audit
            .write(
                AuditEvent::new(self.tenant_id, AuditAction::StoreDisconnected)
                    .with_resource("connection", connection_id.to_string())
                    .with_metadata(serde_json::json!({
                        "source_type": connection.source_type,
                    })),
            )
            .await;
        Ok(connection)
    }

    /// Mark a connection failed after a sync error.
    ///
    /// Updates the denormalized sync fields; credentials are untouched
    /// (a sync failure must not revoke credentials).
    pub async fn mark_failed(&self, connection_id: Uuid, error: &str) -> Result<ConnectorConnection> {
        let connection = sqlx::query_as::<_, ConnectorConnection>(
            r"
            UPDATE connector_connections
            SET status = 'failed', last_sync_status = $3, last_sync_at = $4
            WHERE id = $1 AND tenant_id = $2 AND status <> 'deleted'
            RETURNING id, tenant_id, external_connection_id, source_type,
                      connection_name, configuration, status, is_enabled,
                      last_sync_at, last_sync_status, sync_frequency_minutes,
                      created_at
            ",
        )
        .bind(connection_id)
        .bind(self.tenant_id)
        .bind("failed")
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConnectorError::NotFound(format!("connection {connection_id}")))?;

        self.audit
            .write(
                AuditEvent::new(self.tenant_id, AuditAction::StoreSyncFailed)
                    .with_source(AuditSource::Worker)
                    .with_resource("connection", connection_id.to_string())
                    .with_metadata(serde_json::json!({"error": error}))
                    .failed("sync_failed"),
            )
            .await;

        Ok(connection)
    }

    /// Record a successful sync on the connection.
    pub async fn record_sync_success(&self, connection_id: Uuid) -> Result<ConnectorConnection> {
        let connection = sqlx::query_as::<_, ConnectorConnection>(
            r"
            UPDATE connector_connections
            SET status = 'active', last_sync_status = 'succeeded', last_sync_at = $3
            WHERE id = $1 AND tenant_id = $2 AND status <> 'deleted'
            RETURNING id, tenant_id, external_connection_id, source_type,
                      connection_name, configuration, status, is_enabled,
                      last_sync_at, last_sync_status, sync_frequency_minutes,
                      created_at
            ",
        )
        .bind(connection_id)
        .bind(self.tenant_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConnectorError::NotFound(format!("connection {connection_id}")))?;

        Ok(connection)
    }

    /// Update the scheduled sync cadence.
    pub async fn update_sync_frequency(
        &self,
        connection_id: Uuid,
        frequency_minutes: i32,
    ) -> Result<ConnectorConnection> {
        validate_sync_frequency(frequency_minutes)?;

        sqlx::query_as::<_, ConnectorConnection>(
            r"
            UPDATE connector_connections
            SET sync_frequency_minutes = $3
            WHERE id = $1 AND tenant_id = $2 AND status <> 'deleted'
            RETURNING id, tenant_id, external_connection_id, source_type,
                      connection_name, configuration, status, is_enabled,
                      last_sync_at, last_sync_status, sync_frequency_minutes,
                      created_at
            ",
        )
        .bind(connection_id)
        .bind(self.tenant_id)
        .bind(frequency_minutes)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConnectorError::NotFound(format!("connection {connection_id}")))
    }

    // ========================================================================
    // Sync Runs
    // ========================================================================

    /// Record the start of a sync run.
    pub async fn start_sync_run(&self, connector_id: Uuid) -> Result<SyncRun> {
        let run = sqlx::query_as::<_, SyncRun>(
            r"
            INSERT INTO sync_runs (run_id, tenant_id, connector_id, status, started_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING run_id, tenant_id, connector_id, status, started_at,
                      completed_at, rows_synced, error_message
            ",
        )
        .bind(Uuid::new_v4())
        .bind(self.tenant_id)
        .bind(connector_id)
        .bind(SyncRunStatus::Running)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(run)
    }

    /// Complete a sync run and update the connection's denormalized sync
    /// fields.
    pub async fn complete_sync_run(
        &self,
        run_id: Uuid,
        status: SyncRunStatus,
        rows_synced: Option<i64>,
        error_message: Option<String>,
    ) -> Result<SyncRun> {
        let run = sqlx::query_as::<_, SyncRun>(
            r"
            UPDATE sync_runs
            SET status = $3, completed_at = $4, rows_synced = $5, error_message = $6
            WHERE run_id = $1 AND tenant_id = $2
            RETURNING run_id, tenant_id, connector_id, status, started_at,
                      completed_at, rows_synced, error_message
            ",
        )
        .bind(run_id)
        .bind(self.tenant_id)
        .bind(status)
        .bind(Utc::now())
        .bind(rows_synced)
        .bind(&error_message)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConnectorError::NotFound(format!("sync run {run_id}")))?;

        match status {
            SyncRunStatus::Succeeded => {
                self.record_sync_success(run.connector_id).await?;
                self.audit
                    .write(
                        AuditEvent::new(self.tenant_id, AuditAction::StoreSyncCompleted)
                            .with_source(AuditSource::Worker)
                            .with_resource("sync_run", run_id.to_string())
                            .with_metadata(serde_json::json!({"rows_synced": rows_synced})),
                    )
                    .await;
            }
            SyncRunStatus::Failed => {
                let error = error_message.as_deref().unwrap_or("sync failed");
                self.mark_failed(run.connector_id, error).await?;
            }
            SyncRunStatus::Running | SyncRunStatus::Cancelled => {}
        }

        Ok(run)
    }

    /// Recent sync runs for a connector, newest first.
    pub async fn recent_sync_runs(&self, connector_id: Uuid, limit: i64) -> Result<Vec<SyncRun>> {
        let runs = sqlx::query_as::<_, SyncRun>(
            r"
            SELECT run_id, tenant_id, connector_id, status, started_at,
                   completed_at, rows_synced, error_message
            FROM sync_runs
            WHERE tenant_id = $1 AND connector_id = $2
            ORDER BY started_at DESC
            LIMIT $3
            ",
        )
        .bind(self.tenant_id)
        .bind(connector_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    async fn set_status(
        &self,
        connection_id: Uuid,
        status: ConnectionStatus,
    ) -> Result<ConnectorConnection> {
        sqlx::query_as::<_, ConnectorConnection>(
            r"
            UPDATE connector_connections
            SET status = $3
            WHERE id = $1 AND tenant_id = $2 AND status <> 'deleted'
            RETURNING id, tenant_id, external_connection_id, source_type,
                      connection_name, configuration, status, is_enabled,
                      last_sync_at, last_sync_status, sync_frequency_minutes,
                      created_at
            ",
        )
        .bind(connection_id)
        .bind(self.tenant_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConnectorError::NotFound(format!("connection {connection_id}")))
    }

    async fn set_enabled(&self, connection_id: Uuid, enabled: bool) -> Result<ConnectorConnection> {
        sqlx::query_as::<_, ConnectorConnection>(
            r"
            UPDATE connector_connections
            SET is_enabled = $3
            WHERE id = $1 AND tenant_id = $2 AND status <> 'deleted'
            RETURNING id, tenant_id, external_connection_id, source_type,
                      connection_name, configuration, status, is_enabled,
                      last_sync_at, last_sync_status, sync_frequency_minutes,
                      created_at
            ",
        )
        .bind(connection_id)
        .bind(self.tenant_id)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConnectorError::NotFound(format!("connection {connection_id}")))
    }
}

/// Validate the sync cadence bounds.
fn validate_sync_frequency(minutes: i32) -> Result<()> {
    if !(MIN_SYNC_FREQUENCY_MINUTES..=MAX_SYNC_FREQUENCY_MINUTES).contains(&minutes) {
        return Err(ConnectorError::InvalidInput(format!(
            "sync_frequency_minutes must be between {MIN_SYNC_FREQUENCY_MINUTES} and {MAX_SYNC_FREQUENCY_MINUTES}"
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_frequency_bounds() {
        assert!(validate_sync_frequency(15).is_ok());
        assert!(validate_sync_frequency(1440).is_ok());
        assert!(validate_sync_frequency(14).is_err());
        assert!(validate_sync_frequency(1441).is_err());
        assert!(validate_sync_frequency(0).is_err());
    }

    // Registration, the duplicate-shop guard, and sync-run bookkeeping
    // run against the partial unique index in Postgres; covered by the
    // integration environment.
}
