//! Dashboard service
//!
//! CRUD, optimistic locking, version snapshots with cap enforcement, and
//! restore. The tenant row is locked before counting so concurrent
//! creates cannot overshoot the plan limit.

use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog};

use super::{
    CustomDashboard, DashboardAccess, DashboardError, DashboardStatus, DashboardVersion, Result,
    VERSION_CAP,
};

// ============================================================================
// Service
// ============================================================================

/// Tenant- and user-scoped dashboard operations.
pub struct CustomDashboardService {
    pool: PgPool,
    audit: Arc<AuditLog>,
    tenant_id: Uuid,
    user_id: Uuid,
}

impl CustomDashboardService {
    /// Create a service bound to one tenant and acting user.
    pub fn new(pool: PgPool, audit: Arc<AuditLog>, tenant_id: Uuid, user_id: Uuid) -> Self {
        Self {
            pool,
            audit,
            tenant_id,
            user_id,
        }
    }

    // ========================================================================
    // Create & Duplicate
    // ========================================================================

    /// Create a dashboard under the plan limit.
    ///
    /// The count is taken after locking the tenant row, so two
    /// concurrent creates at `max - 1` cannot both pass the check.
    pub async fn create(
        &self,
        name: &str,
        layout_json: serde_json::Value,
        filters_json: serde_json::Value,
        max_dashboards: i64,
    ) -> Result<CustomDashboard> {
        let mut tx = self.pool.begin().await?;
        self.lock_tenant(&mut tx).await?;

        let current = self.count_non_archived(&mut tx).await?;
        if current >= max_dashboards {
            return Err(DashboardError::LimitExceeded {
                current,
                max: max_dashboards,
            });
        }
        self.ensure_name_free(&mut tx, name).await?;

        let now = Utc::now();
        let dashboard = sqlx::query_as::<_, CustomDashboard>(
            r"
            INSERT INTO custom_dashboards (
                id, tenant_id, name, status, layout_json, filters_json,
                version_number, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8, $8)
            RETURNING id, tenant_id, name, status, layout_json, filters_json,
                      version_number, created_by, created_at, updated_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(self.tenant_id)
        .bind(name)
        .bind(DashboardStatus::Draft)
        .bind(&layout_json)
        .bind(&filters_json)
        .bind(self.user_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        self.snapshot(&mut tx, &dashboard, "created").await?;
        tx.commit().await?;

        self.audit_write(AuditAction::DashboardCreated, dashboard.id, None)
            .await;

        Ok(dashboard)
    }

    /// Duplicate a dashboard under the same count lock.
    pub async fn duplicate(
        &self,
        dashboard_id: Uuid,
        new_name: &str,
        max_dashboards: i64,
    ) -> Result<CustomDashboard> {
        let source = self.get(dashboard_id).await?;
        self.create(
            new_name,
            source.layout_json.clone(),
            source.filters_json.clone(),
            max_dashboards,
        )
        .await
    }

    // ========================================================================
    // Read
    // ========================================================================

    /// Fetch a dashboard within the tenant scope.
    pub async fn get(&self, dashboard_id: Uuid) -> Result<CustomDashboard> {
        sqlx::query_as::<_, CustomDashboard>(
            r"
            SELECT id, tenant_id, name, status, layout_json, filters_json,
                   version_number, created_by, created_at, updated_at
            FROM custom_dashboards
            WHERE id = $1 AND tenant_id = $2
            ",
        )
        .bind(dashboard_id)
        .bind(self.tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DashboardError::NotFound)
    }

    /// Non-archived dashboards for the tenant.
    pub async fn list(&self) -> Result<Vec<CustomDashboard>> {
        let dashboards = sqlx::query_as::<_, CustomDashboard>(
            r"
            SELECT id, tenant_id, name, status, layout_json, filters_json,
                   version_number, created_by, created_at, updated_at
            FROM custom_dashboards
            WHERE tenant_id = $1 AND status <> 'archived'
            ORDER BY updated_at DESC
            ",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(dashboards)
    }

    /// The caller's access level on a dashboard.
    pub async fn access_level(&self, dashboard: &CustomDashboard) -> Result<DashboardAccess> {
        if dashboard.created_by == self.user_id {
            return Ok(DashboardAccess::Owner);
        }

        let share: Option<(String,)> = sqlx::query_as(
            r"
            SELECT access_level
            FROM dashboard_shares
            WHERE dashboard_id = $1 AND user_id = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            ",
        )
        .bind(dashboard.id)
        .bind(self.user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match share.as_ref().map(|(level,)| level.as_str()) {
            Some("admin") => DashboardAccess::Admin,
            Some("edit") => DashboardAccess::Edit,
            Some("read") => DashboardAccess::Read,
            _ => DashboardAccess::None,
        })
    }

    // ========================================================================
    // Update
    // ========================================================================

    /// Update layout/filters with optimistic locking.
    ///
    /// `expected_updated_at` must match the row; a mismatch returns a
    /// conflict so the client reloads. On success the version counter
    /// bumps and a snapshot is taken.
    pub async fn update(
        &self,
        dashboard_id: Uuid,
        layout_json: Option<serde_json::Value>,
        filters_json: Option<serde_json::Value>,
        expected_updated_at: chrono::DateTime<Utc>,
        change_summary: &str,
    ) -> Result<CustomDashboard> {
        let existing = self.get(dashboard_id).await?;
        self.require_write(&existing).await?;

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let updated = sqlx::query_as::<_, CustomDashboard>(
            r"
            UPDATE custom_dashboards
            SET layout_json = COALESCE($4, layout_json),
                filters_json = COALESCE($5, filters_json),
                version_number = version_number + 1,
                updated_at = $6
            WHERE id = $1 AND tenant_id = $2 AND updated_at = $3
            RETURNING id, tenant_id, name, status, layout_json, filters_json,
                      version_number, created_by, created_at, updated_at
            ",
        )
        .bind(dashboard_id)
        .bind(self.tenant_id)
        .bind(expected_updated_at)
        .bind(layout_json)
        .bind(filters_json)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DashboardError::OptimisticLockConflict)?;

        self.snapshot(&mut tx, &updated, change_summary).await?;
        tx.commit().await?;

        self.audit_write(AuditAction::DashboardUpdated, dashboard_id, None)
            .await;

        Ok(updated)
    }

    /// Publish a draft.
    pub async fn publish(&self, dashboard_id: Uuid) -> Result<CustomDashboard> {
        self.set_status(dashboard_id, DashboardStatus::Published).await
    }

    /// Archive a dashboard, freeing its name for reuse.
    pub async fn archive(&self, dashboard_id: Uuid) -> Result<CustomDashboard> {
        let archived = self.set_status(dashboard_id, DashboardStatus::Archived).await?;
        self.audit_write(AuditAction::DashboardArchived, dashboard_id, None)
            .await;
        Ok(archived)
    }

    // ========================================================================
    // Versions
    // ========================================================================

    /// Versions of a dashboard, newest first.
    pub async fn list_versions(&self, dashboard_id: Uuid) -> Result<Vec<DashboardVersion>> {
        // Ownership check: tenant-scoped get first
        self.get(dashboard_id).await?;

        let versions = sqlx::query_as::<_, DashboardVersion>(
            r"
            SELECT dashboard_id, version_number, snapshot_json, change_summary,
                   created_by, created_at
            FROM dashboard_versions
            WHERE dashboard_id = $1
            ORDER BY version_number DESC
            ",
        )
        .bind(dashboard_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(versions)
    }

    /// One specific version.
    pub async fn get_version(
        &self,
        dashboard_id: Uuid,
        version_number: i64,
    ) -> Result<DashboardVersion> {
        self.get(dashboard_id).await?;

        sqlx::query_as::<_, DashboardVersion>(
            r"
            SELECT dashboard_id, version_number, snapshot_json, change_summary,
                   created_by, created_at
            FROM dashboard_versions
            WHERE dashboard_id = $1 AND version_number = $2
            ",
        )
        .bind(dashboard_id)
        .bind(version_number)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DashboardError::VersionNotFound(version_number))
    }

    /// Restore a dashboard to a snapshot: the snapshot's layout and
    /// filters replace the current ones and the version counter bumps.
    pub async fn restore_version(
        &self,
        dashboard_id: Uuid,
        version_number: i64,
    ) -> Result<CustomDashboard> {
        let existing = self.get(dashboard_id).await?;
        self.require_write(&existing).await?;
        let version = self.get_version(dashboard_id, version_number).await?;

        let layout = version
            .snapshot_json
            .get("layout_json")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let filters = version
            .snapshot_json
            .get("filters_json")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let mut tx = self.pool.begin().await?;
        let restored = sqlx::query_as::<_, CustomDashboard>(
            r"
            UPDATE custom_dashboards
            SET layout_json = $3, filters_json = $4,
                version_number = version_number + 1, updated_at = $5
            WHERE id = $1 AND tenant_id = $2
            RETURNING id, tenant_id, name, status, layout_json, filters_json,
                      version_number, created_by, created_at, updated_at
            ",
        )
        .bind(dashboard_id)
        .bind(self.tenant_id)
        .bind(layout)
        .bind(filters)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DashboardError::NotFound)?;

        self.snapshot(
            &mut tx,
            &restored,
            &format!("restored from version {version_number}"),
        )
        .await?;
        tx.commit().await?;

        self.audit_write(
            AuditAction::DashboardVersionRestored,
            dashboard_id,
            Some(serde_json::json!({"restored_version": version_number})),
        )
        .await;

        Ok(restored)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Lock the tenant row; serializes dashboard-count checks.
    async fn lock_tenant(&self, tx: &mut Transaction<'_, Postgres>) -> Result<()> {
        sqlx::query(r"SELECT id FROM tenants WHERE id = $1 FOR UPDATE")
            .bind(self.tenant_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn count_non_archived(&self, tx: &mut Transaction<'_, Postgres>) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM custom_dashboards
            WHERE tenant_id = $1 AND status <> 'archived'
            ",
        )
        .bind(self.tenant_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.0)
    }

    async fn ensure_name_free(&self, tx: &mut Transaction<'_, Postgres>, name: &str) -> Result<()> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r"
            SELECT id FROM custom_dashboards
            WHERE tenant_id = $1 AND name = $2 AND status <> 'archived'
            ",
        )
        .bind(self.tenant_id)
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?;

        if row.is_some() {
            return Err(DashboardError::NameConflict(name.to_string()));
        }
        Ok(())
    }

    async fn require_write(&self, dashboard: &CustomDashboard) -> Result<()> {
        if self.access_level(dashboard).await?.can_write() {
            Ok(())
        } else {
            Err(DashboardError::AccessDenied)
        }
    }

    /// Insert a snapshot and prune beyond the cap, oldest first.
    async fn snapshot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        dashboard: &CustomDashboard,
        change_summary: &str,
    ) -> Result<()> {
        let snapshot_json = serde_json::json!({
            "name": dashboard.name,
            "status": dashboard.status,
            "layout_json": dashboard.layout_json,
            "filters_json": dashboard.filters_json,
        });

        sqlx::query(
            r"
            INSERT INTO dashboard_versions (
                dashboard_id, version_number, snapshot_json, change_summary,
                created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(dashboard.id)
        .bind(dashboard.version_number)
        .bind(&snapshot_json)
        .bind(change_summary)
        .bind(self.user_id)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r"
            DELETE FROM dashboard_versions
            WHERE dashboard_id = $1
              AND version_number NOT IN (
                  SELECT version_number FROM dashboard_versions
                  WHERE dashboard_id = $1
                  ORDER BY version_number DESC
                  LIMIT $2
              )
            ",
        )
        .bind(dashboard.id)
        .bind(VERSION_CAP)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn set_status(
        &self,
        dashboard_id: Uuid,
        status: DashboardStatus,
    ) -> Result<CustomDashboard> {
        let existing = self.get(dashboard_id).await?;
        self.require_write(&existing).await?;

        sqlx::query_as::<_, CustomDashboard>(
            r"
            UPDATE custom_dashboards
            SET status = $3, updated_at = $4
            WHERE id = $1 AND tenant_id = $2
            RETURNING id, tenant_id, name, status, layout_json, filters_json,
                      version_number, created_by, created_at, updated_at
            ",
        )
        .bind(dashboard_id)
        .bind(self.tenant_id)
        .bind(status)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DashboardError::NotFound)
    }

    async fn audit_write(
        &self,
        action: AuditAction,
        dashboard_id: Uuid,
        metadata: Option<serde_json::Value>,
    ) {
        let mut event = AuditEvent::new(self.tenant_id, action)
            .with_user(self.user_id)
            .with_resource("dashboard", dashboard_id.to_string());
        if let Some(metadata) = metadata {
            event = event.with_metadata(metadata);
        }
        self.audit.write(event).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_shape_round_trips() {
        let dashboard = CustomDashboard {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Revenue".to_string(),
            status: DashboardStatus::Draft,
            layout_json: serde_json::json!({"rows": [1, 2]}),
            filters_json: serde_json::json!({"range": "30d"}),
            version_number: 3,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let snapshot = serde_json::json!({
            "name": dashboard.name,
            "status": dashboard.status,
            "layout_json": dashboard.layout_json,
            "filters_json": dashboard.filters_json,
        });
        assert_eq!(snapshot["layout_json"]["rows"][1], 2);
        assert_eq!(snapshot["status"], "draft");
    }

    // Limit enforcement under the tenant lock, optimistic-lock conflicts,
    // and version pruning need Postgres; covered in the integration
    // environment.
}
