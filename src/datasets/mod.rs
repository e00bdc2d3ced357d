//! Dataset version manager
//!
//! Gates BI-dataset upgrades so removals or type changes of *exposed*
//! columns can never silently break dashboards:
//!
//! - A candidate is compatible iff every exposed column of the active
//!   version survives with the same type; unexposed columns are free to
//!   change
//! - Lifecycle: `pending → active | failed`; activation supersedes the
//!   prior active and requires compatibility
//! - `rollback` demotes the active version and promotes the latest
//!   superseded one
//! - At most one active version per dataset (partial unique index)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditSource};

// ============================================================================
// Error Types
// ============================================================================

/// Dataset subsystem errors
#[derive(Error, Debug)]
pub enum DatasetError {
    /// Candidate schema breaks exposed columns
    #[error("Schema incompatible: {0}")]
    SchemaIncompatible(String),

    /// Referenced dataset or version not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation invalid for the version's status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for dataset operations
pub type Result<T> = std::result::Result<T, DatasetError>;

// ============================================================================
// Columns & Compatibility
// ============================================================================

/// One column in a dataset schema snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name
    pub name: String,

    /// Column type
    pub column_type: String,

    /// Whether the column is surfaced in the BI layer
    pub exposed: bool,
}

/// Outcome of a compatibility evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityOutcome {
    /// Whether the candidate is compatible
    pub is_compatible: bool,

    /// Why not, when incompatible
    pub incompatibility_reason: Option<String>,
}

/// Compatible iff no exposed column of `active` is missing from
/// `candidate` or changed in type. Unexposed columns may be freely
/// removed or retyped.
pub fn check_compatibility(active: &[ColumnDef], candidate: &[ColumnDef]) -> CompatibilityOutcome {
    let candidate_by_name: HashMap<&str, &ColumnDef> = candidate
        .iter()
        .map(|column| (column.name.as_str(), column))
        .collect();

    let mut problems = Vec::new();
    for column in active.iter().filter(|column| column.exposed) {
        match candidate_by_name.get(column.name.as_str()) {
            None => problems.push(format!("exposed column '{}' removed", column.name)),
            Some(replacement) if replacement.column_type != column.column_type => {
                problems.push(format!(
                    "exposed column '{}' changed type {} -> {}",
                    column.name, column.column_type, replacement.column_type
                ));
            }
            Some(_) => {}
        }
    }

    if problems.is_empty() {
        CompatibilityOutcome {
            is_compatible: true,
            incompatibility_reason: None,
        }
    } else {
        CompatibilityOutcome {
            is_compatible: false,
            incompatibility_reason: Some(problems.join("; ")),
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Lifecycle status of a dataset version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dataset_version_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DatasetVersionStatus {
    /// Created, not yet activated
    Pending,
    /// Serving the BI layer
    Active,
    /// Activation failed
    Failed,
    /// Replaced by a newer active version
    Superseded,
    /// Demoted by a rollback
    RolledBack,
}

/// One version of a BI-exposed dataset.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DatasetVersion {
    /// Version record id
    pub id: Uuid,

    /// Dataset name
    pub dataset_name: String,

    /// Version label
    pub version: String,

    /// Lifecycle status
    pub status: DatasetVersionStatus,

    /// Column schema snapshot
    pub column_snapshot: serde_json::Value,

    /// Compatibility verdict against the active version at evaluation
    pub is_compatible: bool,

    /// Why incompatible, when it is
    pub incompatibility_reason: Option<String>,

    /// Activation instant
    pub activated_at: Option<DateTime<Utc>>,

    /// Deactivation instant
    pub deactivated_at: Option<DateTime<Utc>>,

    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl DatasetVersion {
    /// Parse the column snapshot.
    pub fn columns(&self) -> Result<Vec<ColumnDef>> {
        Ok(serde_json::from_value(self.column_snapshot.clone())?)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Manages dataset version lifecycle and the compatibility gate.
pub struct DatasetVersionManager {
    pool: PgPool,
    audit: Arc<AuditLog>,
}

impl DatasetVersionManager {
    /// Create a manager.
    pub fn new(pool: PgPool, audit: Arc<AuditLog>) -> Self {
        Self { pool, audit }
    }

    /// Create a pending version. Idempotent on `(dataset_name, version)`:
    /// re-creating an existing pair returns the existing row.
    pub async fn create_pending(
        &self,
        dataset_name: &str,
        version: &str,
        columns: &[ColumnDef],
    ) -> Result<DatasetVersion> {
        if let Some(existing) = self.find(dataset_name, version).await? {
            return Ok(existing);
        }

        // Compatibility is evaluated against the current active version
        // at creation time; no active version means trivially compatible.
        let outcome = match self.active_version(dataset_name).await? {
            Some(active) => check_compatibility(&active.columns()?, columns),
            None => CompatibilityOutcome {
                is_compatible: true,
                incompatibility_reason: None,
            },
        };

        let row = sqlx::query_as::<_, DatasetVersion>(
            r"
            INSERT INTO dataset_versions (
                id, dataset_name, version, status, column_snapshot,
                is_compatible, incompatibility_reason, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (dataset_name, version) DO NOTHING
            RETURNING id, dataset_name, version, status, column_snapshot,
                      is_compatible, incompatibility_reason, activated_at,
                      deactivated_at, created_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(dataset_name)
        .bind(version)
        .bind(DatasetVersionStatus::Pending)
        .bind(serde_json::to_value(columns)?)
        .bind(outcome.is_compatible)
        .bind(&outcome.incompatibility_reason)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(version) => Ok(version),
            // Lost a concurrent insert race; the winner's row stands.
            None => self
                .find(dataset_name, version)
                .await?
                .ok_or_else(|| DatasetError::NotFound(format!("{dataset_name}@{version}"))),
        }
    }

    /// Activate a pending version.
    ///
    /// Requires `is_compatible = true`; incompatible candidates are
    /// marked failed and rejected. The prior active version becomes
    /// superseded in the same transaction.
    pub async fn activate(&self, dataset_name: &str, version: &str) -> Result<DatasetVersion> {
        let candidate = self
            .find(dataset_name, version)
            .await?
            .ok_or_else(|| DatasetError::NotFound(format!("{dataset_name}@{version}")))?;

        if candidate.status != DatasetVersionStatus::Pending {
            return Err(DatasetError::InvalidState(format!(
                "version {version} is {:?}, expected pending",
                candidate.status
            )));
        }

        if !candidate.is_compatible {
            self.set_status(candidate.id, DatasetVersionStatus::Failed, None, Some(Utc::now()))
                .await?;
            return Err(DatasetError::SchemaIncompatible(
                candidate
                    .incompatibility_reason
                    .unwrap_or_else(|| "exposed columns changed".to_string()),
            ));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            UPDATE dataset_versions
            SET status = 'superseded', deactivated_at = $2
            WHERE dataset_name = $1 AND status = 'active'
            ",
        )
        .bind(dataset_name)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let activated = sqlx::query_as::<_, DatasetVersion>(
            r"
            UPDATE dataset_versions
            SET status = 'active', activated_at = $2, deactivated_at = NULL
            WHERE id = $1
            RETURNING id, dataset_name, version, status, column_snapshot,
                      is_compatible, incompatibility_reason, activated_at,
                      deactivated_at, created_at
            ",
        )
        .bind(candidate.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        self.audit
            .write(
                AuditEvent::new(Uuid::nil(), AuditAction::DatasetVersionActivated)
                    .with_source(AuditSource::System)
                    .with_resource("dataset_version", format!("{dataset_name}@{version}"))
                    .with_metadata(serde_json::json!({
                        "dataset_name": dataset_name,
                        "version": version,
                    })),
            )
            .await;

        Ok(activated)
    }

    /// Roll a dataset back: the active version demotes to `rolled_back`
    /// and the most recently superseded version is promoted.
    pub async fn rollback(&self, dataset_name: &str) -> Result<DatasetVersion> {
        let active = self
            .active_version(dataset_name)
            .await?
            .ok_or_else(|| DatasetError::NotFound(format!("no active version for {dataset_name}")))?;

        let previous = sqlx::query_as::<_, DatasetVersion>(
            r"
            SELECT id, dataset_name, version, status, column_snapshot,
                   is_compatible, incompatibility_reason, activated_at,
                   deactivated_at, created_at
            FROM dataset_versions
            WHERE dataset_name = $1 AND status = 'superseded'
            ORDER BY deactivated_at DESC NULLS LAST
            LIMIT 1
            ",
        )
        .bind(dataset_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            DatasetError::InvalidState(format!("no superseded version to roll {dataset_name} back to"))
        })?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            UPDATE dataset_versions
            SET status = 'rolled_back', deactivated_at = $2
            WHERE id = $1
            ",
        )
        .bind(active.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let promoted = sqlx::query_as::<_, DatasetVersion>(
            r"
            UPDATE dataset_versions
            SET status = 'active', activated_at = $2, deactivated_at = NULL
            WHERE id = $1
            RETURNING id, dataset_name, version, status, column_snapshot,
                      is_compatible, incompatibility_reason, activated_at,
                      deactivated_at, created_at
            ",
        )
        .bind(previous.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        self.audit
            .write(
                AuditEvent::new(Uuid::nil(), AuditAction::DatasetVersionRolledBack)
                    .with_source(AuditSource::System)
                    .with_resource("dataset_version", dataset_name)
                    .with_metadata(serde_json::json!({
                        "dataset_name": dataset_name,
                        "demoted_version": active.version,
                        "promoted_version": promoted.version,
                    })),
            )
            .await;

        Ok(promoted)
    }

    /// Mark a pending version failed.
    pub async fn mark_failed(&self, dataset_name: &str, version: &str) -> Result<()> {
        let row = self
            .find(dataset_name, version)
            .await?
            .ok_or_else(|| DatasetError::NotFound(format!("{dataset_name}@{version}")))?;
        self.set_status(row.id, DatasetVersionStatus::Failed, None, Some(Utc::now()))
            .await
    }

    /// The currently active version, if any.
    pub async fn active_version(&self, dataset_name: &str) -> Result<Option<DatasetVersion>> {
        let row = sqlx::query_as::<_, DatasetVersion>(
            r"
            SELECT id, dataset_name, version, status, column_snapshot,
                   is_compatible, incompatibility_reason, activated_at,
                   deactivated_at, created_at
            FROM dataset_versions
            WHERE dataset_name = $1 AND status = 'active'
            ",
        )
        .bind(dataset_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    async fn find(&self, dataset_name: &str, version: &str) -> Result<Option<DatasetVersion>> {
        let row = sqlx::query_as::<_, DatasetVersion>(
            r"
            SELECT id, dataset_name, version, status, column_snapshot,
                   is_compatible, incompatibility_reason, activated_at,
                   deactivated_at, created_at
            FROM dataset_versions
            WHERE dataset_name = $1 AND version = $2
            ",
        )
        .bind(dataset_name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: DatasetVersionStatus,
        activated_at: Option<DateTime<Utc>>,
        deactivated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE dataset_versions
            SET status = $2,
                activated_at = COALESCE($3, activated_at),
                deactivated_at = COALESCE($4, deactivated_at)
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(status)
        .bind(activated_at)
        .bind(deactivated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, column_type: &str, exposed: bool) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            column_type: column_type.to_string(),
            exposed,
        }
    }

    #[test]
    fn test_identical_schema_compatible() {
        let columns = vec![
            column("order_id", "text", true),
            column("revenue", "numeric", true),
        ];
        let outcome = check_compatibility(&columns, &columns);
        assert!(outcome.is_compatible);
        assert!(outcome.incompatibility_reason.is_none());
    }

    #[test]
    fn test_removed_exposed_column_incompatible() {
        let active = vec![
            column("order_id", "text", true),
            column("revenue", "numeric", true),
        ];
        let candidate = vec![column("order_id", "text", true)];
        let outcome = check_compatibility(&active, &candidate);
        assert!(!outcome.is_compatible);
        assert!(outcome
            .incompatibility_reason
            .unwrap()
            .contains("'revenue' removed"));
    }

    #[test]
    fn test_retyped_exposed_column_incompatible() {
        let active = vec![column("revenue", "numeric", true)];
        let candidate = vec![column("revenue", "text", true)];
        let outcome = check_compatibility(&active, &candidate);
        assert!(!outcome.is_compatible);
        assert!(outcome
            .incompatibility_reason
            .unwrap()
            .contains("numeric -> text"));
    }

    #[test]
    fn test_unexposed_columns_free_to_change() {
        let active = vec![
            column("order_id", "text", true),
            column("internal_flag", "boolean", false),
            column("debug_blob", "jsonb", false),
        ];
        // Unexposed removed and retyped; exposed intact
        let candidate = vec![
            column("order_id", "text", true),
            column("internal_flag", "text", false),
        ];
        assert!(check_compatibility(&active, &candidate).is_compatible);
    }

    #[test]
    fn test_added_columns_compatible() {
        let active = vec![column("order_id", "text", true)];
        let candidate = vec![
            column("order_id", "text", true),
            column("discount", "numeric", true),
        ];
        assert!(check_compatibility(&active, &candidate).is_compatible);
    }

    #[test]
    fn test_exposure_flag_change_on_surviving_column_is_compatible() {
        // The gate protects name+type of exposed columns; flipping a
        // candidate column to unexposed while keeping name and type does
        // not break existing dashboards at the schema level.
        let active = vec![column("order_id", "text", true)];
        let candidate = vec![column("order_id", "text", false)];
        assert!(check_compatibility(&active, &candidate).is_compatible);
    }

    #[test]
    fn test_multiple_problems_reported_together() {
        let active = vec![
            column("a", "text", true),
            column("b", "int", true),
        ];
        let candidate = vec![column("b", "text", true)];
        let reason = check_compatibility(&active, &candidate)
            .incompatibility_reason
            .unwrap();
        assert!(reason.contains("'a' removed"));
        assert!(reason.contains("'b' changed type"));
    }

    // Activation/rollback against the partial unique index need
    // Postgres; covered in the integration environment.
}
