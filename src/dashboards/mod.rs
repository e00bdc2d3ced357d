//! Custom dashboards
//!
//! Tenant-scoped dashboard CRUD with optimistic locking, version
//! snapshots, and share-based access levels:
//!
//! - Creation and duplication count non-archived dashboards under a
//!   pessimistic lock so the plan limit cannot be overshot
//! - Updates serialize via `expected_updated_at`; a mismatch forces the
//!   client to reload
//! - Every write bumps `version_number` and snapshots the dashboard;
//!   versions are capped at 50 with FIFO pruning
//! - Access levels: owner (creator), then admin/edit/read via
//!   non-expired share rows; writes require owner, admin, or edit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{DenialPayload, ErrorCode};

pub mod service;

pub use service::CustomDashboardService;

/// Maximum versions retained per dashboard; oldest pruned on overflow.
pub const VERSION_CAP: i64 = 50;

// ============================================================================
// Error Types
// ============================================================================

/// Dashboard subsystem errors
#[derive(Error, Debug)]
pub enum DashboardError {
    /// Dashboard not found within the tenant scope
    #[error("Dashboard not found")]
    NotFound,

    /// Tenant is at its dashboard limit
    #[error("Dashboard limit reached: {current} of {max}")]
    LimitExceeded {
        /// Current non-archived count
        current: i64,
        /// Plan limit
        max: i64,
    },

    /// A non-archived dashboard with this name already exists
    #[error("A dashboard named '{0}' already exists")]
    NameConflict(String),

    /// Concurrent write detected via `expected_updated_at`
    #[error("Dashboard was modified by someone else; reload and retry")]
    OptimisticLockConflict,

    /// Caller lacks write access
    #[error("You do not have permission to modify this dashboard")]
    AccessDenied,

    /// Referenced version not found
    #[error("Version {0} not found")]
    VersionNotFound(i64),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DashboardError {
    /// Structured denial payload for the caller.
    pub fn to_denial(&self) -> DenialPayload {
        match self {
            Self::NotFound => DenialPayload::new(ErrorCode::AccountNotFound, "Not found."),
            Self::LimitExceeded { .. } => {
                DenialPayload::new(ErrorCode::DashboardLimitExceeded, self.to_string())
            }
            Self::NameConflict(_) => {
                DenialPayload::new(ErrorCode::DashboardNameConflict, self.to_string())
            }
            Self::OptimisticLockConflict => {
                DenialPayload::new(ErrorCode::OptimisticLockConflict, self.to_string())
            }
            Self::AccessDenied => DenialPayload::new(ErrorCode::AccessRevoked, self.to_string()),
            _ => DenialPayload::new(
                ErrorCode::CacheUnavailable,
                "The operation could not be completed.",
            ),
        }
    }
}

/// Result type for dashboard operations
pub type Result<T> = std::result::Result<T, DashboardError>;

// ============================================================================
// Rows
// ============================================================================

/// Dashboard lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dashboard_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DashboardStatus {
    /// Editable, not visible to viewers
    Draft,
    /// Live
    Published,
    /// Hidden; name freed for reuse
    Archived,
}

/// A custom dashboard. Unique on (tenant, name) among non-archived rows.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CustomDashboard {
    /// Dashboard id
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Display name
    pub name: String,

    /// Lifecycle status
    pub status: DashboardStatus,

    /// Layout definition
    pub layout_json: serde_json::Value,

    /// Filter definition
    pub filters_json: serde_json::Value,

    /// Monotonic version counter
    pub version_number: i64,

    /// Creator (owner)
    pub created_by: Uuid,

    /// Creation instant
    pub created_at: DateTime<Utc>,

    /// Last write instant (the optimistic-lock token)
    pub updated_at: DateTime<Utc>,
}

/// A point-in-time snapshot of a dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DashboardVersion {
    /// Dashboard snapshotted
    pub dashboard_id: Uuid,

    /// Version counter at snapshot time
    pub version_number: i64,

    /// Full dashboard snapshot
    pub snapshot_json: serde_json::Value,

    /// What changed
    pub change_summary: String,

    /// Who made the change
    pub created_by: Uuid,

    /// Snapshot instant
    pub created_at: DateTime<Utc>,
}

/// Access level a caller holds on a dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DashboardAccess {
    /// Creator
    Owner,
    /// Full control via share
    Admin,
    /// May edit via share
    Edit,
    /// Read-only via share
    Read,
    /// No access
    None,
}

impl DashboardAccess {
    /// Whether this level permits writes.
    pub fn can_write(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin | Self::Edit)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_write_matrix() {
        assert!(DashboardAccess::Owner.can_write());
        assert!(DashboardAccess::Admin.can_write());
        assert!(DashboardAccess::Edit.can_write());
        assert!(!DashboardAccess::Read.can_write());
        assert!(!DashboardAccess::None.can_write());
    }

    #[test]
    fn test_error_denials() {
        let err = DashboardError::LimitExceeded { current: 3, max: 3 };
        assert_eq!(err.to_denial().error_code, ErrorCode::DashboardLimitExceeded);
        assert_eq!(
            DashboardError::OptimisticLockConflict.to_denial().error_code,
            ErrorCode::OptimisticLockConflict
        );
        assert_eq!(
            DashboardError::NameConflict("Revenue".to_string())
                .to_denial()
                .error_code,
            ErrorCode::DashboardNameConflict
        );
    }
}
