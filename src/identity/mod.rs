//! Identity mirror
//!
//! Local mirror of the hosted identity provider: users, organizations
//! (tenants), and memberships. The mirror is maintained by webhook-driven
//! sync plus lazy bootstrap at the guard. Key properties:
//!
//! - Revocation never deletes rows; `is_active = false` preserves the
//!   trail for audit reconstruction
//! - Role mapping from provider roles is a closed function
//! - Sync operations are idempotent

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod sync;

pub use sync::{IdentityEvent, IdentitySyncService};

// ============================================================================
// Error Types
// ============================================================================

/// Identity subsystem errors
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Referenced record was not found
    #[error("Identity record not found: {0}")]
    NotFound(String),
}

/// Result type for identity operations
pub type Result<T> = std::result::Result<T, IdentityError>;

// ============================================================================
// Rows
// ============================================================================

/// Mirrored user. No passwords are stored; authentication happens at the
/// identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    /// Local id
    pub id: Uuid,

    /// Identity-provider user id
    pub external_user_id: String,

    /// Whether the user is active (deactivation is reversible)
    pub is_active: bool,
}

/// Tenant status; transitions are linear except admin reactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tenant_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    /// Active
    Active,
    /// Suspended (reversible)
    Suspended,
    /// Deactivated
    Deactivated,
}

/// Billing tier of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "billing_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingTier {
    /// Free tier
    Free,
    /// Growth tier
    Growth,
    /// Pro tier
    Pro,
    /// Enterprise tier
    Enterprise,
}

impl BillingTier {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Growth => "growth",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

/// The billing and data-isolation boundary.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tenant {
    /// Immutable tenant id
    pub id: Uuid,

    /// Identity-provider organization id
    pub external_org_id: String,

    /// Display name
    pub name: String,

    /// Billing tier
    pub billing_tier: BillingTier,

    /// Lifecycle status
    pub status: TenantStatus,
}

/// Where a role grant came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "role_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RoleSource {
    /// Identity-provider webhook
    Webhook,
    /// Lazy bootstrap at the guard
    LazySync,
    /// Agency-granted access
    AgencyGrant,
    /// Operator-granted access
    AdminGrant,
}

/// A user's role within one tenant. Composite unique on
/// `(user_id, tenant_id, role)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserTenantRole {
    /// User holding the role
    pub user_id: Uuid,

    /// Tenant the role applies to
    pub tenant_id: Uuid,

    /// Role name
    pub role: TenantRole,

    /// Whether the grant is live
    pub is_active: bool,

    /// Origin of the grant
    pub source: RoleSource,
}

// ============================================================================
// Roles
// ============================================================================

/// Roles a user can hold within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tenant_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TenantRole {
    /// Merchant administrator
    MerchantAdmin,
    /// Merchant read-only viewer
    MerchantViewer,
    /// Agency administrator (manages multiple client tenants)
    AgencyAdmin,
    /// Agency analyst
    AgencyAnalyst,
}

impl TenantRole {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MerchantAdmin => "merchant_admin",
            Self::MerchantViewer => "merchant_viewer",
            Self::AgencyAdmin => "agency_admin",
            Self::AgencyAnalyst => "agency_analyst",
        }
    }

    /// Parse a role string; unknown strings map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "merchant_admin" => Some(Self::MerchantAdmin),
            "merchant_viewer" => Some(Self::MerchantViewer),
            "agency_admin" => Some(Self::AgencyAdmin),
            "agency_analyst" => Some(Self::AgencyAnalyst),
            _ => None,
        }
    }
}

/// Map an identity-provider role string to a local role.
///
/// Closed function: `org:admin` and `org:owner` become merchant admins;
/// member, viewer, billing, and anything unknown become merchant viewers.
pub fn map_provider_role(provider_role: &str) -> TenantRole {
    match provider_role {
        "org:admin" | "org:owner" => TenantRole::MerchantAdmin,
        "org:member" | "org:viewer" | "org:billing" => TenantRole::MerchantViewer,
        _ => TenantRole::MerchantViewer,
    }
}

/// Roles permitted at each billing tier. A downgrade narrows this set and
/// the guard enforces it on every request.
pub fn roles_allowed_for_tier(tier: BillingTier) -> &'static [TenantRole] {
    match tier {
        BillingTier::Free => &[TenantRole::MerchantAdmin, TenantRole::MerchantViewer],
        BillingTier::Growth => &[
            TenantRole::MerchantAdmin,
            TenantRole::MerchantViewer,
            TenantRole::AgencyAdmin,
        ],
        BillingTier::Pro | BillingTier::Enterprise => &[
            TenantRole::MerchantAdmin,
            TenantRole::MerchantViewer,
            TenantRole::AgencyAdmin,
            TenantRole::AgencyAnalyst,
        ],
    }
}

/// Whether a role is permitted at a billing tier.
pub fn is_role_allowed_for_tier(role: TenantRole, tier: BillingTier) -> bool {
    roles_allowed_for_tier(tier).contains(&role)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_role_mapping_is_closed() {
        assert_eq!(map_provider_role("org:admin"), TenantRole::MerchantAdmin);
        assert_eq!(map_provider_role("org:owner"), TenantRole::MerchantAdmin);
        assert_eq!(map_provider_role("org:member"), TenantRole::MerchantViewer);
        assert_eq!(map_provider_role("org:billing"), TenantRole::MerchantViewer);
        // Unknown roles default to viewer, never admin
        assert_eq!(
            map_provider_role("org:superuser"),
            TenantRole::MerchantViewer
        );
        assert_eq!(map_provider_role(""), TenantRole::MerchantViewer);
    }

    #[test]
    fn test_tier_allowlist_narrows_on_downgrade() {
        assert!(is_role_allowed_for_tier(
            TenantRole::AgencyAdmin,
            BillingTier::Growth
        ));
        assert!(!is_role_allowed_for_tier(
            TenantRole::AgencyAdmin,
            BillingTier::Free
        ));
        assert!(is_role_allowed_for_tier(
            TenantRole::AgencyAnalyst,
            BillingTier::Pro
        ));
        assert!(!is_role_allowed_for_tier(
            TenantRole::AgencyAnalyst,
            BillingTier::Growth
        ));
        // Merchant roles survive every tier
        for tier in [
            BillingTier::Free,
            BillingTier::Growth,
            BillingTier::Pro,
            BillingTier::Enterprise,
        ] {
            assert!(is_role_allowed_for_tier(TenantRole::MerchantAdmin, tier));
            assert!(is_role_allowed_for_tier(TenantRole::MerchantViewer, tier));
        }
    }

    #[test]
    fn test_role_parse_round_trip() {
        for role in [
            TenantRole::MerchantAdmin,
            TenantRole::MerchantViewer,
            TenantRole::AgencyAdmin,
            TenantRole::AgencyAnalyst,
        ] {
            assert_eq!(TenantRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(TenantRole::parse("superuser"), None);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(BillingTier::Free < BillingTier::Growth);
        assert!(BillingTier::Growth < BillingTier::Pro);
        assert!(BillingTier::Pro < BillingTier::Enterprise);
    }
}
