//! Tenant guard
//!
//! Binds every authenticated request to exactly one *active* tenant
//! context, re-validated against the database; token claims are never
//! trusted alone:
//!
//! - Lazy user bootstrap closes the identity-webhook lag window
//! - Revoked access, suspended tenants, and deactivated users deny
//!   immediately, mid-session
//! - The billing-tier role allowlist is enforced on every request, so a
//!   downgrade revokes elevated roles without waiting for token expiry
//! - Every denial writes a structured security audit event
//!
//! Failure model: authentication failures deny with 401 semantics, tenant
//! access failures with 403 semantics, and unknown internal errors deny
//! fail-closed.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog};
use crate::core::{DenialPayload, ErrorCode, RequestInfo};
use crate::identity::{
    is_role_allowed_for_tier, BillingTier, RoleSource, Tenant, TenantRole, TenantStatus, User,
    UserTenantRole,
};

pub mod middleware;

pub use middleware::{cors_layer, with_edge_layers, GuardLayer};

// ============================================================================
// Error Types
// ============================================================================

/// Guard enforcement errors
#[derive(Error, Debug)]
pub enum GuardError {
    /// Request denied; payload carries the structured denial
    #[error("Request denied: {}", .0.error_code)]
    Denied(Box<DenialPayload>),

    /// Database error (fail-closed at the middleware boundary)
    #[error("Database error during enforcement: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for guard operations
pub type Result<T> = std::result::Result<T, GuardError>;

// ============================================================================
// Inputs
// ============================================================================

/// Verified bearer-token claims, produced by the authentication
/// collaborator. The guard treats them as a hint, not an authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Identity-provider user id
    pub external_user_id: String,

    /// Tenants the token says the user may access
    pub allowed_tenant_ids: Vec<Uuid>,

    /// Role strings the token carries
    pub roles: Vec<String>,
}

/// Violation classes recorded on denials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    /// Authentication missing
    MissingAuth,
    /// No tenant context supplied
    MissingTenant,
    /// Tenant not found
    InvalidTenant,
    /// Attempted access outside the allowed set
    CrossTenant,
    /// Tenant suspended or deactivated
    SuspendedTenant,
    /// User deactivated
    InactiveUser,
    /// Membership revoked in the database
    AccessRevoked,
    /// No role valid at the current billing tier
    RoleInvalidForBilling,
}

impl ViolationType {
    /// Stable string form written to audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingAuth => "missing_auth",
            Self::MissingTenant => "missing_tenant",
            Self::InvalidTenant => "invalid_tenant",
            Self::CrossTenant => "cross_tenant",
            Self::SuspendedTenant => "suspended_tenant",
            Self::InactiveUser => "inactive_user",
            Self::AccessRevoked => "access_revoked",
            Self::RoleInvalidForBilling => "role_invalid_for_billing",
        }
    }
}

// ============================================================================
// Resolved Context
// ============================================================================

/// The validated tenant context attached to a request after enforcement.
///
/// Downstream handlers take the tenant id from here, never from the
/// request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardContext {
    /// Local user id
    pub user_id: Uuid,

    /// Identity-provider user id
    pub external_user_id: String,

    /// The single active tenant this request is bound to
    pub tenant_id: Uuid,

    /// Billing tier of the active tenant
    pub billing_tier: BillingTier,

    /// Roles surviving DB and billing-tier enforcement
    pub roles: Vec<TenantRole>,

    /// Correlation id of the request
    pub correlation_id: Uuid,
}

impl GuardContext {
    /// Whether the surviving role set includes a role.
    pub fn has_role(&self, role: TenantRole) -> bool {
        self.roles.contains(&role)
    }

    /// Whether the caller can administer the tenant.
    pub fn is_admin(&self) -> bool {
        self.has_role(TenantRole::MerchantAdmin) || self.has_role(TenantRole::AgencyAdmin)
    }
}

// ============================================================================
// Tenant Guard
// ============================================================================

/// Centralized tenant access control. Sits at the request edge; every
/// authenticated route passes through [`TenantGuard::enforce`].
pub struct TenantGuard {
    pool: PgPool,
    audit: Arc<AuditLog>,
}

impl TenantGuard {
    /// Create a guard.
    pub fn new(pool: PgPool, audit: Arc<AuditLog>) -> Self {
        Self { pool, audit }
    }

    /// Enforce tenant access for a request.
    ///
    /// Walks the enforcement ladder and returns the validated context or
    /// a structured denial. Denials are audited before returning.
    pub async fn enforce(
        &self,
        claims: &Claims,
        active_tenant_id: Option<Uuid>,
        request: &RequestInfo,
    ) -> Result<GuardContext> {
        // 1. Resolve the local user; bootstrap when identity webhooks
        //    have not caught up yet.
        let user = match self.find_user(&claims.external_user_id).await? {
            Some(user) => user,
            None => self.bootstrap_user(claims, active_tenant_id).await?,
        };

        // 2. Deactivated users deny immediately.
        if !user.is_active {
            return Err(self
                .deny(
                    ViolationType::InactiveUser,
                    ErrorCode::UserInactive,
                    "Your account has been deactivated.",
                    claims,
                    Some(user.id),
                    active_tenant_id,
                    request,
                    Some(AuditAction::IdentityAccessRevokedEnforced),
                )
                .await);
        }

        // 3. A tenant context is required.
        let tenant_id = match active_tenant_id {
            Some(id) => id,
            None => {
                return Err(self
                    .deny(
                        ViolationType::MissingTenant,
                        ErrorCode::TenantRequired,
                        "No tenant context. Please select a tenant.",
                        claims,
                        Some(user.id),
                        None,
                        request,
                        None,
                    )
                    .await);
            }
        };

        // 4. The tenant must exist and be active.
        let tenant = match self.find_tenant(tenant_id).await? {
            Some(tenant) => tenant,
            None => {
                return Err(self
                    .deny(
                        ViolationType::InvalidTenant,
                        ErrorCode::TenantNotFound,
                        "Tenant not found.",
                        claims,
                        Some(user.id),
                        Some(tenant_id),
                        request,
                        None,
                    )
                    .await);
            }
        };

        if tenant.status != TenantStatus::Active {
            return Err(self
                .deny(
                    ViolationType::SuspendedTenant,
                    ErrorCode::TenantSuspended,
                    "This workspace is currently suspended.",
                    claims,
                    Some(user.id),
                    Some(tenant_id),
                    request,
                    Some(AuditAction::IdentityAccessRevokedEnforced),
                )
                .await);
        }

        // 5. Live roles are the source of truth; an empty set means the
        //    user's access was revoked since the token was minted.
        let db_roles = self.live_roles(user.id, tenant_id).await?;
        if db_roles.is_empty() {
            return Err(self
                .deny(
                    ViolationType::AccessRevoked,
                    ErrorCode::AccessRevoked,
                    "Access to this tenant has been revoked.",
                    claims,
                    Some(user.id),
                    Some(tenant_id),
                    request,
                    Some(AuditAction::IdentityAccessRevokedEnforced),
                )
                .await);
        }

        // 6. Billing-tier allowlist: a downgrade strips elevated roles on
        //    the next request.
        let surviving: Vec<TenantRole> = db_roles
            .iter()
            .map(|r| r.role)
            .filter(|role| is_role_allowed_for_tier(*role, tenant.billing_tier))
            .collect();

        if surviving.is_empty() {
            let denial = self
                .deny(
                    ViolationType::RoleInvalidForBilling,
                    ErrorCode::BillingRoleNotAllowed,
                    "Your role is not available on the current billing plan.",
                    claims,
                    Some(user.id),
                    Some(tenant_id),
                    request,
                    None,
                )
                .await;
            self.audit
                .write(
                    AuditEvent::new(tenant_id, AuditAction::BillingRoleRevokedDueToDowngrade)
                        .with_user(user.id)
                        .with_request(request)
                        .with_metadata(serde_json::json!({
                            "billing_tier": tenant.billing_tier.as_str(),
                            "invalid_roles": db_roles
                                .iter()
                                .map(|r| r.role.as_str())
                                .collect::<Vec<_>>(),
                        }))
                        .denied(ErrorCode::BillingRoleNotAllowed.as_str()),
                )
                .await;
            return Err(denial);
        }

        // 7. Role drift between token and database is audited but does
        //    not deny.
        let token_roles: Vec<TenantRole> = claims
            .roles
            .iter()
            .filter_map(|r| TenantRole::parse(&r.to_lowercase()))
            .collect();
        if !token_roles.is_empty() && !same_role_set(&token_roles, &surviving) {
            self.audit
                .write(
                    AuditEvent::new(tenant_id, AuditAction::IdentityRoleChangeEnforced)
                        .with_user(user.id)
                        .with_request(request)
                        .with_metadata(serde_json::json!({
                            "previous_roles": token_roles.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
                            "new_roles": surviving.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
                            "change_source": "db_enforcement",
                        })),
                )
                .await;
        }

        // 8. Attach the resolved context.
        Ok(GuardContext {
            user_id: user.id,
            external_user_id: claims.external_user_id.clone(),
            tenant_id,
            billing_tier: tenant.billing_tier,
            roles: surviving,
            correlation_id: request.correlation_id,
        })
    }

    // ========================================================================
    // Internal: Lookups
    // ========================================================================

    async fn find_user(&self, external_user_id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r"
            SELECT id, external_user_id, is_active
            FROM users
            WHERE external_user_id = $1
            ",
        )
        .bind(external_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>(
            r"
            SELECT id, external_org_id, name, billing_tier, status
            FROM tenants
            WHERE id = $1
            ",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn live_roles(&self, user_id: Uuid, tenant_id: Uuid) -> Result<Vec<UserTenantRole>> {
        let roles = sqlx::query_as::<_, UserTenantRole>(
            r"
            SELECT user_id, tenant_id, role, is_active, source
            FROM user_tenant_roles
            WHERE user_id = $1 AND tenant_id = $2 AND is_active = TRUE
            ",
        )
        .bind(user_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    /// Tenants the user has live access to (for denial audit context).
    async fn allowed_tenants(&self, user_id: Uuid) -> Vec<Uuid> {
        let rows: std::result::Result<Vec<(Uuid,)>, _> = sqlx::query_as(
            r"
            SELECT DISTINCT r.tenant_id
            FROM user_tenant_roles r
            JOIN tenants t ON t.id = r.tenant_id
            WHERE r.user_id = $1 AND r.is_active = TRUE AND t.status = 'active'
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await;

        rows.map(|r| r.into_iter().map(|t| t.0).collect())
            .unwrap_or_default()
    }

    /// Best-effort lazy bootstrap: create the user plus a viewer role on
    /// the requested tenant so first requests racing the identity webhook
    /// do not deadlock on authorization.
    async fn bootstrap_user(&self, claims: &Claims, tenant_id: Option<Uuid>) -> Result<User> {
        tracing::warn!(
            external_user_id = claims.external_user_id,
            "user not found during enforcement; attempting lazy bootstrap"
        );

        let user = sqlx::query_as::<_, User>(
            r"
            INSERT INTO users (id, external_user_id, is_active)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (external_user_id) DO UPDATE SET external_user_id = EXCLUDED.external_user_id
            RETURNING id, external_user_id, is_active
            ",
        )
        .bind(Uuid::new_v4())
        .bind(&claims.external_user_id)
        .fetch_one(&self.pool)
        .await?;

        if let Some(tenant_id) = tenant_id {
            sqlx::query(
                r"
                INSERT INTO user_tenant_roles (user_id, tenant_id, role, is_active, source)
                VALUES ($1, $2, $3, TRUE, $4)
                ON CONFLICT (user_id, tenant_id, role) DO NOTHING
                ",
            )
            .bind(user.id)
            .bind(tenant_id)
            .bind(TenantRole::MerchantViewer)
            .bind(RoleSource::LazySync)
            .execute(&self.pool)
            .await?;

            self.audit
                .write(
                    AuditEvent::new(tenant_id, AuditAction::IdentityUserFirstSeen)
                        .with_user(user.id)
                        .with_metadata(serde_json::json!({
                            "external_user_id": claims.external_user_id,
                            "bootstrap": "lazy_sync",
                        })),
                )
                .await;
        }

        Ok(user)
    }

    // ========================================================================
    // Internal: Denials
    // ========================================================================

    /// Build a denial, audit it, and return the error.
    #[allow(clippy::too_many_arguments)]
    async fn deny(
        &self,
        violation: ViolationType,
        code: ErrorCode,
        message: &str,
        claims: &Claims,
        user_id: Option<Uuid>,
        requested_tenant_id: Option<Uuid>,
        request: &RequestInfo,
        extra_action: Option<AuditAction>,
    ) -> GuardError {
        let allowed = match user_id {
            Some(id) => self.allowed_tenants(id).await,
            None => Vec::new(),
        };

        let metadata = serde_json::json!({
            "violation_type": violation.as_str(),
            "external_user_id": claims.external_user_id,
            "requested_tenant_id": requested_tenant_id,
            "allowed_tenant_ids": allowed,
            "path": request.path,
            "method": request.method,
        });

        // Violations against unknown tenants are recorded under the nil
        // tenant so the security trail is still queryable.
        let audit_tenant = requested_tenant_id.unwrap_or(Uuid::nil());

        let mut event = AuditEvent::new(audit_tenant, AuditAction::SecurityCrossTenantDenied)
            .with_request(request)
            .with_metadata(metadata.clone())
            .denied(code.as_str());
        event.user_id = user_id;
        event.resource_type = Some("tenant_access".to_string());
        event.resource_id = requested_tenant_id.map(|id| id.to_string());
        self.audit.write(event).await;

        if let Some(action) = extra_action {
            let mut extra = AuditEvent::new(audit_tenant, action)
                .with_request(request)
                .with_metadata(metadata)
                .denied(code.as_str());
            extra.user_id = user_id;
            self.audit.write(extra).await;
        }

        tracing::warn!(
            violation = violation.as_str(),
            external_user_id = claims.external_user_id,
            requested_tenant_id = ?requested_tenant_id,
            path = request.path,
            correlation_id = %request.correlation_id,
            "tenant context violation"
        );

        let mut payload = DenialPayload::new(code, message);
        if let Some(tenant_id) = requested_tenant_id {
            payload = payload.with_tenant(tenant_id);
        }
        GuardError::Denied(Box::new(payload))
    }
}

/// Compare role sets ignoring order and duplicates.
fn same_role_set(a: &[TenantRole], b: &[TenantRole]) -> bool {
    use std::collections::HashSet;
    let a: HashSet<_> = a.iter().collect();
    let b: HashSet<_> = b.iter().collect();
    a == b
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_strings() {
        assert_eq!(ViolationType::CrossTenant.as_str(), "cross_tenant");
        assert_eq!(
            ViolationType::RoleInvalidForBilling.as_str(),
            "role_invalid_for_billing"
        );
    }

    #[test]
    fn test_same_role_set_ignores_order() {
        let a = vec![TenantRole::MerchantAdmin, TenantRole::MerchantViewer];
        let b = vec![TenantRole::MerchantViewer, TenantRole::MerchantAdmin];
        assert!(same_role_set(&a, &b));
        let c = vec![TenantRole::MerchantViewer];
        assert!(!same_role_set(&a, &c));
    }

    #[test]
    fn test_guard_context_role_helpers() {
        let ctx = GuardContext {
            user_id: Uuid::new_v4(),
            external_user_id: "user_1".to_string(),
            tenant_id: Uuid::new_v4(),
            billing_tier: BillingTier::Growth,
            roles: vec![TenantRole::AgencyAdmin],
            correlation_id: Uuid::new_v4(),
        };
        assert!(ctx.is_admin());
        assert!(!ctx.has_role(TenantRole::MerchantViewer));
    }

    #[test]
    fn test_denied_error_preserves_payload() {
        let err = GuardError::Denied(Box::new(DenialPayload::new(
            ErrorCode::AccessRevoked,
            "Access to this tenant has been revoked.",
        )));
        match err {
            GuardError::Denied(payload) => {
                assert_eq!(payload.error_code, ErrorCode::AccessRevoked);
            }
            GuardError::Database(_) => unreachable!(),
        }
    }
}
