//! Identity-provider sync
//!
//! Synchronizes the local mirror from identity webhooks (`user.*`,
//! `organization.*`, `organizationMembership.*`). Every mutation is
//! idempotent and audited; revocations flip `is_active` instead of
//! deleting so access history can be reconstructed.

use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditSource};

use super::{
    map_provider_role, BillingTier, IdentityError, Result, RoleSource, Tenant, TenantRole,
    TenantStatus, User, UserTenantRole,
};

// ============================================================================
// Webhook Payload
// ============================================================================

/// Normalized identity-provider event, produced by the webhook transport
/// layer after signature verification.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct IdentityEvent {
    /// Event type (`user.created`, `organization.updated`,
    /// `organizationMembership.deleted`, ...)
    #[serde(rename = "type")]
    pub event_type: String,

    /// Provider user id, for user and membership events
    #[serde(default)]
    pub external_user_id: Option<String>,

    /// Provider organization id, for organization and membership events
    #[serde(default)]
    pub external_org_id: Option<String>,

    /// Organization name, for organization events
    #[serde(default)]
    pub org_name: Option<String>,

    /// Provider role string, for membership events
    #[serde(default)]
    pub role: Option<String>,
}

// ============================================================================
// Sync Service
// ============================================================================

/// Maintains the identity mirror from provider webhook payloads.
pub struct IdentitySyncService {
    pool: PgPool,
    audit: Arc<AuditLog>,
}

impl IdentitySyncService {
    /// Create a sync service.
    pub fn new(pool: PgPool, audit: Arc<AuditLog>) -> Self {
        Self { pool, audit }
    }

    /// Dispatch one identity-provider event to the matching sync
    /// operation. Unknown event types are acknowledged and skipped.
    pub async fn handle_event(&self, event: &IdentityEvent) -> Result<()> {
        match event.event_type.as_str() {
            "user.created" | "user.updated" => {
                if let Some(user_id) = &event.external_user_id {
                    self.sync_user(user_id).await?;
                }
            }
            "user.deleted" => {
                if let Some(user_id) = &event.external_user_id {
                    self.deactivate_user(user_id).await?;
                }
            }
            "organization.created" | "organization.updated" => {
                if let Some(org_id) = &event.external_org_id {
                    let name = event.org_name.as_deref().unwrap_or(org_id);
                    self.sync_tenant_from_org(org_id, name).await?;
                }
            }
            "organization.deleted" => {
                if let Some(org_id) = &event.external_org_id {
                    self.deactivate_tenant(org_id).await?;
                }
            }
            "organizationMembership.created" => {
                if let (Some(user_id), Some(org_id)) =
                    (&event.external_user_id, &event.external_org_id)
                {
                    let role = event.role.as_deref().unwrap_or_default();
                    self.sync_membership(user_id, org_id, role).await?;
                }
            }
            "organizationMembership.updated" => {
                if let (Some(user_id), Some(org_id)) =
                    (&event.external_user_id, &event.external_org_id)
                {
                    let role = event.role.as_deref().unwrap_or_default();
                    self.update_membership_role(user_id, org_id, role).await?;
                }
            }
            "organizationMembership.deleted" => {
                if let (Some(user_id), Some(org_id)) =
                    (&event.external_user_id, &event.external_org_id)
                {
                    self.remove_membership(user_id, org_id).await?;
                }
            }
            other => {
                tracing::debug!(event_type = other, "identity event type not handled");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Upsert a user from a `user.created` / `user.updated` event.
    ///
    /// Idempotent: re-syncing an existing user reactivates it if needed
    /// and changes nothing else.
    pub async fn sync_user(&self, external_user_id: &str) -> Result<User> {
        if let Some(existing) = self.get_user_by_external_id(external_user_id).await? {
            if !existing.is_active {
                return self.set_user_active(external_user_id, true).await;
            }
            return Ok(existing);
        }

        let user = sqlx::query_as::<_, User>(
            r"
            INSERT INTO users (id, external_user_id, is_active)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (external_user_id) DO UPDATE SET is_active = TRUE
            RETURNING id, external_user_id, is_active
            ",
        )
        .bind(Uuid::new_v4())
        .bind(external_user_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(external_user_id, user_id = %user.id, "user first seen");

        Ok(user)
    }

    /// Deactivate a user (`user.deleted`). Reversible.
    pub async fn deactivate_user(&self, external_user_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE users SET is_active = FALSE WHERE external_user_id = $1
            ",
        )
        .bind(external_user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Look up a user by external id.
    pub async fn get_user_by_external_id(&self, external_user_id: &str) -> Result<Option<User>> {
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

    async fn set_user_active(&self, external_user_id: &str, active: bool) -> Result<User> {
        sqlx::query_as::<_, User>(
            r"
            UPDATE users SET is_active = $2
            WHERE external_user_id = $1
            RETURNING id, external_user_id, is_active
            ",
        )
        .bind(external_user_id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| IdentityError::NotFound(format!("user {external_user_id}")))
    }

    // ========================================================================
    // Organizations → Tenants
    // ========================================================================

    /// Upsert a tenant from an `organization.created` / `.updated` event.
    ///
    /// Creates the tenant on the free tier if it does not exist; on
    /// conflict only the name is refreshed (tier and status are owned by
    /// billing and operations respectively).
    pub async fn sync_tenant_from_org(&self, external_org_id: &str, name: &str) -> Result<Tenant> {
        let existing = self.get_tenant_by_external_org(external_org_id).await?;

        if let Some(tenant) = existing {
            if tenant.name != name {
                let updated = sqlx::query_as::<_, Tenant>(
                    r"
                    UPDATE tenants SET name = $2
                    WHERE external_org_id = $1
                    RETURNING id, external_org_id, name, billing_tier, status
                    ",
                )
                .bind(external_org_id)
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
                return Ok(updated);
            }
            return Ok(tenant);
        }

        let tenant = sqlx::query_as::<_, Tenant>(
            r"
            INSERT INTO tenants (id, external_org_id, name, billing_tier, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_org_id) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, external_org_id, name, billing_tier, status
            ",
        )
        .bind(Uuid::new_v4())
        .bind(external_org_id)
        .bind(name)
        .bind(BillingTier::Free)
        .bind(TenantStatus::Active)
        .fetch_one(&self.pool)
        .await?;

        self.audit
            .write(
                AuditEvent::new(tenant.id, AuditAction::IdentityTenantCreated)
                    .with_source(AuditSource::Webhook)
                    .with_resource("tenant", tenant.id.to_string())
                    .with_metadata(serde_json::json!({"external_org_id": external_org_id})),
            )
            .await;

        Ok(tenant)
    }

    /// Deactivate a tenant (`organization.deleted`).
    pub async fn deactivate_tenant(&self, external_org_id: &str) -> Result<bool> {
        let tenant = match self.get_tenant_by_external_org(external_org_id).await? {
            Some(t) => t,
            None => return Ok(false),
        };

        sqlx::query(
            r"
            UPDATE tenants SET status = $2 WHERE id = $1
            ",
        )
        .bind(tenant.id)
        .bind(TenantStatus::Deactivated)
        .execute(&self.pool)
        .await?;

        self.audit
            .write(
                AuditEvent::new(tenant.id, AuditAction::IdentityTenantDeactivated)
                    .with_source(AuditSource::Webhook)
                    .with_resource("tenant", tenant.id.to_string()),
            )
            .await;

        Ok(true)
    }

    /// Look up a tenant by external organization id.
    pub async fn get_tenant_by_external_org(&self, external_org_id: &str) -> Result<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>(
            r"
            SELECT id, external_org_id, name, billing_tier, status
            FROM tenants
            WHERE external_org_id = $1
            ",
        )
        .bind(external_org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(tenant)
    }

    // ========================================================================
    // Memberships
    // ========================================================================

    /// Sync a membership from an `organizationMembership.created` /
    /// `.updated` event.
    ///
    /// Maps the provider role through the closed mapping, upserts the
    /// `(user, tenant, role)` grant, and emits `identity.role_assigned`
    /// exactly once per activation (idempotent re-syncs of an already
    /// active grant are silent).
    pub async fn sync_membership(
        &self,
        external_user_id: &str,
        external_org_id: &str,
        provider_role: &str,
    ) -> Result<UserTenantRole> {
        let user = self.sync_user(external_user_id).await?;
        let tenant = self
            .get_tenant_by_external_org(external_org_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(format!("tenant for org {external_org_id}")))?;

        let role = map_provider_role(provider_role);
        self.upsert_role(user.id, tenant.id, role, RoleSource::Webhook)
            .await
    }

    /// Upsert a role grant, reactivating a revoked one.
    ///
    /// Returns the grant. The `identity.role_assigned` audit event fires
    /// only on a fresh insert or a reactivation.
    pub async fn upsert_role(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        role: TenantRole,
        source: RoleSource,
    ) -> Result<UserTenantRole> {
        let existing = sqlx::query_as::<_, UserTenantRole>(
            r"
            SELECT user_id, tenant_id, role, is_active, source
            FROM user_tenant_roles
            WHERE user_id = $1 AND tenant_id = $2 AND role = $3
            ",
        )
        .bind(user_id)
        .bind(tenant_id)
        .bind(role)
        .fetch_optional(&self.pool)
        .await?;

        let was_active = existing.as_ref().map(|r| r.is_active).unwrap_or(false);

        let grant = sqlx::query_as::<_, UserTenantRole>(
            r"
            INSERT INTO user_tenant_roles (user_id, tenant_id, role, is_active, source)
            VALUES ($1, $2, $3, TRUE, $4)
            ON CONFLICT (user_id, tenant_id, role)
            DO UPDATE SET is_active = TRUE
            RETURNING user_id, tenant_id, role, is_active, source
            ",
        )
        .bind(user_id)
        .bind(tenant_id)
        .bind(role)
        .bind(source)
        .fetch_one(&self.pool)
        .await?;

        if !was_active {
            self.audit
                .write(
                    AuditEvent::new(tenant_id, AuditAction::IdentityRoleAssigned)
                        .with_user(user_id)
                        .with_source(AuditSource::Webhook)
                        .with_resource("user_tenant_role", role.as_str())
                        .with_metadata(serde_json::json!({
                            "role": role.as_str(),
                            "reactivation": existing.is_some(),
                        })),
                )
                .await;
        }

        Ok(grant)
    }

    /// Remove a membership (`organizationMembership.deleted`): every role
    /// for the pair is revoked by flipping `is_active`.
    pub async fn remove_membership(&self, external_user_id: &str, external_org_id: &str) -> Result<u64> {
        let user = match self.get_user_by_external_id(external_user_id).await? {
            Some(u) => u,
            None => return Ok(0),
        };
        let tenant = match self.get_tenant_by_external_org(external_org_id).await? {
            Some(t) => t,
            None => return Ok(0),
        };

        let result = sqlx::query(
            r"
            UPDATE user_tenant_roles
            SET is_active = FALSE
            WHERE user_id = $1 AND tenant_id = $2 AND is_active = TRUE
            ",
        )
        .bind(user.id)
        .bind(tenant.id)
        .execute(&self.pool)
        .await?;

        let revoked = result.rows_affected();
        if revoked > 0 {
            self.audit
                .write(
                    AuditEvent::new(tenant.id, AuditAction::IdentityRoleRevoked)
                        .with_user(user.id)
                        .with_source(AuditSource::Webhook)
                        .with_metadata(serde_json::json!({"roles_revoked": revoked})),
                )
                .await;
        }

        Ok(revoked)
    }

    /// Replace a user's role in a tenant (`organizationMembership.updated`
    /// with a role change): the new role activates, the others deactivate.
    pub async fn update_membership_role(
        &self,
        external_user_id: &str,
        external_org_id: &str,
        provider_role: &str,
    ) -> Result<UserTenantRole> {
        let user = self
            .get_user_by_external_id(external_user_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(format!("user {external_user_id}")))?;
        let tenant = self
            .get_tenant_by_external_org(external_org_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(format!("tenant for org {external_org_id}")))?;

        let new_role = map_provider_role(provider_role);

        sqlx::query(
            r"
            UPDATE user_tenant_roles
            SET is_active = FALSE
            WHERE user_id = $1 AND tenant_id = $2 AND role <> $3 AND is_active = TRUE
            ",
        )
        .bind(user.id)
        .bind(tenant.id)
        .bind(new_role)
        .execute(&self.pool)
        .await?;

        self.upsert_role(user.id, tenant.id, new_role, RoleSource::Webhook)
            .await
    }

    /// Active tenants a user belongs to.
    pub async fn get_user_tenants(&self, external_user_id: &str) -> Result<Vec<Tenant>> {
        let user = match self.get_user_by_external_id(external_user_id).await? {
            Some(u) => u,
            None => return Ok(Vec::new()),
        };

        let tenants = sqlx::query_as::<_, Tenant>(
            r"
            SELECT DISTINCT t.id, t.external_org_id, t.name, t.billing_tier, t.status
            FROM tenants t
            JOIN user_tenant_roles r ON r.tenant_id = t.id
            WHERE r.user_id = $1 AND r.is_active = TRUE AND t.status = 'active'
            ",
        )
        .bind(user.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(tenants)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_event_parses_provider_payload() {
        let payload = r#"{
            "type": "organizationMembership.created",
            "external_user_id": "user_2abc",
            "external_org_id": "org_9xyz",
            "role": "org:admin"
        }"#;
        let event: IdentityEvent = serde_json::from_str(payload).unwrap();
        assert_eq!(event.event_type, "organizationMembership.created");
        assert_eq!(event.role.as_deref(), Some("org:admin"));
        assert!(event.org_name.is_none());
    }

    #[test]
    fn test_webhook_role_flows_through_closed_mapping() {
        // The sync path maps provider roles before persistence; the
        // mapping itself is covered in the parent module. This pins the
        // webhook-facing behavior for an unknown role string.
        assert_eq!(map_provider_role("org:custom"), TenantRole::MerchantViewer);
    }

    // Membership upsert/reactivation semantics (role_assigned exactly once
    // per reactivation) require Postgres and are exercised in the
    // integration environment.
}
