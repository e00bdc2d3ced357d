//! Append-only audit logging
//!
//! Every security-sensitive action in the control plane writes an immutable
//! audit record:
//!
//! - Closed registry of auditable actions (`AuditAction`)
//! - Structured events with tenant, actor, request metadata, and outcome
//! - Recursive PII redaction before persistence
//! - Fallback channel when the primary write fails (the originating
//!   request is never failed for an audit error)
//! - Retention sweep as the single sanctioned deletion path
//!
//! ## Immutability
//!
//! The `audit_logs` table is append-only; UPDATE and DELETE are rejected by
//! a database trigger. The retention sweep runs under the table owner role,
//! which is exempt from the trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::RequestInfo;

pub mod log;
pub mod redaction;

pub use log::{AuditLog, AuditWriteReceipt};
pub use redaction::PiiRedactor;

// ============================================================================
// Error Types
// ============================================================================

/// Audit subsystem errors
#[derive(Error, Debug)]
pub enum AuditError {
    /// Primary database write failed
    #[error("Audit write failed: {0}")]
    WriteFailed(#[from] sqlx::Error),

    /// Metadata could not be serialized
    #[error("Audit serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;

// ============================================================================
// Action Registry
// ============================================================================

/// Closed registry of all auditable actions.
///
/// Add new actions here as features are developed; free-form action
/// strings are not accepted anywhere in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    // Auth events
    /// Successful login
    AuthLogin,
    /// Logout
    AuthLogout,
    /// Failed login attempt
    AuthLoginFailed,
    /// Credential token refreshed
    AuthTokenRefresh,

    // Billing events
    /// Plan changed
    BillingPlanChanged,
    /// Subscription created
    BillingSubscriptionCreated,
    /// Subscription activated
    BillingSubscriptionActivated,
    /// Subscription frozen on payment failure
    BillingSubscriptionFrozen,
    /// Subscription recovered from freeze
    BillingSubscriptionRecovered,
    /// Subscription cancelled
    BillingSubscriptionCancelled,
    /// Subscription expired
    BillingSubscriptionExpired,
    /// Role revoked because of a billing downgrade
    BillingRoleRevokedDueToDowngrade,

    // Connector events
    /// Store/connection registered
    StoreConnected,
    /// Store/connection disconnected
    StoreDisconnected,
    /// Connection updated
    StoreUpdated,
    /// Sync completed
    StoreSyncCompleted,
    /// Sync failed
    StoreSyncFailed,
    /// Cross-tenant duplicate shop domain blocked
    DuplicateShopDomainBlocked,

    // Data freshness events
    /// Source transitioned to stale
    DataFreshnessStale,
    /// Source transitioned to unavailable
    DataFreshnessUnavailable,
    /// Source recovered to fresh
    DataFreshnessRecovered,
    /// DQ incident opened
    DqIncidentOpened,
    /// DQ incident resolved
    DqIncidentResolved,

    // Entitlement events
    /// Feature access denied
    EntitlementDenied,
    /// Feature override created or updated
    EntitlementOverrideWritten,
    /// Feature override deleted
    EntitlementOverrideDeleted,

    // Identity events
    /// User first seen via webhook or lazy sync
    IdentityUserFirstSeen,
    /// User linked to a tenant
    IdentityUserLinkedToTenant,
    /// Role assigned (or reactivated)
    IdentityRoleAssigned,
    /// Role revoked
    IdentityRoleRevoked,
    /// Tenant created from an organization event
    IdentityTenantCreated,
    /// Tenant deactivated
    IdentityTenantDeactivated,
    /// Stale access revoked at the guard
    IdentityAccessRevokedEnforced,
    /// DB roles diverged from token claims
    IdentityRoleChangeEnforced,

    // Security events
    /// Cross-tenant access denied
    SecurityCrossTenantDenied,

    // Admin events
    /// Plan created by an operator
    AdminPlanCreated,
    /// Plan updated by an operator
    AdminPlanUpdated,
    /// Plan deleted by an operator
    AdminPlanDeleted,

    // Governance events
    /// Approval gate decision recorded
    GovernanceApprovalDecision,
    /// Rollback state transition
    GovernanceRollbackTransition,
    /// Metric deprecation warning emitted
    GovernanceMetricDeprecation,
    /// Pre-deploy validation completed
    GovernanceValidationCompleted,
    /// AI guardrail check (allowed or refused)
    GovernanceGuardrailCheck,

    // Dashboard events
    /// Dashboard created
    DashboardCreated,
    /// Dashboard updated
    DashboardUpdated,
    /// Dashboard archived
    DashboardArchived,
    /// Dashboard version restored
    DashboardVersionRestored,

    // Dataset events
    /// Dataset version activated
    DatasetVersionActivated,
    /// Dataset version rolled back
    DatasetVersionRolledBack,

    // Retention events
    /// Audit retention sweep started
    AuditRetentionStarted,
    /// Audit retention sweep completed
    AuditRetentionCompleted,
    /// Audit retention sweep failed
    AuditRetentionFailed,
}

impl AuditAction {
    /// Dotted action string persisted in the `action` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthLogin => "auth.login",
            Self::AuthLogout => "auth.logout",
            Self::AuthLoginFailed => "auth.login_failed",
            Self::AuthTokenRefresh => "auth.token_refresh",
            Self::BillingPlanChanged => "billing.plan_changed",
            Self::BillingSubscriptionCreated => "billing.subscription_created",
            Self::BillingSubscriptionActivated => "billing.subscription_activated",
            Self::BillingSubscriptionFrozen => "billing.subscription_frozen",
            Self::BillingSubscriptionRecovered => "billing.subscription_recovered",
            Self::BillingSubscriptionCancelled => "billing.subscription_cancelled",
            Self::BillingSubscriptionExpired => "billing.subscription_expired",
            Self::BillingRoleRevokedDueToDowngrade => "billing.role_revoked_due_to_downgrade",
            Self::StoreConnected => "store.connected",
            Self::StoreDisconnected => "store.disconnected",
            Self::StoreUpdated => "store.updated",
            Self::StoreSyncCompleted => "store.sync_completed",
            Self::StoreSyncFailed => "store.sync_failed",
            Self::DuplicateShopDomainBlocked => "store.duplicate_shop_domain_blocked",
            Self::DataFreshnessStale => "data.freshness.stale",
            Self::DataFreshnessUnavailable => "data.freshness.unavailable",
            Self::DataFreshnessRecovered => "data.freshness.recovered",
            Self::DqIncidentOpened => "data.dq_incident.opened",
            Self::DqIncidentResolved => "data.dq_incident.resolved",
            Self::EntitlementDenied => "entitlement.denied",
            Self::EntitlementOverrideWritten => "entitlement.override_written",
            Self::EntitlementOverrideDeleted => "entitlement.override_deleted",
            Self::IdentityUserFirstSeen => "identity.user_first_seen",
            Self::IdentityUserLinkedToTenant => "identity.user_linked_to_tenant",
            Self::IdentityRoleAssigned => "identity.role_assigned",
            Self::IdentityRoleRevoked => "identity.role_revoked",
            Self::IdentityTenantCreated => "identity.tenant_created",
            Self::IdentityTenantDeactivated => "identity.tenant_deactivated",
            Self::IdentityAccessRevokedEnforced => "identity.access_revoked_enforced",
            Self::IdentityRoleChangeEnforced => "identity.role_change_enforced",
            Self::SecurityCrossTenantDenied => "security.cross_tenant_denied",
            Self::AdminPlanCreated => "admin.plan_created",
            Self::AdminPlanUpdated => "admin.plan_updated",
            Self::AdminPlanDeleted => "admin.plan_deleted",
            Self::GovernanceApprovalDecision => "governance.approval_decision",
            Self::GovernanceRollbackTransition => "governance.rollback_transition",
            Self::GovernanceMetricDeprecation => "governance.metric_deprecation",
            Self::GovernanceValidationCompleted => "governance.validation_completed",
            Self::GovernanceGuardrailCheck => "governance.guardrail_check",
            Self::DashboardCreated => "dashboard.created",
            Self::DashboardUpdated => "dashboard.updated",
            Self::DashboardArchived => "dashboard.archived",
            Self::DashboardVersionRestored => "dashboard.version_restored",
            Self::DatasetVersionActivated => "dataset.version_activated",
            Self::DatasetVersionRolledBack => "dataset.version_rolled_back",
            Self::AuditRetentionStarted => "audit.retention.started",
            Self::AuditRetentionCompleted => "audit.retention.completed",
            Self::AuditRetentionFailed => "audit.retention.failed",
        }
    }
}

/// Outcome of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Action completed
    Success,
    /// Action attempted but failed
    Failure,
    /// Action was denied
    Denied,
}

impl AuditOutcome {
    /// String form persisted in the `outcome` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
        }
    }
}

/// Originating channel of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSource {
    /// Request-path API call
    Api,
    /// Background worker
    Worker,
    /// Internal system action
    System,
    /// Inbound webhook
    Webhook,
}

impl AuditSource {
    /// String form persisted in the `source` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Worker => "worker",
            Self::System => "system",
            Self::Webhook => "webhook",
        }
    }
}

// ============================================================================
// Audit Event
// ============================================================================

/// An audit event ready to be persisted.
///
/// Metadata is PII-redacted by the writer before insertion; callers may
/// pass raw metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Tenant the action applies to
    pub tenant_id: Uuid,

    /// Action from the closed registry
    pub action: AuditAction,

    /// Acting user, if any (None for system events)
    pub user_id: Option<Uuid>,

    /// Client IP address
    pub ip_address: Option<String>,

    /// Client user agent
    pub user_agent: Option<String>,

    /// Type of the resource acted on
    pub resource_type: Option<String>,

    /// Id of the resource acted on
    pub resource_id: Option<String>,

    /// Structured context (redacted before persistence)
    pub metadata: serde_json::Value,

    /// Correlation id tying this event to its request
    pub correlation_id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Originating channel
    pub source: AuditSource,

    /// Outcome
    pub outcome: AuditOutcome,

    /// Error code on failure/denial
    pub error_code: Option<String>,
}

impl AuditEvent {
    /// Create a success event with empty metadata.
    pub fn new(tenant_id: Uuid, action: AuditAction) -> Self {
        Self {
            tenant_id,
            action,
            user_id: None,
            ip_address: None,
            user_agent: None,
            resource_type: None,
            resource_id: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: AuditSource::Api,
            outcome: AuditOutcome::Success,
            error_code: None,
        }
    }

    /// Set the acting user.
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Set the resource acted on.
    pub fn with_resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Set structured metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the originating channel.
    pub fn with_source(mut self, source: AuditSource) -> Self {
        self.source = source;
        self
    }

    /// Mark the event as a denial with an error code.
    pub fn denied(mut self, error_code: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Denied;
        self.error_code = Some(error_code.into());
        self
    }

    /// Mark the event as a failure with an error code.
    pub fn failed(mut self, error_code: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.error_code = Some(error_code.into());
        self
    }

    /// Attach request metadata (ip, user agent, correlation id).
    pub fn with_request(mut self, info: &RequestInfo) -> Self {
        self.ip_address = info.ip_address.clone();
        self.user_agent = info.user_agent.clone();
        self.correlation_id = info.correlation_id;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_strings_are_dotted() {
        assert_eq!(
            AuditAction::SecurityCrossTenantDenied.as_str(),
            "security.cross_tenant_denied"
        );
        assert_eq!(
            AuditAction::DataFreshnessRecovered.as_str(),
            "data.freshness.recovered"
        );
        assert_eq!(
            AuditAction::BillingRoleRevokedDueToDowngrade.as_str(),
            "billing.role_revoked_due_to_downgrade"
        );
    }

    #[test]
    fn test_event_builder() {
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let event = AuditEvent::new(tenant, AuditAction::StoreConnected)
            .with_user(user)
            .with_resource("connection", "conn-1")
            .with_source(AuditSource::Api)
            .with_metadata(serde_json::json!({"source_type": "shopify"}));

        assert_eq!(event.tenant_id, tenant);
        assert_eq!(event.user_id, Some(user));
        assert_eq!(event.outcome, AuditOutcome::Success);
        assert_eq!(event.resource_id.as_deref(), Some("conn-1"));
    }

    #[test]
    fn test_denied_event_carries_error_code() {
        let event = AuditEvent::new(Uuid::new_v4(), AuditAction::SecurityCrossTenantDenied)
            .denied("cross_tenant_denied");
        assert_eq!(event.outcome, AuditOutcome::Denied);
        assert_eq!(event.error_code.as_deref(), Some("cross_tenant_denied"));
    }
}
