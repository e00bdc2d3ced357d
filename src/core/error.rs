//! Error-code registry and structured denial payloads
//!
//! Every denial or conflict surfaced to a caller carries a machine-readable
//! `error_code` plus a sanitized message. Callers map codes to
//! protocol-appropriate statuses; this crate never decides HTTP shapes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Error Codes
// ============================================================================

/// Closed registry of error codes surfaced across subsystem boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Client / authorization
    /// Authentication is missing or invalid
    AuthRequired,
    /// No tenant context was supplied
    TenantRequired,
    /// Requested tenant is not in the caller's allowed set
    CrossTenantDenied,
    /// The caller's access to the tenant has been revoked
    AccessRevoked,
    /// Tenant exists but is suspended or deactivated
    TenantSuspended,
    /// Tenant does not exist (or must not be disclosed)
    TenantNotFound,
    /// User account is deactivated
    UserInactive,
    /// None of the caller's roles are permitted on the current billing tier
    BillingRoleNotAllowed,
    /// Feature access denied by entitlement resolution
    EntitlementDenied,
    /// Access requires an active paid subscription
    PaymentRequired,

    // State conflicts
    /// A connection with this external id already exists
    DuplicateConnection,
    /// The shop domain is already connected
    DuplicateShopDomain,
    /// A non-archived dashboard with this name already exists
    DashboardNameConflict,
    /// Concurrent write detected via optimistic lock
    OptimisticLockConflict,
    /// Tenant is at its dashboard limit
    DashboardLimitExceeded,

    // Integrity / fail-closed
    /// Entitlement evaluation failed; must render as a retryable
    /// server-side failure, never as a success
    EntitlementEvalFailed,
    /// Candidate dataset schema breaks exposed columns
    SchemaIncompatible,
    /// An AI guardrail refused the action
    GuardrailViolation,

    // Operational
    /// An ingestion sync failed
    SyncFailed,
    /// Referenced account or resource was not found
    AccountNotFound,
    /// Credential has been revoked or expired
    CredentialRevoked,
    /// Token refresh attempts are exhausted
    RefreshExhausted,

    // Recoverable infrastructure (never user-visible)
    /// Cache read/write failed; value is recomputed transparently
    CacheUnavailable,
    /// Primary audit write failed; event went to the fallback channel
    AuditWriteFailed,
}

impl ErrorCode {
    /// Stable string form used in payloads and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::TenantRequired => "tenant_required",
            Self::CrossTenantDenied => "cross_tenant_denied",
            Self::AccessRevoked => "access_revoked",
            Self::TenantSuspended => "tenant_suspended",
            Self::TenantNotFound => "tenant_not_found",
            Self::UserInactive => "user_inactive",
            Self::BillingRoleNotAllowed => "billing_role_not_allowed",
            Self::EntitlementDenied => "entitlement_denied",
            Self::PaymentRequired => "payment_required",
            Self::DuplicateConnection => "duplicate_connection",
            Self::DuplicateShopDomain => "duplicate_shop_domain",
            Self::DashboardNameConflict => "dashboard_name_conflict",
            Self::OptimisticLockConflict => "optimistic_lock_conflict",
            Self::DashboardLimitExceeded => "dashboard_limit_exceeded",
            Self::EntitlementEvalFailed => "entitlement_eval_failed",
            Self::SchemaIncompatible => "schema_incompatible",
            Self::GuardrailViolation => "guardrail_violation",
            Self::SyncFailed => "sync_failed",
            Self::AccountNotFound => "account_not_found",
            Self::CredentialRevoked => "credential_revoked",
            Self::RefreshExhausted => "refresh_exhausted",
            Self::CacheUnavailable => "cache_unavailable",
            Self::AuditWriteFailed => "audit_write_failed",
        }
    }

    /// Whether the code denotes an authentication failure (401 semantics)
    /// rather than an authorization failure (403 semantics).
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::AuthRequired)
    }

    /// Whether the code must render as a retryable server-side failure.
    pub fn is_retryable_server_failure(&self) -> bool {
        matches!(self, Self::EntitlementEvalFailed)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Denial Payload
// ============================================================================

/// Context attached to a denial so the client can act on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DenialContext {
    /// Feature key involved, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,

    /// Billing state at time of denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_state: Option<String>,

    /// Plan that would grant the feature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_plan: Option<String>,

    /// Tenant the denial applies to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
}

/// Structured denial payload returned to callers.
///
/// The message is merchant-safe: no internal ids, paths, or stack detail.
/// Support-facing detail travels separately through the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenialPayload {
    /// Machine-readable error code
    pub error_code: ErrorCode,

    /// Sanitized, merchant-facing message
    pub message: String,

    /// Structured context for the client
    #[serde(default)]
    pub context: DenialContext,
}

impl DenialPayload {
    /// Create a denial payload with an empty context.
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            context: DenialContext::default(),
        }
    }

    /// Attach a feature key.
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.context.feature = Some(feature.into());
        self
    }

    /// Attach the billing state.
    pub fn with_billing_state(mut self, state: impl Into<String>) -> Self {
        self.context.billing_state = Some(state.into());
        self
    }

    /// Attach the plan that would grant access.
    pub fn with_required_plan(mut self, plan: impl Into<String>) -> Self {
        self.context.required_plan = Some(plan.into());
        self
    }

    /// Attach the tenant id.
    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.context.tenant_id = Some(tenant_id);
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
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::CrossTenantDenied.as_str(), "cross_tenant_denied");
        assert_eq!(
            ErrorCode::EntitlementEvalFailed.as_str(),
            "entitlement_eval_failed"
        );
        assert_eq!(ErrorCode::PaymentRequired.as_str(), "payment_required");
    }

    #[test]
    fn test_eval_failed_is_retryable_never_success() {
        assert!(ErrorCode::EntitlementEvalFailed.is_retryable_server_failure());
        assert!(!ErrorCode::EntitlementDenied.is_retryable_server_failure());
    }

    #[test]
    fn test_authentication_vs_authorization() {
        assert!(ErrorCode::AuthRequired.is_authentication());
        assert!(!ErrorCode::CrossTenantDenied.is_authentication());
        assert!(!ErrorCode::TenantRequired.is_authentication());
    }

    #[test]
    fn test_denial_payload_builder() {
        let tenant = Uuid::new_v4();
        let payload = DenialPayload::new(ErrorCode::PaymentRequired, "Subscription required")
            .with_feature("ai_insights")
            .with_billing_state("expired")
            .with_required_plan("Growth")
            .with_tenant(tenant);

        assert_eq!(payload.error_code, ErrorCode::PaymentRequired);
        assert_eq!(payload.context.feature.as_deref(), Some("ai_insights"));
        assert_eq!(payload.context.required_plan.as_deref(), Some("Growth"));
        assert_eq!(payload.context.tenant_id, Some(tenant));
    }

    #[test]
    fn test_denial_payload_serializes_without_empty_context_fields() {
        let payload = DenialPayload::new(ErrorCode::TenantRequired, "Select a tenant");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["error_code"], "tenant_required");
        assert!(json["context"].get("feature").is_none());
    }
}
