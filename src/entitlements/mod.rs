//! Entitlement resolution
//!
//! Resolves per-tenant feature grants from plan + billing state +
//! overrides. Single entry point for all entitlement queries:
//!
//! - **Fail-closed**: any evaluation error denies access
//! - **Single-flight**: concurrent cache misses for one tenant share one
//!   database computation
//! - **Deterministic subscription selection**: highest tier rank, then
//!   latest creation, wins
//! - **Resolution order**: override → plan → deny
//!
//! Do not read plans, overrides, or the cache directly from other
//! subsystems; route every lookup through [`engine::EntitlementEngine`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{PlanCatalogConfig, PlanConfig, PlanLimits};
use crate::core::{DenialPayload, ErrorCode};

pub mod cache;
pub mod engine;
pub mod overrides;

pub use cache::EntitlementCache;
pub use engine::EntitlementEngine;
pub use overrides::{OverrideStore, TenantOverride};

// ============================================================================
// Error Types
// ============================================================================

/// Entitlement subsystem errors
#[derive(Error, Debug)]
pub enum EntitlementError {
    /// Evaluation failed; surfaces as a retryable denial, never an allow
    #[error("Entitlement evaluation failed for tenant {tenant_id}: {detail}")]
    EvalFailed {
        /// Tenant whose evaluation failed
        tenant_id: Uuid,
        /// Support-facing detail (not merchant-visible)
        detail: String,
    },

    /// Override validation failed
    #[error("Invalid override: {0}")]
    InvalidOverride(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EntitlementError {
    /// Structured denial payload for the middleware boundary.
    ///
    /// `EvalFailed` maps to the retryable `entitlement_eval_failed` code;
    /// everything else is an internal error to the caller.
    pub fn to_denial(&self) -> DenialPayload {
        match self {
            Self::EvalFailed { tenant_id, .. } => DenialPayload::new(
                ErrorCode::EntitlementEvalFailed,
                "Entitlements are temporarily unavailable. Please retry.",
            )
            .with_tenant(*tenant_id),
            _ => DenialPayload::new(
                ErrorCode::EntitlementEvalFailed,
                "Entitlements are temporarily unavailable. Please retry.",
            ),
        }
    }
}

/// Result type for entitlement operations
pub type Result<T> = std::result::Result<T, EntitlementError>;

// ============================================================================
// Billing State
// ============================================================================

/// Derived summary of a tenant's subscription standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingState {
    /// Paid and current
    Active,
    /// In a trial period
    Trialing,
    /// Payment failed; grace window still open
    GracePeriod,
    /// Payment failed; grace window elapsed
    PastDue,
    /// Cancelled; access retained until period end
    Canceled,
    /// Frozen without grace information
    Frozen,
    /// Subscription ended
    Expired,
    /// Awaiting activation
    Pending,
    /// No subscription on record
    None,
}

impl BillingState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::GracePeriod => "grace_period",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Frozen => "frozen",
            Self::Expired => "expired",
            Self::Pending => "pending",
            Self::None => "none",
        }
    }

    /// Derive the billing state from raw subscription fields.
    ///
    /// - frozen with grace in the future → grace period
    /// - frozen past grace (or without grace info) → past due / frozen
    /// - canceled keeps access until `current_period_end`, then expired
    pub fn derive(
        status: SubscriptionStanding,
        grace_period_ends_on: Option<DateTime<Utc>>,
        current_period_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        match status {
            SubscriptionStanding::Active => Self::Active,
            SubscriptionStanding::Frozen => match grace_period_ends_on {
                Some(grace) if grace > now => Self::GracePeriod,
                Some(_) => Self::PastDue,
                None => Self::Frozen,
            },
            SubscriptionStanding::Canceled => match current_period_end {
                Some(end) if end > now => Self::Canceled,
                _ => Self::Expired,
            },
            SubscriptionStanding::Expired => Self::Expired,
            SubscriptionStanding::Pending => Self::Pending,
        }
    }
}

/// Raw subscription status as persisted (input to state derivation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStanding {
    /// Awaiting activation
    Pending,
    /// Active
    Active,
    /// Frozen on payment failure
    Frozen,
    /// Cancelled
    Canceled,
    /// Expired
    Expired,
}

// ============================================================================
// Access Level
// ============================================================================

/// Access level derived from the billing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Full access
    Full,
    /// Full access until the paid period ends
    FullUntilPeriodEnd,
    /// Read-only access
    ReadOnly,
    /// Limited access (frozen without grace info)
    Limited,
    /// Analytics pages only, read-only
    ReadOnlyAnalytics,
    /// No access
    None,
}

impl AccessLevel {
    /// Whether writes and feature use are permitted at this level.
    pub fn permits_feature_use(&self) -> bool {
        matches!(self, Self::Full | Self::FullUntilPeriodEnd)
    }

    /// Parse from a config access-rule string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "full_until_period_end" => Some(Self::FullUntilPeriodEnd),
            "read_only" => Some(Self::ReadOnly),
            "limited" => Some(Self::Limited),
            "read_only_analytics" => Some(Self::ReadOnlyAnalytics),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Default billing state → access level table, overridable via the plan
/// catalog's `access_rules`.
pub fn default_access_level(state: BillingState) -> AccessLevel {
    match state {
        BillingState::Active | BillingState::Trialing | BillingState::GracePeriod => {
            AccessLevel::Full
        }
        BillingState::Canceled => AccessLevel::FullUntilPeriodEnd,
        BillingState::PastDue => AccessLevel::ReadOnly,
        BillingState::Frozen => AccessLevel::Limited,
        BillingState::Expired => AccessLevel::ReadOnlyAnalytics,
        BillingState::Pending | BillingState::None => AccessLevel::None,
    }
}

/// Warnings surfaced for a billing state when config has no rule.
pub fn default_warnings(state: BillingState) -> Vec<String> {
    match state {
        BillingState::GracePeriod => {
            vec!["Payment failed. Update your payment method to keep full access.".to_string()]
        }
        BillingState::PastDue => {
            vec!["Your account is past due. Access is read-only until payment succeeds.".to_string()]
        }
        BillingState::Canceled => {
            vec!["Your subscription is cancelled and will end at the close of the billing period.".to_string()]
        }
        _ => Vec::new(),
    }
}

// ============================================================================
// Feature Grants
// ============================================================================

/// Where a grant decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureSource {
    /// Granted or denied by the plan
    Plan,
    /// Granted or denied by a tenant override
    Override,
    /// Unknown feature; explicit deny
    Deny,
}

/// The grant decision for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGrant {
    /// Feature key
    pub feature_key: String,

    /// Whether access is granted
    pub granted: bool,

    /// Decision source
    pub source: FeatureSource,
}

impl FeatureGrant {
    /// Explicit deny for an unknown feature.
    pub fn deny(feature_key: impl Into<String>) -> Self {
        Self {
            feature_key: feature_key.into(),
            granted: false,
            source: FeatureSource::Deny,
        }
    }
}

/// Resolve the feature map from plan features and non-expired overrides.
///
/// Every key referenced by either side receives a grant. A non-expired
/// override wins over the plan, including an explicit `enabled = false`,
/// which is recorded with `source = override` and `granted = false`.
pub fn resolve_features(
    plan_features: &HashMap<String, bool>,
    overrides: &[TenantOverride],
    now: DateTime<Utc>,
) -> HashMap<String, FeatureGrant> {
    let mut features: HashMap<String, FeatureGrant> = plan_features
        .iter()
        .map(|(key, enabled)| {
            (
                key.clone(),
                FeatureGrant {
                    feature_key: key.clone(),
                    granted: *enabled,
                    source: FeatureSource::Plan,
                },
            )
        })
        .collect();

    for override_row in overrides {
        if override_row.expires_at <= now {
            continue;
        }
        features.insert(
            override_row.feature_key.clone(),
            FeatureGrant {
                feature_key: override_row.feature_key.clone(),
                granted: override_row.enabled,
                source: FeatureSource::Override,
            },
        );
    }

    features
}

// ============================================================================
// Resolved Entitlement
// ============================================================================

/// Fully resolved entitlements for one tenant at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEntitlement {
    /// Tenant resolved for
    pub tenant_id: Uuid,

    /// Winning plan id
    pub plan_id: String,

    /// Merchant-facing plan name
    pub plan_name: String,

    /// Derived billing state
    pub billing_state: BillingState,

    /// Derived access level
    pub access_level: AccessLevel,

    /// Feature key → grant
    pub features: HashMap<String, FeatureGrant>,

    /// Plan limits (deep copy; callers may not mutate the catalog)
    pub limits: PlanLimits,

    /// Feature keys with overrides applied
    pub overrides_applied: Vec<String>,

    /// Billing warnings for the merchant
    pub warnings: Vec<String>,

    /// Resolution timestamp
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedEntitlement {
    /// Grant for a feature; unknown features are explicit denies.
    pub fn feature(&self, feature_key: &str) -> FeatureGrant {
        self.features
            .get(feature_key)
            .cloned()
            .unwrap_or_else(|| FeatureGrant::deny(feature_key))
    }

    /// Check feature access, combining the grant with the access level.
    ///
    /// A granted feature under a non-full access level denies with
    /// `payment_required` and names the plan that would restore it. An
    /// ungranted feature denies with `payment_required` when a higher plan
    /// grants it, else `entitlement_denied`.
    pub fn check_feature_access(
        &self,
        feature_key: &str,
        catalog: &PlanCatalogConfig,
    ) -> std::result::Result<FeatureGrant, DenialPayload> {
        let grant = self.feature(feature_key);

        if !grant.granted {
            if let Some(plan) = required_plan_for(catalog, feature_key) {
                return Err(DenialPayload::new(
                    ErrorCode::PaymentRequired,
                    "This feature requires a plan upgrade.",
                )
                .with_feature(feature_key)
                .with_billing_state(self.billing_state.as_str())
                .with_required_plan(plan.display_name.clone())
                .with_tenant(self.tenant_id));
            }
            return Err(DenialPayload::new(
                ErrorCode::EntitlementDenied,
                "This feature is not available on your plan.",
            )
            .with_feature(feature_key)
            .with_tenant(self.tenant_id));
        }

        if !self.access_level.permits_feature_use() {
            return Err(DenialPayload::new(
                ErrorCode::PaymentRequired,
                "Your subscription is not active. Update billing to restore access.",
            )
            .with_feature(feature_key)
            .with_billing_state(self.billing_state.as_str())
            .with_required_plan(self.plan_name.clone())
            .with_tenant(self.tenant_id));
        }

        Ok(grant)
    }
}

/// Lowest-ranked plan in the catalog that grants a feature.
pub fn required_plan_for<'a>(
    catalog: &'a PlanCatalogConfig,
    feature_key: &str,
) -> Option<&'a PlanConfig> {
    catalog
        .plans
        .values()
        .filter(|plan| plan.features.get(feature_key).copied().unwrap_or(false))
        .min_by_key(|plan| plan.tier_rank)
}

// ============================================================================
// Tests
// ============================================================================
