//! Configuration structs consumed by the control plane
//!
//! File parsing happens in a collaborator; this crate consumes the typed
//! structs. Provided here:
//!
//! - Plan catalog + billing-state access rules
//! - Data freshness SLA thresholds per source and tier
//! - Metric version registry
//! - Change approval requirements
//! - Pre-deploy validation categories
//! - Rollback authority and verification checks
//! - AI guardrail restrictions
//! - Runtime knobs loaded from environment variables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Plan Catalog
// ============================================================================

/// Per-plan resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanLimits {
    /// Maximum non-archived custom dashboards
    pub max_dashboards: i64,

    /// Maximum active users
    pub max_users: i64,

    /// API calls per month
    pub api_calls_per_month: i64,

    /// AI insights per month
    pub ai_insights_per_month: i64,

    /// Data retention window in days
    pub data_retention_days: i64,

    /// Export rows per request
    pub export_rows_per_request: i64,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_dashboards: 3,
            max_users: 2,
            api_calls_per_month: 10_000,
            ai_insights_per_month: 10,
            data_retention_days: 90,
            export_rows_per_request: 5_000,
        }
    }
}

/// One plan definition from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Stable plan identifier (e.g. `plan_growth`)
    pub plan_id: String,

    /// Merchant-facing name
    pub display_name: String,

    /// Ordering rank; higher wins in subscription selection
    pub tier_rank: i32,

    /// Monthly price in cents
    pub price_cents: i64,

    /// Feature key → enabled
    pub features: HashMap<String, bool>,

    /// Resource limits
    pub limits: PlanLimits,
}

/// Access rule for a billing state, overriding the default table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    /// Access level string (parsed by the entitlement engine)
    pub access_level: String,

    /// Warnings surfaced to the merchant in this state
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Plan catalog plus billing-state access rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanCatalogConfig {
    /// Plans keyed by plan id
    pub plans: HashMap<String, PlanConfig>,

    /// Billing state → access rule overrides
    #[serde(default)]
    pub access_rules: HashMap<String, AccessRule>,
}

impl PlanCatalogConfig {
    /// Identifier of the synthesized free plan.
    pub const FREE_PLAN_ID: &'static str = "plan_free";

    /// Look up a plan by id.
    pub fn plan(&self, plan_id: &str) -> Option<&PlanConfig> {
        self.plans.get(plan_id)
    }

    /// The free plan, if configured.
    pub fn free_plan(&self) -> Option<&PlanConfig> {
        self.plans.get(Self::FREE_PLAN_ID)
    }
}

// ============================================================================
// Freshness SLA
// ============================================================================

/// Warn/error thresholds in minutes for one source + tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlaThresholds {
    /// Minutes after which data is stale
    pub warn_after_minutes: i64,

    /// Minutes after which data is unavailable
    pub error_after_minutes: i64,
}

impl Default for SlaThresholds {
    fn default() -> Self {
        Self {
            warn_after_minutes: 1440,
            error_after_minutes: 2880,
        }
    }
}

/// Freshness SLA configuration per source and billing tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessSlaConfig {
    /// Tier used when the tenant's tier has no entry
    pub default_tier: String,

    /// source key → tier → thresholds
    pub sources: HashMap<String, HashMap<String, SlaThresholds>>,

    /// Sources whose staleness is always critical
    #[serde(default)]
    pub critical_sources: Vec<String>,
}

impl Default for FreshnessSlaConfig {
    fn default() -> Self {
        Self {
            default_tier: "free".to_string(),
            sources: HashMap::new(),
            critical_sources: vec![
                "shopify_orders".to_string(),
                "shopify_refunds".to_string(),
            ],
        }
    }
}

impl FreshnessSlaConfig {
    /// Thresholds for a source and tier, falling back to the free tier
    /// and then the defaults.
    pub fn thresholds(&self, source: &str, tier: &str) -> SlaThresholds {
        let effective_tier = if tier.is_empty() {
            self.default_tier.as_str()
        } else {
            tier
        };
        self.sources
            .get(source)
            .and_then(|tiers| tiers.get(effective_tier).or_else(|| tiers.get("free")))
            .copied()
            .unwrap_or_default()
    }

    /// Whether staleness of this source is always critical.
    pub fn is_critical_source(&self, source: &str) -> bool {
        self.critical_sources.iter().any(|s| s == source)
    }
}

// ============================================================================
// Metric Versions
// ============================================================================

/// Lifecycle status of one metric version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    /// Version is current
    Active,
    /// Version is deprecated with a sunset date
    Deprecated,
    /// Version is past end-of-life; resolution is a hard block
    Sunset,
}

/// One version of a metric definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricVersionConfig {
    /// Backing dbt model
    pub dbt_model: String,

    /// Human-readable definition
    pub definition: String,

    /// Lifecycle status
    pub status: MetricStatus,

    /// Date deprecation was announced
    #[serde(default)]
    pub deprecated_date: Option<DateTime<Utc>>,

    /// End-of-life date
    #[serde(default)]
    pub sunset_date: Option<DateTime<Utc>>,

    /// Migration guide URL or path
    #[serde(default)]
    pub migration_guide: Option<String>,
}

/// Version registry for one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    /// Version callers get by default
    pub current_version: String,

    /// Version → definition
    pub versions: HashMap<String, MetricVersionConfig>,
}

/// Metric version registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricVersionsConfig {
    /// Metric name → version registry
    pub metrics: HashMap<String, MetricConfig>,

    /// Days before sunset at which warnings escalate to BLOCK level
    pub warn_before_sunset_days: i64,

    /// Channels merchant alerts are emitted on (e.g. "email", "in_app")
    #[serde(default)]
    pub alert_channels: Vec<String>,
}

impl Default for MetricVersionsConfig {
    fn default() -> Self {
        Self {
            metrics: HashMap::new(),
            warn_before_sunset_days: 30,
            alert_channels: vec!["in_app".to_string()],
        }
    }
}

// ============================================================================
// Change Approvals
// ============================================================================

/// Emergency approval policy for a change type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyPolicy {
    /// Minimum emergency approvers
    pub min_approvers: usize,

    /// Roles allowed to grant emergency approval
    pub allowed_approver_roles: Vec<String>,

    /// Incident ticket reference required
    pub require_incident_ticket: bool,

    /// Post-mortem commitment required
    pub require_post_mortem_commitment: bool,
}

/// Approval requirements for one change type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequirements {
    /// Roles whose approval is required
    pub required_approver_roles: Vec<String>,

    /// Minimum number of approvals
    pub min_approvals: usize,

    /// Pre-approval checklist item names
    #[serde(default)]
    pub checklist: Vec<String>,

    /// Hours before an open request expires
    pub sla_hours: i64,

    /// Emergency path, if permitted for this change type
    #[serde(default)]
    pub emergency: Option<EmergencyPolicy>,
}

/// Approval configuration per change type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeApprovalConfig {
    /// Change type → requirements
    pub change_types: HashMap<String, ApprovalRequirements>,
}

// ============================================================================
// Pre-deploy Validation
// ============================================================================

/// What a failing check in a category does to the overall result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureBehavior {
    /// Failure blocks the deploy
    Block,
    /// Failure warns and requires approval
    Warn,
    /// Failure is informational
    Info,
}

/// One configured check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Check name (matched against the handler registry)
    pub name: String,

    /// Threshold the measured value is compared against
    #[serde(default)]
    pub threshold: Option<f64>,

    /// Whether this check alone can block regardless of category behavior
    #[serde(default)]
    pub blocking: bool,
}

/// A category of checks sharing a failure behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckCategory {
    /// Category name
    pub name: String,

    /// Behavior applied to failures in this category
    pub failure_behavior: FailureBehavior,

    /// Checks in the category
    pub checks: Vec<CheckConfig>,
}

/// Pre-deploy validation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreDeployConfig {
    /// Ordered categories
    pub categories: Vec<CheckCategory>,
}

// ============================================================================
// Rollback
// ============================================================================

/// Rollback authority and verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Roles authorized to initiate rollbacks
    pub authorized_roles: Vec<String>,

    /// Verification check names run after execution
    #[serde(default)]
    pub verification_checks: Vec<String>,

    /// Canary percentages for gradual rollbacks
    #[serde(default = "RollbackConfig::default_batches")]
    pub gradual_batch_percentages: Vec<u8>,

    /// Success criteria evaluated between gradual batches
    #[serde(default)]
    pub batch_success_criteria: Vec<String>,
}

impl RollbackConfig {
    fn default_batches() -> Vec<u8> {
        vec![10, 50, 100]
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            authorized_roles: vec!["platform_admin".to_string(), "sre".to_string()],
            verification_checks: Vec::new(),
            gradual_batch_percentages: Self::default_batches(),
            batch_success_criteria: Vec::new(),
        }
    }
}

// ============================================================================
// AI Restrictions
// ============================================================================

/// Why a prohibited action is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionCategory {
    /// Flatly prohibited
    Prohibited,
    /// Requires human judgment
    RequiresHumanJudgment,
    /// A business decision, not an AI decision
    BusinessDecision,
    /// Security-critical action
    SecurityCritical,
    /// Accountability must rest with a person
    AccountabilityRequired,
}

/// One prohibited action entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProhibitedAction {
    /// Action identifier
    pub action: String,

    /// Human-readable reason for the refusal
    pub reason: String,

    /// Refusal category
    pub category: RestrictionCategory,

    /// Where to redirect the request (role or process)
    #[serde(default)]
    pub redirect_to: Option<String>,
}

/// AI guardrail configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiRestrictionsConfig {
    /// Closed registry of prohibited actions
    pub prohibited_actions: Vec<ProhibitedAction>,

    /// Behaviors every AI surface must uphold
    #[serde(default)]
    pub required_behaviors: Vec<String>,
}

impl AiRestrictionsConfig {
    /// Find the restriction entry for an action, if prohibited.
    pub fn restriction(&self, action: &str) -> Option<&ProhibitedAction> {
        self.prohibited_actions.iter().find(|p| p.action == action)
    }
}

// ============================================================================
// Runtime Knobs
// ============================================================================

/// Runtime configuration loaded from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Entitlement cache TTL in seconds
    pub entitlement_cache_ttl_secs: u64,

    /// Grace period granted on payment failure, in days
    pub billing_grace_period_days: i64,

    /// Hours before token expiry at which proactive refresh triggers
    pub proactive_refresh_hours: i64,

    /// Audit retention window in days
    pub audit_retention_days: i64,

    /// Shopify webhook shared secret
    pub webhook_shared_secret: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            entitlement_cache_ttl_secs: 300,
            billing_grace_period_days: 7,
            proactive_refresh_hours: 24,
            audit_retention_days: 365,
            webhook_shared_secret: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            entitlement_cache_ttl_secs: std::env::var("MERIDIAN_ENTITLEMENT_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.entitlement_cache_ttl_secs),
            billing_grace_period_days: std::env::var("MERIDIAN_BILLING_GRACE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.billing_grace_period_days),
            proactive_refresh_hours: std::env::var("MERIDIAN_PROACTIVE_REFRESH_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.proactive_refresh_hours),
            audit_retention_days: std::env::var("MERIDIAN_AUDIT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.audit_retention_days),
            webhook_shared_secret: std::env::var("MERIDIAN_WEBHOOK_SECRET").ok(),
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.billing_grace_period_days < 0 {
            return Err("Grace period must be non-negative".to_string());
        }
        if self.audit_retention_days <= 0 {
            return Err("Audit retention must be positive".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sla_thresholds_fallback_chain() {
        let mut sources = HashMap::new();
        let mut tiers = HashMap::new();
        tiers.insert(
            "pro".to_string(),
            SlaThresholds {
                warn_after_minutes: 120,
                error_after_minutes: 480,
            },
        );
        tiers.insert(
            "free".to_string(),
            SlaThresholds {
                warn_after_minutes: 720,
                error_after_minutes: 1440,
            },
        );
        sources.insert("shopify_orders".to_string(), tiers);
        let config = FreshnessSlaConfig {
            sources,
            ..Default::default()
        };

        // Exact tier match
        assert_eq!(
            config.thresholds("shopify_orders", "pro").warn_after_minutes,
            120
        );
        // Unknown tier falls back to free
        assert_eq!(
            config
                .thresholds("shopify_orders", "enterprise")
                .warn_after_minutes,
            720
        );
        // Unknown source falls back to defaults
        assert_eq!(config.thresholds("email", "free").warn_after_minutes, 1440);
        assert_eq!(config.thresholds("email", "free").error_after_minutes, 2880);
    }

    #[test]
    fn test_default_critical_sources() {
        let config = FreshnessSlaConfig::default();
        assert!(config.is_critical_source("shopify_orders"));
        assert!(config.is_critical_source("shopify_refunds"));
        assert!(!config.is_critical_source("facebook_ads"));
    }

    #[test]
    fn test_runtime_config_validation() {
        let mut config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        config.billing_grace_period_days = -1;
        assert!(config.validate().is_err());
        config.billing_grace_period_days = 7;
        config.audit_retention_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_plan_catalog_lookup() {
        let mut plans = HashMap::new();
        plans.insert(
            PlanCatalogConfig::FREE_PLAN_ID.to_string(),
            PlanConfig {
                plan_id: PlanCatalogConfig::FREE_PLAN_ID.to_string(),
                display_name: "Free".to_string(),
                tier_rank: 0,
                price_cents: 0,
                features: HashMap::new(),
                limits: PlanLimits::default(),
            },
        );
        let catalog = PlanCatalogConfig {
            plans,
            access_rules: HashMap::new(),
        };
        assert!(catalog.free_plan().is_some());
        assert!(catalog.plan("plan_growth").is_none());
    }

    #[test]
    fn test_ai_restriction_lookup() {
        let config = AiRestrictionsConfig {
            prohibited_actions: vec![ProhibitedAction {
                action: "delete_tenant_data".to_string(),
                reason: "Destructive action requires a human".to_string(),
                category: RestrictionCategory::AccountabilityRequired,
                redirect_to: Some("support".to_string()),
            }],
            required_behaviors: vec![],
        };
        assert!(config.restriction("delete_tenant_data").is_some());
        assert!(config.restriction("summarize_sales").is_none());
    }

    #[test]
    fn test_rollback_default_batches() {
        let config = RollbackConfig::default();
        assert_eq!(config.gradual_batch_percentages, vec![10, 50, 100]);
    }
}
