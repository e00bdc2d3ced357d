//! Integration tests for entitlement resolution and billing-driven access
//!
//! Exercises the deterministic pieces end to end: billing-state
//! derivation, feature resolution with overrides, access-level checks,
//! and the cache's revocation semantics.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use meridian::config::{PlanCatalogConfig, PlanConfig, PlanLimits};
use meridian::core::ErrorCode;
use meridian::entitlements::{
    default_access_level, resolve_features, AccessLevel, BillingState, EntitlementCache,
    FeatureGrant, FeatureSource, ResolvedEntitlement, SubscriptionStanding, TenantOverride,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn growth_catalog() -> PlanCatalogConfig {
    let mut plans = HashMap::new();
    let mut free_features = HashMap::new();
    free_features.insert("dashboards".to_string(), true);
    free_features.insert("ai_insights".to_string(), false);
    plans.insert(
        "plan_free".to_string(),
        PlanConfig {
            plan_id: "plan_free".to_string(),
            display_name: "Free".to_string(),
            tier_rank: 0,
            price_cents: 0,
            features: free_features,
            limits: PlanLimits::default(),
        },
    );
    let mut growth_features = HashMap::new();
    growth_features.insert("dashboards".to_string(), true);
    growth_features.insert("ai_insights".to_string(), true);
    plans.insert(
        "plan_growth".to_string(),
        PlanConfig {
            plan_id: "plan_growth".to_string(),
            display_name: "Growth".to_string(),
            tier_rank: 1,
            price_cents: 9900,
            features: growth_features,
            limits: PlanLimits {
                max_dashboards: 10,
                ..PlanLimits::default()
            },
        },
    );
    PlanCatalogConfig {
        plans,
        access_rules: HashMap::new(),
    }
}

fn resolved_for(state: BillingState, catalog: &PlanCatalogConfig) -> ResolvedEntitlement {
    let plan = catalog.plan("plan_growth").unwrap();
    ResolvedEntitlement {
        tenant_id: Uuid::new_v4(),
        plan_id: plan.plan_id.clone(),
        plan_name: plan.display_name.clone(),
        billing_state: state,
        access_level: default_access_level(state),
        features: resolve_features(&plan.features, &[], now()),
        limits: plan.limits.clone(),
        overrides_applied: vec![],
        warnings: vec![],
        resolved_at: now(),
    }
}

#[test]
fn cancellation_retains_access_until_period_end_then_requires_payment() {
    let catalog = growth_catalog();
    let period_end = now() + Duration::days(12);

    // Immediately after the cancellation webhook: canceled, access retained
    let state = BillingState::derive(
        SubscriptionStanding::Canceled,
        None,
        Some(period_end),
        now(),
    );
    assert_eq!(state, BillingState::Canceled);
    let resolved = resolved_for(state, &catalog);
    assert!(resolved.check_feature_access("ai_insights", &catalog).is_ok());

    // Past the period end: expired, payment required, plan named
    let late = period_end + Duration::minutes(1);
    let state = BillingState::derive(
        SubscriptionStanding::Canceled,
        None,
        Some(period_end),
        late,
    );
    assert_eq!(state, BillingState::Expired);
    let resolved = resolved_for(state, &catalog);
    let denial = resolved
        .check_feature_access("ai_insights", &catalog)
        .unwrap_err();
    assert_eq!(denial.error_code, ErrorCode::PaymentRequired);
    assert_eq!(denial.context.required_plan.as_deref(), Some("Growth"));
}

#[test]
fn free_plan_feature_denial_names_the_upgrade_plan() {
    let catalog = growth_catalog();
    let free = catalog.plan("plan_free").unwrap();
    let resolved = ResolvedEntitlement {
        tenant_id: Uuid::new_v4(),
        plan_id: free.plan_id.clone(),
        plan_name: free.display_name.clone(),
        billing_state: BillingState::Active,
        access_level: AccessLevel::Full,
        features: resolve_features(&free.features, &[], now()),
        limits: free.limits.clone(),
        overrides_applied: vec![],
        warnings: vec![],
        resolved_at: now(),
    };

    let denial = resolved
        .check_feature_access("ai_insights", &catalog)
        .unwrap_err();
    assert_eq!(denial.error_code, ErrorCode::PaymentRequired);
    // The lowest plan granting the feature is named
    assert_eq!(denial.context.required_plan.as_deref(), Some("Growth"));

    // Granted features on the free plan still pass
    assert!(resolved.check_feature_access("dashboards", &catalog).is_ok());
}

#[test]
fn override_round_trip_wins_over_plan_and_expires() {
    let tenant = Uuid::new_v4();
    let plan_features: HashMap<String, bool> =
        [("ai_insights".to_string(), false)].into_iter().collect();

    let override_row = TenantOverride {
        tenant_id: tenant,
        feature_key: "ai_insights".to_string(),
        enabled: true,
        expires_at: now() + Duration::hours(6),
        reason: "pilot".to_string(),
        created_by: "ops".to_string(),
    };

    // Non-expired: override wins with source=override
    let features = resolve_features(&plan_features, std::slice::from_ref(&override_row), now());
    let grant = &features["ai_insights"];
    assert_eq!(
        grant,
        &FeatureGrant {
            feature_key: "ai_insights".to_string(),
            granted: true,
            source: FeatureSource::Override,
        }
    );

    // After expiry: plan value returns
    let later = now() + Duration::hours(7);
    let features = resolve_features(&plan_features, std::slice::from_ref(&override_row), later);
    assert!(!features["ai_insights"].granted);
    assert_eq!(features["ai_insights"].source, FeatureSource::Plan);
}

#[test]
fn cache_invalidation_revokes_immediately_and_ttl_expires() {
    let catalog = growth_catalog();
    let cache = EntitlementCache::new(300);
    let resolved = resolved_for(BillingState::Active, &catalog);
    let tenant = resolved.tenant_id;

    cache.set(tenant, resolved, now());
    assert!(cache.get(tenant, now() + Duration::seconds(10)).is_some());

    // Billing webhook invalidates synchronously
    assert!(cache.invalidate(tenant, "billing_webhook:cancelled"));
    assert!(cache.get(tenant, now() + Duration::seconds(10)).is_none());

    // TTL expiry also forces recomputation
    let resolved = resolved_for(BillingState::Active, &catalog);
    let tenant = resolved.tenant_id;
    cache.set(tenant, resolved, now());
    assert!(cache.get(tenant, now() + Duration::seconds(301)).is_none());
}

#[test]
fn grace_period_ladder_matches_billing_policy() {
    // Frozen with grace in the future keeps full access
    let in_grace = BillingState::derive(
        SubscriptionStanding::Frozen,
        Some(now() + Duration::days(3)),
        None,
        now(),
    );
    assert_eq!(in_grace, BillingState::GracePeriod);
    assert_eq!(default_access_level(in_grace), AccessLevel::Full);

    // Past grace drops to read-only
    let past_due = BillingState::derive(
        SubscriptionStanding::Frozen,
        Some(now() - Duration::hours(1)),
        None,
        now(),
    );
    assert_eq!(past_due, BillingState::PastDue);
    assert_eq!(default_access_level(past_due), AccessLevel::ReadOnly);
}
