//! Entitlement cache
//!
//! Per-tenant TTL cache of resolved entitlements. Invariants:
//!
//! - Invalidation is synchronous and atomic
//! - A cached value is never returned past its TTL
//! - Read failures are non-fatal; the engine recomputes
//!
//! This cache is the single authority for cached grants. Subsystems that
//! write overrides or subscriptions must invalidate through the engine.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::ResolvedEntitlement;

/// One cached entry with its write instant.
#[derive(Debug, Clone)]
struct CachedEntry {
    resolved: ResolvedEntitlement,
    cached_at: DateTime<Utc>,
}

/// In-process TTL cache keyed by tenant id.
pub struct EntitlementCache {
    entries: DashMap<Uuid, CachedEntry>,
    ttl: Duration,
}

impl EntitlementCache {
    /// Create a cache with the given TTL in seconds.
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Read a cached entitlement; expired entries are removed and treated
    /// as misses.
    pub fn get(&self, tenant_id: Uuid, now: DateTime<Utc>) -> Option<ResolvedEntitlement> {
        let expired = match self.entries.get(&tenant_id) {
            Some(entry) => {
                if now - entry.cached_at < self.ttl {
                    return Some(entry.resolved.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(&tenant_id);
        }
        None
    }

    /// Store a resolved entitlement.
    pub fn set(&self, tenant_id: Uuid, resolved: ResolvedEntitlement, now: DateTime<Utc>) {
        self.entries.insert(
            tenant_id,
            CachedEntry {
                resolved,
                cached_at: now,
            },
        );
    }

    /// Invalidate a tenant's cached entitlements. Returns whether an
    /// entry existed.
    pub fn invalidate(&self, tenant_id: Uuid, reason: &str) -> bool {
        let removed = self.entries.remove(&tenant_id).is_some();
        tracing::info!(
            tenant_id = %tenant_id,
            reason,
            cache_deleted = removed,
            "entitlements invalidated"
        );
        removed
    }

    /// Number of live entries (expired entries may still be counted until
    /// their next read).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlanLimits;
    use crate::entitlements::{AccessLevel, BillingState};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn resolved(tenant_id: Uuid, at: DateTime<Utc>) -> ResolvedEntitlement {
        ResolvedEntitlement {
            tenant_id,
            plan_id: "plan_free".to_string(),
            plan_name: "Free".to_string(),
            billing_state: BillingState::Active,
            access_level: AccessLevel::Full,
            features: HashMap::new(),
            limits: PlanLimits::default(),
            overrides_applied: vec![],
            warnings: vec![],
            resolved_at: at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = EntitlementCache::new(300);
        let tenant = Uuid::new_v4();
        cache.set(tenant, resolved(tenant, t0()), t0());

        let hit = cache.get(tenant, t0() + Duration::seconds(299));
        assert!(hit.is_some());
    }

    #[test]
    fn test_never_returned_past_ttl() {
        let cache = EntitlementCache::new(300);
        let tenant = Uuid::new_v4();
        cache.set(tenant, resolved(tenant, t0()), t0());

        assert!(cache.get(tenant, t0() + Duration::seconds(300)).is_none());
        // The expired entry was evicted on read
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidation_is_synchronous() {
        let cache = EntitlementCache::new(300);
        let tenant = Uuid::new_v4();
        cache.set(tenant, resolved(tenant, t0()), t0());

        assert!(cache.invalidate(tenant, "billing_webhook"));
        assert!(cache.get(tenant, t0()).is_none());
        // Idempotent
        assert!(!cache.invalidate(tenant, "billing_webhook"));
    }

    #[test]
    fn test_invalidation_scoped_to_tenant() {
        let cache = EntitlementCache::new(300);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.set(a, resolved(a, t0()), t0());
        cache.set(b, resolved(b, t0()), t0());

        cache.invalidate(a, "override_written");
        assert!(cache.get(a, t0()).is_none());
        assert!(cache.get(b, t0()).is_some());
    }
}
