//! Periodic workers
//!
//! In-process scheduled checks: token refresh, override cleanup,
//! freshness evaluation, billing reconciliation, and audit retention.
//! Each worker is a cooperative tokio task that ticks on an interval and
//! stops promptly on shutdown; per-tenant work runs under that tenant's
//! scope.

use futures::future::join_all;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::billing::Reconciler;
use crate::config::{FreshnessSlaConfig, RuntimeConfig};
use crate::connectors::tokens::PlatformTokenClient;
use crate::connectors::{CredentialVault, KeyService, TokenManager};
use crate::entitlements::EntitlementEngine;
use crate::freshness::DataAvailabilityService;
use crate::identity::BillingTier;

// ============================================================================
// Runner
// ============================================================================

/// Handle over the spawned worker set.
pub struct WorkerSet {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    /// Create an empty worker set.
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Spawn a periodic job. The closure runs once per tick; errors are
    /// logged and do not stop the loop.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, every: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = job().await {
                            tracing::error!(worker = name, error = %err, "periodic job failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!(worker = name, "worker stopping");
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.push(handle);
    }

    /// Signal shutdown and wait for every worker to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tenant Enumeration
// ============================================================================

/// Active tenants with their billing tiers, for per-tenant sweeps.
async fn active_tenants(pool: &PgPool) -> anyhow::Result<Vec<(Uuid, BillingTier)>> {
    let tenants: Vec<(Uuid, BillingTier)> = sqlx::query_as(
        r"
        SELECT id, billing_tier FROM tenants WHERE status = 'active'
        ",
    )
    .fetch_all(pool)
    .await?;
    Ok(tenants)
}

// ============================================================================
// Jobs
// ============================================================================

/// Proactive token refresh across all active tenants.
pub async fn token_refresh_sweep(
    pool: PgPool,
    keys: Arc<dyn KeyService>,
    platform: Arc<dyn PlatformTokenClient>,
    audit: Arc<AuditLog>,
    config: Arc<RuntimeConfig>,
) -> anyhow::Result<()> {
    for (tenant_id, _) in active_tenants(&pool).await? {
        let vault = Arc::new(CredentialVault::new(pool.clone(), keys.clone(), tenant_id));
        let manager = TokenManager::new(
            pool.clone(),
            vault,
            platform.clone(),
            audit.clone(),
            tenant_id,
        );
        if let Err(err) = manager
            .refresh_expiring_credentials(config.proactive_refresh_hours)
            .await
        {
            tracing::error!(tenant_id = %tenant_id, error = %err, "token refresh sweep failed for tenant");
        }
    }
    Ok(())
}

/// Expired-override sweep; invalidates affected tenants.
pub async fn override_cleanup(engine: Arc<EntitlementEngine>) -> anyhow::Result<()> {
    let cleaned = engine.cleanup_expired_overrides().await?;
    if cleaned > 0 {
        tracing::info!(tenants_invalidated = cleaned, "expired overrides cleaned");
    }
    Ok(())
}

/// Freshness evaluation for every active tenant and source. Tenants are
/// independent, so their evaluations run concurrently.
pub async fn freshness_sweep(
    pool: PgPool,
    sla: Arc<FreshnessSlaConfig>,
    audit: Arc<AuditLog>,
) -> anyhow::Result<()> {
    let evaluations = active_tenants(&pool).await?.into_iter().map(|(tenant_id, tier)| {
        let service = DataAvailabilityService::new(
            pool.clone(),
            sla.clone(),
            audit.clone(),
            tenant_id,
            tier.as_str(),
        );
        async move {
            if let Err(err) = service.evaluate_all().await {
                tracing::error!(tenant_id = %tenant_id, error = %err, "freshness evaluation failed for tenant");
            }
        }
    });
    join_all(evaluations).await;
    Ok(())
}

/// Billing reconciliation against the provider of record.
pub async fn reconciliation_sweep(reconciler: Arc<Reconciler>) -> anyhow::Result<()> {
    reconciler.run().await?;
    Ok(())
}

/// Audit retention sweep for every active tenant, run concurrently.
pub async fn audit_retention_sweep(
    pool: PgPool,
    audit: Arc<AuditLog>,
    config: Arc<RuntimeConfig>,
) -> anyhow::Result<()> {
    let sweeps = active_tenants(&pool).await?.into_iter().map(|(tenant_id, _)| {
        let audit = audit.clone();
        let retention_days = config.audit_retention_days;
        async move {
            if let Err(err) = audit.apply_retention(tenant_id, retention_days).await {
                tracing::error!(tenant_id = %tenant_id, error = %err, "audit retention failed for tenant");
            }
        }
    });
    join_all(sweeps).await;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_job_ticks_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut workers = WorkerSet::new();
        let inner = counter.clone();
        workers.spawn_periodic("test", Duration::from_secs(10), move || {
            let inner = inner.clone();
            async move {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        // First tick fires immediately, then every 10s
        tokio::time::sleep(Duration::from_secs(25)).await;
        let ticks = counter.load(Ordering::SeqCst);
        assert!(ticks >= 3, "expected at least 3 ticks, got {ticks}");

        workers.shutdown().await;
        let after_shutdown = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_errors_do_not_stop_the_loop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut workers = WorkerSet::new();
        let inner = counter.clone();
        workers.spawn_periodic("flaky", Duration::from_secs(5), move || {
            let inner = inner.clone();
            async move {
                let n = inner.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(22)).await;
        assert!(counter.load(Ordering::SeqCst) >= 4);
        workers.shutdown().await;
    }
}
