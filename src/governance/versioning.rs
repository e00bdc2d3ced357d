//! Metric version resolver
//!
//! Resolves metric names to concrete versions with deprecation handling:
//! sunset versions hard-block, deprecated versions warn with
//! `days_until_sunset`, and warnings escalate to BLOCK level inside the
//! warn-before-sunset window. Merchant alerts are emitted on the
//! configured channels.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{MetricStatus, MetricVersionsConfig};

use super::{GovernanceError, Result};

// ============================================================================
// Result Shapes
// ============================================================================

/// Escalation level of a deprecation warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    /// Informational warning
    Warn,
    /// Inside the sunset window; treat as blocking in CI
    Block,
}

/// A deprecation warning produced at resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprecationNotice {
    /// Metric name
    pub metric_name: String,

    /// Version the caller resolved
    pub resolved_version: String,

    /// Version to migrate to
    pub recommended_version: String,

    /// Escalation level
    pub level: WarningLevel,

    /// Human-readable message
    pub message: String,

    /// Days until the sunset date, when one is set
    pub days_until_sunset: Option<i64>,

    /// Migration guide reference
    pub migration_guide: Option<String>,
}

/// A merchant alert emitted for a deprecated metric in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantAlert {
    /// Tenant alerted
    pub tenant_id: String,

    /// Metric name
    pub metric_name: String,

    /// Deprecated version in use
    pub version: String,

    /// Channels the alert was emitted on
    pub channels: Vec<String>,

    /// Alert message
    pub message: String,
}

/// Resolution of a metric to a concrete version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricResolution {
    /// Metric name
    pub metric_name: String,

    /// Resolved version
    pub resolved_version: String,

    /// Backing dbt model
    pub dbt_model: String,

    /// Definition text
    pub definition: String,

    /// Version status
    pub status: MetricStatus,

    /// Warnings attached to the resolution
    pub warnings: Vec<DeprecationNotice>,
}

// ============================================================================
// Resolver
// ============================================================================

/// Config-resident metric version resolver.
pub struct MetricVersionResolver {
    config: MetricVersionsConfig,
    warnings_emitted: Mutex<Vec<DeprecationNotice>>,
    alerts_emitted: Mutex<Vec<MerchantAlert>>,
}

impl MetricVersionResolver {
    /// Create a resolver from configuration.
    pub fn new(config: MetricVersionsConfig) -> Self {
        Self {
            config,
            warnings_emitted: Mutex::new(Vec::new()),
            alerts_emitted: Mutex::new(Vec::new()),
        }
    }

    /// Resolve a metric to a concrete version.
    ///
    /// `requested_version = None` resolves the current version. A sunset
    /// version (explicit status or past sunset date) is a hard error.
    pub fn resolve(
        &self,
        metric_name: &str,
        requested_version: Option<&str>,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MetricResolution> {
        let metric = self
            .config
            .metrics
            .get(metric_name)
            .ok_or_else(|| GovernanceError::UnknownMetric(metric_name.to_string()))?;

        let version = requested_version.unwrap_or(&metric.current_version).to_string();
        let version_config =
            metric
                .versions
                .get(&version)
                .ok_or_else(|| GovernanceError::UnknownVersion {
                    metric: metric_name.to_string(),
                    version: version.clone(),
                })?;

        // Sunset is checked by explicit status AND by date comparison.
        if self.is_sunset(version_config.status, version_config.sunset_date, now) {
            return Err(GovernanceError::MetricSunset {
                metric: metric_name.to_string(),
                version,
                current_version: metric.current_version.clone(),
            });
        }

        let mut warnings = Vec::new();
        if version_config.status == MetricStatus::Deprecated {
            let notice = self.deprecation_notice(
                metric_name,
                &version,
                &metric.current_version,
                version_config.sunset_date,
                version_config.migration_guide.clone(),
                now,
            );
            self.warnings_emitted.lock().push(notice.clone());

            if let Some(tenant) = tenant_id {
                self.emit_merchant_alert(tenant, metric_name, &version, &notice);
            }
            warnings.push(notice);
        }

        Ok(MetricResolution {
            metric_name: metric_name.to_string(),
            resolved_version: version,
            dbt_model: version_config.dbt_model.clone(),
            definition: version_config.definition.clone(),
            status: version_config.status,
            warnings,
        })
    }

    /// Whether a metric version is sunset, by explicit status or by a
    /// sunset date in the past.
    pub fn check_sunset(&self, metric_name: &str, version: &str, now: DateTime<Utc>) -> bool {
        self.config
            .metrics
            .get(metric_name)
            .and_then(|metric| metric.versions.get(version))
            .map(|config| self.is_sunset(config.status, config.sunset_date, now))
            .unwrap_or(false)
    }

    /// Inventory of deprecated versions across the registry.
    pub fn deprecated_metrics(&self) -> Vec<(String, String, Option<DateTime<Utc>>)> {
        let mut deprecated = Vec::new();
        for (name, metric) in &self.config.metrics {
            for (version, config) in &metric.versions {
                if config.status == MetricStatus::Deprecated {
                    deprecated.push((name.clone(), version.clone(), config.sunset_date));
                }
            }
        }
        deprecated.sort();
        deprecated
    }

    /// Whether rolling a metric back to `version` is supported: the
    /// version must exist and not be sunset.
    pub fn supports_rollback_to(&self, metric_name: &str, version: &str, now: DateTime<Utc>) -> bool {
        self.config
            .metrics
            .get(metric_name)
            .and_then(|metric| metric.versions.get(version))
            .map(|config| !self.is_sunset(config.status, config.sunset_date, now))
            .unwrap_or(false)
    }

    /// Warnings emitted since construction.
    pub fn warnings_emitted(&self) -> Vec<DeprecationNotice> {
        self.warnings_emitted.lock().clone()
    }

    /// Merchant alerts emitted since construction.
    pub fn alerts_emitted(&self) -> Vec<MerchantAlert> {
        self.alerts_emitted.lock().clone()
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn is_sunset(
        &self,
        status: MetricStatus,
        sunset_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if status == MetricStatus::Sunset {
            return true;
        }
        matches!(sunset_date, Some(date) if date <= now)
    }

    fn deprecation_notice(
        &self,
        metric_name: &str,
        version: &str,
        current_version: &str,
        sunset_date: Option<DateTime<Utc>>,
        migration_guide: Option<String>,
        now: DateTime<Utc>,
    ) -> DeprecationNotice {
        let days_until_sunset = sunset_date.map(|date| (date - now).num_days());

        let level = match days_until_sunset {
            Some(days) if days <= self.config.warn_before_sunset_days => WarningLevel::Block,
            _ => WarningLevel::Warn,
        };

        let mut message = format!(
            "Metric '{metric_name}' version '{version}' is deprecated. Please migrate to version '{current_version}'."
        );
        if let Some(days) = days_until_sunset {
            if days > 0 {
                message.push_str(&format!(" Sunset in {days} days."));
            } else {
                message.push_str(" This version has reached its sunset date.");
            }
        }

        DeprecationNotice {
            metric_name: metric_name.to_string(),
            resolved_version: version.to_string(),
            recommended_version: current_version.to_string(),
            level,
            message,
            days_until_sunset,
            migration_guide,
        }
    }

    fn emit_merchant_alert(
        &self,
        tenant_id: &str,
        metric_name: &str,
        version: &str,
        notice: &DeprecationNotice,
    ) {
        let alert = MerchantAlert {
            tenant_id: tenant_id.to_string(),
            metric_name: metric_name.to_string(),
            version: version.to_string(),
            channels: self.config.alert_channels.clone(),
            message: notice.message.clone(),
        };
        tracing::info!(
            tenant_id,
            metric_name,
            version,
            channels = ?alert.channels,
            "merchant deprecation alert emitted"
        );
        self.alerts_emitted.lock().push(alert);
    }
}

// ============================================================================
// Deprecation Middleware
// ============================================================================

/// Query-side adapter: checks every metric referenced by a query and
/// annotates responses with any deprecation warnings.
pub struct DeprecationMiddleware<'a> {
    resolver: &'a MetricVersionResolver,
}

impl<'a> DeprecationMiddleware<'a> {
    /// Wrap a resolver.
    pub fn new(resolver: &'a MetricVersionResolver) -> Self {
        Self { resolver }
    }

    /// Check every metric a query references. Sunset metrics fail the
    /// whole query; deprecated ones accumulate warnings.
    pub fn check_query(
        &self,
        metric_names: &[&str],
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeprecationNotice>> {
        let mut warnings = Vec::new();
        for name in metric_names {
            let resolution = self.resolver.resolve(name, None, tenant_id, now)?;
            warnings.extend(resolution.warnings);
        }
        Ok(warnings)
    }

    /// Attach warnings to a JSON response under `_deprecations`.
    pub fn annotate_response(
        &self,
        mut response: serde_json::Value,
        warnings: &[DeprecationNotice],
    ) -> serde_json::Value {
        if warnings.is_empty() {
            return response;
        }
        if let Some(map) = response.as_object_mut() {
            map.insert(
                "_deprecations".to_string(),
                serde_json::to_value(warnings).unwrap_or_default(),
            );
        }
        response
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricConfig, MetricVersionConfig};
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn resolver() -> MetricVersionResolver {
        let mut versions = HashMap::new();
        versions.insert(
            "v1".to_string(),
            MetricVersionConfig {
                dbt_model: "fct_revenue_v1".to_string(),
                definition: "gross revenue".to_string(),
                status: MetricStatus::Deprecated,
                deprecated_date: Some(now() - Duration::days(60)),
                sunset_date: Some(now() + Duration::days(14)),
                migration_guide: Some("docs/metrics/revenue-v2".to_string()),
            },
        );
        versions.insert(
            "v2".to_string(),
            MetricVersionConfig {
                dbt_model: "fct_revenue_v2".to_string(),
                definition: "net revenue".to_string(),
                status: MetricStatus::Active,
                deprecated_date: None,
                sunset_date: None,
                migration_guide: None,
            },
        );
        versions.insert(
            "v0".to_string(),
            MetricVersionConfig {
                dbt_model: "fct_revenue_v0".to_string(),
                definition: "legacy revenue".to_string(),
                status: MetricStatus::Sunset,
                deprecated_date: None,
                sunset_date: Some(now() - Duration::days(30)),
                migration_guide: None,
            },
        );

        let mut metrics = HashMap::new();
        metrics.insert(
            "revenue".to_string(),
            MetricConfig {
                current_version: "v2".to_string(),
                versions,
            },
        );

        MetricVersionResolver::new(MetricVersionsConfig {
            metrics,
            warn_before_sunset_days: 30,
            alert_channels: vec!["in_app".to_string()],
        })
    }

    #[test]
    fn test_current_version_resolves_clean() {
        let resolver = resolver();
        let resolution = resolver.resolve("revenue", None, None, now()).unwrap();
        assert_eq!(resolution.resolved_version, "v2");
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_sunset_version_hard_blocks() {
        let resolver = resolver();
        let err = resolver.resolve("revenue", Some("v0"), None, now()).unwrap_err();
        assert!(matches!(err, GovernanceError::MetricSunset { .. }));
    }

    #[test]
    fn test_sunset_by_date_even_if_status_deprecated() {
        // check_sunset looks at the date as well as the explicit status
        let resolver = resolver();
        assert!(resolver.check_sunset("revenue", "v0", now()));
        assert!(!resolver.check_sunset("revenue", "v1", now()));
        // Past the sunset date, v1 blocks too
        assert!(resolver.check_sunset("revenue", "v1", now() + Duration::days(15)));
    }

    #[test]
    fn test_deprecated_version_warns_with_days_and_block_level() {
        let resolver = resolver();
        let resolution = resolver
            .resolve("revenue", Some("v1"), Some("tenant-1"), now())
            .unwrap();
        assert_eq!(resolution.warnings.len(), 1);
        let warning = &resolution.warnings[0];
        assert_eq!(warning.days_until_sunset, Some(14));
        // 14 days out is inside the 30-day window → BLOCK level
        assert_eq!(warning.level, WarningLevel::Block);
        assert_eq!(warning.recommended_version, "v2");
        assert_eq!(resolver.alerts_emitted().len(), 1);
    }

    #[test]
    fn test_unknown_metric_and_version() {
        let resolver = resolver();
        assert!(matches!(
            resolver.resolve("nonexistent", None, None, now()),
            Err(GovernanceError::UnknownMetric(_))
        ));
        assert!(matches!(
            resolver.resolve("revenue", Some("v9"), None, now()),
            Err(GovernanceError::UnknownVersion { .. })
        ));
    }

    #[test]
    fn test_supports_rollback_to() {
        let resolver = resolver();
        assert!(resolver.supports_rollback_to("revenue", "v1", now()));
        assert!(!resolver.supports_rollback_to("revenue", "v0", now()));
        assert!(!resolver.supports_rollback_to("revenue", "v9", now()));
    }

    #[test]
    fn test_middleware_annotates_and_blocks() {
        let resolver = resolver();
        let middleware = DeprecationMiddleware::new(&resolver);

        let warnings = middleware
            .check_query(&["revenue"], None, now())
            .unwrap();
        assert!(warnings.is_empty());

        let response = middleware.annotate_response(
            serde_json::json!({"rows": []}),
            &resolver
                .resolve("revenue", Some("v1"), None, now())
                .unwrap()
                .warnings,
        );
        assert!(response.get("_deprecations").is_some());
    }

    #[test]
    fn test_deprecated_inventory() {
        let resolver = resolver();
        let deprecated = resolver.deprecated_metrics();
        assert_eq!(deprecated.len(), 1);
        assert_eq!(deprecated[0].0, "revenue");
        assert_eq!(deprecated[0].1, "v1");
    }
}
