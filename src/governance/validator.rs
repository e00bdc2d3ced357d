//! Pre-deploy validator
//!
//! Deterministic execution of configured checks. Categories carry a
//! failure behavior; any blocking failure makes the overall result
//! `block` with `can_deploy = false`, any non-blocking failure makes it
//! `warn` with `requires_approval = true`. The result serializes to a
//! machine-readable report for CI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{CheckConfig, FailureBehavior, PreDeployConfig};

// ============================================================================
// Results
// ============================================================================

/// Status of one executed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Check passed
    Pass,
    /// Check failed in a warning category
    Warn,
    /// Check failed in a blocking way
    Block,
    /// No handler registered; skipped
    Skip,
    /// Handler itself errored
    Error,
}

/// Result of one check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name
    pub check_name: String,

    /// Outcome
    pub status: CheckStatus,

    /// Value the handler measured
    pub measured_value: Option<f64>,

    /// Threshold the value was compared against
    pub threshold: Option<f64>,

    /// Whether this check blocks on failure
    pub blocking: bool,

    /// Handler detail
    pub detail: Option<String>,
}

/// Overall validation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Everything passed
    Pass,
    /// Non-blocking failures present
    Warn,
    /// Blocking failure present
    Block,
}

/// Serializable validation result for CI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Overall outcome
    pub overall: OverallStatus,

    /// Whether the deploy may proceed
    pub can_deploy: bool,

    /// Whether a human approval is required despite passing
    pub requires_approval: bool,

    /// Per-check results in execution order
    pub results: Vec<CheckResult>,

    /// Run start instant
    pub started_at: DateTime<Utc>,

    /// Run end instant
    pub finished_at: DateTime<Utc>,
}

impl ValidationResult {
    /// JSON report for CI artifacts.
    pub fn to_report_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Process exit code for CI: 0 pass, 1 warn, 2 block.
    pub fn exit_code(&self) -> i32 {
        match self.overall {
            OverallStatus::Pass => 0,
            OverallStatus::Warn => 1,
            OverallStatus::Block => 2,
        }
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Measures one check; returns the measured value and pass/fail, or an
/// error description.
pub type ValidationHandler =
    Box<dyn Fn(&CheckConfig) -> std::result::Result<(Option<f64>, bool), String> + Send + Sync>;

/// Config-driven pre-deploy validator.
pub struct PreDeployValidator {
    config: PreDeployConfig,
    handlers: HashMap<String, ValidationHandler>,
}

impl PreDeployValidator {
    /// Create a validator from configuration.
    pub fn new(config: PreDeployConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a check name.
    pub fn register_handler(&mut self, check_name: impl Into<String>, handler: ValidationHandler) {
        self.handlers.insert(check_name.into(), handler);
    }

    /// Run every configured check in order.
    pub fn run(&self, now: DateTime<Utc>) -> ValidationResult {
        let started_at = now;
        let mut results = Vec::new();

        for category in &self.config.categories {
            for check in &category.checks {
                results.push(self.run_check(check, category.failure_behavior));
            }
        }

        let any_blocking_failure = results
            .iter()
            .any(|result| result.status == CheckStatus::Block);
        let any_failure = results
            .iter()
            .any(|result| matches!(result.status, CheckStatus::Warn | CheckStatus::Error));

        let overall = if any_blocking_failure {
            OverallStatus::Block
        } else if any_failure {
            OverallStatus::Warn
        } else {
            OverallStatus::Pass
        };

        let result = ValidationResult {
            overall,
            can_deploy: !any_blocking_failure,
            requires_approval: !any_blocking_failure && any_failure,
            results,
            started_at,
            finished_at: now,
        };

        tracing::info!(
            overall = ?result.overall,
            can_deploy = result.can_deploy,
            requires_approval = result.requires_approval,
            checks = result.results.len(),
            "pre-deploy validation completed"
        );

        result
    }

    /// Sign-off checklist: names of all configured checks, grouped by
    /// category.
    pub fn sign_off_checklist(&self) -> Vec<(String, Vec<String>)> {
        self.config
            .categories
            .iter()
            .map(|category| {
                (
                    category.name.clone(),
                    category
                        .checks
                        .iter()
                        .map(|check| check.name.clone())
                        .collect(),
                )
            })
            .collect()
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn run_check(&self, check: &CheckConfig, behavior: FailureBehavior) -> CheckResult {
        let blocking = check.blocking || behavior == FailureBehavior::Block;

        let Some(handler) = self.handlers.get(&check.name) else {
            return CheckResult {
                check_name: check.name.clone(),
                status: CheckStatus::Skip,
                measured_value: None,
                threshold: check.threshold,
                blocking,
                detail: Some("no handler registered".to_string()),
            };
        };

        match handler(check) {
            Ok((measured_value, passed)) => {
                let status = if passed {
                    CheckStatus::Pass
                } else if blocking {
                    CheckStatus::Block
                } else {
                    CheckStatus::Warn
                };
                CheckResult {
                    check_name: check.name.clone(),
                    status,
                    measured_value,
                    threshold: check.threshold,
                    blocking,
                    detail: None,
                }
            }
            Err(detail) => CheckResult {
                check_name: check.name.clone(),
                // A handler error in a blocking category blocks; the
                // check could not prove safety.
                status: if blocking {
                    CheckStatus::Block
                } else {
                    CheckStatus::Error
                },
                measured_value: None,
                threshold: check.threshold,
                blocking,
                detail: Some(detail),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckCategory;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn config() -> PreDeployConfig {
        PreDeployConfig {
            categories: vec![
                CheckCategory {
                    name: "schema".to_string(),
                    failure_behavior: FailureBehavior::Block,
                    checks: vec![CheckConfig {
                        name: "exposed_columns_intact".to_string(),
                        threshold: None,
                        blocking: true,
                    }],
                },
                CheckCategory {
                    name: "quality".to_string(),
                    failure_behavior: FailureBehavior::Warn,
                    checks: vec![CheckConfig {
                        name: "row_count_delta".to_string(),
                        threshold: Some(5.0),
                        blocking: false,
                    }],
                },
            ],
        }
    }

    fn validator(schema_pass: bool, quality_pass: bool) -> PreDeployValidator {
        let mut validator = PreDeployValidator::new(config());
        validator.register_handler(
            "exposed_columns_intact",
            Box::new(move |_| Ok((None, schema_pass))),
        );
        validator.register_handler(
            "row_count_delta",
            Box::new(move |_| Ok((Some(3.2), quality_pass))),
        );
        validator
    }

    #[test]
    fn test_all_pass() {
        let result = validator(true, true).run(now());
        assert_eq!(result.overall, OverallStatus::Pass);
        assert!(result.can_deploy);
        assert!(!result.requires_approval);
        assert_eq!(result.exit_code(), 0);
    }

    #[test]
    fn test_blocking_failure_blocks_deploy() {
        let result = validator(false, true).run(now());
        assert_eq!(result.overall, OverallStatus::Block);
        assert!(!result.can_deploy);
        assert_eq!(result.exit_code(), 2);
        assert_eq!(result.results[0].status, CheckStatus::Block);
    }

    #[test]
    fn test_non_blocking_failure_requires_approval() {
        let result = validator(true, false).run(now());
        assert_eq!(result.overall, OverallStatus::Warn);
        assert!(result.can_deploy);
        assert!(result.requires_approval);
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.results[1].status, CheckStatus::Warn);
        assert_eq!(result.results[1].measured_value, Some(3.2));
    }

    #[test]
    fn test_missing_handler_skips() {
        let validator = PreDeployValidator::new(config());
        let result = validator.run(now());
        assert!(result
            .results
            .iter()
            .all(|check| check.status == CheckStatus::Skip));
        // Skips are not failures
        assert_eq!(result.overall, OverallStatus::Pass);
    }

    #[test]
    fn test_handler_error_in_blocking_category_blocks() {
        let mut validator = PreDeployValidator::new(config());
        validator.register_handler(
            "exposed_columns_intact",
            Box::new(|_| Err("warehouse unreachable".to_string())),
        );
        validator.register_handler("row_count_delta", Box::new(|_| Ok((Some(1.0), true))));
        let result = validator.run(now());
        assert_eq!(result.overall, OverallStatus::Block);
        assert!(!result.can_deploy);
    }

    #[test]
    fn test_report_is_machine_readable() {
        let result = validator(true, false).run(now());
        let report = result.to_report_json();
        assert_eq!(report["overall"], "warn");
        assert_eq!(report["can_deploy"], true);
        assert!(report["results"].as_array().unwrap().len() == 2);
    }

    #[test]
    fn test_sign_off_checklist() {
        let checklist = validator(true, true).sign_off_checklist();
        assert_eq!(checklist.len(), 2);
        assert_eq!(checklist[0].0, "schema");
        assert_eq!(checklist[0].1, vec!["exposed_columns_intact".to_string()]);
    }
}
