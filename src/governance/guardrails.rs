//! AI guardrails
//!
//! A closed registry of prohibited actions and required behaviors loaded
//! from configuration. Attempted prohibited actions are refused with a
//! structured refusal; every check, allowed or refused, is appended to
//! the guardrail audit.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{AiRestrictionsConfig, RestrictionCategory};

// ============================================================================
// Refusals
// ============================================================================

/// Structured refusal of a prohibited action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailRefusal {
    /// Request that attempted the action
    pub request_id: String,

    /// The action refused
    pub action: String,

    /// Why it was refused
    pub reason: String,

    /// Refusal category
    pub category: RestrictionCategory,

    /// Where to redirect the request
    pub redirect_to: Option<String>,
}

/// One guardrail audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailCheckRecord {
    /// Request checked
    pub request_id: String,

    /// Action checked
    pub action: String,

    /// Whether it was allowed
    pub allowed: bool,

    /// Refusal detail, when refused
    pub refusal: Option<GuardrailRefusal>,

    /// Check instant
    pub checked_at: DateTime<Utc>,
}

// ============================================================================
// Guardrails
// ============================================================================

/// Enforces the AI restriction registry.
pub struct AiGuardrails {
    config: AiRestrictionsConfig,
    audit: Mutex<Vec<GuardrailCheckRecord>>,
}

impl AiGuardrails {
    /// Create guardrails from configuration.
    pub fn new(config: AiRestrictionsConfig) -> Self {
        Self {
            config,
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Check whether an AI surface may perform an action.
    ///
    /// Allowed actions return `Ok(())`; prohibited ones return the
    /// structured refusal. Both outcomes are appended to the guardrail
    /// audit.
    pub fn check_action(
        &self,
        request_id: &str,
        action: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), GuardrailRefusal> {
        let result = match self.config.restriction(action) {
            Some(restriction) => Err(GuardrailRefusal {
                request_id: request_id.to_string(),
                action: action.to_string(),
                reason: restriction.reason.clone(),
                category: restriction.category,
                redirect_to: restriction.redirect_to.clone(),
            }),
            None => Ok(()),
        };

        let record = GuardrailCheckRecord {
            request_id: request_id.to_string(),
            action: action.to_string(),
            allowed: result.is_ok(),
            refusal: result.as_ref().err().cloned(),
            checked_at: now,
        };

        if let Err(refusal) = &result {
            tracing::warn!(
                request_id,
                action,
                category = ?refusal.category,
                "AI guardrail refused action"
            );
        }

        self.audit.lock().push(record);
        result
    }

    /// Record a refusal raised at runtime by an AI surface itself (as
    /// opposed to one decided here).
    pub fn record_runtime_refusal(&self, refusal: GuardrailRefusal, now: DateTime<Utc>) {
        self.audit.lock().push(GuardrailCheckRecord {
            request_id: refusal.request_id.clone(),
            action: refusal.action.clone(),
            allowed: false,
            refusal: Some(refusal),
            checked_at: now,
        });
    }

    /// Behaviors every AI surface must uphold.
    pub fn required_behaviors(&self) -> &[String] {
        &self.config.required_behaviors
    }

    /// The guardrail audit log.
    pub fn audit_log(&self) -> Vec<GuardrailCheckRecord> {
        self.audit.lock().clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProhibitedAction;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn guardrails() -> AiGuardrails {
        AiGuardrails::new(AiRestrictionsConfig {
            prohibited_actions: vec![
                ProhibitedAction {
                    action: "modify_billing".to_string(),
                    reason: "Billing changes are a business decision".to_string(),
                    category: RestrictionCategory::BusinessDecision,
                    redirect_to: Some("account_manager".to_string()),
                },
                ProhibitedAction {
                    action: "delete_tenant_data".to_string(),
                    reason: "Destructive actions need a human owner".to_string(),
                    category: RestrictionCategory::AccountabilityRequired,
                    redirect_to: None,
                },
            ],
            required_behaviors: vec!["cite_data_sources".to_string()],
        })
    }

    #[test]
    fn test_allowed_action_passes_and_is_logged() {
        let guardrails = guardrails();
        assert!(guardrails.check_action("req-1", "summarize_sales", now()).is_ok());
        let log = guardrails.audit_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].allowed);
    }

    #[test]
    fn test_prohibited_action_refused_with_structure() {
        let guardrails = guardrails();
        let refusal = guardrails
            .check_action("req-2", "modify_billing", now())
            .unwrap_err();
        assert_eq!(refusal.category, RestrictionCategory::BusinessDecision);
        assert_eq!(refusal.redirect_to.as_deref(), Some("account_manager"));
        assert_eq!(refusal.request_id, "req-2");

        let log = guardrails.audit_log();
        assert_eq!(log.len(), 1);
        assert!(!log[0].allowed);
        assert!(log[0].refusal.is_some());
    }

    #[test]
    fn test_runtime_refusal_recorded() {
        let guardrails = guardrails();
        guardrails.record_runtime_refusal(
            GuardrailRefusal {
                request_id: "req-3".to_string(),
                action: "send_customer_email".to_string(),
                reason: "model declined".to_string(),
                category: RestrictionCategory::RequiresHumanJudgment,
                redirect_to: None,
            },
            now(),
        );
        assert_eq!(guardrails.audit_log().len(), 1);
    }

    #[test]
    fn test_every_check_is_audited() {
        let guardrails = guardrails();
        let _ = guardrails.check_action("r1", "ok_action", now());
        let _ = guardrails.check_action("r2", "delete_tenant_data", now());
        let _ = guardrails.check_action("r3", "another_ok", now());
        assert_eq!(guardrails.audit_log().len(), 3);
    }
}
