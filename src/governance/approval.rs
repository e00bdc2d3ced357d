//! Approval gate
//!
//! Deterministic Pass/Block decisions for change requests. Block
//! conditions, in order: missing change request, missing approval
//! configuration, SLA expired, pre-approval checklist incomplete,
//! missing required approvals, or an emergency approval that does not
//! satisfy the emergency policy. Every decision is appended to the
//! gate's decision log.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::{ApprovalRequirements, ChangeApprovalConfig};

// ============================================================================
// Inputs
// ============================================================================

/// One granted approval on a change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    /// Who approved
    pub approver: String,

    /// Role the approval was granted under
    pub role: String,

    /// When it was granted
    pub approved_at: DateTime<Utc>,
}

/// Emergency approval attached to a change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyApproval {
    /// Emergency approvers with their roles
    pub approvers: Vec<Approval>,

    /// Incident ticket reference
    pub incident_ticket: Option<String>,

    /// Whether a post-mortem has been committed to
    pub post_mortem_commitment: bool,
}

/// A change request submitted for deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Request id
    pub id: String,

    /// Change type (matched against the approval configuration)
    pub change_type: String,

    /// Submission instant
    pub created_at: DateTime<Utc>,

    /// Checklist items marked complete
    pub checklist_completed: Vec<String>,

    /// Approvals granted
    pub approvals: Vec<Approval>,

    /// Emergency path, if invoked
    pub emergency: Option<EmergencyApproval>,
}

// ============================================================================
// Decision
// ============================================================================

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status")]
pub enum ApprovalDecision {
    /// Change may deploy
    Pass {
        /// Human-readable reason
        reason: String,
    },
    /// Change is blocked
    Block {
        /// Human-readable reason
        reason: String,
    },
}

impl ApprovalDecision {
    /// Whether the decision permits deployment.
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass { .. })
    }

    fn reason(&self) -> &str {
        match self {
            Self::Pass { reason } | Self::Block { reason } => reason,
        }
    }
}

/// One appended decision-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Entry id
    pub audit_id: Uuid,

    /// Decision instant
    pub timestamp: DateTime<Utc>,

    /// Change request evaluated
    pub change_request_id: String,

    /// Decision and reason
    pub decision: ApprovalDecision,
}

// ============================================================================
// Gate
// ============================================================================

/// Approval-gated deployment gate.
pub struct ApprovalGate {
    config: ChangeApprovalConfig,
    change_requests: Mutex<HashMap<String, ChangeRequest>>,
    decision_log: Mutex<Vec<DecisionRecord>>,
}

impl ApprovalGate {
    /// Create a gate from approval configuration.
    pub fn new(config: ChangeApprovalConfig) -> Self {
        Self {
            config,
            change_requests: Mutex::new(HashMap::new()),
            decision_log: Mutex::new(Vec::new()),
        }
    }

    /// Register (or replace) a change request.
    pub fn register_change_request(&self, request: ChangeRequest) {
        self.change_requests
            .lock()
            .insert(request.id.clone(), request);
    }

    /// Evaluate a change request at `now`.
    pub fn validate(&self, change_request_id: &str, now: DateTime<Utc>) -> ApprovalDecision {
        let decision = self.evaluate(change_request_id, now);
        self.record(change_request_id, &decision, now);
        decision
    }

    /// The append-only decision log.
    pub fn decision_log(&self) -> Vec<DecisionRecord> {
        self.decision_log.lock().clone()
    }

    /// Change requests that have not yet passed.
    pub fn pending_requests(&self) -> Vec<String> {
        let log = self.decision_log.lock();
        self.change_requests
            .lock()
            .keys()
            .filter(|id| {
                !log.iter()
                    .any(|record| &record.change_request_id == *id && record.decision.is_pass())
            })
            .cloned()
            .collect()
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn evaluate(&self, change_request_id: &str, now: DateTime<Utc>) -> ApprovalDecision {
        let requests = self.change_requests.lock();
        let Some(request) = requests.get(change_request_id) else {
            return ApprovalDecision::Block {
                reason: format!("Change request '{change_request_id}' not found"),
            };
        };

        let Some(requirements) = self.config.change_types.get(&request.change_type) else {
            return ApprovalDecision::Block {
                reason: format!(
                    "No approval configuration found for type '{}'",
                    request.change_type
                ),
            };
        };

        // SLA: a request older than the configured window must be re-filed.
        let sla_deadline = request.created_at + Duration::hours(requirements.sla_hours);
        if now > sla_deadline {
            return ApprovalDecision::Block {
                reason: format!(
                    "Approval SLA expired at {}; re-file the change request",
                    sla_deadline.to_rfc3339()
                ),
            };
        }

        // Pre-approval checklist must be complete.
        let incomplete: Vec<&String> = requirements
            .checklist
            .iter()
            .filter(|item| !request.checklist_completed.contains(item))
            .collect();
        if !incomplete.is_empty() {
            return ApprovalDecision::Block {
                reason: format!(
                    "Pre-approval checklist incomplete: {}",
                    incomplete
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            };
        }

        // Emergency path, when invoked, replaces the standard approvals.
        if let Some(emergency) = &request.emergency {
            return self.evaluate_emergency(request, requirements, emergency);
        }

        // Standard approvals: enough approvers holding required roles.
        let qualifying = request
            .approvals
            .iter()
            .filter(|approval| requirements.required_approver_roles.contains(&approval.role))
            .count();
        if qualifying < requirements.min_approvals {
            return ApprovalDecision::Block {
                reason: format!(
                    "Missing required approvals: have {qualifying}, need {} from roles [{}]",
                    requirements.min_approvals,
                    requirements.required_approver_roles.join(", ")
                ),
            };
        }

        ApprovalDecision::Pass {
            reason: format!(
                "{qualifying} qualifying approvals satisfy the '{}' policy",
                request.change_type
            ),
        }
    }

    fn evaluate_emergency(
        &self,
        request: &ChangeRequest,
        requirements: &ApprovalRequirements,
        emergency: &EmergencyApproval,
    ) -> ApprovalDecision {
        let Some(policy) = &requirements.emergency else {
            return ApprovalDecision::Block {
                reason: format!(
                    "Emergency approval is not permitted for type '{}'",
                    request.change_type
                ),
            };
        };

        let qualifying = emergency
            .approvers
            .iter()
            .filter(|approval| policy.allowed_approver_roles.contains(&approval.role))
            .count();
        if qualifying < policy.min_approvers {
            return ApprovalDecision::Block {
                reason: format!(
                    "Emergency approval requires {} approvers from roles [{}]; have {qualifying}",
                    policy.min_approvers,
                    policy.allowed_approver_roles.join(", ")
                ),
            };
        }

        if policy.require_incident_ticket
            && emergency
                .incident_ticket
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true)
        {
            return ApprovalDecision::Block {
                reason: "Emergency approval requires an incident ticket reference".to_string(),
            };
        }

        if policy.require_post_mortem_commitment && !emergency.post_mortem_commitment {
            return ApprovalDecision::Block {
                reason: "Emergency approval requires a post-mortem commitment".to_string(),
            };
        }

        ApprovalDecision::Pass {
            reason: "Emergency approval policy satisfied".to_string(),
        }
    }

    fn record(&self, change_request_id: &str, decision: &ApprovalDecision, now: DateTime<Utc>) {
        tracing::info!(
            change_request_id,
            pass = decision.is_pass(),
            reason = decision.reason(),
            "approval gate decision"
        );
        self.decision_log.lock().push(DecisionRecord {
            audit_id: Uuid::new_v4(),
            timestamp: now,
            change_request_id: change_request_id.to_string(),
            decision: decision.clone(),
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmergencyPolicy;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn config() -> ChangeApprovalConfig {
        let mut change_types = HashMap::new();
        change_types.insert(
            "metric_change".to_string(),
            ApprovalRequirements {
                required_approver_roles: vec!["data_lead".to_string(), "eng_lead".to_string()],
                min_approvals: 2,
                checklist: vec!["backfill_plan".to_string(), "dashboard_diff".to_string()],
                sla_hours: 72,
                emergency: Some(EmergencyPolicy {
                    min_approvers: 1,
                    allowed_approver_roles: vec!["sre".to_string()],
                    require_incident_ticket: true,
                    require_post_mortem_commitment: true,
                }),
            },
        );
        ChangeApprovalConfig { change_types }
    }

    fn approved_request() -> ChangeRequest {
        ChangeRequest {
            id: "cr-1".to_string(),
            change_type: "metric_change".to_string(),
            created_at: now() - Duration::hours(1),
            checklist_completed: vec!["backfill_plan".to_string(), "dashboard_diff".to_string()],
            approvals: vec![
                Approval {
                    approver: "ana".to_string(),
                    role: "data_lead".to_string(),
                    approved_at: now(),
                },
                Approval {
                    approver: "ben".to_string(),
                    role: "eng_lead".to_string(),
                    approved_at: now(),
                },
            ],
            emergency: None,
        }
    }

    #[test]
    fn test_missing_request_blocks() {
        let gate = ApprovalGate::new(config());
        let decision = gate.validate("missing", now());
        assert!(!decision.is_pass());
        assert_eq!(gate.decision_log().len(), 1);
    }

    #[test]
    fn test_missing_config_blocks() {
        let gate = ApprovalGate::new(config());
        let mut request = approved_request();
        request.change_type = "unconfigured".to_string();
        gate.register_change_request(request);
        assert!(!gate.validate("cr-1", now()).is_pass());
    }

    #[test]
    fn test_fully_approved_passes() {
        let gate = ApprovalGate::new(config());
        gate.register_change_request(approved_request());
        assert!(gate.validate("cr-1", now()).is_pass());
    }

    #[test]
    fn test_sla_expiry_blocks() {
        let gate = ApprovalGate::new(config());
        let mut request = approved_request();
        request.created_at = now() - Duration::hours(73);
        gate.register_change_request(request);
        let decision = gate.validate("cr-1", now());
        assert!(!decision.is_pass());
        assert!(matches!(decision, ApprovalDecision::Block { reason } if reason.contains("SLA")));
    }

    #[test]
    fn test_incomplete_checklist_blocks() {
        let gate = ApprovalGate::new(config());
        let mut request = approved_request();
        request.checklist_completed = vec!["backfill_plan".to_string()];
        gate.register_change_request(request);
        let decision = gate.validate("cr-1", now());
        assert!(
            matches!(decision, ApprovalDecision::Block { reason } if reason.contains("dashboard_diff"))
        );
    }

    #[test]
    fn test_insufficient_approvals_block() {
        let gate = ApprovalGate::new(config());
        let mut request = approved_request();
        request.approvals.pop();
        gate.register_change_request(request);
        assert!(!gate.validate("cr-1", now()).is_pass());
    }

    #[test]
    fn test_wrong_role_approvals_do_not_count() {
        let gate = ApprovalGate::new(config());
        let mut request = approved_request();
        request.approvals[1].role = "intern".to_string();
        gate.register_change_request(request);
        assert!(!gate.validate("cr-1", now()).is_pass());
    }

    #[test]
    fn test_emergency_policy_enforced() {
        let gate = ApprovalGate::new(config());
        let mut request = approved_request();
        request.approvals.clear();
        request.emergency = Some(EmergencyApproval {
            approvers: vec![Approval {
                approver: "oncall".to_string(),
                role: "sre".to_string(),
                approved_at: now(),
            }],
            incident_ticket: None,
            post_mortem_commitment: true,
        });
        gate.register_change_request(request.clone());
        // Missing incident ticket blocks
        assert!(!gate.validate("cr-1", now()).is_pass());

        // Complete emergency approval passes
        request.emergency = Some(EmergencyApproval {
            approvers: vec![Approval {
                approver: "oncall".to_string(),
                role: "sre".to_string(),
                approved_at: now(),
            }],
            incident_ticket: Some("INC-123".to_string()),
            post_mortem_commitment: true,
        });
        gate.register_change_request(request);
        assert!(gate.validate("cr-1", now()).is_pass());
    }

    #[test]
    fn test_every_decision_is_logged() {
        let gate = ApprovalGate::new(config());
        gate.register_change_request(approved_request());
        gate.validate("cr-1", now());
        gate.validate("missing", now());
        assert_eq!(gate.decision_log().len(), 2);
    }
}
