//! Rollback orchestrator
//!
//! State machine: `pending → validating_authority → executing →
//! verifying → (completed | failed | paused | rolled_forward)`.
//!
//! Rollback requests require an authorized role. Scopes: global, tenant
//! subset, or gradual (canary percentages with success criteria between
//! batches). Actions delegate to registered handlers; a failed action
//! does not stop subsequent actions but marks the overall outcome
//! failed. A completed rollback may be reversed only when the original
//! request was explicitly marked reversible.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::RollbackConfig;

use super::{GovernanceError, Result};

// ============================================================================
// Request Shapes
// ============================================================================

/// Scope of a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum RollbackScope {
    /// All tenants at once
    Global,
    /// A named subset of tenants
    TenantSubset {
        /// Tenants in scope
        tenant_ids: Vec<Uuid>,
    },
    /// Canary batches with success criteria between them
    Gradual,
}

/// One action within a rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAction {
    /// Handler name (matched against the registry)
    pub action_type: String,

    /// Target expression; `{version}` interpolates the target version
    pub target: String,
}

/// A rollback request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    /// Request id
    pub id: String,

    /// Who requested the rollback
    pub requested_by: String,

    /// Role of the requester (checked against the authorized list)
    pub requester_role: String,

    /// Why
    pub reason: String,

    /// Version being rolled back to
    pub target_version: String,

    /// Scope
    pub scope: RollbackScope,

    /// Ordered actions
    pub actions: Vec<RollbackAction>,

    /// Whether this rollback may later be reversed. Reversal of a
    /// request without this flag is rejected rather than guessed.
    pub reversible: bool,
}

// ============================================================================
// States & Results
// ============================================================================

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackState {
    /// Accepted, not yet validated
    Pending,
    /// Authority check in progress
    ValidatingAuthority,
    /// Actions executing
    Executing,
    /// Verification checks running
    Verifying,
    /// Finished successfully
    Completed,
    /// Finished with failures
    Failed,
    /// Paused by an operator
    Paused,
    /// Reversed by a later rollback
    RolledForward,
}

/// Result of one executed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Handler name
    pub action_type: String,

    /// Interpolated target
    pub target: String,

    /// Whether the handler reported success
    pub succeeded: bool,
}

/// Result of the verification phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Checks that passed
    pub passed: Vec<String>,

    /// Checks that failed
    pub failed: Vec<String>,
}

/// Tracked state of one rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// The originating request
    pub request: RollbackRequest,

    /// Current state
    pub state: RollbackState,

    /// Per-action results
    pub action_results: Vec<ActionResult>,

    /// Verification outcome, when reached
    pub verification: Option<VerificationResult>,

    /// Batches executed (gradual scope)
    pub batches_executed: Vec<u8>,

    /// State transition log
    pub transitions: Vec<(RollbackState, DateTime<Utc>)>,

    /// Id of the reversal rollback, if reversed
    pub reversed_by: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Executes one action type. Returns whether the action succeeded.
pub type ActionHandler = Box<dyn Fn(&RollbackAction) -> bool + Send + Sync>;

/// Evaluates one verification or batch-success check by name.
pub type CheckHandler = Box<dyn Fn(&str) -> bool + Send + Sync>;

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives rollbacks through the state machine.
pub struct RollbackOrchestrator {
    config: RollbackConfig,
    handlers: HashMap<String, ActionHandler>,
    check: CheckHandler,
    records: Mutex<HashMap<String, RollbackRecord>>,
}

impl RollbackOrchestrator {
    /// Create an orchestrator. `check` evaluates verification and batch
    /// success criteria by name.
    pub fn new(config: RollbackConfig, check: CheckHandler) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
            check,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler for an action type.
    pub fn register_handler(&mut self, action_type: impl Into<String>, handler: ActionHandler) {
        self.handlers.insert(action_type.into(), handler);
    }

    /// Validate that the requester may initiate rollbacks.
    pub fn validate_authority(&self, request: &RollbackRequest) -> Result<()> {
        if self
            .config
            .authorized_roles
            .iter()
            .any(|role| role == &request.requester_role)
        {
            Ok(())
        } else {
            Err(GovernanceError::NotAuthorized(request.requester_role.clone()))
        }
    }

    /// Run a rollback to completion (or failure).
    pub fn initiate(&self, request: RollbackRequest, now: DateTime<Utc>) -> Result<RollbackRecord> {
        let mut record = RollbackRecord {
            request: request.clone(),
            state: RollbackState::Pending,
            action_results: Vec::new(),
            verification: None,
            batches_executed: Vec::new(),
            transitions: vec![(RollbackState::Pending, now)],
            reversed_by: None,
        };

        self.transition(&mut record, RollbackState::ValidatingAuthority, now);
        if let Err(err) = self.validate_authority(&request) {
            self.transition(&mut record, RollbackState::Failed, now);
            self.store(record);
            return Err(err);
        }

        self.transition(&mut record, RollbackState::Executing, now);
        let all_succeeded = match &request.scope {
            RollbackScope::Global | RollbackScope::TenantSubset { .. } => {
                self.execute_actions(&mut record)
            }
            RollbackScope::Gradual => self.execute_gradual(&mut record),
        };

        self.transition(&mut record, RollbackState::Verifying, now);
        let verification = self.verify();
        let verification_passed = verification.failed.is_empty();
        record.verification = Some(verification);

        let final_state = if all_succeeded && verification_passed {
            RollbackState::Completed
        } else {
            RollbackState::Failed
        };
        self.transition(&mut record, final_state, now);

        self.store(record.clone());
        Ok(record)
    }

    /// Pause an executing rollback.
    pub fn pause(&self, rollback_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(rollback_id)
            .ok_or_else(|| GovernanceError::RollbackNotFound(rollback_id.to_string()))?;
        if record.state != RollbackState::Executing {
            return Err(GovernanceError::InvalidState(format!(
                "cannot pause rollback in state {:?}",
                record.state
            )));
        }
        record.state = RollbackState::Paused;
        record.transitions.push((RollbackState::Paused, now));
        Ok(())
    }

    /// Resume a paused rollback into execution.
    pub fn resume(&self, rollback_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(rollback_id)
            .ok_or_else(|| GovernanceError::RollbackNotFound(rollback_id.to_string()))?;
        if record.state != RollbackState::Paused {
            return Err(GovernanceError::InvalidState(format!(
                "cannot resume rollback in state {:?}",
                record.state
            )));
        }
        record.state = RollbackState::Executing;
        record.transitions.push((RollbackState::Executing, now));
        Ok(())
    }

    /// Reverse a completed rollback by re-entering with a new request.
    ///
    /// Requires the original to be completed and explicitly reversible;
    /// the original moves to `rolled_forward`.
    pub fn reverse(
        &self,
        original_id: &str,
        reversal: RollbackRequest,
        now: DateTime<Utc>,
    ) -> Result<RollbackRecord> {
        {
            let records = self.records.lock();
            let original = records
                .get(original_id)
                .ok_or_else(|| GovernanceError::RollbackNotFound(original_id.to_string()))?;
            if original.state != RollbackState::Completed {
                return Err(GovernanceError::InvalidState(format!(
                    "only completed rollbacks can be reversed; '{original_id}' is {:?}",
                    original.state
                )));
            }
            if !original.request.reversible {
                return Err(GovernanceError::NotReversible(original_id.to_string()));
            }
        }

        let reversal_record = self.initiate(reversal, now)?;

        let mut records = self.records.lock();
        if let Some(original) = records.get_mut(original_id) {
            original.state = RollbackState::RolledForward;
            original.transitions.push((RollbackState::RolledForward, now));
            original.reversed_by = Some(reversal_record.request.id.clone());
        }

        Ok(reversal_record)
    }

    /// Rollbacks currently executing or paused.
    pub fn active_rollbacks(&self) -> Vec<RollbackRecord> {
        self.records
            .lock()
            .values()
            .filter(|record| {
                matches!(
                    record.state,
                    RollbackState::Executing | RollbackState::Paused | RollbackState::Verifying
                )
            })
            .cloned()
            .collect()
    }

    /// Full rollback history.
    pub fn history(&self) -> Vec<RollbackRecord> {
        self.records.lock().values().cloned().collect()
    }

    /// A single record by id.
    pub fn get(&self, rollback_id: &str) -> Option<RollbackRecord> {
        self.records.lock().get(rollback_id).cloned()
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Execute all actions. Failures continue subsequent actions.
    fn execute_actions(&self, record: &mut RollbackRecord) -> bool {
        let mut all_succeeded = true;
        let actions = record.request.actions.clone();
        for action in &actions {
            let target = action
                .target
                .replace("{version}", &record.request.target_version);
            let succeeded = match self.handlers.get(&action.action_type) {
                Some(handler) => handler(action),
                None => {
                    tracing::warn!(
                        action_type = action.action_type,
                        "no handler registered for rollback action"
                    );
                    false
                }
            };
            if !succeeded {
                all_succeeded = false;
            }
            record.action_results.push(ActionResult {
                action_type: action.action_type.clone(),
                target,
                succeeded,
            });
        }
        all_succeeded
    }

    /// Execute gradually: each canary batch runs the actions, then the
    /// batch success criteria gate the next batch.
    fn execute_gradual(&self, record: &mut RollbackRecord) -> bool {
        let batches = self.config.gradual_batch_percentages.clone();
        for percent in batches {
            let batch_ok = self.execute_actions(record);
            record.batches_executed.push(percent);
            if !batch_ok {
                return false;
            }
            let criteria_ok = self
                .config
                .batch_success_criteria
                .iter()
                .all(|criterion| (self.check)(criterion));
            if !criteria_ok {
                tracing::warn!(percent, "gradual rollback halted: batch criteria failed");
                return false;
            }
        }
        true
    }

    fn verify(&self) -> VerificationResult {
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        for check in &self.config.verification_checks {
            if (self.check)(check) {
                passed.push(check.clone());
            } else {
                failed.push(check.clone());
            }
        }
        VerificationResult { passed, failed }
    }

    fn transition(&self, record: &mut RollbackRecord, state: RollbackState, now: DateTime<Utc>) {
        tracing::info!(
            rollback_id = record.request.id,
            from = ?record.state,
            to = ?state,
            "rollback state transition"
        );
        record.state = state;
        record.transitions.push((state, now));
    }

    fn store(&self, record: RollbackRecord) {
        self.records
            .lock()
            .insert(record.request.id.clone(), record);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn config() -> RollbackConfig {
        RollbackConfig {
            authorized_roles: vec!["sre".to_string()],
            verification_checks: vec!["dashboards_render".to_string()],
            gradual_batch_percentages: vec![10, 50, 100],
            batch_success_criteria: vec!["error_rate_ok".to_string()],
        }
    }

    fn request(id: &str, reversible: bool) -> RollbackRequest {
        RollbackRequest {
            id: id.to_string(),
            requested_by: "oncall".to_string(),
            requester_role: "sre".to_string(),
            reason: "bad metric deploy".to_string(),
            target_version: "v1".to_string(),
            scope: RollbackScope::Global,
            actions: vec![RollbackAction {
                action_type: "repoint_view".to_string(),
                target: "fct_revenue_{version}".to_string(),
            }],
            reversible,
        }
    }

    fn orchestrator(check_pass: bool) -> RollbackOrchestrator {
        let mut orchestrator = RollbackOrchestrator::new(config(), Box::new(move |_| check_pass));
        orchestrator.register_handler("repoint_view", Box::new(|_| true));
        orchestrator
    }

    #[test]
    fn test_unauthorized_role_rejected() {
        let orchestrator = orchestrator(true);
        let mut bad = request("rb-1", false);
        bad.requester_role = "viewer".to_string();
        assert!(matches!(
            orchestrator.initiate(bad, now()),
            Err(GovernanceError::NotAuthorized(_))
        ));
    }

    #[test]
    fn test_successful_rollback_completes() {
        let orchestrator = orchestrator(true);
        let record = orchestrator.initiate(request("rb-1", false), now()).unwrap();
        assert_eq!(record.state, RollbackState::Completed);
        assert!(record.action_results.iter().all(|result| result.succeeded));
        // Target interpolation applied
        assert_eq!(record.action_results[0].target, "fct_revenue_v1");
        // Walked the full ladder
        let states: Vec<RollbackState> = record.transitions.iter().map(|(s, _)| *s).collect();
        assert!(states.contains(&RollbackState::ValidatingAuthority));
        assert!(states.contains(&RollbackState::Executing));
        assert!(states.contains(&RollbackState::Verifying));
    }

    #[test]
    fn test_failed_action_continues_but_fails_overall() {
        let mut orchestrator = orchestrator(true);
        orchestrator.register_handler("failing", Box::new(|_| false));
        let mut req = request("rb-2", false);
        req.actions.insert(
            0,
            RollbackAction {
                action_type: "failing".to_string(),
                target: "x".to_string(),
            },
        );
        let record = orchestrator.initiate(req, now()).unwrap();
        assert_eq!(record.state, RollbackState::Failed);
        // Second action still ran
        assert_eq!(record.action_results.len(), 2);
        assert!(record.action_results[1].succeeded);
    }

    #[test]
    fn test_verification_failure_fails() {
        let orchestrator = orchestrator(false);
        let record = orchestrator.initiate(request("rb-3", false), now()).unwrap();
        assert_eq!(record.state, RollbackState::Failed);
        let verification = record.verification.unwrap();
        assert_eq!(verification.failed, vec!["dashboards_render".to_string()]);
    }

    #[test]
    fn test_gradual_executes_batches() {
        let orchestrator = orchestrator(true);
        let mut req = request("rb-4", false);
        req.scope = RollbackScope::Gradual;
        let record = orchestrator.initiate(req, now()).unwrap();
        assert_eq!(record.batches_executed, vec![10, 50, 100]);
        assert_eq!(record.state, RollbackState::Completed);
    }

    #[test]
    fn test_gradual_halts_on_failed_criteria() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_inner = calls.clone();
        let mut orchestrator = RollbackOrchestrator::new(
            config(),
            // Batch criteria fail on the second evaluation
            Box::new(move |name| {
                if name == "error_rate_ok" {
                    calls_inner.fetch_add(1, Ordering::SeqCst) == 0
                } else {
                    true
                }
            }),
        );
        orchestrator.register_handler("repoint_view", Box::new(|_| true));
        let mut req = request("rb-5", false);
        req.scope = RollbackScope::Gradual;
        let record = orchestrator.initiate(req, now()).unwrap();
        assert_eq!(record.state, RollbackState::Failed);
        assert_eq!(record.batches_executed, vec![10, 50]);
    }

    #[test]
    fn test_reverse_requires_reversible_flag() {
        let orchestrator = orchestrator(true);
        orchestrator.initiate(request("rb-6", false), now()).unwrap();
        let err = orchestrator
            .reverse("rb-6", request("rb-6-reverse", false), now())
            .unwrap_err();
        assert!(matches!(err, GovernanceError::NotReversible(_)));
    }

    #[test]
    fn test_reverse_completed_reversible_rollback() {
        let orchestrator = orchestrator(true);
        orchestrator.initiate(request("rb-7", true), now()).unwrap();
        let reversal = orchestrator
            .reverse("rb-7", request("rb-7-reverse", false), now())
            .unwrap();
        assert_eq!(reversal.state, RollbackState::Completed);

        let original = orchestrator.get("rb-7").unwrap();
        assert_eq!(original.state, RollbackState::RolledForward);
        assert_eq!(original.reversed_by.as_deref(), Some("rb-7-reverse"));
    }

    #[test]
    fn test_pause_resume_guards() {
        let orchestrator = orchestrator(true);
        orchestrator.initiate(request("rb-8", false), now()).unwrap();
        // Completed rollbacks cannot be paused
        assert!(orchestrator.pause("rb-8", now()).is_err());
        assert!(orchestrator.pause("missing", now()).is_err());
        assert!(orchestrator.resume("rb-8", now()).is_err());
    }
}
