//! Governance core
//!
//! Deterministic engines guarding deployments and platform changes:
//!
//! - **Approval gate** (`approval`): Pass/Block decisions from change
//!   requests and approval configuration
//! - **Metric versioning** (`versioning`): deprecation warnings and
//!   sunset hard blocks at metric resolution
//! - **Rollback orchestrator** (`rollback`): authority-checked rollback
//!   state machine with gradual scopes and verification
//! - **Pre-deploy validator** (`validator`): config-driven checks with a
//!   machine-readable report for CI
//! - **AI guardrails** (`guardrails`): a closed registry of prohibited
//!   actions with structured refusals
//!
//! Every engine records its decisions in an append-only decision log.

use thiserror::Error;

pub mod approval;
pub mod guardrails;
pub mod rollback;
pub mod validator;
pub mod versioning;

pub use approval::{ApprovalDecision, ApprovalGate, ChangeRequest};
pub use guardrails::{AiGuardrails, GuardrailRefusal};
pub use rollback::{RollbackOrchestrator, RollbackRequest, RollbackScope, RollbackState};
pub use validator::{CheckResult, CheckStatus, PreDeployValidator, ValidationResult};
pub use versioning::{MetricResolution, MetricVersionResolver, WarningLevel};

// ============================================================================
// Error Types
// ============================================================================

/// Governance subsystem errors
#[derive(Error, Debug)]
pub enum GovernanceError {
    /// Metric not present in the registry
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    /// Version not present for the metric
    #[error("Unknown version '{version}' for metric '{metric}'")]
    UnknownVersion {
        /// Metric name
        metric: String,
        /// Requested version
        version: String,
    },

    /// Resolution of a sunset metric version is a hard block
    #[error("Metric '{metric}' version '{version}' has been sunset. Please migrate to version '{current_version}'.")]
    MetricSunset {
        /// Metric name
        metric: String,
        /// Sunset version
        version: String,
        /// Version to migrate to
        current_version: String,
    },

    /// Caller role is not authorized for the operation
    #[error("Role '{0}' is not authorized for rollback operations")]
    NotAuthorized(String),

    /// Referenced rollback does not exist
    #[error("Rollback not found: {0}")]
    RollbackNotFound(String),

    /// Reversal requested for a rollback not marked reversible
    #[error("Rollback '{0}' was not requested as reversible")]
    NotReversible(String),

    /// Operation invalid for the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for governance operations
pub type Result<T> = std::result::Result<T, GovernanceError>;
