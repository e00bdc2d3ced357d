//! Data freshness and data quality
//!
//! The freshness state machine, anomaly checks, and DQ incident
//! lifecycle:
//!
//! - **Availability** (`availability`): per (tenant, source) state
//!   machine computed purely from sync metadata and SLA thresholds,
//!   never set manually
//! - **Anomaly checks** (`anomaly`): a registered set of typed checks
//!   returning a common result shape
//! - **Incidents** (`incidents`): open → acknowledged → resolved
//!   lifecycle with blocking banners and sync-health summaries

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod anomaly;
pub mod availability;
pub mod incidents;

pub use anomaly::{AnomalyCheck, AnomalyResult};
pub use availability::{AvailabilityResult, DataAvailabilityService};
pub use incidents::{DqIncident, IncidentService, IncidentStatus};

// ============================================================================
// Error Types
// ============================================================================

/// Freshness/DQ subsystem errors
#[derive(Error, Debug)]
pub enum FreshnessError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Referenced record not found within the tenant scope
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for freshness operations
pub type Result<T> = std::result::Result<T, FreshnessError>;

// ============================================================================
// States
// ============================================================================

/// Availability state per (tenant, source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "availability_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityState {
    /// Data within the SLA window
    Fresh,
    /// SLA exceeded but within the grace window
    Stale,
    /// Grace window exceeded, ingestion failed, or never synced
    Unavailable,
}

impl AvailabilityState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Why a source is in its availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "availability_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityReason {
    /// Latest sync within SLA
    SyncOk,
    /// Warn threshold exceeded
    SlaExceeded,
    /// Error threshold exceeded
    GraceWindowExceeded,
    /// Latest sync failed
    SyncFailed,
    /// No sync has ever completed
    NeverSynced,
    /// Historical backfill in progress
    BackfillInProgress,
}

impl AvailabilityReason {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncOk => "sync_ok",
            Self::SlaExceeded => "sla_exceeded",
            Self::GraceWindowExceeded => "grace_window_exceeded",
            Self::SyncFailed => "sync_failed",
            Self::NeverSynced => "never_synced",
            Self::BackfillInProgress => "backfill_in_progress",
        }
    }
}

/// Incident severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dq_severity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DqSeverity {
    /// Noteworthy, no action required yet
    Warning,
    /// Needs attention
    High,
    /// Dashboards are impacted
    Critical,
}

impl DqSeverity {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ============================================================================
// State Computation
// ============================================================================

/// Compute the availability state from sync metadata and thresholds.
///
/// Pure; persistence and auditing happen in the service. The transition
/// boundaries are inclusive: exactly at the warn threshold is stale,
/// exactly at the error threshold is unavailable.
pub fn compute_state(
    last_sync_status: Option<&str>,
    minutes_since_sync: Option<i64>,
    warn_threshold: i64,
    error_threshold: i64,
) -> (AvailabilityState, AvailabilityReason) {
    let Some(minutes) = minutes_since_sync else {
        return (AvailabilityState::Unavailable, AvailabilityReason::NeverSynced);
    };

    let last_failed = matches!(last_sync_status, Some("failed"));
    if last_failed && minutes >= warn_threshold {
        return (AvailabilityState::Unavailable, AvailabilityReason::SyncFailed);
    }
    if minutes >= error_threshold {
        return (
            AvailabilityState::Unavailable,
            AvailabilityReason::GraceWindowExceeded,
        );
    }
    if minutes >= warn_threshold {
        return (AvailabilityState::Stale, AvailabilityReason::SlaExceeded);
    }
    (AvailabilityState::Fresh, AvailabilityReason::SyncOk)
}

/// Incident severity for a stale source.
///
/// Multiplicative ladder over the warn threshold: up to 2× is a warning,
/// up to 4x is high, beyond 4x (or any staleness of a critical source)
/// is critical.
pub fn severity_for_staleness(
    minutes_since_sync: i64,
    warn_threshold: i64,
    is_critical_source: bool,
) -> DqSeverity {
    if is_critical_source {
        return DqSeverity::Critical;
    }
    if warn_threshold <= 0 {
        return DqSeverity::Critical;
    }
    let ratio = minutes_since_sync as f64 / warn_threshold as f64;
    if ratio > 4.0 {
        DqSeverity::Critical
    } else if ratio > 2.0 {
        DqSeverity::High
    } else {
        DqSeverity::Warning
    }
}

// ============================================================================
// Source Mapping
// ============================================================================

/// Map a connection's `source_type` to its SLA config key. Fixed table;
/// unknown source types have no SLA and are skipped by evaluation.
pub fn resolve_sla_key(connection_source_type: &str) -> Option<&'static str> {
    match connection_source_type.to_lowercase().as_str() {
        "shopify" | "source-shopify" => Some("shopify_orders"),
        "facebook" | "meta" => Some("facebook_ads"),
        "google" | "google_ads" => Some("google_ads"),
        "tiktok" => Some("tiktok_ads"),
        "snapchat" => Some("snapchat_ads"),
        "klaviyo" | "shopify_email" => Some("email"),
        "attentive" | "postscript" | "smsbump" => Some("sms"),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const WARN: i64 = 120;
    const ERROR: i64 = 480;

    #[test]
    fn test_never_synced() {
        assert_eq!(
            compute_state(None, None, WARN, ERROR),
            (AvailabilityState::Unavailable, AvailabilityReason::NeverSynced)
        );
    }

    #[test]
    fn test_freshness_ladder_boundaries() {
        // warn - 1 → fresh
        assert_eq!(
            compute_state(Some("succeeded"), Some(WARN - 1), WARN, ERROR),
            (AvailabilityState::Fresh, AvailabilityReason::SyncOk)
        );
        // exactly warn → stale
        assert_eq!(
            compute_state(Some("succeeded"), Some(WARN), WARN, ERROR),
            (AvailabilityState::Stale, AvailabilityReason::SlaExceeded)
        );
        // error - 1 → stale
        assert_eq!(
            compute_state(Some("succeeded"), Some(ERROR - 1), WARN, ERROR),
            (AvailabilityState::Stale, AvailabilityReason::SlaExceeded)
        );
        // exactly error → unavailable
        assert_eq!(
            compute_state(Some("succeeded"), Some(ERROR), WARN, ERROR),
            (
                AvailabilityState::Unavailable,
                AvailabilityReason::GraceWindowExceeded
            )
        );
    }

    #[test]
    fn test_failed_sync_goes_unavailable_at_warn() {
        assert_eq!(
            compute_state(Some("failed"), Some(WARN), WARN, ERROR),
            (AvailabilityState::Unavailable, AvailabilityReason::SyncFailed)
        );
        // A recent failure has not crossed warn yet; data is still fresh
        assert_eq!(
            compute_state(Some("failed"), Some(5), WARN, ERROR),
            (AvailabilityState::Fresh, AvailabilityReason::SyncOk)
        );
    }

    #[test]
    fn test_severity_ladder() {
        assert_eq!(severity_for_staleness(200, WARN, false), DqSeverity::Warning);
        assert_eq!(severity_for_staleness(240, WARN, false), DqSeverity::Warning);
        assert_eq!(severity_for_staleness(241, WARN, false), DqSeverity::High);
        assert_eq!(severity_for_staleness(480, WARN, false), DqSeverity::High);
        assert_eq!(severity_for_staleness(481, WARN, false), DqSeverity::Critical);
    }

    #[test]
    fn test_critical_source_is_always_critical() {
        assert_eq!(severity_for_staleness(121, WARN, true), DqSeverity::Critical);
    }

    #[test]
    fn test_sla_key_mapping() {
        assert_eq!(resolve_sla_key("shopify"), Some("shopify_orders"));
        assert_eq!(resolve_sla_key("facebook"), Some("facebook_ads"));
        assert_eq!(resolve_sla_key("META"), Some("facebook_ads"));
        assert_eq!(resolve_sla_key("klaviyo"), Some("email"));
        assert_eq!(resolve_sla_key("postscript"), Some("sms"));
        assert_eq!(resolve_sla_key("unknown_source"), None);
    }
}
