//! # Meridian - Multi-tenant Control Plane
//!
//! The trust, lifecycle, and freshness boundary around a Shopify
//! analytics pipeline. Meridian computes no analytics itself; it owns
//! tenant isolation, billing-driven access, and data-correctness
//! guarantees.
//!
//! ## Architecture
//!
//! - `core`: errors, denial payloads, request context, clock
//! - `audit`: append-only audit log with PII redaction and fallback
//! - `config`: collaborator-parsed configuration structs
//! - `entitlements`: fail-closed, single-flight entitlement engine
//! - `identity`: identity-provider mirror and role mapping
//! - `guard`: per-request tenant binding with DB-as-truth enforcement
//! - `connectors`: connection registry, credential vault, token manager
//! - `freshness`: availability state machine, anomaly checks, incidents
//! - `billing`: subscription state machine, webhook pipeline, reconciliation
//! - `governance`: approval gate, metric versioning, rollback, pre-deploy
//!   validation, AI guardrails
//! - `dashboards`: versioned custom dashboards with optimistic locking
//! - `datasets`: schema-compatibility gate for BI datasets
//! - `workers`: in-process periodic jobs

#![warn(missing_docs)]
#![warn(clippy::all)]

// Shared plumbing
pub mod core;

// Leaf: everything writes to it
pub mod audit;

// Configuration structs
pub mod config;

// Entitlement resolution
pub mod entitlements;

// Identity mirror
pub mod identity;

// Request-edge tenant guard
pub mod guard;

// Ingestion connectors
pub mod connectors;

// Freshness and data quality
pub mod freshness;

// Billing lifecycle
pub mod billing;

// Governance engines
pub mod governance;

// Custom dashboards
pub mod dashboards;

// Dataset compatibility gate
pub mod datasets;

// Periodic workers
pub mod workers;

// Re-export commonly used types
pub use crate::core::{DenialPayload, ErrorCode, RequestInfo};
pub use audit::{AuditAction, AuditEvent, AuditLog, AuditOutcome};
pub use entitlements::{BillingState, EntitlementEngine, ResolvedEntitlement};
pub use guard::{Claims, GuardContext, TenantGuard};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
