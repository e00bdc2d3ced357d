//! Shared plumbing for the Meridian control plane
//!
//! This module provides the cross-cutting primitives every subsystem
//! depends on:
//!
//! - Error-code registry and the structured denial payload returned to
//!   callers on authorization and state-conflict failures
//! - Request-scoped metadata (IP, user agent, path, correlation id)
//! - Clock abstraction so state machines evaluate against an injectable
//!   instant
//! - Tenant-scoped query helpers

#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod error;
pub mod telemetry;
pub mod time;

pub use context::RequestInfo;
pub use error::{DenialContext, DenialPayload, ErrorCode};
pub use time::{Clock, SystemClock};
