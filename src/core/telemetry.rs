//! Tracing initialization
//!
//! Structured logging setup for binaries embedding the control plane.
//! Field conventions: every tenant-scoped event carries `tenant_id`, and
//! request-path events carry `correlation_id`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Honors `RUST_LOG`; defaults to `info` with JSON output so the audit
/// fallback channel (`audit.fallback` target) is machine-collectable.
/// Returns whether this call installed the subscriber (false if one was
/// already set, e.g. by a test harness).
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing::subscriber::set_global_default(
        fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .finish(),
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_existing_subscriber() {
        let first = init_tracing();
        let second = init_tracing();
        // At most one call installs the subscriber; neither panics.
        assert!(!(first && second));
    }
}
