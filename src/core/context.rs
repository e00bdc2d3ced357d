//! Request-scoped metadata
//!
//! Carries the client-facing facts of a request (IP, user agent, path,
//! method) plus the correlation id that ties audit records, log lines, and
//! denials together.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation id header honored on inbound requests.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Forwarded-for header consulted for the client IP behind proxies.
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// Request metadata attached to audit records and violation reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Client IP address (first hop of X-Forwarded-For when proxied)
    pub ip_address: Option<String>,

    /// Client user agent
    pub user_agent: Option<String>,

    /// Request path
    pub path: String,

    /// HTTP method
    pub method: String,

    /// Correlation id (propagated or freshly generated)
    pub correlation_id: Uuid,
}

impl RequestInfo {
    /// Build request info from headers plus path/method.
    ///
    /// Honors `X-Forwarded-For` (first entry) and `X-Correlation-ID`;
    /// generates a correlation id when none is supplied.
    pub fn from_headers(headers: &HeaderMap, path: &str, method: &str) -> Self {
        let ip_address = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string());

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let correlation_id = headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        Self {
            ip_address,
            user_agent,
            path: path.to_string(),
            method: method.to_string(),
            correlation_id,
        }
    }

    /// Synthesize request info for a background worker or system job.
    pub fn system(job_name: &str) -> Self {
        Self {
            ip_address: None,
            user_agent: None,
            path: format!("worker:{job_name}"),
            method: "SYSTEM".to_string(),
            correlation_id: Uuid::new_v4(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let info = RequestInfo::from_headers(&headers, "/connections", "GET");
        assert_eq!(info.ip_address.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_correlation_id_propagated() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(
            CORRELATION_ID_HEADER,
            HeaderValue::from_str(&id.to_string()).unwrap(),
        );
        let info = RequestInfo::from_headers(&headers, "/", "POST");
        assert_eq!(info.correlation_id, id);
    }

    #[test]
    fn test_correlation_id_generated_when_absent() {
        let headers = HeaderMap::new();
        let a = RequestInfo::from_headers(&headers, "/", "GET");
        let b = RequestInfo::from_headers(&headers, "/", "GET");
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn test_system_info() {
        let info = RequestInfo::system("token_refresh");
        assert_eq!(info.path, "worker:token_refresh");
        assert_eq!(info.method, "SYSTEM");
        assert!(info.ip_address.is_none());
    }
}
