//! Guard middleware
//!
//! Axum adapter placing the tenant guard at the request edge. The
//! authentication collaborator has already verified the bearer token and
//! stored [`Claims`] in request extensions; this layer binds the request
//! to one active tenant and attaches the resolved [`GuardContext`] for
//! downstream handlers.
//!
//! Route descriptors can also declare a required feature; the entitlement
//! engine is consulted after the guard passes.
//!
//! [`with_edge_layers`] assembles the full edge stack around a router:
//! HTTP tracing, correlation-id propagation, CORS, and the guard itself.
//!
//! # Examples
//!
//! ```rust,ignore
//! use axum::{routing::get, Router};
//! use meridian::guard::middleware::{with_edge_layers, GuardLayer};
//!
//! let app = with_edge_layers(
//!     Router::new().route("/connections", get(list_connections)),
//!     guard_layer,
//! );
//! ```

use axum::{
    extract::{Request, State},
    http::{header, header::HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::core::{context::CORRELATION_ID_HEADER, DenialPayload, ErrorCode, RequestInfo};
use crate::entitlements::EntitlementEngine;

use super::{Claims, GuardError, TenantGuard};

/// Header carrying the desired active tenant when the route has no
/// explicit tenant path segment.
pub const ACTIVE_TENANT_HEADER: &str = "X-Active-Tenant";

/// Shared state for the guard middleware.
#[derive(Clone)]
pub struct GuardLayer {
    /// The guard authority
    pub guard: Arc<TenantGuard>,

    /// Entitlement engine for per-route feature requirements
    pub entitlements: Arc<EntitlementEngine>,

    /// Plan catalog used to name the required plan in denials
    pub catalog: Arc<crate::config::PlanCatalogConfig>,
}

/// Per-route descriptor declaring what the route requires beyond a valid
/// tenant context.
#[derive(Debug, Clone, Default)]
pub struct RouteRequirements {
    /// Feature key that must be granted for the route
    pub required_feature: Option<String>,
}

/// Enforce tenant context on a request.
///
/// Expects `Claims` in request extensions (inserted by the auth layer).
/// On success, the request gains a `GuardContext` extension. Denials are
/// rendered as the structured payload with 401/403 semantics; internal
/// errors fail closed as 503 with `entitlement_eval_failed`-style
/// retryability.
pub async fn guard_middleware(
    State(layer): State<GuardLayer>,
    mut request: Request,
    next: Next,
) -> Response {
    let info = RequestInfo::from_headers(
        request.headers(),
        request.uri().path(),
        request.method().as_str(),
    );

    let claims = match request.extensions().get::<Claims>().cloned() {
        Some(claims) => claims,
        None => {
            return denial_response(DenialPayload::new(
                ErrorCode::AuthRequired,
                "Authentication required.",
            ));
        }
    };

    let active_tenant = request
        .headers()
        .get(HeaderName::from_static("x-active-tenant"))
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .or_else(|| implicit_tenant(&claims));

    let context = match layer.guard.enforce(&claims, active_tenant, &info).await {
        Ok(context) => context,
        Err(GuardError::Denied(payload)) => return denial_response(*payload),
        Err(GuardError::Database(err)) => {
            // Fail closed: an enforcement error is a denial, not an allow.
            tracing::error!(error = %err, "guard enforcement failed; denying");
            return denial_response(DenialPayload::new(
                ErrorCode::EntitlementEvalFailed,
                "Authorization is temporarily unavailable. Please retry.",
            ));
        }
    };

    // Per-route feature requirement, declared via extensions by the router.
    if let Some(requirements) = request.extensions().get::<RouteRequirements>() {
        if let Some(feature) = requirements.required_feature.clone() {
            match layer.entitlements.get_entitlements(context.tenant_id).await {
                Ok(resolved) => {
                    if let Err(denial) = resolved.check_feature_access(&feature, &layer.catalog) {
                        return denial_response(denial);
                    }
                }
                Err(err) => return denial_response(err.to_denial()),
            }
        }
    }

    request.extensions_mut().insert(context);
    next.run(request).await
}

/// Single-tenant tokens imply their tenant; multi-tenant tokens require
/// an explicit selection.
fn implicit_tenant(claims: &Claims) -> Option<Uuid> {
    match claims.allowed_tenant_ids.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

/// Map a denial payload to a response with protocol-appropriate status.
fn denial_response(payload: DenialPayload) -> Response {
    let status = status_for(payload.error_code);
    (status, Json(payload)).into_response()
}

/// 401 for authentication, 503 for retryable fail-closed, 404 for
/// existence-hiding, 402 for payment, 403 otherwise.
fn status_for(code: ErrorCode) -> StatusCode {
    if code.is_authentication() {
        return StatusCode::UNAUTHORIZED;
    }
    if code.is_retryable_server_failure() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match code {
        ErrorCode::TenantNotFound | ErrorCode::AccountNotFound => StatusCode::NOT_FOUND,
        ErrorCode::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
        _ => StatusCode::FORBIDDEN,
    }
}

// ============================================================================
// Correlation ID Middleware
// ============================================================================

/// Propagate the correlation id: honor an inbound `X-Correlation-ID`,
/// generate one otherwise, and echo it on the response so clients and
/// support can tie a request to its audit records.
///
/// A generated id is written back onto the request headers so the
/// guard's `RequestInfo` (and every audit record) carries the same id
/// the client receives.
pub async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let header_value = HeaderValue::from_str(&correlation_id.to_string()).ok();
    if let Some(value) = header_value.clone() {
        request
            .headers_mut()
            .insert(HeaderName::from_static("x-correlation-id"), value);
    }
    request.extensions_mut().insert(correlation_id);

    let mut response = next.run(request).await;
    if let Some(value) = header_value {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-correlation-id"), value);
    }
    response
}

// ============================================================================
// CORS
// ============================================================================

/// CORS layer for development: any origin, the methods and headers the
/// control plane speaks, correlation id exposed for support tickets.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-active-tenant"),
            HeaderName::from_static("x-correlation-id"),
        ])
        .expose_headers([HeaderName::from_static("x-correlation-id")])
        .max_age(Duration::from_secs(3600))
}

/// Production CORS layer restricted to specific origins, with
/// credentials allowed.
pub fn cors_layer_with_origins(origins: Vec<String>) -> CorsLayer {
    let allowed_origins: Vec<HeaderValue> = origins
        .into_iter()
        .filter_map(|origin| HeaderValue::from_str(&origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-active-tenant"),
            HeaderName::from_static("x-correlation-id"),
        ])
        .expose_headers([HeaderName::from_static("x-correlation-id")])
        .max_age(Duration::from_secs(3600))
        .allow_credentials(true)
}

// ============================================================================
// Edge Stack
// ============================================================================

/// Wrap a router with the full request-edge stack, outermost first:
/// HTTP tracing, correlation-id propagation, CORS, then the tenant
/// guard. Every authenticated route goes through this assembly.
pub fn with_edge_layers(router: Router, layer: GuardLayer) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(correlation_id_middleware))
            .layer(cors_layer())
            .layer(axum::middleware::from_fn_with_state(
                layer,
                guard_middleware,
            )),
    )
}

/// [`with_edge_layers`] with a production CORS origin allowlist.
pub fn with_edge_layers_for_origins(
    router: Router,
    layer: GuardLayer,
    origins: Vec<String>,
) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(correlation_id_middleware))
            .layer(cors_layer_with_origins(origins))
            .layer(axum::middleware::from_fn_with_state(
                layer,
                guard_middleware,
            )),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::AuthRequired), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(ErrorCode::CrossTenantDenied),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_for(ErrorCode::TenantNotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(ErrorCode::PaymentRequired),
            StatusCode::PAYMENT_REQUIRED
        );
        // Eval failure must never look like success or a client error
        assert_eq!(
            status_for(ErrorCode::EntitlementEvalFailed),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_implicit_tenant_only_for_single_tenant_tokens() {
        let tenant = Uuid::new_v4();
        let single = Claims {
            external_user_id: "u".to_string(),
            allowed_tenant_ids: vec![tenant],
            roles: vec![],
        };
        assert_eq!(implicit_tenant(&single), Some(tenant));

        let multi = Claims {
            external_user_id: "u".to_string(),
            allowed_tenant_ids: vec![tenant, Uuid::new_v4()],
            roles: vec![],
        };
        assert_eq!(implicit_tenant(&multi), None);

        let none = Claims {
            external_user_id: "u".to_string(),
            allowed_tenant_ids: vec![],
            roles: vec![],
        };
        assert_eq!(implicit_tenant(&none), None);
    }

    #[test]
    fn test_cors_layers_build() {
        let open = cors_layer();
        assert!(format!("{open:?}").contains("CorsLayer"));

        let restricted = cors_layer_with_origins(vec![
            "https://app.example.com".to_string(),
            "not a valid origin\u{0}".to_string(),
        ]);
        assert!(format!("{restricted:?}").contains("CorsLayer"));
    }
}
