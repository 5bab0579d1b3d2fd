//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │  Set Request ID  │ ← x-request-id (UUID) unless the client sent one
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Propagate Req ID │ ← Echoes x-request-id on the response
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers, denials included
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Access Control  │ ← 403 blocked / suspicious, 429 rate limited
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Body Limit    │
//! └────────┬─────────┘
//!          ▼
//!      Handler  (/admin/* additionally behind Admin Auth)
//! ```
//!
//! Access control is applied with `layer`, not `route_layer`, so requests
//! for unknown paths are rate limited and scanned too.
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Probes (bypass access control)
//! - `/dashboard`, `/api/status` - Protected application surface
//! - `/admin/*` - Admin API, mounted only with `ADMIN_API_KEY`

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::Request;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

use crate::handlers;
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    // =========================================================================
    // Build Router with Routes
    // =========================================================================
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/dashboard", get(handlers::dashboard_overview))
        .route("/api/status", get(handlers::api_status));

    match state.admin_auth() {
        Some(auth) => {
            info!("Admin API enabled at /admin");
            let admin = Router::new()
                .route(
                    "/blocked",
                    get(handlers::list_blocked).post(handlers::block_address),
                )
                .route("/blocked/{address}", delete(handlers::unblock_address))
                .route("/events", get(handlers::list_events))
                .route("/failed-logins", post(handlers::report_failed_login))
                .route_layer(auth);
            router = router.nest("/admin", admin);
        }
        None => info!("Admin API disabled (no ADMIN_API_KEY set)"),
    }

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Access control over every path, matched or not
    info!(
        max_requests = config.rate_limit_max_requests,
        window_secs = config.rate_limit_window.as_secs(),
        trusted_proxies = config.trusted_proxies.len(),
        "Access control enabled"
    );
    router = router.layer(state.access_control_layer());

    // 3. CORS, outside access control so 403/429 bodies stay readable cross-origin
    router = router.layer(build_cors_layer(&config.cors_allowed_origins));

    // 4. Request ID propagation, tracing, and generation
    router = router.layer(PropagateRequestIdLayer::x_request_id());
    router = router.layer(TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info_span!(
            "http_request",
            method = %req.method(),
            uri = %req.uri(),
            request_id = %request_id,
        )
    }));
    router = router.layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    router.with_state(state)
}

/// Build CORS layer from configuration.
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
