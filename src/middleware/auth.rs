//! API key authentication for the admin API.
//!
//! # Security Features
//!
//! - **Constant-time comparison** of the provided key
//! - **Failure throttle**: once an address spends its failure budget it gets
//!   429 until the budget refills, before the key is even compared. Only
//!   failures draw from the budget.
//! - **Failed-login accounting**: every rejected key is reported to the
//!   failed-login monitor, so repeated guessing ends in a 24-hour block
//!   enforced by the access-control layer
//!
//! The key is read from `X-API-Key` or `Authorization: Bearer <key>`.
//!
//! ```bash
//! curl -H "X-API-Key: $ADMIN_API_KEY" http://localhost:3000/admin/blocked
//! ```

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tokio_util::task::TaskTracker;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::access_control::ClientAddress;
use super::ip::{TrustedProxyConfig, client_address};
use crate::access::{FailedLoginAttempt, FailedLoginMonitor};
use crate::metrics;

/// Header name for the admin API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Auth failures per address per minute before the throttle engages.
const AUTH_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

const AUTH_FAILURE_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Admin API key layer.
#[derive(Clone)]
pub struct AdminAuth {
    expected_key: Arc<String>,
    failure_limiter: Arc<AuthFailureLimiter>,
    throttled_until: Arc<DashMap<String, Instant>>,
    failed_logins: Option<FailedLoginMonitor>,
    tracker: TaskTracker,
}

impl AdminAuth {
    pub fn new(api_key: String, failed_logins: Option<FailedLoginMonitor>, tracker: TaskTracker) -> Self {
        let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);
        Self {
            expected_key: Arc::new(api_key),
            failure_limiter: Arc::new(RateLimiter::keyed(quota)),
            throttled_until: Arc::new(DashMap::new()),
            failed_logins,
            tracker,
        }
    }
}

impl<S> Layer<S> for AdminAuth {
    type Service = AdminAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdminAuthService {
            inner,
            auth: self.clone(),
        }
    }
}

/// Admin API key service wrapper.
#[derive(Clone)]
pub struct AdminAuthService<S> {
    inner: S,
    auth: AdminAuth,
}

impl<S> Service<Request<Body>> for AdminAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let auth = self.auth.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let address = match req.extensions().get::<ClientAddress>() {
                Some(ClientAddress(address)) => address.clone(),
                None => client_address(&req, &TrustedProxyConfig::default()).0,
            };

            if let Some(retry_after) = auth.throttled_for(&address) {
                warn!(address = %address, retry_after_secs = retry_after, "Admin access throttled");
                return Ok(throttled_response(retry_after));
            }

            let provided = extract_api_key(&req);
            if provided
                .as_deref()
                .is_some_and(|key| constant_time_eq(key, &auth.expected_key))
            {
                debug!(address = %address, "Admin API key accepted");
                return inner.call(req).await;
            }

            let message = if provided.is_some() {
                "Invalid API key"
            } else {
                "API key required"
            };
            metrics::record_admin_auth_failure();
            warn!(address = %address, path = %req.uri().path(), "{message}");
            auth.spend_failure(&address);
            auth.report_failure(&req, address);
            Ok(unauthorized_response(message))
        })
    }
}

impl AdminAuth {
    /// Drop lapsed throttles and failure budgets that have fully refilled.
    ///
    /// Returns how many throttles were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.throttled_until.len();
        self.throttled_until.retain(|_, until| *until > now);
        self.failure_limiter.retain_recent();
        self.failure_limiter.shrink_to_fit();
        before.saturating_sub(self.throttled_until.len())
    }

    /// Addresses with an active throttle or a partly spent failure budget.
    pub fn tracked(&self) -> usize {
        self.throttled_until.len().max(self.failure_limiter.len())
    }

    /// Seconds left on a throttle for `address`, if one is active.
    fn throttled_for(&self, address: &str) -> Option<u64> {
        let until = *self.throttled_until.get(address)?;
        let now = Instant::now();
        if until <= now {
            self.throttled_until.remove(address);
            return None;
        }
        Some((until - now).as_secs().max(1))
    }

    /// Draw one failure from the budget; an exhausted budget starts a throttle.
    fn spend_failure(&self, address: &str) {
        if let Err(not_until) = self.failure_limiter.check_key(&address.to_string()) {
            let wait = not_until
                .wait_time_from(DefaultClock::default().now())
                .max(Duration::from_secs(1));
            error!(
                address,
                retry_after_secs = wait.as_secs(),
                "Admin auth failure budget exhausted, throttling address"
            );
            self.throttled_until
                .insert(address.to_string(), Instant::now() + wait);
        }
    }

    /// Feed a rejected key into the failed-login rule without delaying the 401.
    fn report_failure<B>(&self, req: &Request<B>, address: String) {
        let Some(monitor) = self.failed_logins.clone() else {
            return;
        };
        let attempt = FailedLoginAttempt {
            address,
            user_agent: req
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            endpoint: Some(req.uri().path().to_string()),
            username: Some("admin-api".to_string()),
            source: None,
        };
        self.tracker.spawn(async move {
            let address = attempt.address.clone();
            if let Err(e) = monitor.report(attempt).await {
                warn!(address = %address, error = %e, "Failed to record admin auth failure");
            }
        });
    }
}

/// Key from `X-API-Key`, or from a bearer `Authorization` header.
fn extract_api_key<B>(req: &Request<B>) -> Option<String> {
    if let Some(value) = req.headers().get(API_KEY_HEADER)
        && let Ok(value) = value.to_str()
    {
        return Some(value.to_string());
    }

    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn unauthorized_response(message: &str) -> Response<Body> {
    (
        StatusCode::UNAUTHORIZED,
        [
            ("WWW-Authenticate", "API-Key"),
            ("Content-Type", "application/json"),
        ],
        format!(r#"{{"error":"Unauthorized","message":"{message}"}}"#),
    )
        .into_response()
}

fn throttled_response(retry_after: u64) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            ("Retry-After", retry_after.to_string()),
            ("Content-Type", "application/json".to_string()),
        ],
        r#"{"error":"Too Many Requests","message":"Too many failed authentication attempts. Please wait before retrying."}"#.to_string(),
    )
        .into_response()
}
