//! Tower layer running the access-control decision for every request.
//!
//! # Failure policy
//!
//! Evaluation runs in its own task under a deadline. If it panics or does
//! not finish in time, the request is forwarded as if allowed: this layer is
//! defense in depth, and its failure must not take the application down.
//! Each such fail-open is logged at error level and counted
//! (`control_tower_fail_open_total`).

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{error, trace};

use super::ip::{TrustedProxyConfig, client_address};
use crate::access::{AccessGuard, RequestInfo, Verdict};
use crate::metrics;

/// The resolved client address, stored as a request extension for handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddress(pub String);

/// Access-control layer for the whole router.
#[derive(Clone)]
pub struct AccessControlLayer {
    guard: AccessGuard,
    trusted_proxies: Arc<TrustedProxyConfig>,
    evaluation_timeout: Duration,
}

impl AccessControlLayer {
    pub fn new(
        guard: AccessGuard,
        trusted_proxies: TrustedProxyConfig,
        evaluation_timeout: Duration,
    ) -> Self {
        Self {
            guard,
            trusted_proxies: Arc::new(trusted_proxies),
            evaluation_timeout,
        }
    }
}

impl<S> Layer<S> for AccessControlLayer {
    type Service = AccessControlService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessControlService {
            inner,
            guard: self.guard.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            evaluation_timeout: self.evaluation_timeout,
        }
    }
}

/// Access-control service wrapper.
#[derive(Clone)]
pub struct AccessControlService<S> {
    inner: S,
    guard: AccessGuard,
    trusted_proxies: Arc<TrustedProxyConfig>,
    evaluation_timeout: Duration,
}

impl<S> Service<Request<Body>> for AccessControlService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let guard = self.guard.clone();
        let evaluation_timeout = self.evaluation_timeout;
        let mut inner = self.inner.clone();

        let info = request_info(&req, &self.trusted_proxies);
        req.extensions_mut()
            .insert(ClientAddress(info.address.clone()));

        Box::pin(async move {
            let started = Instant::now();
            let verdict = evaluate_isolated(guard, info, evaluation_timeout).await;
            metrics::record_evaluation_duration(started.elapsed().as_secs_f64());

            match verdict {
                Verdict::Deny(denial) => Ok(denial.into_response()),
                Verdict::Bypass | Verdict::Allow { .. } => inner.call(req).await,
            }
        })
    }
}

fn request_info<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> RequestInfo {
    let (address, source) = client_address(req, trusted_proxies);
    trace!(address = %address, source = ?source, "Resolved client address");

    let url = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), |pq| pq.as_str().to_string());
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    RequestInfo::new(address, req.method().as_str(), url)
        .with_user_agent(header("user-agent"))
        .with_request_id(header("x-request-id"))
}

/// Run the guard in its own task; a panic or a missed deadline allows the request.
async fn evaluate_isolated(guard: AccessGuard, info: RequestInfo, limit: Duration) -> Verdict {
    let address = info.address.clone();
    let path = info.path.clone();
    let mut handle = tokio::spawn(async move { guard.evaluate(&info).await });

    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(join_error)) => {
            metrics::record_fail_open("panic");
            error!(
                address = %address,
                path = %path,
                panicked = join_error.is_panic(),
                "Access evaluation failed, allowing request"
            );
            Verdict::Allow { logged: false }
        }
        Err(_) => {
            handle.abort();
            metrics::record_fail_open("timeout");
            error!(
                address = %address,
                path = %path,
                timeout_ms = limit.as_millis() as u64,
                "Access evaluation timed out, allowing request"
            );
            Verdict::Allow { logged: false }
        }
    }
}
