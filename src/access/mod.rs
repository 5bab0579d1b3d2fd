//! Access-control core: decides whether an inbound request may proceed.
//!
//! # Decision order
//!
//! ```text
//! bypass prefix / static asset ─────────────────────────────► Bypass
//! block registry: blocked      ── blocked_access_attempt ───► 403
//! rate limiter: over limit     ── rate_limit_exceeded ──────► 429 (+ 15 min block)
//! threat signature matched     ── suspicious_pattern ───────► 403 (+ permanent block)
//! otherwise                    ── sampled normal_access ────► Allow
//! ```
//!
//! The first terminal outcome wins for the response status. A rate-limited
//! request is still scanned: a signature hit there records
//! `suspicious_pattern` and blocks permanently instead of for 15 minutes.
//!
//! A store failure during the block check answers "not blocked" (degraded
//! mode). Once a denial is decided its writes run detached and the caller
//! waits for them only up to the audit bound, so a slow store delays a
//! denial but never turns it into an allow.

pub mod degraded;
pub mod failed_login;
pub mod patterns;
pub mod rate_limiter;
pub mod recorder;
pub mod registry;

use std::sync::Arc;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Duration as ChronoDuration;
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};

use crate::error::ErrorResponse;
use crate::metrics;
use crate::models::{BlockedBy, EventType, SecurityEvent, Severity};

pub use degraded::DegradedMode;
pub use failed_login::{FailedLoginAttempt, FailedLoginMonitor, FailedLoginPolicy, FailedLoginVerdict};
pub use patterns::{SIGNATURE_SET_VERSION, ThreatMatch, ThreatMatcher, ThreatSignature};
pub use rate_limiter::{FixedWindowLimiter, RateDecision, RatePolicy};
pub use recorder::{AuditOutcome, Sampler, SecurityEventRecorder};
pub use registry::{BlockCheck, BlockOutcome, BlockRegistry, BlockRequest};

/// Which paths are skipped and which count as protected.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    /// Paths starting with any of these skip every check.
    pub bypass_prefixes: Vec<String>,
    /// Paths whose clean requests are eligible for `normal_access` sampling.
    pub protected_prefixes: Vec<String>,
    /// Length of the block placed on an address that trips the rate limit.
    pub rate_limit_block: ChronoDuration,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            bypass_prefixes: [
                "/_next/",
                "/static/",
                "/assets/",
                "/api/proxy",
                "/favicon.ico",
                "/health",
                "/ready",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            protected_prefixes: ["/dashboard", "/api", "/admin"]
                .into_iter()
                .map(String::from)
                .collect(),
            rate_limit_block: ChronoDuration::minutes(15),
        }
    }
}

impl AccessPolicy {
    /// Whether `path` skips access control entirely.
    ///
    /// Covers the configured prefixes and static assets (a last segment with
    /// a file extension). A path with a `..` segment is never treated as an
    /// asset, so traversal probes are still scanned.
    pub fn bypasses(&self, path: &str) -> bool {
        if self.bypass_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return true;
        }
        let decoded = percent_decode_str(path).decode_utf8_lossy();
        if decoded.split('/').any(|segment| segment == "..") {
            return false;
        }
        decoded.rsplit('/').next().is_some_and(has_file_extension)
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protected_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }
}

/// `app.js`, `logo.PNG`; not `.env`, `v1.`, or `archive.tar-backup-2024`.
fn has_file_extension(segment: &str) -> bool {
    match segment.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=8).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// The parts of a request the access decision looks at.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub address: String,
    pub user_agent: Option<String>,
    pub method: String,
    pub path: String,
    /// Path and query string as received.
    pub url: String,
    pub request_id: Option<String>,
}

impl RequestInfo {
    pub fn new(address: impl Into<String>, method: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let path = url.split_once('?').map_or(url.as_str(), |(path, _)| path).to_string();
        Self {
            address: address.into(),
            user_agent: None,
            method: method.into(),
            path,
            url,
            request_id: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    fn event(&self, event_type: EventType, severity: Severity, reason: impl Into<String>) -> SecurityEvent {
        let mut event = SecurityEvent::new(event_type, severity, reason)
            .with_address(self.address.clone())
            .with_user_agent(self.user_agent.clone())
            .with_endpoint(self.path.clone())
            .with_metadata("method", self.method.clone());
        if let Some(request_id) = &self.request_id {
            event = event.with_metadata("request_id", request_id.clone());
        }
        event
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialKind {
    Blocked,
    RateLimited,
    SuspiciousPattern,
}

/// A refusal, rendered as `{error, message}` JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub kind: DenialKind,
    /// Seconds until the rate window resets.
    pub retry_after: Option<u64>,
}

impl Denial {
    fn blocked() -> Self {
        Self {
            kind: DenialKind::Blocked,
            retry_after: None,
        }
    }

    fn rate_limited(retry_after: ChronoDuration) -> Self {
        let millis = retry_after.num_milliseconds().max(0) as u64;
        Self {
            kind: DenialKind::RateLimited,
            retry_after: Some(millis.div_ceil(1000).max(1)),
        }
    }

    fn suspicious() -> Self {
        Self {
            kind: DenialKind::SuspiciousPattern,
            retry_after: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            DenialKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            DenialKind::Blocked | DenialKind::SuspiciousPattern => StatusCode::FORBIDDEN,
        }
    }

    fn body(&self) -> ErrorResponse {
        let (error, message) = match self.kind {
            DenialKind::Blocked => ("Forbidden", "Access denied"),
            DenialKind::RateLimited => (
                "Too Many Requests",
                "Rate limit exceeded. Please retry later.",
            ),
            DenialKind::SuspiciousPattern => ("Forbidden", "Suspicious request blocked"),
        };
        ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self.kind {
            DenialKind::Blocked => "blocked",
            DenialKind::RateLimited => "rate_limited",
            DenialKind::SuspiciousPattern => "pattern",
        }
    }
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Excluded path; nothing was checked.
    Bypass,
    /// Clean request; `logged` is whether it was sampled into the audit log.
    Allow { logged: bool },
    Deny(Denial),
}

/// Composes the registry, limiter, matcher and recorder into one decision.
#[derive(Clone)]
pub struct AccessGuard {
    policy: Arc<AccessPolicy>,
    limiter: FixedWindowLimiter,
    matcher: Arc<ThreatMatcher>,
    registry: BlockRegistry,
    recorder: SecurityEventRecorder,
    sampler: Arc<Sampler>,
}

impl AccessGuard {
    pub fn new(
        policy: AccessPolicy,
        limiter: FixedWindowLimiter,
        matcher: ThreatMatcher,
        registry: BlockRegistry,
        recorder: SecurityEventRecorder,
        sampler: Sampler,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            limiter,
            matcher: Arc::new(matcher),
            registry,
            recorder,
            sampler: Arc::new(sampler),
        }
    }

    pub fn limiter(&self) -> &FixedWindowLimiter {
        &self.limiter
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Decide what happens to `request`.
    pub async fn evaluate(&self, request: &RequestInfo) -> Verdict {
        if self.policy.bypasses(&request.path) {
            metrics::record_access_decision("bypass");
            return Verdict::Bypass;
        }

        match self.deny_reason(request).await {
            Some(denial) => {
                metrics::record_access_decision(denial.outcome_label());
                Verdict::Deny(denial)
            }
            None => {
                metrics::record_access_decision("allow");
                Verdict::Allow {
                    logged: self.sample_normal_access(request).await,
                }
            }
        }
    }

    async fn deny_reason(&self, request: &RequestInfo) -> Option<Denial> {
        let address = request.address.as_str();

        if let BlockCheck::Blocked(entry) = self.registry.check(address).await {
            warn!(address, path = %request.path, reason = %entry.reason, "Blocked address refused");
            let mut event = request
                .event(
                    EventType::BlockedAccessAttempt,
                    Severity::Critical,
                    format!("Blocked address attempted access: {}", entry.reason),
                )
                .with_metadata("blocked_by", entry.blocked_by.as_str())
                .mark_blocked();
            if let Some(until) = entry.blocked_until {
                event = event.with_metadata("blocked_until", until.to_rfc3339());
            }
            self.enforce(vec![event], None).await;
            return Some(Denial::blocked());
        }

        if let RateDecision::Limited { retry_after } = self.limiter.check(address) {
            let policy = self.limiter.policy();
            warn!(address, path = %request.path, "Rate limit exceeded");
            let mut events = vec![
                request
                    .event(
                        EventType::RateLimitExceeded,
                        Severity::Medium,
                        format!(
                            "More than {} requests in {} seconds",
                            policy.max_requests,
                            policy.window.num_seconds()
                        ),
                    )
                    .with_metadata("max_requests", policy.max_requests)
                    .with_metadata("window_secs", policy.window.num_seconds())
                    .mark_blocked(),
            ];
            // 429 still wins, but a signature hit upgrades the block to permanent.
            let block = match self.matcher.scan(&request.url) {
                Some(hit) => {
                    let (event, block) = Self::pattern_hit(request, &hit);
                    events.push(event);
                    block
                }
                None => BlockRequest::new(address, "rate limit exceeded", BlockedBy::AutoRateLimit)
                    .for_duration(self.policy.rate_limit_block)
                    .with_context(request.user_agent.clone(), Some(request.path.clone())),
            };
            self.enforce(events, Some(block)).await;
            return Some(Denial::rate_limited(retry_after));
        }

        if let Some(hit) = self.matcher.scan(&request.url) {
            let (event, block) = Self::pattern_hit(request, &hit);
            self.enforce(vec![event], Some(block)).await;
            return Some(Denial::suspicious());
        }

        None
    }

    /// The `suspicious_pattern` event and permanent block for a signature hit.
    fn pattern_hit(request: &RequestInfo, hit: &ThreatMatch) -> (SecurityEvent, BlockRequest) {
        warn!(address = %request.address, url = %request.url, pattern = %hit.label, "Suspicious request pattern");
        let reason = format!("suspicious pattern: {}", hit.label);
        let event = request
            .event(EventType::SuspiciousPattern, hit.severity, reason.clone())
            .with_metadata("pattern", hit.label.clone())
            .with_metadata("url", request.url.clone())
            .with_metadata("signature_set_version", SIGNATURE_SET_VERSION)
            .mark_blocked();
        let block = BlockRequest::new(request.address.clone(), reason, BlockedBy::AutoPatternMatch)
            .with_context(request.user_agent.clone(), Some(request.path.clone()));
        (event, block)
    }

    /// Write the audit events and block for a denial already decided.
    ///
    /// Runs on the recorder's tracker, so an evaluation timeout cannot undo
    /// the denial; the caller waits at most the recorder's bound.
    async fn enforce(&self, events: Vec<SecurityEvent>, block: Option<BlockRequest>) {
        let recorder = self.recorder.clone();
        let registry = self.registry.clone();
        self.recorder
            .run_bounded(async move {
                for event in events {
                    recorder.record(event).await;
                }
                if let Some(block) = block {
                    registry.block(block).await;
                }
            })
            .await;
    }

    async fn sample_normal_access(&self, request: &RequestInfo) -> bool {
        if !self.policy.is_protected(&request.path) || !self.sampler.sample() {
            return false;
        }
        debug!(address = %request.address, path = %request.path, "Sampling normal access");
        let event = request.event(EventType::NormalAccess, Severity::Low, "Normal access");
        self.recorder.record(event).await;
        true
    }
}
