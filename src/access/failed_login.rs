//! Failed-login threshold blocking.
//!
//! Separate from the in-memory rate limiter: this rule counts persisted
//! `failed_login` events, so it survives restarts and sees failures reported
//! by every product.
//!
//! ```text
//! report ──► insert failed_login event
//!        ──► count failed_login events for the address since now - window
//!        ──► count >= threshold ? block for block_duration, mark events blocked
//! ```
//!
//! A report past the threshold while the block is already in force leaves
//! the single existing entry untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::{info, instrument, warn};

use super::registry::{BlockRegistry, BlockRequest};
use crate::clock::SharedClock;
use crate::metrics;
use crate::models::{BlockedBy, EventType, SecurityEvent, Severity};
use crate::persistence::{EventQuery, PersistenceGateway, PersistenceResult, with_timeout};

/// Threshold rule parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedLoginPolicy {
    pub threshold: usize,
    pub window: ChronoDuration,
    pub block_duration: ChronoDuration,
}

impl Default for FailedLoginPolicy {
    /// 5 failures in 5 minutes block for 24 hours.
    fn default() -> Self {
        Self {
            threshold: 5,
            window: ChronoDuration::minutes(5),
            block_duration: ChronoDuration::hours(24),
        }
    }
}

/// One failed login as observed by a product.
#[derive(Debug, Clone, Default)]
pub struct FailedLoginAttempt {
    pub address: String,
    pub user_agent: Option<String>,
    pub endpoint: Option<String>,
    pub username: Option<String>,
    pub source: Option<String>,
}

impl FailedLoginAttempt {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

/// Result of counting a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedLoginVerdict {
    /// Failures inside the window, this one included.
    pub recent_attempts: usize,
    /// Whether this report created the block.
    pub blocked: bool,
}

/// Applies [`FailedLoginPolicy`] to reported failures.
#[derive(Clone)]
pub struct FailedLoginMonitor {
    gateway: Arc<dyn PersistenceGateway>,
    registry: BlockRegistry,
    clock: SharedClock,
    policy: FailedLoginPolicy,
    default_source: String,
    timeout: Duration,
}

impl FailedLoginMonitor {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        registry: BlockRegistry,
        clock: SharedClock,
        policy: FailedLoginPolicy,
        default_source: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            registry,
            clock,
            policy,
            default_source: default_source.into(),
            timeout,
        }
    }

    pub fn policy(&self) -> FailedLoginPolicy {
        self.policy
    }

    /// Record `attempt` and block the address once it reaches the threshold.
    ///
    /// The event write and the count are awaited: unlike routine audit
    /// writes, the threshold cannot be evaluated without them.
    #[instrument(skip(self, attempt), fields(address = %attempt.address))]
    pub async fn report(&self, attempt: FailedLoginAttempt) -> PersistenceResult<FailedLoginVerdict> {
        let now = self.clock.now();

        let mut event = SecurityEvent::new(EventType::FailedLogin, Severity::Medium, "Failed login attempt")
            .with_address(attempt.address.clone())
            .with_user_agent(attempt.user_agent.clone())
            .with_source(attempt.source.clone().unwrap_or_else(|| self.default_source.clone()))
            .at(now);
        if let Some(endpoint) = &attempt.endpoint {
            event = event.with_endpoint(endpoint.clone());
        }
        if let Some(username) = &attempt.username {
            event = event.with_metadata("username", username.clone());
        }
        with_timeout(self.timeout, self.gateway.insert_event(&event))
            .await
            .inspect_err(|_| metrics::record_persistence_error("insert_event"))?;

        let query = EventQuery::for_address(attempt.address.clone())
            .of_type(EventType::FailedLogin)
            .since(now - self.policy.window);
        let recent_attempts = with_timeout(self.timeout, self.gateway.list_events(&query))
            .await
            .inspect_err(|_| metrics::record_persistence_error("list_events"))?
            .len();

        if recent_attempts < self.policy.threshold {
            return Ok(FailedLoginVerdict {
                recent_attempts,
                blocked: false,
            });
        }

        let reason = format!(
            "{recent_attempts} failed login attempts in {} minutes",
            self.policy.window.num_minutes()
        );
        let outcome = self
            .registry
            .block(
                BlockRequest::new(attempt.address.clone(), reason, BlockedBy::AutoFailedLogin)
                    .for_duration(self.policy.block_duration)
                    .with_context(attempt.user_agent, attempt.endpoint),
            )
            .await;
        if let Some(e) = outcome.error {
            return Err(e);
        }

        if outcome.created {
            info!(
                address = %attempt.address,
                recent_attempts,
                "Failed-login threshold reached, address blocked"
            );
            match with_timeout(self.timeout, self.gateway.mark_events_blocked(&query)).await {
                Ok(marked) => info!(address = %attempt.address, marked, "Contributing events marked blocked"),
                Err(e) => {
                    metrics::record_persistence_error("mark_events_blocked");
                    warn!(address = %attempt.address, error = %e, "Failed to mark contributing events");
                }
            }
        }

        Ok(FailedLoginVerdict {
            recent_attempts,
            blocked: outcome.created,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::access::degraded::DegradedMode;
    use crate::access::recorder::SecurityEventRecorder;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryGateway;
    use tokio_util::task::TaskTracker;

    fn monitor() -> (FailedLoginMonitor, InMemoryGateway, ManualClock) {
        let gateway = InMemoryGateway::new();
        let clock = ManualClock::default();
        let shared: Arc<dyn PersistenceGateway> = Arc::new(gateway.clone());
        let recorder = SecurityEventRecorder::new(
            Arc::clone(&shared),
            TaskTracker::new(),
            "control-tower",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let registry = BlockRegistry::new(
            Arc::clone(&shared),
            recorder,
            DegradedMode::new(),
            Arc::new(clock.clone()),
            Duration::from_secs(1),
        );
        let monitor = FailedLoginMonitor::new(
            shared,
            registry,
            Arc::new(clock.clone()),
            FailedLoginPolicy::default(),
            "control-tower",
            Duration::from_secs(1),
        );
        (monitor, gateway, clock)
    }

    #[tokio::test]
    async fn test_fifth_failure_blocks_for_a_day() {
        let (monitor, gateway, clock) = monitor();
        for attempt in 1..=4 {
            let verdict = monitor.report(FailedLoginAttempt::new("192.0.2.20")).await.unwrap();
            assert_eq!(verdict.recent_attempts, attempt);
            assert!(!verdict.blocked);
            clock.advance(ChronoDuration::seconds(30));
        }

        let verdict = monitor.report(FailedLoginAttempt::new("192.0.2.20")).await.unwrap();
        assert_eq!(verdict, FailedLoginVerdict { recent_attempts: 5, blocked: true });

        let rows = gateway.blocked_entries().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].blocked_by, BlockedBy::AutoFailedLogin);
        assert_eq!(rows[0].reason, "5 failed login attempts in 5 minutes");
        assert_eq!(
            rows[0].blocked_until.unwrap() - rows[0].created_at,
            ChronoDuration::hours(24)
        );

        let failed: Vec<_> = gateway
            .events()
            .await
            .into_iter()
            .filter(|e| e.event_type == EventType::FailedLogin)
            .collect();
        assert_eq!(failed.len(), 5);
        assert!(failed.iter().all(|e| e.blocked));
    }

    #[tokio::test]
    async fn test_sixth_failure_does_not_add_a_block() {
        let (monitor, gateway, _clock) = monitor();
        for _ in 0..5 {
            monitor.report(FailedLoginAttempt::new("192.0.2.21")).await.unwrap();
        }
        let sixth = monitor.report(FailedLoginAttempt::new("192.0.2.21")).await.unwrap();
        assert_eq!(sixth.recent_attempts, 6);
        assert!(!sixth.blocked);
        assert_eq!(gateway.blocked_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_outside_window_do_not_count() {
        let (monitor, gateway, clock) = monitor();
        for _ in 0..4 {
            monitor.report(FailedLoginAttempt::new("192.0.2.22")).await.unwrap();
        }
        clock.advance(ChronoDuration::minutes(6));

        let verdict = monitor.report(FailedLoginAttempt::new("192.0.2.22")).await.unwrap();
        assert_eq!(verdict.recent_attempts, 1);
        assert!(gateway.blocked_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_other_addresses_are_counted_separately() {
        let (monitor, gateway, _clock) = monitor();
        for i in 0..5 {
            monitor
                .report(FailedLoginAttempt::new(format!("192.0.2.{}", 30 + i)))
                .await
                .unwrap();
        }
        assert!(gateway.blocked_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_username_and_source_are_kept() {
        let (monitor, gateway, _clock) = monitor();
        let attempt = FailedLoginAttempt {
            username: Some("ops@example.com".into()),
            source: Some("billing-portal".into()),
            ..FailedLoginAttempt::new("192.0.2.40")
        };
        monitor.report(attempt).await.unwrap();

        let event = &gateway.events().await[0];
        assert_eq!(event.source, "billing-portal");
        assert_eq!(event.metadata["username"], "ops@example.com");
    }
}
