//! Shared application state for Axum handlers and the access-control layer.
//!
//! # Structured Concurrency
//!
//! Background work (the rate-window sweep, the persistence probe, detached
//! audit writes, failed-login reports from the admin auth layer) runs on one
//! `TaskTracker`. [`AppState::shutdown`] cancels the loops and waits for every
//! tracked task, so pending audit writes are flushed before exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::access::{
    AccessGuard, BlockRegistry, DegradedMode, FailedLoginMonitor, FixedWindowLimiter, Sampler,
    SecurityEventRecorder,
};
use crate::clock::{SharedClock, system_clock};
use crate::config::{Config, PersistenceBackend};
use crate::error::AppResult;
use crate::metrics;
use crate::middleware::{AccessControlLayer, AdminAuth, TrustedProxyConfig};
use crate::persistence::{InMemoryGateway, PersistenceGateway, RestGateway, with_timeout};

/// Build the gateway selected by `PERSISTENCE_BACKEND`.
pub fn build_gateway(config: &Config) -> AppResult<Arc<dyn PersistenceGateway>> {
    match config.persistence_backend {
        PersistenceBackend::Rest => {
            let gateway = RestGateway::new(config.rest_gateway_config()?)?;
            Ok(Arc::new(gateway))
        }
        PersistenceBackend::Memory => {
            warn!("Using in-memory persistence: blocks and audit events are lost on restart");
            Ok(Arc::new(InMemoryGateway::new()))
        }
    }
}

/// Shared application state.
///
/// Cloned per request; every component is `Arc`-backed.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub guard: AccessGuard,
    pub registry: BlockRegistry,
    pub recorder: SecurityEventRecorder,
    pub failed_logins: FailedLoginMonitor,
    pub degraded: DegradedMode,
    pub clock: SharedClock,
    admin_auth: Option<AdminAuth>,
    /// Timestamp when the application started
    pub started_at: Instant,
    persistence_healthy: Arc<AtomicBool>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create state on the system clock with an OS-seeded sampler.
    ///
    /// Spawns the background tasks; must be called inside a Tokio runtime.
    pub fn new(config: Config, gateway: Arc<dyn PersistenceGateway>) -> AppResult<Self> {
        let sampler = Sampler::new(config.normal_access_sample_rate);
        Self::with_parts(config, gateway, system_clock(), sampler)
    }

    /// Create state with an explicit clock and sampler.
    pub fn with_parts(
        config: Config,
        gateway: Arc<dyn PersistenceGateway>,
        clock: SharedClock,
        sampler: Sampler,
    ) -> AppResult<Self> {
        let matcher = config.threat_matcher()?;
        info!(
            signatures = matcher.signatures().len(),
            "Threat signatures loaded"
        );

        let task_tracker = TaskTracker::new();
        let degraded = DegradedMode::new();
        let recorder = SecurityEventRecorder::new(
            gateway.clone(),
            task_tracker.clone(),
            config.event_source.clone(),
            config.persistence_timeout,
            config.audit_wait,
        );
        let registry = BlockRegistry::new(
            gateway.clone(),
            recorder.clone(),
            degraded.clone(),
            clock.clone(),
            config.persistence_timeout,
        );
        let failed_logins = FailedLoginMonitor::new(
            gateway.clone(),
            registry.clone(),
            clock.clone(),
            config.failed_login_policy(),
            config.event_source.clone(),
            config.persistence_timeout,
        );
        let limiter = FixedWindowLimiter::new(config.rate_policy(), clock.clone());
        let guard = AccessGuard::new(
            config.access_policy(),
            limiter,
            matcher,
            registry.clone(),
            recorder.clone(),
            sampler,
        );

        let admin_auth = config.admin_api_key.clone().map(|key| {
            AdminAuth::new(key, Some(failed_logins.clone()), task_tracker.clone())
        });

        let state = Self {
            config: Arc::new(config),
            gateway,
            guard,
            registry,
            recorder,
            failed_logins,
            degraded,
            clock,
            admin_auth,
            started_at: Instant::now(),
            persistence_healthy: Arc::new(AtomicBool::new(true)),
            task_tracker,
            cancellation_token: CancellationToken::new(),
        };

        metrics::set_persistence_status(true);
        state.spawn_rate_window_sweep();
        state.spawn_persistence_probe();

        Ok(state)
    }

    /// Access-control layer configured from this state.
    pub fn access_control_layer(&self) -> AccessControlLayer {
        AccessControlLayer::new(
            self.guard.clone(),
            TrustedProxyConfig::new(&self.config.trusted_proxies),
            self.config.evaluation_timeout,
        )
    }

    /// Admin auth layer, or `None` when no admin key is configured.
    pub fn admin_auth(&self) -> Option<AdminAuth> {
        self.admin_auth.clone()
    }

    /// Result of the most recent persistence probe.
    pub fn persistence_healthy(&self) -> bool {
        self.persistence_healthy.load(Ordering::Relaxed)
    }

    /// Probe the store now and update the health flag.
    pub async fn probe_persistence(&self) -> bool {
        probe(
            self.gateway.as_ref(),
            &self.persistence_healthy,
            self.config.persistence_timeout,
        )
        .await
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Drop lapsed rate windows and admin-auth throttles so idle addresses
    /// don't accumulate.
    fn spawn_rate_window_sweep(&self) {
        let limiter = self.guard.limiter().clone();
        let admin_auth = self.admin_auth.clone();
        let period = self.config.rate_limit_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Rate window sweep received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let pruned = limiter.prune_expired();
                        let tracked = limiter.tracked();
                        metrics::set_rate_windows_tracked(tracked);
                        trace!(pruned, tracked, "Rate windows swept");
                        if let Some(auth) = &admin_auth {
                            let throttles = auth.prune();
                            trace!(throttles, tracked = auth.tracked(), "Admin auth throttles swept");
                        }
                    }
                }
            }

            debug!("Rate window sweep shutting down");
        });
    }

    /// Periodically ping the store and publish the result.
    fn spawn_persistence_probe(&self) {
        let gateway = self.gateway.clone();
        let healthy = self.persistence_healthy.clone();
        let period = self.config.health_check_interval;
        let limit = self.config.persistence_timeout;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Persistence probe received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        probe(gateway.as_ref(), &healthy, limit).await;
                    }
                }
            }

            debug!("Persistence probe shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// 1. Signals the loops to stop via the cancellation token
    /// 2. Closes the task tracker
    /// 3. Waits for every tracked task, pending audit writes included
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }
}

/// Ping once, log transitions, and store the result.
async fn probe(
    gateway: &dyn PersistenceGateway,
    healthy: &AtomicBool,
    limit: std::time::Duration,
) -> bool {
    let reachable = match with_timeout(limit, gateway.ping()).await {
        Ok(()) => true,
        Err(e) => {
            if healthy.load(Ordering::Relaxed) {
                error!(error = %e, "Persistence probe failed, store unreachable");
            } else {
                trace!(error = %e, "Persistence still unreachable");
            }
            false
        }
    };

    let was = healthy.swap(reachable, Ordering::Relaxed);
    if reachable && !was {
        info!("Persistence reachable again");
    }
    metrics::set_persistence_status(reachable);
    reachable
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_state() {
        let config = Config::default();
        let gateway = build_gateway(&config).unwrap();
        let state = AppState::new(config, gateway).unwrap();

        assert!(state.probe_persistence().await);
        assert!(state.persistence_healthy());
        assert!(state.admin_auth().is_none());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_admin_auth_enabled_with_key() {
        let config = Config {
            admin_api_key: Some("secret".to_string()),
            ..Config::default()
        };
        let state = AppState::new(config, Arc::new(InMemoryGateway::new())).unwrap();
        assert!(state.admin_auth().is_some());
        state.shutdown().await;
    }

    #[test]
    fn test_rest_backend_without_credentials_fails() {
        let config = Config {
            persistence_backend: PersistenceBackend::Rest,
            ..Config::default()
        };
        assert!(build_gateway(&config).is_err());
    }

    #[tokio::test]
    async fn test_missing_signature_file_fails() {
        let config = Config {
            threat_signatures_file: Some("/nonexistent/signatures.json".into()),
            ..Config::default()
        };
        assert!(AppState::new(config, Arc::new(InMemoryGateway::new())).is_err());
    }
}
