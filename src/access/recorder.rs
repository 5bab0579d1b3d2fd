//! Security event recorder.
//!
//! Each write runs as its own task on the shared [`TaskTracker`]. The caller
//! waits for it only up to a bounded deadline: a slow store delays a
//! response by at most `wait`, and a write still in flight after that keeps
//! running in the background (graceful shutdown waits for it). Failures are
//! captured here (logged and counted) and never propagate to the request.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::metrics;
use crate::models::SecurityEvent;
use crate::persistence::{PersistenceGateway, with_timeout};

/// What became of one audit write, as far as the caller could see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Written,
    Failed,
    /// Still running when the caller stopped waiting.
    Pending,
}

impl AuditOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, AuditOutcome::Written)
    }
}

/// Appends [`SecurityEvent`]s through the persistence gateway.
#[derive(Clone)]
pub struct SecurityEventRecorder {
    gateway: Arc<dyn PersistenceGateway>,
    tracker: TaskTracker,
    source: String,
    write_timeout: Duration,
    wait: Duration,
}

impl SecurityEventRecorder {
    /// `write_timeout` bounds the gateway call; `wait` bounds how long
    /// [`record`](Self::record) blocks its caller.
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        tracker: TaskTracker,
        source: impl Into<String>,
        write_timeout: Duration,
        wait: Duration,
    ) -> Self {
        Self {
            gateway,
            tracker,
            source: source.into(),
            write_timeout,
            wait,
        }
    }

    /// Default `source` stamped on events that don't carry one.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// How long callers wait on a write before leaving it to the tracker.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Run `work` on the tracker and wait for it at most [`wait`](Self::wait).
    ///
    /// Returns whether `work` finished in time; if not it keeps running.
    pub async fn run_bounded<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(work);
        match tokio::time::timeout(self.wait, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Background persistence task aborted");
                true
            }
            Err(_) => {
                debug!(wait_ms = self.wait.as_millis() as u64, "Persistence writes still pending");
                false
            }
        }
    }

    /// Write `event`, waiting at most the configured bound.
    pub async fn record(&self, mut event: SecurityEvent) -> AuditOutcome {
        if event.source.is_empty() {
            event.source.clone_from(&self.source);
        }

        let gateway = Arc::clone(&self.gateway);
        let write_timeout = self.write_timeout;
        let handle = self.tracker.spawn(async move {
            let event_type = event.event_type.clone();
            match with_timeout(write_timeout, gateway.insert_event(&event)).await {
                Ok(()) => {
                    debug!(event_type = %event_type, severity = %event.severity, "Security event recorded");
                    true
                }
                Err(e) => {
                    metrics::record_audit_write_failure(event_type.as_str());
                    metrics::record_persistence_error("insert_event");
                    warn!(
                        event_type = %event_type,
                        address = event.address.as_deref().unwrap_or("-"),
                        error = %e,
                        "Failed to record security event"
                    );
                    false
                }
            }
        });

        match tokio::time::timeout(self.wait, handle).await {
            Ok(Ok(true)) => AuditOutcome::Written,
            Ok(Ok(false)) => AuditOutcome::Failed,
            Ok(Err(e)) => {
                warn!(error = %e, "Security event write task aborted");
                AuditOutcome::Failed
            }
            Err(_) => {
                debug!(wait_ms = self.wait.as_millis() as u64, "Security event write still pending");
                AuditOutcome::Pending
            }
        }
    }
}

/// Bernoulli sampler for routine-traffic logging.
///
/// Seedable so tests can check the logged fraction deterministically.
pub struct Sampler {
    rate: f64,
    rng: Mutex<StdRng>,
}

impl Sampler {
    /// `rate` is clamped to `[0, 1]`.
    pub fn new(rate: f64) -> Self {
        Self::from_rng(rate, StdRng::from_os_rng())
    }

    pub fn seeded(rate: f64, seed: u64) -> Self {
        Self::from_rng(rate, StdRng::seed_from_u64(seed))
    }

    fn from_rng(rate: f64, rng: StdRng) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self {
            rate,
            rng: Mutex::new(rng),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Whether this occurrence should be logged.
    pub fn sample(&self) -> bool {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.random_bool(self.rate)
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").field("rate", &self.rate).finish()
    }
}
