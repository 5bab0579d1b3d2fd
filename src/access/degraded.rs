//! Degraded-mode tracking.
//!
//! A block-check read that fails is answered "not blocked" so an outage of
//! the store does not take the dashboard down with it. Each such answer is a
//! degraded-mode event: logged at error level with `degraded = true`, counted
//! here, and surfaced on `/health`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tracing::error;

use crate::metrics;
use crate::persistence::PersistenceError;

const NEVER: i64 = i64::MIN;

/// Shared counter of degraded-mode events.
#[derive(Debug, Clone)]
pub struct DegradedMode {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    events: AtomicU64,
    last_at_millis: AtomicI64,
}

impl Default for DegradedMode {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                events: AtomicU64::new(0),
                last_at_millis: AtomicI64::new(NEVER),
            }),
        }
    }
}

impl DegradedMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `operation` failed and the caller fell back.
    pub fn record(&self, operation: &'static str, address: &str, err: &PersistenceError, now: DateTime<Utc>) {
        self.inner.events.fetch_add(1, Ordering::Relaxed);
        self.inner
            .last_at_millis
            .store(now.timestamp_millis(), Ordering::Relaxed);
        metrics::record_degraded_event();
        metrics::record_persistence_error(operation);
        error!(
            degraded = true,
            operation,
            address,
            error = %err,
            "Persistence unavailable, treating address as not blocked"
        );
    }

    pub fn events(&self) -> u64 {
        self.inner.events.load(Ordering::Relaxed)
    }

    pub fn last_at(&self) -> Option<DateTime<Utc>> {
        match self.inner.last_at_millis.load(Ordering::Relaxed) {
            NEVER => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }
}
