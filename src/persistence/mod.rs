//! Persistence gateway over the hosted security tables.
//!
//! The access-control core only needs a handful of row operations on two
//! collections, blocked addresses and security events:
//!
//! ```text
//! blocked_ips      select/insert/delete where ip_address = X
//! security_events  insert, select/update where ip_address = X
//!                  and event_type = Y and created_at >= T
//! ```
//!
//! [`RestGateway`] talks to a PostgREST-style HTTP API; [`InMemoryGateway`]
//! keeps everything in process and backs tests and local development.
//!
//! Gateway calls are suspending network operations. Callers on the request
//! path bound them with [`with_timeout`] and decide locally what a failure
//! means (see `access`).

mod memory;
mod rest;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{BlockedEntry, EventType, SecurityEvent};

pub use memory::InMemoryGateway;
pub use rest::{RestGateway, RestGatewayConfig};

/// Failures surfaced by a persistence gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Unique-key violation on insert.
    #[error("duplicate key")]
    Duplicate,

    /// The store could not be reached or answered with a server error.
    #[error("persistence unavailable: {0}")]
    Unavailable(String),

    #[error("persistence call timed out after {0:?}")]
    Timeout(Duration),

    /// The store refused the request (bad filter, auth, schema mismatch).
    #[error("persistence rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("could not decode persistence response: {0}")]
    Decode(String),
}

impl PersistenceError {
    /// Transient errors are worth retrying on the next request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PersistenceError::Unavailable(_) | PersistenceError::Timeout(_)
        )
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Filter over the security event log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub address: Option<String>,
    pub event_type: Option<EventType>,
    /// Only events created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Newest first; `None` means no limit.
    pub limit: Option<u32>,
}

impl EventQuery {
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every filter (limit aside).
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        self.address
            .as_deref()
            .is_none_or(|address| event.address.as_deref() == Some(address))
            && self
                .event_type
                .as_ref()
                .is_none_or(|event_type| &event.event_type == event_type)
            && self.since.is_none_or(|since| event.created_at >= since)
    }
}

/// Row operations the access-control core needs from the hosted store.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Look up the block row for `address`.
    async fn find_blocked(&self, address: &str) -> PersistenceResult<Option<BlockedEntry>>;

    /// Insert a block row. Fails with [`PersistenceError::Duplicate`] when
    /// the address already has one.
    async fn insert_blocked(&self, entry: &BlockedEntry) -> PersistenceResult<()>;

    /// Delete the block row for `address`; returns whether a row existed.
    async fn delete_blocked(&self, address: &str) -> PersistenceResult<bool>;

    /// All block rows, newest first.
    async fn list_blocked(&self, limit: Option<u32>) -> PersistenceResult<Vec<BlockedEntry>>;

    /// Append an audit event.
    async fn insert_event(&self, event: &SecurityEvent) -> PersistenceResult<()>;

    /// Events matching `query`, newest first.
    async fn list_events(&self, query: &EventQuery) -> PersistenceResult<Vec<SecurityEvent>>;

    /// Stamp `blocked = true` on events matching `query`; returns how many
    /// rows were touched when the store reports it.
    async fn mark_events_blocked(&self, query: &EventQuery) -> PersistenceResult<u64>;

    /// Cheap reachability probe.
    async fn ping(&self) -> PersistenceResult<()>;
}

/// Bound a gateway call by `limit`, mapping an elapsed deadline to
/// [`PersistenceError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> PersistenceResult<T>
where
    F: Future<Output = PersistenceResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PersistenceError::Timeout(limit)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::Severity;

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed_deadline() {
        let result: PersistenceResult<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result,
            Err(PersistenceError::Timeout(Duration::from_millis(10)))
        );
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through_errors() {
        let result: PersistenceResult<()> = with_timeout(Duration::from_secs(1), async {
            Err(PersistenceError::Duplicate)
        })
        .await;
        assert_eq!(result, Err(PersistenceError::Duplicate));
    }

    #[test]
    fn test_event_query_matches_filters() {
        let now = Utc::now();
        let event = SecurityEvent::new(EventType::FailedLogin, Severity::Medium, "bad password")
            .with_address("192.0.2.10")
            .at(now);

        let query = EventQuery::for_address("192.0.2.10")
            .of_type(EventType::FailedLogin)
            .since(now - chrono::Duration::minutes(5));
        assert!(query.matches(&event));

        assert!(!EventQuery::for_address("192.0.2.11").matches(&event));
        assert!(
            !EventQuery::default()
                .of_type(EventType::NormalAccess)
                .matches(&event)
        );
        assert!(
            !EventQuery::default()
                .since(now + chrono::Duration::seconds(1))
                .matches(&event)
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PersistenceError::Unavailable("refused".into()).is_transient());
        assert!(PersistenceError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!PersistenceError::Duplicate.is_transient());
    }
}
