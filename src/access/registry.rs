//! Block registry: which client addresses are currently refused.
//!
//! # Lifecycle
//!
//! ```text
//! block()  ──► row inserted ──► audit event (manual_block / auto_block)
//!                  │
//!                  ├─ duplicate, live row    → kept as is (idempotent)
//!                  └─ duplicate, expired row → replaced once
//!
//! check()  ──► no row              → NotBlocked
//!              row, expired         → row deleted, NotBlocked   (lazy expiry)
//!              row, live/permanent  → Blocked
//!              store failed         → Degraded (caller treats as not blocked)
//!
//! unblock() ─► row deleted ──► audit event (manual_unblock)
//! ```
//!
//! A failed block write does not change the decision already taken for the
//! in-flight request; it is reported through [`BlockOutcome::error`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::{error, info, instrument, warn};

use super::degraded::DegradedMode;
use super::recorder::{AuditOutcome, SecurityEventRecorder};
use crate::clock::SharedClock;
use crate::metrics;
use crate::models::{BlockedBy, BlockedEntry, EventType, SecurityEvent, Severity};
use crate::persistence::{PersistenceError, PersistenceGateway, PersistenceResult, with_timeout};

/// Result of a block check.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockCheck {
    NotBlocked,
    Blocked(BlockedEntry),
    /// The store could not answer; treated as not blocked.
    Degraded,
}

impl BlockCheck {
    pub fn is_blocked(&self) -> bool {
        matches!(self, BlockCheck::Blocked(_))
    }
}

/// A request to block one address.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub address: String,
    pub reason: String,
    /// `None` blocks permanently.
    pub duration: Option<ChronoDuration>,
    pub blocked_by: BlockedBy,
    pub user_agent: Option<String>,
    pub endpoint: Option<String>,
}

impl BlockRequest {
    pub fn new(address: impl Into<String>, reason: impl Into<String>, blocked_by: BlockedBy) -> Self {
        Self {
            address: address.into(),
            reason: reason.into(),
            duration: None,
            blocked_by,
            user_agent: None,
            endpoint: None,
        }
    }

    pub fn for_duration(mut self, duration: ChronoDuration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn for_minutes(self, minutes: i64) -> Self {
        self.for_duration(ChronoDuration::minutes(minutes))
    }

    pub fn with_context(mut self, user_agent: Option<String>, endpoint: Option<String>) -> Self {
        self.user_agent = user_agent;
        self.endpoint = endpoint;
        self
    }
}

/// What a block call achieved.
#[derive(Debug, Clone)]
pub struct BlockOutcome {
    /// The entry now in force: the new one, or the live row that was already there.
    pub entry: BlockedEntry,
    /// Whether this call wrote a new row.
    pub created: bool,
    pub audit: AuditOutcome,
    /// Set when the block row could not be written.
    pub error: Option<PersistenceError>,
}

/// Tracks blocked addresses in the persistence store.
#[derive(Clone)]
pub struct BlockRegistry {
    gateway: Arc<dyn PersistenceGateway>,
    recorder: SecurityEventRecorder,
    degraded: DegradedMode,
    clock: SharedClock,
    timeout: Duration,
}

impl BlockRegistry {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        recorder: SecurityEventRecorder,
        degraded: DegradedMode,
        clock: SharedClock,
        timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            recorder,
            degraded,
            clock,
            timeout,
        }
    }

    /// Look up `address`, lazily deleting an expired row.
    #[instrument(skip(self))]
    pub async fn check(&self, address: &str) -> BlockCheck {
        let now = self.clock.now();
        let entry = match with_timeout(self.timeout, self.gateway.find_blocked(address)).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return BlockCheck::NotBlocked,
            Err(e) => {
                self.degraded.record("find_blocked", address, &e, now);
                return BlockCheck::Degraded;
            }
        };

        if !entry.is_expired(now) {
            return BlockCheck::Blocked(entry);
        }

        // The answer is already known; the delete only bounds how long we wait.
        let gateway = Arc::clone(&self.gateway);
        let timeout = self.timeout;
        let owned = address.to_string();
        self.recorder
            .run_bounded(async move {
                match with_timeout(timeout, gateway.delete_blocked(&owned)).await {
                    Ok(_) => info!(address = %owned, reason = %entry.reason, "Block expired, entry removed"),
                    Err(e) => {
                        metrics::record_persistence_error("delete_blocked");
                        warn!(address = %owned, error = %e, "Failed to remove expired block entry");
                    }
                }
            })
            .await;
        BlockCheck::NotBlocked
    }

    /// Whether `address` is currently blocked. A store failure answers `false`.
    pub async fn is_blocked(&self, address: &str) -> bool {
        self.check(address).await.is_blocked()
    }

    /// Block an address and record the audit event.
    #[instrument(skip(self, request), fields(address = %request.address, blocked_by = %request.blocked_by))]
    pub async fn block(&self, request: BlockRequest) -> BlockOutcome {
        let now = self.clock.now();
        let entry = BlockedEntry::new(
            request.address.clone(),
            request.reason.clone(),
            request.duration,
            request.blocked_by.clone(),
            now,
        );

        let (entry, created, error) = match self.insert(&entry).await {
            Ok(true) => (entry, true, None),
            Ok(false) => {
                let existing = self.existing(&request.address).await.unwrap_or(entry);
                (existing, false, None)
            }
            Err(e) => {
                metrics::record_persistence_error("insert_blocked");
                error!(address = %request.address, error = %e, "Failed to persist block entry");
                (entry, false, Some(e))
            }
        };

        if created {
            metrics::record_block_created(request.blocked_by.as_str());
            info!(
                address = %entry.address,
                reason = %entry.reason,
                permanent = entry.is_permanent,
                "Address blocked"
            );
        }

        let audit = self.recorder.record(Self::block_event(&request, &entry, created)).await;
        BlockOutcome {
            entry,
            created,
            audit,
            error,
        }
    }

    /// Remove the block on `address` and record a `manual_unblock` event.
    ///
    /// Returns whether a row was removed.
    #[instrument(skip(self))]
    pub async fn unblock(&self, address: &str) -> PersistenceResult<(bool, AuditOutcome)> {
        let removed = with_timeout(self.timeout, self.gateway.delete_blocked(address))
            .await
            .inspect_err(|_| metrics::record_persistence_error("delete_blocked"))?;

        let event = SecurityEvent::new(
            EventType::ManualUnblock,
            Severity::Low,
            "Address unblocked by administrator",
        )
        .with_address(address)
        .with_metadata("removed", removed)
        .at(self.clock.now());
        let audit = self.recorder.record(event).await;

        if removed {
            info!(address, "Address unblocked");
        }
        Ok((removed, audit))
    }

    /// Stored block rows, newest first, expired ones included.
    pub async fn list(&self, limit: Option<u32>) -> PersistenceResult<Vec<BlockedEntry>> {
        with_timeout(self.timeout, self.gateway.list_blocked(limit))
            .await
            .inspect_err(|_| metrics::record_persistence_error("list_blocked"))
    }

    /// Insert `entry`. `Ok(false)` means a live row already exists.
    ///
    /// A duplicate caused by an expired row deletes that row and retries once.
    async fn insert(&self, entry: &BlockedEntry) -> PersistenceResult<bool> {
        match with_timeout(self.timeout, self.gateway.insert_blocked(entry)).await {
            Ok(()) => return Ok(true),
            Err(PersistenceError::Duplicate) => {}
            Err(e) => return Err(e),
        }

        let stale = self
            .existing(&entry.address)
            .await
            .is_some_and(|existing| existing.is_expired(entry.created_at));
        if !stale {
            return Ok(false);
        }

        with_timeout(self.timeout, self.gateway.delete_blocked(&entry.address)).await?;
        match with_timeout(self.timeout, self.gateway.insert_blocked(entry)).await {
            Ok(()) => Ok(true),
            Err(PersistenceError::Duplicate) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn existing(&self, address: &str) -> Option<BlockedEntry> {
        with_timeout(self.timeout, self.gateway.find_blocked(address))
            .await
            .ok()
            .flatten()
    }

    fn block_event(request: &BlockRequest, entry: &BlockedEntry, created: bool) -> SecurityEvent {
        let event_type = if request.blocked_by.is_manual() {
            EventType::ManualBlock
        } else {
            EventType::AutoBlock
        };
        let mut event = SecurityEvent::new(event_type, Severity::High, request.reason.clone())
            .with_address(request.address.clone())
            .with_user_agent(request.user_agent.clone())
            .with_metadata("blocked_by", request.blocked_by.as_str())
            .with_metadata("permanent", entry.is_permanent)
            .with_metadata("created", created)
            .at(entry.created_at)
            .mark_blocked();
        if let Some(duration) = request.duration {
            event = event.with_metadata("duration_minutes", duration.num_minutes());
        }
        if let Some(endpoint) = &request.endpoint {
            event = event.with_endpoint(endpoint.clone());
        }
        event
    }
}
