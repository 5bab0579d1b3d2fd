//! Persisted security records: blocked addresses and the audit event log.
//!
//! Field names follow the hosted database columns (`ip_address`,
//! `blocked_until`, ...), so these types serialize straight into request
//! bodies for the REST gateway.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Audit severity. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of security event.
///
/// The known kinds are variants; anything else read back from the store (or
/// accepted through the admin API after validation) lands in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    BlockedAccessAttempt,
    RateLimitExceeded,
    SuspiciousPattern,
    NormalAccess,
    FailedLogin,
    ManualBlock,
    ManualUnblock,
    AutoBlock,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::BlockedAccessAttempt => "blocked_access_attempt",
            EventType::RateLimitExceeded => "rate_limit_exceeded",
            EventType::SuspiciousPattern => "suspicious_pattern",
            EventType::NormalAccess => "normal_access",
            EventType::FailedLogin => "failed_login",
            EventType::ManualBlock => "manual_block",
            EventType::ManualUnblock => "manual_unblock",
            EventType::AutoBlock => "auto_block",
            EventType::Other(other) => other,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, EventType::Other(_))
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "blocked_access_attempt" => EventType::BlockedAccessAttempt,
            "rate_limit_exceeded" => EventType::RateLimitExceeded,
            "suspicious_pattern" => EventType::SuspiciousPattern,
            "normal_access" => EventType::NormalAccess,
            "failed_login" => EventType::FailedLogin,
            "manual_block" => EventType::ManualBlock,
            "manual_unblock" => EventType::ManualUnblock,
            "auto_block" => EventType::AutoBlock,
            _ => EventType::Other(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a block decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BlockedBy {
    AutoRateLimit,
    AutoPatternMatch,
    ManualAdmin,
    AutoFailedLogin,
    Other(String),
}

impl BlockedBy {
    pub fn as_str(&self) -> &str {
        match self {
            BlockedBy::AutoRateLimit => "auto_rate_limit",
            BlockedBy::AutoPatternMatch => "auto_pattern_match",
            BlockedBy::ManualAdmin => "manual_admin",
            BlockedBy::AutoFailedLogin => "auto_failed_login",
            BlockedBy::Other(other) => other,
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, BlockedBy::ManualAdmin)
    }
}

impl From<String> for BlockedBy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "auto_rate_limit" => BlockedBy::AutoRateLimit,
            "auto_pattern_match" => BlockedBy::AutoPatternMatch,
            "manual_admin" => BlockedBy::ManualAdmin,
            "auto_failed_login" => BlockedBy::AutoFailedLogin,
            _ => BlockedBy::Other(value),
        }
    }
}

impl From<BlockedBy> for String {
    fn from(value: BlockedBy) -> Self {
        match value {
            BlockedBy::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for BlockedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A blocked client address.
///
/// At most one row exists per address; `blocked_until == None` means the
/// block is permanent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedEntry {
    #[serde(rename = "ip_address")]
    pub address: String,
    pub reason: String,
    #[serde(default)]
    pub blocked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_permanent: bool,
    pub blocked_by: BlockedBy,
    pub created_at: DateTime<Utc>,
}

impl BlockedEntry {
    /// Build an entry; `duration == None` produces a permanent block.
    pub fn new(
        address: impl Into<String>,
        reason: impl Into<String>,
        duration: Option<Duration>,
        blocked_by: BlockedBy,
        now: DateTime<Utc>,
    ) -> Self {
        let blocked_until = duration.map(|d| now + d);
        Self {
            address: address.into(),
            reason: reason.into(),
            blocked_until,
            is_permanent: blocked_until.is_none(),
            blocked_by,
            created_at: now,
        }
    }

    /// Whether the block has lapsed at `now`. Permanent blocks never lapse.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until <= now)
    }

    /// Seconds left on a temporary block, `None` for permanent blocks.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.blocked_until
            .map(|until| (until - now).num_seconds().max(0))
    }
}

/// One row of the append-only security audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Assigned by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub event_type: EventType,
    #[serde(rename = "ip_address", default)]
    pub address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub severity: Severity,
    pub reason: String,
    pub source: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub blocked: bool,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(event_type: EventType, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            id: None,
            event_type,
            address: None,
            user_agent: None,
            endpoint: None,
            severity,
            reason: reason.into(),
            source: String::new(),
            metadata: Map::new(),
            blocked: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn mark_blocked(mut self) -> Self {
        self.blocked = true;
        self
    }
}
