use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BlockedEntry, SecurityEvent};

/// Request to block an address from the admin API.
#[derive(Debug, Deserialize)]
pub struct BlockAddressRequest {
    /// Client address to block
    pub address: String,
    /// Human-readable reason recorded with the block
    pub reason: String,
    /// Block length in minutes; omitted means permanent
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

/// Response after a manual block.
#[derive(Debug, Serialize)]
pub struct BlockAddressResponse {
    pub entry: BlockedEntry,
    /// False when the address was already blocked
    pub created: bool,
    /// Whether the audit event made it to the store
    pub audit_recorded: bool,
}

/// Response after a manual unblock.
#[derive(Debug, Serialize)]
pub struct UnblockResponse {
    pub address: String,
    pub unblocked: bool,
    pub timestamp: DateTime<Utc>,
}

/// Query parameters for listing audit events.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default = "default_event_limit")]
    pub limit: u32,
}

fn default_event_limit() -> u32 {
    50
}

/// Audit event listing.
#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<SecurityEvent>,
    pub count: usize,
}

/// Query parameters for listing blocked addresses.
#[derive(Debug, Deserialize)]
pub struct BlockedListQuery {
    #[serde(default = "default_blocked_limit")]
    pub limit: u32,
}

fn default_blocked_limit() -> u32 {
    100
}

/// Blocked address listing.
#[derive(Debug, Serialize)]
pub struct BlockedListResponse {
    pub entries: Vec<BlockedEntry>,
    pub count: usize,
}

/// A failed login reported by one of the affiliated products.
#[derive(Debug, Deserialize)]
pub struct FailedLoginReport {
    pub address: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Login endpoint that rejected the credentials
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Account identifier the attempt targeted, if known
    #[serde(default)]
    pub username: Option<String>,
    /// Product that observed the failure
    #[serde(default)]
    pub source: Option<String>,
}

/// Outcome of a failed-login report.
#[derive(Debug, Serialize)]
pub struct FailedLoginResponse {
    pub address: String,
    /// Failed logins from this address inside the lookback window
    pub recent_attempts: usize,
    pub threshold: usize,
    /// True when this report pushed the address over the threshold
    pub blocked: bool,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub persistence_reachable: bool,
    /// Degraded-mode events (persistence failures on the request path) so far
    pub degraded_events: u64,
    pub last_degraded_at: Option<DateTime<Utc>>,
    /// Addresses with a live rate window
    pub tracked_addresses: usize,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Security overview shown on the dashboard.
#[derive(Debug, Serialize)]
pub struct SecurityOverview {
    pub active_blocks: usize,
    pub permanent_blocks: usize,
    pub temporary_blocks: usize,
    pub recent_events: Vec<SecurityEvent>,
    pub signature_set_version: u32,
    pub generated_at: DateTime<Utc>,
}

/// Minimal status payload for the `/api` namespace.
#[derive(Debug, Serialize)]
pub struct ApiStatusResponse {
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}
