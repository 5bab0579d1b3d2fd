//! PostgREST-style client for the hosted security tables.
//!
//! # Wire format
//!
//! ```text
//! GET    {base}/rest/v1/blocked_ips?ip_address=eq.X&select=*
//! POST   {base}/rest/v1/blocked_ips                  (Prefer: return=minimal)
//! DELETE {base}/rest/v1/blocked_ips?ip_address=eq.X  (Prefer: return=representation)
//! POST   {base}/rest/v1/security_events
//! GET    {base}/rest/v1/security_events?ip_address=eq.X&event_type=eq.Y
//!            &created_at=gte.T&order=created_at.desc&limit=N
//! PATCH  {base}/rest/v1/security_events?...           body {"blocked": true}
//! ```
//!
//! Every request carries the service key both as `apikey` and as a bearer
//! token. A unique violation comes back as HTTP 409 with SQLSTATE `23505`
//! and maps to [`PersistenceError::Duplicate`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::{EventQuery, PersistenceError, PersistenceGateway, PersistenceResult};
use crate::models::{BlockedEntry, SecurityEvent};

/// SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

/// Longest error body carried into a [`PersistenceError::Rejected`].
const MAX_ERROR_BODY: usize = 256;

/// Connection settings for [`RestGateway`].
#[derive(Debug, Clone)]
pub struct RestGatewayConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub base_url: String,
    /// Service key
    pub api_key: String,
    pub blocked_table: String,
    pub events_table: String,
    /// Per-request timeout enforced by the HTTP client
    pub timeout: Duration,
}

/// [`PersistenceGateway`] backed by a PostgREST HTTP API.
#[derive(Clone)]
pub struct RestGateway {
    client: Client,
    rest_url: String,
    api_key: String,
    blocked_table: String,
    events_table: String,
    timeout: Duration,
}

impl RestGateway {
    /// Build the gateway. Fails only if the HTTP client cannot be constructed.
    pub fn new(config: RestGatewayConfig) -> PersistenceResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| PersistenceError::Unavailable(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
            blocked_table: config.blocked_table,
            events_table: config.events_table,
            timeout: config.timeout,
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn event_filters(query: &EventQuery) -> Vec<(&'static str, String)> {
        let mut filters = Vec::new();
        if let Some(address) = &query.address {
            filters.push(("ip_address", format!("eq.{address}")));
        }
        if let Some(event_type) = &query.event_type {
            filters.push(("event_type", format!("eq.{event_type}")));
        }
        if let Some(since) = query.since {
            filters.push((
                "created_at",
                format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ));
        }
        filters
    }

    async fn send(&self, request: RequestBuilder) -> PersistenceResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout))?;
        check_status(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> PersistenceResult<T> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PersistenceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PersistenceGateway for RestGateway {
    #[instrument(skip(self))]
    async fn find_blocked(&self, address: &str) -> PersistenceResult<Option<BlockedEntry>> {
        let rows: Vec<BlockedEntry> = self
            .send_json(
                self.request(Method::GET, &self.blocked_table)
                    .query(&[("ip_address", format!("eq.{address}")), ("select", "*".into())])
                    .query(&[("limit", "1")]),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    #[instrument(skip(self, entry), fields(address = %entry.address))]
    async fn insert_blocked(&self, entry: &BlockedEntry) -> PersistenceResult<()> {
        self.send(
            self.request(Method::POST, &self.blocked_table)
                .header("Prefer", "return=minimal")
                .json(entry),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_blocked(&self, address: &str) -> PersistenceResult<bool> {
        let removed: Vec<BlockedEntry> = self
            .send_json(
                self.request(Method::DELETE, &self.blocked_table)
                    .header("Prefer", "return=representation")
                    .query(&[("ip_address", format!("eq.{address}"))]),
            )
            .await?;
        Ok(!removed.is_empty())
    }

    #[instrument(skip(self))]
    async fn list_blocked(&self, limit: Option<u32>) -> PersistenceResult<Vec<BlockedEntry>> {
        let mut request = self
            .request(Method::GET, &self.blocked_table)
            .query(&[("select", "*"), ("order", "created_at.desc")]);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        self.send_json(request).await
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type, severity = %event.severity))]
    async fn insert_event(&self, event: &SecurityEvent) -> PersistenceResult<()> {
        self.send(
            self.request(Method::POST, &self.events_table)
                .header("Prefer", "return=minimal")
                .json(event),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_events(&self, query: &EventQuery) -> PersistenceResult<Vec<SecurityEvent>> {
        let mut request = self
            .request(Method::GET, &self.events_table)
            .query(&Self::event_filters(query))
            .query(&[("select", "*"), ("order", "created_at.desc")]);
        if let Some(limit) = query.limit {
            request = request.query(&[("limit", limit)]);
        }
        self.send_json(request).await
    }

    #[instrument(skip(self))]
    async fn mark_events_blocked(&self, query: &EventQuery) -> PersistenceResult<u64> {
        let response = self
            .send(
                self.request(Method::PATCH, &self.events_table)
                    .header("Prefer", "return=minimal,count=exact")
                    .query(&Self::event_filters(query))
                    .json(&json!({ "blocked": true })),
            )
            .await?;
        Ok(content_range_total(&response).unwrap_or(0))
    }

    async fn ping(&self) -> PersistenceResult<()> {
        self.send(
            self.request(Method::GET, &self.blocked_table)
                .query(&[("select", "ip_address"), ("limit", "1")]),
        )
        .await?;
        Ok(())
    }
}

/// Map a reqwest transport failure onto the gateway error taxonomy.
fn map_transport_error(e: reqwest::Error, timeout: Duration) -> PersistenceError {
    if e.is_timeout() {
        debug!(error = %e, "Persistence request timed out");
        PersistenceError::Timeout(timeout)
    } else {
        PersistenceError::Unavailable(e.to_string())
    }
}

/// Turn non-2xx responses into errors.
async fn check_status(response: Response) -> PersistenceResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::CONFLICT || body.contains(UNIQUE_VIOLATION) {
        return Err(PersistenceError::Duplicate);
    }

    let message: String = body.chars().take(MAX_ERROR_BODY).collect();
    if status.is_server_error() {
        warn!(status = status.as_u16(), "Persistence store returned a server error");
        return Err(PersistenceError::Unavailable(format!("{status}: {message}")));
    }

    Err(PersistenceError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Total row count from a `Content-Range: 0-4/5` or `*/5` header.
fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get("content-range")?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .parse()
        .ok()
}
