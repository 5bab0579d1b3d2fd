//! Shared fixtures for the integration tests: the full router served on an
//! ephemeral port, plus gateways that fail in specific ways.
#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::net::TcpListener;

use control_tower::access::Sampler;
use control_tower::clock::{Clock, ManualClock};
use control_tower::models::{BlockedEntry, SecurityEvent};
use control_tower::persistence::{
    EventQuery, InMemoryGateway, PersistenceError, PersistenceGateway, PersistenceResult,
};
use control_tower::{AppState, Config, build_router};

pub const ADMIN_KEY: &str = "test-admin-key";

/// Router served over real TCP with a manual clock and seeded sampler.
pub struct TestFixture {
    pub base_url: String,
    pub client: Client,
    pub state: AppState,
    pub clock: ManualClock,
}

impl TestFixture {
    /// In-memory store, admin API enabled, nothing sampled.
    pub async fn new() -> (Self, InMemoryGateway) {
        let gateway = InMemoryGateway::new();
        let fixture = Self::with_gateway(test_config(), Arc::new(gateway.clone())).await;
        (fixture, gateway)
    }

    pub async fn with_gateway(config: Config, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let clock = ManualClock::new(Utc::now());
        let sampler = Sampler::seeded(config.normal_access_sample_rate, 7);
        let state = AppState::with_parts(config, gateway, Arc::new(clock.clone()), sampler)
            .expect("Failed to build application state");
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to ephemeral port");
        let addr = listener.local_addr().expect("Failed to get local address");

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("Server failed");
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: format!("http://{addr}"),
            client,
            state,
            clock,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET `path` as `address` (via `X-Forwarded-For`).
    pub async fn get_as(&self, address: &str, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("x-forwarded-for", address)
            .send()
            .await
            .expect("Request failed")
    }

    /// Admin request builder carrying the key and a fixed admin address.
    pub fn admin(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("x-forwarded-for", "192.0.2.200")
            .header("x-api-key", ADMIN_KEY)
    }
}

/// Defaults plus an admin key and a zero sample rate, so event counts in
/// tests are exact.
pub fn test_config() -> Config {
    Config {
        admin_api_key: Some(ADMIN_KEY.to_string()),
        normal_access_sample_rate: 0.0,
        persistence_timeout: Duration::from_millis(300),
        audit_wait: Duration::from_millis(500),
        evaluation_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Wait until the store holds at least `count` events, or give up.
pub async fn wait_for_events(gateway: &InMemoryGateway, count: usize) -> Vec<SecurityEvent> {
    for _ in 0..50 {
        let events = gateway.events().await;
        if events.len() >= count {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    gateway.events().await
}

// =============================================================================
// Misbehaving gateways
// =============================================================================

/// Every call fails as if the store were down.
#[derive(Clone, Default)]
pub struct FailingGateway;

fn down<T>() -> PersistenceResult<T> {
    Err(PersistenceError::Unavailable("connection refused".to_string()))
}

#[async_trait]
impl PersistenceGateway for FailingGateway {
    async fn find_blocked(&self, _address: &str) -> PersistenceResult<Option<BlockedEntry>> {
        down()
    }
    async fn insert_blocked(&self, _entry: &BlockedEntry) -> PersistenceResult<()> {
        down()
    }
    async fn delete_blocked(&self, _address: &str) -> PersistenceResult<bool> {
        down()
    }
    async fn list_blocked(&self, _limit: Option<u32>) -> PersistenceResult<Vec<BlockedEntry>> {
        down()
    }
    async fn insert_event(&self, _event: &SecurityEvent) -> PersistenceResult<()> {
        down()
    }
    async fn list_events(&self, _query: &EventQuery) -> PersistenceResult<Vec<SecurityEvent>> {
        down()
    }
    async fn mark_events_blocked(&self, _query: &EventQuery) -> PersistenceResult<u64> {
        down()
    }
    async fn ping(&self) -> PersistenceResult<()> {
        down()
    }
}

/// Block lookups panic; everything else is served from memory.
#[derive(Clone, Default)]
pub struct PanickingGateway {
    pub inner: InMemoryGateway,
}

#[async_trait]
impl PersistenceGateway for PanickingGateway {
    async fn find_blocked(&self, _address: &str) -> PersistenceResult<Option<BlockedEntry>> {
        panic!("simulated bug in block lookup");
    }
    async fn insert_blocked(&self, entry: &BlockedEntry) -> PersistenceResult<()> {
        self.inner.insert_blocked(entry).await
    }
    async fn delete_blocked(&self, address: &str) -> PersistenceResult<bool> {
        self.inner.delete_blocked(address).await
    }
    async fn list_blocked(&self, limit: Option<u32>) -> PersistenceResult<Vec<BlockedEntry>> {
        self.inner.list_blocked(limit).await
    }
    async fn insert_event(&self, event: &SecurityEvent) -> PersistenceResult<()> {
        self.inner.insert_event(event).await
    }
    async fn list_events(&self, query: &EventQuery) -> PersistenceResult<Vec<SecurityEvent>> {
        self.inner.list_events(query).await
    }
    async fn mark_events_blocked(&self, query: &EventQuery) -> PersistenceResult<u64> {
        self.inner.mark_events_blocked(query).await
    }
    async fn ping(&self) -> PersistenceResult<()> {
        Ok(())
    }
}

/// Block lookups never return; the rest is served from memory.
#[derive(Clone, Default)]
pub struct HangingGateway {
    pub inner: InMemoryGateway,
}

#[async_trait]
impl PersistenceGateway for HangingGateway {
    async fn find_blocked(&self, _address: &str) -> PersistenceResult<Option<BlockedEntry>> {
        std::future::pending().await
    }
    async fn insert_blocked(&self, entry: &BlockedEntry) -> PersistenceResult<()> {
        self.inner.insert_blocked(entry).await
    }
    async fn delete_blocked(&self, address: &str) -> PersistenceResult<bool> {
        self.inner.delete_blocked(address).await
    }
    async fn list_blocked(&self, limit: Option<u32>) -> PersistenceResult<Vec<BlockedEntry>> {
        self.inner.list_blocked(limit).await
    }
    async fn insert_event(&self, event: &SecurityEvent) -> PersistenceResult<()> {
        self.inner.insert_event(event).await
    }
    async fn list_events(&self, query: &EventQuery) -> PersistenceResult<Vec<SecurityEvent>> {
        self.inner.list_events(query).await
    }
    async fn mark_events_blocked(&self, query: &EventQuery) -> PersistenceResult<u64> {
        self.inner.mark_events_blocked(query).await
    }
    async fn ping(&self) -> PersistenceResult<()> {
        Ok(())
    }
}

/// Every call stalls forever, like a store that accepts connections and
/// never answers.
#[derive(Clone, Default)]
pub struct StalledGateway;

#[async_trait]
impl PersistenceGateway for StalledGateway {
    async fn find_blocked(&self, _address: &str) -> PersistenceResult<Option<BlockedEntry>> {
        std::future::pending().await
    }
    async fn insert_blocked(&self, _entry: &BlockedEntry) -> PersistenceResult<()> {
        std::future::pending().await
    }
    async fn delete_blocked(&self, _address: &str) -> PersistenceResult<bool> {
        std::future::pending().await
    }
    async fn list_blocked(&self, _limit: Option<u32>) -> PersistenceResult<Vec<BlockedEntry>> {
        std::future::pending().await
    }
    async fn insert_event(&self, _event: &SecurityEvent) -> PersistenceResult<()> {
        std::future::pending().await
    }
    async fn list_events(&self, _query: &EventQuery) -> PersistenceResult<Vec<SecurityEvent>> {
        std::future::pending().await
    }
    async fn mark_events_blocked(&self, _query: &EventQuery) -> PersistenceResult<u64> {
        std::future::pending().await
    }
    async fn ping(&self) -> PersistenceResult<()> {
        std::future::pending().await
    }
}
