//! End-to-end access-control tests: the full router on a real socket,
//! driven with reqwest, with a manual clock for expiry.
//!
//! Run with: `cargo test --test access_control_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

use common::{
    FailingGateway, HangingGateway, PanickingGateway, StalledGateway, TestFixture, test_config,
    wait_for_events,
};
use control_tower::Config;
use control_tower::models::{BlockedBy, EventType, Severity};

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_rate_limit_blocks_after_one_hundred_requests() {
    let (fixture, gateway) = TestFixture::new().await;
    let address = "203.0.113.9";

    for i in 1..=100 {
        let response = fixture.get_as(address, "/api/status").await;
        assert_eq!(response.status(), StatusCode::OK, "request {i} should pass");
    }

    let response = fixture.get_as(address, "/api/status").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Too Many Requests");

    let entries = gateway.blocked_entries().await;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.address, address);
    assert_eq!(entry.blocked_by, BlockedBy::AutoRateLimit);
    assert!(!entry.is_permanent);
    assert_eq!(
        entry.blocked_until,
        Some(fixture.clock_now() + ChronoDuration::minutes(15))
    );

    // The block now takes precedence over the rate limiter
    let response = fixture.get_as(address, "/api/status").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "Forbidden", "message": "Access denied"}));
}

#[tokio::test]
async fn test_rate_limit_window_resets() {
    let config = Config {
        rate_limit_max_requests: 3,
        ..test_config()
    };
    let fixture = TestFixture::with_gateway(config, Arc::new(control_tower::persistence::InMemoryGateway::new())).await;

    for _ in 0..3 {
        assert_eq!(fixture.get_as("198.51.100.1", "/api/status").await.status(), StatusCode::OK);
    }
    // Other addresses have their own window
    assert_eq!(fixture.get_as("198.51.100.2", "/api/status").await.status(), StatusCode::OK);

    fixture.clock.advance(ChronoDuration::seconds(61));
    assert_eq!(fixture.get_as("198.51.100.1", "/api/status").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_bypassed_paths_are_not_counted() {
    let (fixture, gateway) = TestFixture::new().await;
    let address = "203.0.113.20";

    for _ in 0..120 {
        let response = fixture.get_as(address, "/static/app.js").await;
        assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
    for path in ["/health", "/ready", "/favicon.ico", "/_next/chunk.js", "/logo.png"] {
        assert_ne!(fixture.get_as(address, path).await.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    assert!(fixture.state.guard.limiter().window(address).is_none());
    assert!(gateway.events().await.is_empty());
}

#[tokio::test]
async fn test_socket_peer_used_without_forwarding_headers() {
    let (fixture, _gateway) = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/api/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(fixture.state.guard.limiter().window("127.0.0.1").is_some());
}

// =============================================================================
// Threat signatures
// =============================================================================

#[tokio::test]
async fn test_script_injection_blocks_permanently() {
    let (fixture, gateway) = TestFixture::new().await;
    let address = "198.51.100.7";

    let response = fixture
        .get_as(address, "/search?q=<script>alert(1)</script>")
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Suspicious request blocked");

    let entries = gateway.blocked_entries().await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_permanent);
    assert_eq!(entries[0].blocked_until, None);
    assert_eq!(entries[0].blocked_by, BlockedBy::AutoPatternMatch);
    assert_eq!(entries[0].reason, "suspicious pattern: script_injection");

    let events = wait_for_events(&gateway, 2).await;
    let pattern_events: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::SuspiciousPattern)
        .collect();
    assert_eq!(pattern_events.len(), 1);
    assert!(pattern_events[0].blocked);
    assert_eq!(pattern_events[0].address.as_deref(), Some(address));
    assert!(events.iter().any(|e| e.event_type == EventType::AutoBlock));

    // Clean follow-up requests are refused as blocked, forever
    fixture.clock.advance(ChronoDuration::days(365));
    let response = fixture.get_as(address, "/api/status").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Access denied");
}

#[tokio::test]
async fn test_signatures_scan_query_strings() {
    let (fixture, gateway) = TestFixture::new().await;

    let cases = [
        ("192.0.2.11", "/files?path=../../etc/passwd", "path_traversal"),
        ("192.0.2.12", "/api/status?id=1 UNION ALL SELECT password", "sql_injection"),
        ("192.0.2.13", "/dashboard?cb=eval(atob('x'))", "code_injection"),
    ];
    for (address, path, label) in cases {
        let response = fixture.get_as(address, path).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{path}");
        let entry = gateway
            .blocked_entries()
            .await
            .into_iter()
            .find(|e| e.address == address)
            .unwrap();
        assert_eq!(entry.reason, format!("suspicious pattern: {label}"));
    }
}

#[tokio::test]
async fn test_clean_request_passes() {
    let (fixture, gateway) = TestFixture::new().await;

    let response = fixture.get_as("192.0.2.50", "/api/status?page=2&sort=name").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["service"], "control_tower");
    assert!(gateway.blocked_entries().await.is_empty());
}

// =============================================================================
// Block expiry
// =============================================================================

#[tokio::test]
async fn test_expired_block_is_lifted_and_removed() {
    let (fixture, gateway) = TestFixture::new().await;
    let address = "203.0.113.30";

    let response = fixture
        .admin(Method::POST, "/admin/blocked")
        .json(&json!({"address": address, "reason": "manual test", "duration_minutes": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    assert_eq!(fixture.get_as(address, "/api/status").await.status(), StatusCode::FORBIDDEN);

    fixture.clock.advance(ChronoDuration::minutes(2));
    assert_eq!(fixture.get_as(address, "/api/status").await.status(), StatusCode::OK);
    assert!(gateway.blocked_entries().await.is_empty());
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_store_down_allows_traffic() {
    let fixture = TestFixture::with_gateway(test_config(), Arc::new(FailingGateway)).await;

    let response = fixture.get_as("203.0.113.40", "/api/status").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(fixture.state.degraded.events() >= 1);
    assert!(fixture.state.degraded.last_at().is_some());

    // Handlers that need the store report it as unavailable
    let response = fixture.get_as("203.0.113.40", "/dashboard").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    assert!(!fixture.state.probe_persistence().await);
    assert_eq!(fixture.get_as("203.0.113.40", "/ready").await.status(), StatusCode::SERVICE_UNAVAILABLE);
    let health: Value = fixture.get_as("203.0.113.40", "/health").await.json().await.unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["persistence_reachable"], false);
}

#[tokio::test]
async fn test_store_down_still_enforces_rate_limit() {
    let config = Config {
        rate_limit_max_requests: 2,
        ..test_config()
    };
    let fixture = TestFixture::with_gateway(config, Arc::new(FailingGateway)).await;

    assert_eq!(fixture.get_as("203.0.113.41", "/api/status").await.status(), StatusCode::OK);
    assert_eq!(fixture.get_as("203.0.113.41", "/api/status").await.status(), StatusCode::OK);
    assert_eq!(
        fixture.get_as("203.0.113.41", "/api/status").await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_stalled_store_still_denies() {
    // Shipped timeouts: the denial must land before the evaluation deadline.
    let config = Config {
        rate_limit_max_requests: 1,
        normal_access_sample_rate: 0.0,
        ..Config::default()
    };
    assert!(config.validate().is_ok());
    let deadline = config.evaluation_timeout;
    let fixture = TestFixture::with_gateway(config, Arc::new(StalledGateway)).await;

    let started = Instant::now();
    let response = fixture.get_as("203.0.113.45", "/api/x?q=%3Cscript%3E").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(started.elapsed() < deadline);

    let started = Instant::now();
    let response = fixture.get_as("203.0.113.45", "/dashboard").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(started.elapsed() < deadline);
}

#[tokio::test]
async fn test_panicking_evaluation_fails_open() {
    let fixture =
        TestFixture::with_gateway(test_config(), Arc::new(PanickingGateway::default())).await;

    let response = fixture.get_as("203.0.113.50", "/api/status").await;
    assert_eq!(response.status(), StatusCode::OK);

    // The server keeps serving after the panic
    let response = fixture.get_as("203.0.113.51", "/api/status").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_slow_evaluation_fails_open() {
    let config = Config {
        persistence_timeout: Duration::from_secs(5),
        evaluation_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let fixture = TestFixture::with_gateway(config, Arc::new(HangingGateway::default())).await;

    let started = Instant::now();
    let response = fixture.get_as("203.0.113.60", "/api/status").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(started.elapsed() < Duration::from_secs(3));
}

// =============================================================================
// Audit sampling
// =============================================================================

#[tokio::test]
async fn test_normal_access_logged_on_protected_paths_only() {
    let gateway = control_tower::persistence::InMemoryGateway::new();
    let config = Config {
        normal_access_sample_rate: 1.0,
        ..test_config()
    };
    let fixture = TestFixture::with_gateway(config, Arc::new(gateway.clone())).await;

    assert_eq!(fixture.get_as("192.0.2.70", "/api/status").await.status(), StatusCode::OK);
    let _ = fixture.get_as("192.0.2.70", "/not-protected").await;
    let _ = fixture.get_as("192.0.2.70", "/static/app.css").await;

    let events = wait_for_events(&gateway, 1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::NormalAccess);
    assert_eq!(events[0].severity, Severity::Low);
    assert_eq!(events[0].endpoint.as_deref(), Some("/api/status"));
    assert!(!events[0].blocked);
}

// =============================================================================
// Failed logins
// =============================================================================

#[tokio::test]
async fn test_failed_login_reports_trigger_block() {
    let (fixture, gateway) = TestFixture::new().await;
    let address = "203.0.113.77";
    let report = json!({"address": address, "endpoint": "/login", "username": "ops", "source": "portal"});

    for attempt in 1..=4 {
        let body: Value = fixture
            .admin(Method::POST, "/admin/failed-logins")
            .json(&report)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["recent_attempts"], attempt);
        assert_eq!(body["blocked"], false);
    }

    let body: Value = fixture
        .admin(Method::POST, "/admin/failed-logins")
        .json(&report)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["recent_attempts"], 5);
    assert_eq!(body["threshold"], 5);
    assert_eq!(body["blocked"], true);

    let entries = gateway.blocked_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].blocked_by, BlockedBy::AutoFailedLogin);
    assert_eq!(
        entries[0].blocked_until,
        Some(fixture.clock_now() + ChronoDuration::hours(24))
    );

    // A sixth report does not create a second entry
    let body: Value = fixture
        .admin(Method::POST, "/admin/failed-logins")
        .json(&report)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["blocked"], false);
    assert_eq!(gateway.blocked_entries().await.len(), 1);

    assert_eq!(fixture.get_as(address, "/api/status").await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_failed_logins_outside_window_do_not_count() {
    let (fixture, gateway) = TestFixture::new().await;
    let report = json!({"address": "203.0.113.78"});

    for _ in 0..4 {
        fixture
            .admin(Method::POST, "/admin/failed-logins")
            .json(&report)
            .send()
            .await
            .unwrap();
    }
    fixture.clock.advance(ChronoDuration::minutes(6));

    let body: Value = fixture
        .admin(Method::POST, "/admin/failed-logins")
        .json(&report)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["recent_attempts"], 1);
    assert!(gateway.blocked_entries().await.is_empty());
}

#[tokio::test]
async fn test_repeated_bad_admin_keys_block_the_caller() {
    let (fixture, gateway) = TestFixture::new().await;
    let address = "203.0.113.88";

    for _ in 0..5 {
        let response = fixture
            .client
            .get(fixture.url("/admin/blocked"))
            .header("x-forwarded-for", address)
            .header("x-api-key", "wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let mut blocked = false;
    for _ in 0..50 {
        if gateway.blocked_entries().await.iter().any(|e| e.address == address) {
            blocked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(blocked, "five failed admin logins should block the address");
    assert_eq!(fixture.get_as(address, "/api/status").await.status(), StatusCode::FORBIDDEN);
}

// =============================================================================
// Admin API
// =============================================================================

#[tokio::test]
async fn test_admin_block_list_and_unblock() {
    let (fixture, gateway) = TestFixture::new().await;
    let address = "198.51.100.50";
    let block = json!({"address": address, "reason": "manual review", "duration_minutes": 30});

    let response = fixture
        .admin(Method::POST, "/admin/blocked")
        .json(&block)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["created"], true);
    assert_eq!(body["entry"]["blocked_by"], "manual_admin");
    assert_eq!(body["entry"]["is_permanent"], false);

    let again = fixture
        .admin(Method::POST, "/admin/blocked")
        .json(&json!({"address": address, "reason": "second opinion"}))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(gateway.blocked_entries().await.len(), 1);

    let listing: Value = fixture
        .admin(Method::GET, "/admin/blocked")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["entries"][0]["ip_address"], address);

    assert_eq!(fixture.get_as(address, "/dashboard").await.status(), StatusCode::FORBIDDEN);

    let response = fixture
        .admin(Method::DELETE, &format!("/admin/blocked/{address}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gateway.blocked_entries().await.is_empty());

    let missing = fixture
        .admin(Method::DELETE, &format!("/admin/blocked/{address}"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let events: Value = fixture
        .admin(Method::GET, &format!("/admin/events?address={address}&event_type=manual_unblock"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(events["count"].as_u64().unwrap() >= 1);
    assert_eq!(events["events"][0]["severity"], "low");
}

#[tokio::test]
async fn test_admin_input_is_validated() {
    let (fixture, gateway) = TestFixture::new().await;

    let bad_address = fixture
        .admin(Method::POST, "/admin/blocked")
        .json(&json!({"address": "not-an-ip", "reason": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_address.status(), StatusCode::BAD_REQUEST);
    let body: Value = bad_address.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");

    let bad_type = fixture
        .admin(Method::GET, "/admin/events?event_type=Not%20Valid")
        .send()
        .await
        .unwrap();
    assert_eq!(bad_type.status(), StatusCode::BAD_REQUEST);

    assert!(gateway.blocked_entries().await.is_empty());
}
