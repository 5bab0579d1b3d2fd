//! # Control Tower
//!
//! Access-control service for the Control Tower operations dashboard:
//!
//! - **Rate limiting**: fixed window per client address, automatic
//!   15-minute block on overflow
//! - **IP blocking**: temporary and permanent blocks in a hosted store,
//!   lazily expired on lookup
//! - **Threat signatures**: regex scan of every request URL, permanent block
//!   on a hit
//! - **Audit log**: security events written to the store, failed-login
//!   threshold blocking on top of them
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → Trace → Access Control → CORS)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, dashboard, admin)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Access core (guard, limiter, registry, matcher, recorder)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PersistenceGateway (PostgREST over HTTPS / in-memory)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use control_tower::{AppState, Config, build_router, state::build_gateway};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), control_tower::AppError> {
//!     let config = Config::from_env()?;
//!     let gateway = build_gateway(&config)?;
//!     let state = AppState::new(config, gateway)?;
//!     let app = build_router(state);
//!
//!     // Serve `app` with connect info so the socket peer is available...
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! Enable the admin API:
//! ```bash
//! ADMIN_API_KEY=your-secret-key cargo run
//! ```
//!
//! Tighten the rate limit:
//! ```bash
//! RATE_LIMIT_MAX_REQUESTS=30 RATE_LIMIT_WINDOW_SECS=60 cargo run
//! ```

pub mod access;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod persistence;
pub mod routes;
pub mod state;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use access::{AccessGuard, Verdict};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use persistence::{PersistenceGateway, PersistenceError};
pub use routes::build_router;
pub use state::AppState;
