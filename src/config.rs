//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! Everything comes from the environment (or a `.env` file) with defaults
//! suited to production, except the persistence credentials, which have no
//! default: with `PERSISTENCE_BACKEND=rest` (the default) a missing
//! `PERSISTENCE_URL` or `PERSISTENCE_API_KEY` is a startup error. The service
//! never runs with a block check that cannot reach its store.
//!
//! # Access Control
//!
//! - `RATE_LIMIT_MAX_REQUESTS` / `RATE_LIMIT_WINDOW_SECS`: fixed window (default: 100 per 60s)
//! - `RATE_LIMIT_BLOCK_MINUTES`: block placed on addresses that trip the limit (default: 15)
//! - `FAILED_LOGIN_THRESHOLD` / `FAILED_LOGIN_WINDOW_SECS` / `FAILED_LOGIN_BLOCK_HOURS`:
//!   failed-login rule (default: 5 in 300s blocks for 24h)
//! - `NORMAL_ACCESS_SAMPLE_RATE`: fraction of clean protected requests logged (default: 0.1)
//! - `THREAT_SIGNATURES_FILE`: JSON list of extra signatures
//!
//! # Security Configuration
//!
//! - `ADMIN_API_KEY`: enables the `/admin` API; unset means it is not mounted
//! - `TRUSTED_PROXIES`: CIDR ranges whose forwarding headers are believed
//! - `CORS_ALLOWED_ORIGINS`: comma-separated origins (default: `*`)

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use crate::access::{
    AccessPolicy, FailedLoginPolicy, RatePolicy, ThreatMatcher, patterns::load_signature_file,
};
use crate::error::{AppError, AppResult};
use crate::persistence::RestGatewayConfig;

/// Which persistence gateway to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceBackend {
    /// Hosted PostgREST-style API.
    Rest,
    /// Process-local store; development only, nothing survives a restart.
    Memory,
}

impl FromStr for PersistenceBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rest" => Ok(Self::Rest),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend '{other}' (expected 'rest' or 'memory')")),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected 'pretty' or 'json')")),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Persistence Configuration
    // =========================================================================
    pub persistence_backend: PersistenceBackend,

    /// Project URL of the hosted database API
    pub persistence_url: Option<String>,

    /// Service key for the hosted database API
    pub persistence_api_key: Option<String>,

    pub blocked_table: String,

    pub events_table: String,

    /// Bound on every gateway call (default: 2s)
    pub persistence_timeout: Duration,

    /// Refuse to start if the store is unreachable (default: true)
    pub persistence_startup_check: bool,

    /// Interval for the background persistence probe (default: 30s)
    pub health_check_interval: Duration,

    // =========================================================================
    // Access Control Configuration
    // =========================================================================
    /// Deadline for one access decision before failing open (default: 5s)
    pub evaluation_timeout: Duration,

    /// How long a request waits for its audit write (default: 500ms)
    pub audit_wait: Duration,

    pub rate_limit_max_requests: u32,

    pub rate_limit_window: Duration,

    pub rate_limit_block_minutes: u32,

    /// Interval for dropping lapsed rate windows (default: 60s)
    pub rate_limit_sweep_interval: Duration,

    pub failed_login_threshold: usize,

    pub failed_login_window: Duration,

    pub failed_login_block_hours: u32,

    pub normal_access_sample_rate: f64,

    /// Path prefixes that skip access control
    pub bypass_prefixes: Vec<String>,

    /// Path prefixes eligible for normal-access sampling
    pub protected_prefixes: Vec<String>,

    /// `source` stamped on events this service records
    pub event_source: String,

    pub threat_signatures_file: Option<PathBuf>,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Admin API key; `None` leaves the admin API unmounted
    pub admin_api_key: Option<String>,

    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (forwarding headers trusted from anyone)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log filter (e.g., "info", "control_tower=debug")
    pub log_level: String,

    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for unparsable values, out-of-range
    /// values, or missing persistence credentials.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,

            // Persistence
            persistence_backend: Self::parse_env("PERSISTENCE_BACKEND", PersistenceBackend::Rest)?,
            persistence_url: Self::non_empty("PERSISTENCE_URL"),
            persistence_api_key: Self::non_empty("PERSISTENCE_API_KEY"),
            blocked_table: env::var("PERSISTENCE_BLOCKED_TABLE")
                .unwrap_or_else(|_| "blocked_ips".to_string()),
            events_table: env::var("PERSISTENCE_EVENTS_TABLE")
                .unwrap_or_else(|_| "security_events".to_string()),
            persistence_timeout: Duration::from_millis(Self::parse_env("PERSISTENCE_TIMEOUT_MS", 2000)?),
            persistence_startup_check: Self::parse_env("PERSISTENCE_STARTUP_CHECK", true)?,
            health_check_interval: Duration::from_secs(Self::parse_env(
                "HEALTH_CHECK_INTERVAL_SECS",
                30,
            )?),

            // Access control
            evaluation_timeout: Duration::from_millis(Self::parse_env(
                "ACCESS_EVALUATION_TIMEOUT_MS",
                5000,
            )?),
            audit_wait: Duration::from_millis(Self::parse_env("AUDIT_WAIT_MS", 500)?),
            rate_limit_max_requests: Self::parse_env("RATE_LIMIT_MAX_REQUESTS", 100)?,
            rate_limit_window: Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 60)?),
            rate_limit_block_minutes: Self::parse_env("RATE_LIMIT_BLOCK_MINUTES", 15)?,
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                60,
            )?),
            failed_login_threshold: Self::parse_env("FAILED_LOGIN_THRESHOLD", 5)?,
            failed_login_window: Duration::from_secs(Self::parse_env("FAILED_LOGIN_WINDOW_SECS", 300)?),
            failed_login_block_hours: Self::parse_env("FAILED_LOGIN_BLOCK_HOURS", 24)?,
            normal_access_sample_rate: Self::parse_env("NORMAL_ACCESS_SAMPLE_RATE", 0.1)?,
            bypass_prefixes: Self::parse_list(
                "ACCESS_BYPASS_PREFIXES",
                "/_next/,/static/,/assets/,/api/proxy,/favicon.ico,/health,/ready",
            ),
            protected_prefixes: Self::parse_list("ACCESS_PROTECTED_PREFIXES", "/dashboard,/api,/admin"),
            event_source: env::var("EVENT_SOURCE").unwrap_or_else(|_| "control-tower".to_string()),
            threat_signatures_file: Self::non_empty("THREAT_SIGNATURES_FILE").map(PathBuf::from),

            // Security
            admin_api_key: Self::non_empty("ADMIN_API_KEY"),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    pub fn validate(&self) -> AppResult<()> {
        if self.persistence_backend == PersistenceBackend::Rest {
            let url = self.persistence_url.as_deref().ok_or_else(|| {
                AppError::ConfigError("PERSISTENCE_URL is required for the rest backend".to_string())
            })?;
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(AppError::ConfigError(format!(
                    "PERSISTENCE_URL must be an http(s) URL, got '{url}'"
                )));
            }
            if self.persistence_api_key.is_none() {
                return Err(AppError::ConfigError(
                    "PERSISTENCE_API_KEY is required for the rest backend".to_string(),
                ));
            }
        }

        let positive = [
            ("RATE_LIMIT_MAX_REQUESTS", u64::from(self.rate_limit_max_requests)),
            ("RATE_LIMIT_WINDOW_SECS", self.rate_limit_window.as_secs()),
            ("RATE_LIMIT_BLOCK_MINUTES", u64::from(self.rate_limit_block_minutes)),
            ("RATE_LIMIT_SWEEP_INTERVAL_SECS", self.rate_limit_sweep_interval.as_secs()),
            ("FAILED_LOGIN_THRESHOLD", self.failed_login_threshold as u64),
            ("FAILED_LOGIN_WINDOW_SECS", self.failed_login_window.as_secs()),
            ("FAILED_LOGIN_BLOCK_HOURS", u64::from(self.failed_login_block_hours)),
            ("PERSISTENCE_TIMEOUT_MS", self.persistence_timeout.as_millis() as u64),
            ("ACCESS_EVALUATION_TIMEOUT_MS", self.evaluation_timeout.as_millis() as u64),
            ("HEALTH_CHECK_INTERVAL_SECS", self.health_check_interval.as_secs()),
            ("MAX_REQUEST_BODY_SIZE", self.max_request_body_size as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(AppError::ConfigError(format!("{name} must be greater than 0")));
        }

        // Worst case on the request path: one block lookup, then either the
        // lazy-expiry delete or the denial writes, then the sampled event.
        let request_path_budget = self.persistence_timeout + self.audit_wait * 2;
        if self.evaluation_timeout <= request_path_budget {
            return Err(AppError::ConfigError(format!(
                "ACCESS_EVALUATION_TIMEOUT_MS ({}) must exceed PERSISTENCE_TIMEOUT_MS + 2 x AUDIT_WAIT_MS ({})",
                self.evaluation_timeout.as_millis(),
                request_path_budget.as_millis()
            )));
        }

        if !(0.0..=1.0).contains(&self.normal_access_sample_rate) {
            return Err(AppError::ConfigError(format!(
                "NORMAL_ACCESS_SAMPLE_RATE must be between 0 and 1, got {}",
                self.normal_access_sample_rate
            )));
        }

        if let Some(prefix) = self
            .bypass_prefixes
            .iter()
            .chain(&self.protected_prefixes)
            .find(|p| !p.starts_with('/'))
        {
            return Err(AppError::ConfigError(format!(
                "Access path prefixes must start with '/', got '{prefix}'"
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_api_key.is_some()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address; `None` if disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        self.metrics_enabled()
            .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy::new(
            self.rate_limit_max_requests,
            Self::chrono(self.rate_limit_window),
        )
    }

    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy {
            bypass_prefixes: self.bypass_prefixes.clone(),
            protected_prefixes: self.protected_prefixes.clone(),
            rate_limit_block: ChronoDuration::minutes(i64::from(self.rate_limit_block_minutes)),
        }
    }

    pub fn failed_login_policy(&self) -> FailedLoginPolicy {
        FailedLoginPolicy {
            threshold: self.failed_login_threshold,
            window: Self::chrono(self.failed_login_window),
            block_duration: ChronoDuration::hours(i64::from(self.failed_login_block_hours)),
        }
    }

    /// Built-in signatures plus those from `THREAT_SIGNATURES_FILE`.
    pub fn threat_matcher(&self) -> AppResult<ThreatMatcher> {
        let extra = match &self.threat_signatures_file {
            Some(path) => load_signature_file(path)?,
            None => Vec::new(),
        };
        ThreatMatcher::with_extra(extra)
    }

    /// Settings for the REST gateway.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` if the URL or key is missing.
    pub fn rest_gateway_config(&self) -> AppResult<RestGatewayConfig> {
        let missing = |name: &str| AppError::ConfigError(format!("{name} is not set"));
        Ok(RestGatewayConfig {
            base_url: self
                .persistence_url
                .clone()
                .ok_or_else(|| missing("PERSISTENCE_URL"))?,
            api_key: self
                .persistence_api_key
                .clone()
                .ok_or_else(|| missing("PERSISTENCE_API_KEY"))?,
            blocked_table: self.blocked_table.clone(),
            events_table: self.events_table.clone(),
            timeout: self.persistence_timeout,
        })
    }

    fn chrono(duration: Duration) -> ChronoDuration {
        ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn non_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Comma-separated list with whitespace trimmed and blanks dropped.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        Self::split_list(&env::var(name).unwrap_or_else(|_| default.to_string()))
    }

    fn split_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Configuration for tests and local development: in-memory persistence,
/// production access-control defaults.
impl Default for Config {
    fn default() -> Self {
        let access = AccessPolicy::default();
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_request_body_size: 1024 * 1024,
            // Persistence
            persistence_backend: PersistenceBackend::Memory,
            persistence_url: None,
            persistence_api_key: None,
            blocked_table: "blocked_ips".to_string(),
            events_table: "security_events".to_string(),
            persistence_timeout: Duration::from_secs(2),
            persistence_startup_check: true,
            health_check_interval: Duration::from_secs(30),
            // Access control
            evaluation_timeout: Duration::from_secs(5),
            audit_wait: Duration::from_millis(500),
            rate_limit_max_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_block_minutes: 15,
            rate_limit_sweep_interval: Duration::from_secs(60),
            failed_login_threshold: 5,
            failed_login_window: Duration::from_secs(300),
            failed_login_block_hours: 24,
            normal_access_sample_rate: 0.1,
            bypass_prefixes: access.bypass_prefixes,
            protected_prefixes: access.protected_prefixes,
            event_source: "control-tower".to_string(),
            threat_signatures_file: None,
            // Security
            admin_api_key: None,
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![],
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}
