mod admin;
mod dashboard;
mod health;

pub use admin::{block_address, list_blocked, list_events, report_failed_login, unblock_address};
pub use dashboard::{api_status, dashboard_overview};
pub use health::{health_check, readiness_check};
