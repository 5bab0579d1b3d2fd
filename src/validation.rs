//! Input validation for the admin API.
//!
//! Everything here rejects with [`AppError::BadRequest`], which the error
//! layer turns into a 400 with a sanitized message.

use std::net::IpAddr;

use crate::error::{AppError, AppResult};
use crate::models::EventType;

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum length for a block reason.
pub const MAX_REASON_LENGTH: usize = 500;

/// Maximum length for free-text context fields (user agent, endpoint, ...).
pub const MAX_CONTEXT_LENGTH: usize = 1024;

/// Maximum length for event type strings.
pub const MAX_EVENT_TYPE_LENGTH: usize = 64;

/// Longest manual block the admin API accepts (one year).
pub const MAX_BLOCK_MINUTES: u32 = 525_600;

/// Largest page returned by list endpoints.
pub const MAX_LIST_LIMIT: u32 = 500;

/// Validate a client address and return its canonical text form.
///
/// Only literal IPv4/IPv6 addresses are accepted, so values that reach the
/// store's query strings are never arbitrary text.
pub fn validate_address(address: &str) -> AppResult<String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("address cannot be empty".to_string()));
    }

    trimmed
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| AppError::BadRequest(format!("'{trimmed}' is not a valid IP address")))
}

/// Validate a block reason.
pub fn validate_reason(reason: &str) -> AppResult<()> {
    if reason.trim().is_empty() {
        return Err(AppError::BadRequest("reason cannot be empty".to_string()));
    }
    validate_text("reason", reason, MAX_REASON_LENGTH)
}

/// Validate an optional free-text field; `None` always passes.
pub fn validate_context(field: &str, value: Option<&str>) -> AppResult<()> {
    match value {
        Some(value) => validate_text(field, value, MAX_CONTEXT_LENGTH),
        None => Ok(()),
    }
}

fn validate_text(field: &str, value: &str, max_len: usize) -> AppResult<()> {
    if value.len() > max_len {
        return Err(AppError::BadRequest(format!(
            "{field} cannot exceed {max_len} characters"
        )));
    }

    if let Some((i, c)) = value.char_indices().find(|(_, c)| c.is_control()) {
        return Err(AppError::BadRequest(format!(
            "{field} contains control character {:?} at position {i}",
            c
        )));
    }

    Ok(())
}

/// Validate a manual block length; `None` (permanent) always passes.
pub fn validate_block_minutes(minutes: Option<u32>) -> AppResult<()> {
    match minutes {
        Some(0) => Err(AppError::BadRequest(
            "duration_minutes must be at least 1 (omit it for a permanent block)".to_string(),
        )),
        Some(m) if m > MAX_BLOCK_MINUTES => Err(AppError::BadRequest(format!(
            "duration_minutes cannot exceed {MAX_BLOCK_MINUTES}"
        ))),
        _ => Ok(()),
    }
}

/// Validate an event type filter.
///
/// Rules:
/// - 1 to 64 characters
/// - Must start with a lowercase letter
/// - Only lowercase letters, digits, and underscores
///
/// Unrecognized but well-formed types are accepted; the store may hold
/// event kinds written by other products.
pub fn validate_event_type(event_type: &str) -> AppResult<EventType> {
    if event_type.is_empty() {
        return Err(AppError::BadRequest(
            "event_type cannot be empty".to_string(),
        ));
    }

    if event_type.len() > MAX_EVENT_TYPE_LENGTH {
        return Err(AppError::BadRequest(format!(
            "event_type cannot exceed {MAX_EVENT_TYPE_LENGTH} characters"
        )));
    }

    if !event_type.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(AppError::BadRequest(
            "event_type must start with a lowercase letter".to_string(),
        ));
    }

    if let Some((i, c)) = event_type
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(AppError::BadRequest(format!(
            "event_type contains invalid character {c:?} at position {i}. \
             Only lowercase letters, digits, and underscores are allowed"
        )));
    }

    Ok(EventType::from(event_type.to_string()))
}

/// Validate a list page size.
pub fn validate_limit(limit: u32) -> AppResult<u32> {
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )));
    }
    Ok(limit)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        assert_eq!(validate_address("203.0.113.50").unwrap(), "203.0.113.50");
        assert_eq!(validate_address(" 192.0.2.1 ").unwrap(), "192.0.2.1");
        assert_eq!(validate_address("2001:DB8::1").unwrap(), "2001:db8::1");
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(validate_address("").is_err());
        assert!(validate_address("unknown").is_err());
        assert!(validate_address("1.2.3.4&select=*").is_err());
        assert!(validate_address("999.1.1.1").is_err());
    }

    #[test]
    fn test_reason_rules() {
        assert!(validate_reason("abuse from scanner").is_ok());
        assert!(validate_reason("   ").is_err());
        assert!(validate_reason(&"x".repeat(MAX_REASON_LENGTH + 1)).is_err());
        assert!(validate_reason("line\nbreak").is_err());
    }

    #[test]
    fn test_context_fields() {
        assert!(validate_context("user_agent", None).is_ok());
        assert!(validate_context("user_agent", Some("curl/8.0")).is_ok());
        assert!(validate_context("endpoint", Some("/login\u{0000}")).is_err());
    }

    #[test]
    fn test_block_minutes() {
        assert!(validate_block_minutes(None).is_ok());
        assert!(validate_block_minutes(Some(15)).is_ok());
        assert!(validate_block_minutes(Some(MAX_BLOCK_MINUTES)).is_ok());
        assert!(validate_block_minutes(Some(0)).is_err());
        assert!(validate_block_minutes(Some(MAX_BLOCK_MINUTES + 1)).is_err());
    }

    #[test]
    fn test_valid_event_types() {
        assert_eq!(validate_event_type("failed_login").unwrap(), EventType::FailedLogin);
        assert_eq!(
            validate_event_type("password_reset2").unwrap(),
            EventType::Other("password_reset2".to_string())
        );
    }

    #[test]
    fn test_invalid_event_types() {
        assert!(validate_event_type("").is_err());
        assert!(validate_event_type("Failed_Login").is_err());
        assert!(validate_event_type("_private").is_err());
        assert!(validate_event_type("user.created").is_err());
        assert!(validate_event_type("eq.x&or=(a)").is_err());
        assert!(validate_event_type(&"a".repeat(MAX_EVENT_TYPE_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_limits() {
        assert_eq!(validate_limit(50).unwrap(), 50);
        assert!(validate_limit(0).is_err());
        assert!(validate_limit(MAX_LIST_LIMIT + 1).is_err());
    }
}
