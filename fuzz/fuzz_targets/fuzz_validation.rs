//! Fuzz testing for admin API validation and request inspection.
//!
//! Checks that the validators, the threat matcher, and the static-asset
//! bypass rule never panic on arbitrary input.
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```

#![no_main]

use std::sync::OnceLock;

use control_tower::access::{AccessPolicy, ThreatMatcher};
use control_tower::validation::{
    validate_address, validate_block_minutes, validate_event_type, validate_limit,
    validate_reason,
};
use libfuzzer_sys::fuzz_target;

fn matcher() -> &'static ThreatMatcher {
    static MATCHER: OnceLock<ThreatMatcher> = OnceLock::new();
    MATCHER.get_or_init(ThreatMatcher::default)
}

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = validate_address(s);
        let _ = validate_reason(s);
        let _ = validate_event_type(s);

        let _ = matcher().scan(s);
        let _ = AccessPolicy::default().bypasses(s);
    }

    if data.len() >= 4 {
        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let _ = validate_block_minutes(Some(value));
        let _ = validate_limit(value);
    }
});
