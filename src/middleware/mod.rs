//! HTTP middleware: access control, admin authentication, client addresses.
//!
//! # Architecture
//!
//! ```text
//! Request → Request ID → Trace → CORS → Access Control → Router
//!                                    │                     └─ /admin/* → Admin Auth → handler
//!                                    ↓
//!                       403 blocked / pattern, 429 rate limit
//! ```
//!
//! Access control wraps the whole router so unmatched paths (scanners
//! probing `/wp-admin`, `/.env`, ...) are rate limited and scanned as well.

pub mod access_control;
pub mod auth;
pub mod ip;

pub use access_control::{AccessControlLayer, ClientAddress};
pub use auth::AdminAuth;
pub use ip::{AddressSource, CidrRange, TrustedProxyConfig, UNKNOWN_ADDRESS, client_address};
