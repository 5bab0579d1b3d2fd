//! Client address extraction.
//!
//! # Fallback chain
//!
//! ```text
//! X-Forwarded-For (first hop) → X-Real-IP → socket peer → "unknown"
//! ```
//!
//! Header values that do not parse as an IP address are skipped, so whatever
//! ends up as the key (and in persisted rows) is always an address or
//! [`UNKNOWN_ADDRESS`].
//!
//! # Security Warning: IP Spoofing Risk
//!
//! Forwarding headers are client-controlled unless a reverse proxy
//! overwrites them. Without `TRUSTED_PROXIES`, a client reaching the service
//! directly can rotate spoofed addresses to dodge the rate limiter, or frame
//! another address into a block. Deploy behind a proxy that overwrites the
//! headers:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! With `TRUSTED_PROXIES` configured, forwarding headers are only honored
//! when the socket peer lies inside one of the ranges; otherwise the peer
//! address itself is used.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Key used when no client address can be determined.
///
/// All such requests share one rate window.
pub const UNKNOWN_ADDRESS: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `10.0.0.0/8`, `::1/128`, or a bare address (full-length prefix).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (ip, prefix) = match cidr.split_once('/') {
            Some((ip, prefix)) => (ip.parse::<IpAddr>().ok()?, Some(prefix.parse::<u8>().ok()?)),
            None => (cidr.parse::<IpAddr>().ok()?, None),
        };
        let max_prefix = if ip.is_ipv4() { 32 } else { 128 };
        let prefix_len = prefix.unwrap_or(max_prefix);
        (prefix_len <= max_prefix).then_some(Self {
            network: ip,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix_len)).unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Reverse proxies whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();
        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether headers from `peer` may be trusted. Everything is trusted
    /// when no ranges are configured.
    pub fn is_trusted(&self, peer: &IpAddr) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(peer))
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Where the client address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    ForwardedFor,
    RealIp,
    Peer,
    Unknown,
}

fn header_address<B>(req: &Request<B>, name: &str, first_hop: bool) -> Option<IpAddr> {
    let value = req.headers().get(name)?.to_str().ok()?;
    let candidate = if first_hop {
        value.split(',').next()?
    } else {
        value
    };
    candidate.trim().parse().ok()
}

fn peer_address<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Best-effort originating address of `req`.
pub fn client_address<B>(req: &Request<B>, trusted: &TrustedProxyConfig) -> (String, AddressSource) {
    let peer = peer_address(req);

    let headers_trusted = match peer {
        Some(peer) => trusted.is_trusted(&peer),
        None => true,
    };

    if headers_trusted {
        if let Some(ip) = header_address(req, "x-forwarded-for", true) {
            return (ip.to_string(), AddressSource::ForwardedFor);
        }
        if let Some(ip) = header_address(req, "x-real-ip", false) {
            return (ip.to_string(), AddressSource::RealIp);
        }
    } else if req.headers().contains_key("x-forwarded-for") {
        debug!(
            peer = ?peer,
            "Ignoring forwarding headers from untrusted peer"
        );
    }

    match peer {
        Some(ip) => (ip.to_string(), AddressSource::Peer),
        None => (UNKNOWN_ADDRESS.to_string(), AddressSource::Unknown),
    }
}
