//! Client identity resolution for rate limiting and forwarding headers.
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use http::HeaderMap;

use crate::core::headers::{X_FORWARDED_FOR, X_REAL_IP};

/// Rate-limit key for a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientId {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

fn header_addr(headers: &HeaderMap, name: &http::HeaderName, first_only: bool) -> Option<IpAddr> {
    let value = headers.get(name)?.to_str().ok()?;
    if first_only {
        parse_addr(value.split(',').next()?)
    } else {
        parse_addr(value)
    }
}

/// Resolve the client address: the first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the socket peer. The first value that parses wins.
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    header_addr(headers, &X_FORWARDED_FOR, true)
        .or_else(|| header_addr(headers, &X_REAL_IP, false))
        .or_else(|| peer.map(|addr| addr.ip()))
}

pub fn resolve_client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientId {
    resolve_client_ip(headers, peer)
        .map(ClientId::from)
        .unwrap_or_else(ClientId::unknown)
}
