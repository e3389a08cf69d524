//! Client identity resolution.
//!
//! The address every per-client limit is keyed on. Candidates are tried in order:
//! `CF-Connecting-IP`, `X-Real-IP`, the first `X-Forwarded-For` entry, then the transport
//! peer. A header candidate is skipped unless it parses (after stripping any port) to a
//! public address; the peer address is used as-is.

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use std::{
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Parse `candidate`, accepting `ip`, `ip:port`, `[v6]` and `[v6]:port`.
#[must_use]
pub fn parse_candidate(candidate: &str) -> Option<IpAddr> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    if let Ok(addr) = candidate.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    if let Ok(ip) = candidate.parse::<IpAddr>() {
        return Some(ip);
    }
    let unbracketed = candidate.strip_prefix('[')?.strip_suffix(']')?;
    unbracketed.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_unspecified()
        || ip.is_link_local()
        || ip.is_broadcast())
}

/// `false` for loopback, private, link-local and unspecified addresses.
#[must_use]
pub fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_public_v4(mapped);
            }
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

fn header_candidate(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    let value = headers.get(name)?.to_str().ok()?;
    let first = if name == X_FORWARDED_FOR {
        value.split(',').next()?
    } else {
        value
    };
    parse_candidate(first).filter(|ip| is_public(*ip))
}

/// Resolve the client address from proxy headers and the transport peer.
#[must_use]
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    [CF_CONNECTING_IP, X_REAL_IP, X_FORWARDED_FOR]
        .iter()
        .find_map(|name| header_candidate(headers, name))
        .or_else(|| peer.map(|addr| addr.ip()))
}

/// Extractor for the resolved client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub Option<IpAddr>);

impl ClientIp {
    /// The key used for per-client limits; `unknown` when nothing resolved.
    #[must_use]
    pub fn key(&self) -> String {
        self.0.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
    }
}

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self(resolve_client_ip(&parts.headers, peer)))
    }
}
