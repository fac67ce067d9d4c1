//! Client identity normalization and CDN-aware resolution.

use axum::http::HeaderMap;
use ipnetwork::Ipv6Network;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

use crate::collab::CdnMembership;
use crate::config::CdnConfig;
use crate::error::Rejection;

/// Prefix length IPv6 clients are grouped by.
pub const IPV6_GROUP_PREFIX: u8 = 64;

/// Normalized client key used by the limiters and the WAF.
///
/// IPv4 addresses are kept exact; IPv6 addresses collapse to their /64
/// (`2001:db8:1:2::/64`), since one subscriber typically owns a whole /64.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity(Arc<str>);

impl ClientIdentity {
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(v4) => Self(Arc::from(v4.to_string())),
            IpAddr::V6(v6) => {
                let network = Ipv6Network::new(v6, IPV6_GROUP_PREFIX)
                    .map(|n| n.network())
                    .unwrap_or(v6);
                Self(Arc::from(format!("{}/{}", network, IPV6_GROUP_PREFIX)))
            }
        }
    }

    /// Rebuild an identity from its stored key, as found in limiter snapshots.
    pub fn from_key(key: &str) -> Self {
        Self(Arc::from(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_ipv6_range(&self) -> bool {
        self.0.contains(':')
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<IpAddr> for ClientIdentity {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

/// Resolve the identity of the client behind `peer`.
///
/// The forwarded client-address headers are trusted only when `peer` is a CDN
/// edge. With `cdn.require` set, any other peer is refused.
pub fn resolve_client_identity(
    peer: SocketAddr,
    headers: &HeaderMap,
    cdn: &dyn CdnMembership,
    config: &CdnConfig,
) -> Result<ClientIdentity, Rejection> {
    let peer_ip = peer.ip().to_canonical();

    if !cdn.is_real_client_ip(peer_ip) {
        if config.require {
            debug!(peer = %peer_ip, "Refusing peer outside the CDN");
            return Err(Rejection::Forbidden);
        }
        return Ok(ClientIdentity::from_ip(peer_ip));
    }

    let forwarded = header_ip(headers, &config.client_ip_header).or_else(|| {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok())
    });

    Ok(ClientIdentity::from_ip(forwarded.unwrap_or(peer_ip)))
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
