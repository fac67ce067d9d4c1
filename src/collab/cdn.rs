//! CIDR-based CDN edge membership.

use ipnetwork::IpNetwork;
use std::net::IpAddr;

use super::CdnMembership;
use crate::config::CdnConfig;
use crate::error::{GatewayError, Result};

/// Published Cloudflare edge ranges.
pub const CLOUDFLARE_RANGES: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
    "2400:cb00::/32",
    "2606:4700::/32",
    "2803:f800::/32",
    "2405:b500::/32",
    "2405:8100::/32",
    "2a06:98c0::/29",
    "2c0f:f248::/32",
];

#[derive(Debug, Clone, Default)]
pub struct CidrCdnMembership {
    networks: Vec<IpNetwork>,
}

impl CidrCdnMembership {
    pub fn from_cidrs(cidrs: &[String]) -> Result<Self> {
        let networks = cidrs
            .iter()
            .map(|cidr| {
                cidr.trim().parse::<IpNetwork>().map_err(|e| {
                    GatewayError::Config(format!("invalid CDN range '{}': {}", cidr, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { networks })
    }

    /// The published Cloudflare edge ranges.
    pub fn cloudflare() -> Self {
        Self {
            networks: CLOUDFLARE_RANGES
                .iter()
                .filter_map(|cidr| cidr.parse().ok())
                .collect(),
        }
    }

    pub fn from_config(config: &CdnConfig) -> Result<Self> {
        let mut membership = if config.cloudflare_ranges {
            Self::cloudflare()
        } else {
            Self::default()
        };
        membership
            .networks
            .extend(Self::from_cidrs(&config.extra_cidrs)?.networks);
        Ok(membership)
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl CdnMembership for CidrCdnMembership {
    fn is_real_client_ip(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.networks.iter().any(|network| network.contains(ip))
    }
}
