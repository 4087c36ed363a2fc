//! Client address resolution behind proxies
//!
//! Anonymous callers are rate limited per address, so the address must not be
//! spoofable. Forwarding headers are only honoured when the connecting peer is
//! a trusted proxy, and `X-Forwarded-For` is walked right to left: the first
//! hop that is not a trusted proxy is the client. Prepended entries written by
//! the client itself are never reached.
//!
//! Trusted ranges come from `TRUSTED_PROXIES` (comma-separated addresses or
//! CIDR blocks), defaulting to loopback and private networks.

use actix_web::{web, HttpRequest};
use std::env;
use std::net::IpAddr;
use tracing::{debug, warn};

const DEFAULT_TRUSTED: &str = "127.0.0.1,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,fc00::/7";

/// Address (or network) and prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    fn parse(raw: &str) -> Option<Self> {
        let (addr, prefix) = match raw.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (raw, None),
        };
        let network: IpAddr = addr.trim().parse().ok()?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().ok().filter(|p| *p <= max)?,
            None => max,
        };
        Some(Self { network, prefix })
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (ip, self.network) {
            (IpAddr::V4(ip), IpAddr::V4(net)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(*ip) & mask == u32::from(net) & mask
            }
            (IpAddr::V6(ip), IpAddr::V6(net)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(*ip) & mask == u128::from(net) & mask
            }
            _ => false,
        }
    }
}

/// Set of proxies whose forwarding headers are believed
#[derive(Debug, Clone)]
pub struct TrustedProxies {
    ranges: Vec<Cidr>,
}

impl Default for TrustedProxies {
    fn default() -> Self {
        Self::parse(DEFAULT_TRUSTED)
    }
}

impl TrustedProxies {
    /// Read `TRUSTED_PROXIES`, falling back to the private-network default
    pub fn from_env() -> Self {
        match env::var("TRUSTED_PROXIES") {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Self::default(),
        }
    }

    /// Parse a comma-separated list; malformed entries are skipped
    pub fn parse(raw: &str) -> Self {
        let ranges = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|entry| {
                let cidr = Cidr::parse(entry);
                if cidr.is_none() {
                    warn!(entry, "Ignoring malformed trusted proxy entry");
                }
                cidr
            })
            .collect();
        Self { ranges }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }

    /// Resolve the client address for `req`, or `"unknown"`
    pub fn client_ip(&self, req: &HttpRequest) -> String {
        let peer = req
            .peer_addr()
            .map(|addr| addr.ip())
            .or_else(|| {
                req.connection_info()
                    .peer_addr()
                    .and_then(|p| p.parse::<IpAddr>().ok())
            });

        let Some(peer) = peer else {
            return "unknown".to_string();
        };
        if !self.contains(&peer) {
            return peer.to_string();
        }

        if let Some(chain) = header_str(req, "x-forwarded-for") {
            for hop in chain.split(',').rev().map(str::trim) {
                match hop.parse::<IpAddr>() {
                    Ok(ip) if !self.contains(&ip) => {
                        debug!(client_ip = %ip, peer_ip = %peer, "Client address from X-Forwarded-For");
                        return ip.to_string();
                    }
                    Ok(_) => continue,
                    Err(_) => warn!(hop, "Invalid address in X-Forwarded-For, skipping"),
                }
            }
        }

        if let Some(ip) = header_str(req, "x-real-ip").and_then(|v| v.trim().parse::<IpAddr>().ok()) {
            return ip.to_string();
        }

        peer.to_string()
    }
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Resolve the client address using the app's [`TrustedProxies`], or the
/// default set when none is registered
pub fn client_ip(req: &HttpRequest) -> String {
    match req.app_data::<web::Data<TrustedProxies>>() {
        Some(proxies) => proxies.client_ip(req),
        None => TrustedProxies::default().client_ip(req),
    }
}
