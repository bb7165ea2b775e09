//! Node IP selection.
//!
//! Picks the addresses a supervised service binds and advertises as its own
//! from the addresses found on local interfaces. Operators steer the choice
//! with a list of subnets; entries prefixed with `!` exclude instead of include.
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;
use tracing::{debug, warn};

/// The "match everything" IPv4 subnet.
pub const IPV4_ANY: &str = "0.0.0.0/0";
/// The "match everything" IPv6 subnet.
pub const IPV6_ANY: &str = "::/0";

/// Errors produced by node IP selection.
#[derive(Debug, Error)]
pub enum NodeIpError {
    /// A subnet expression could not be parsed.
    #[error("failed to parse subnet {subnet:?}")]
    InvalidSubnet {
        /// The offending expression, as given.
        subnet: String,
    },
    /// Interface addresses could not be listed.
    #[error("failed to discover interface IP addresses: {0}")]
    Discovery(#[source] anyhow::Error),
}

/// A source of candidate addresses, in discovery order.
pub trait AddressSource: Send + Sync {
    /// Lists the addresses currently assigned to local interfaces.
    fn addresses(&self) -> anyhow::Result<Vec<IpAddr>>;
}

/// Lists addresses of the host's network interfaces.
///
/// Loopback, link-local, multicast and unspecified addresses are never
/// candidates and are skipped here.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostInterfaces;

impl AddressSource for HostInterfaces {
    fn addresses(&self) -> anyhow::Result<Vec<IpAddr>> {
        let mut result = Vec::new();
        for ifaddr in nix::ifaddrs::getifaddrs()? {
            let address = match ifaddr.address {
                Some(address) => address,
                None => continue,
            };
            let ip = if let Some(sin) = address.as_sockaddr_in() {
                IpAddr::V4(*SocketAddrV4::from(*sin).ip())
            } else if let Some(sin6) = address.as_sockaddr_in6() {
                IpAddr::V6(*SocketAddrV6::from(*sin6).ip())
            } else {
                continue;
            };
            if is_candidate(&ip) && !result.contains(&ip) {
                result.push(ip);
            }
        }
        Ok(result)
    }
}

/// A static list of addresses. Useful when the addresses are known up front.
#[derive(Clone, Debug, Default)]
pub struct StaticAddresses(pub Vec<IpAddr>);

impl AddressSource for StaticAddresses {
    fn addresses(&self) -> anyhow::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

fn is_candidate(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_loopback() && !v4.is_link_local() && !v4.is_multicast() && !v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            // fe80::/10
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !v6.is_loopback() && !link_local && !v6.is_multicast() && !v6.is_unspecified()
        }
    }
}

/// A parsed list of positive and negated subnets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubnetFilter {
    include: Vec<IpNet>,
    exclude: Vec<IpNet>,
}

impl SubnetFilter {
    /// Parses subnet expressions. An expression is a CIDR or a bare address
    /// (a single host), optionally prefixed with `!` to exclude it.
    pub fn parse<S: AsRef<str>>(subnets: &[S]) -> Result<Self, NodeIpError> {
        let mut filter = SubnetFilter::default();
        for subnet in subnets {
            let raw = subnet.as_ref().trim();
            let (negated, expression) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            let network = parse_network(expression).ok_or_else(|| NodeIpError::InvalidSubnet {
                subnet: subnet.as_ref().to_string(),
            })?;
            if negated {
                filter.exclude.push(network);
            } else {
                filter.include.push(network);
            }
        }
        Ok(filter)
    }

    /// Returns true if `ip` falls in at least one positive subnet and in no
    /// negated subnet.
    pub fn matches(&self, ip: &IpAddr) -> bool {
        self.include.iter().any(|net| net.contains(ip))
            && !self.exclude.iter().any(|net| net.contains(ip))
    }
}

fn parse_network(expression: &str) -> Option<IpNet> {
    if expression.contains('/') {
        IpNet::from_str(expression).ok()
    } else {
        let ip = IpAddr::from_str(expression).ok()?;
        let host_prefix = if ip.is_ipv4() { 32 } else { 128 };
        IpNet::new(ip, host_prefix).ok()
    }
}

/// Picks at most one IPv4 and one IPv6 node address.
///
/// Returns an empty list when `subnets` is empty: nothing is picked
/// automatically unless the operator (or [`ip_subnets_from_service_cidrs`])
/// supplies subnets. Addresses inside any of the `reserved` networks are never
/// eligible. When several addresses of the same family qualify, the first
/// discovered one wins and the rest are dropped with a warning.
pub fn pick_node_ips<S: AsRef<str>>(
    subnets: &[S],
    reserved: &[IpNet],
    source: &dyn AddressSource,
) -> Result<Vec<IpAddr>, NodeIpError> {
    if subnets.is_empty() {
        return Ok(Vec::new());
    }

    let filter = SubnetFilter::parse(subnets)?;
    let candidates = source.addresses().map_err(NodeIpError::Discovery)?;

    let mut result = Vec::with_capacity(2);
    let mut has_ipv4 = false;
    let mut has_ipv6 = false;

    for ip in candidates.into_iter().map(canonical) {
        if reserved.iter().any(|net| net.contains(&ip)) {
            debug!(%ip, "Skipping address in reserved network");
            continue;
        }
        if !filter.matches(&ip) {
            continue;
        }
        let seen = if ip.is_ipv4() {
            &mut has_ipv4
        } else {
            &mut has_ipv6
        };
        if *seen {
            warn!(
                %ip,
                "Skipped node IP, please use the kubelet nodeIP validSubnets setting to provide an explicit subnet for the node IP"
            );
            continue;
        }
        *seen = true;
        result.push(ip);
    }

    Ok(result)
}

/// Derives the automatic subnet policy from the service CIDRs: one "match
/// everything" subnet per CIDR, of the same address family, in order.
pub fn ip_subnets_from_service_cidrs<S: AsRef<str>>(
    service_cidrs: &[S],
) -> Result<Vec<String>, NodeIpError> {
    service_cidrs
        .iter()
        .map(|cidr| {
            let network =
                IpNet::from_str(cidr.as_ref().trim()).map_err(|_| NodeIpError::InvalidSubnet {
                    subnet: cidr.as_ref().to_string(),
                })?;
            Ok(match network {
                IpNet::V4(_) => IPV4_ANY.to_string(),
                IpNet::V6(_) => IPV6_ANY.to_string(),
            })
        })
        .collect()
}

// IPv4-mapped IPv6 addresses are treated as IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}
