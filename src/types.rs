use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::constant;

/// Network protocol of a dispatched connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection destination: either a literal socket address or an FQDN
/// that still needs resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Ip(SocketAddr),
    Fqdn(String, u16),
}

impl Destination {
    /// Create an FQDN destination, lowercasing the host.
    pub fn fqdn(host: impl Into<String>, port: u16) -> Self {
        Destination::Fqdn(host.into().to_lowercase(), port)
    }

    pub fn is_fqdn(&self) -> bool {
        matches!(self, Destination::Fqdn(..))
    }

    pub fn port(&self) -> u16 {
        match self {
            Destination::Ip(addr) => addr.port(),
            Destination::Fqdn(_, port) => *port,
        }
    }

    /// The literal IP, if this destination is one.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Destination::Ip(addr) => Some(addr.ip()),
            Destination::Fqdn(..) => None,
        }
    }

    /// The domain name, if this destination is an FQDN.
    pub fn domain(&self) -> Option<&str> {
        match self {
            Destination::Fqdn(domain, _) => Some(domain),
            Destination::Ip(_) => None,
        }
    }

    /// Hostname half, either the domain or the rendered IP.
    pub fn host(&self) -> String {
        match self {
            Destination::Ip(addr) => addr.ip().to_string(),
            Destination::Fqdn(domain, _) => domain.clone(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Ip(addr) => write!(f, "{}", addr),
            Destination::Fqdn(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::Ip(addr)
    }
}

/// Domain resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    AsIs,
    PreferIpv4,
    PreferIpv6,
    Ipv4Only,
    Ipv6Only,
}

impl Strategy {
    /// Resolve `AsIs` against a fallback default.
    pub fn or_default(self, default: Strategy) -> Strategy {
        match self {
            Strategy::AsIs => default,
            other => other,
        }
    }

    /// Reorder and filter resolved addresses according to the strategy.
    pub fn apply(self, addresses: Vec<IpAddr>) -> Vec<IpAddr> {
        match self {
            Strategy::AsIs => addresses,
            Strategy::Ipv4Only => addresses.into_iter().filter(IpAddr::is_ipv4).collect(),
            Strategy::Ipv6Only => addresses.into_iter().filter(IpAddr::is_ipv6).collect(),
            Strategy::PreferIpv4 => prefer(addresses, true),
            Strategy::PreferIpv6 => prefer(addresses, false),
        }
    }
}

fn prefer(addresses: Vec<IpAddr>, v4_first: bool) -> Vec<IpAddr> {
    let (mut first, second): (Vec<_>, Vec<_>) =
        addresses.into_iter().partition(|ip| ip.is_ipv4() == v4_first);
    first.extend(second);
    first
}

/// How the destination of a connection was derived from DNS state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsMode {
    #[default]
    None,
    FakeIp,
    RedirHost,
}

/// Dialer tuning owned by the router and handed to transport constructors.
///
/// Replaces process-wide mutable state: it is fixed at router construction,
/// before any dialer exists.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub concurrent_dial: bool,
    pub tcp_keep_alive_interval: std::time::Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            concurrent_dial: false,
            tcp_keep_alive_interval: constant::TCP_KEEP_ALIVE_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_destination_fqdn() {
        let dest = Destination::fqdn("Example.COM", 443);
        assert!(dest.is_fqdn());
        assert_eq!(dest.domain(), Some("example.com"));
        assert_eq!(dest.port(), 443);
        assert_eq!(dest.to_string(), "example.com:443");
    }

    #[test]
    fn test_destination_ip() {
        let dest = Destination::from(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            53,
        ));
        assert!(!dest.is_fqdn());
        assert_eq!(dest.ip(), Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
        assert_eq!(dest.host(), "1.2.3.4");
    }

    #[test]
    fn test_strategy_apply() {
        let addrs: Vec<IpAddr> = vec![
            "2001:db8::1".parse().unwrap(),
            "1.1.1.1".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
        ];
        assert_eq!(
            Strategy::Ipv4Only.apply(addrs.clone()),
            vec![
                "1.1.1.1".parse::<IpAddr>().unwrap(),
                "8.8.8.8".parse().unwrap()
            ]
        );
        let preferred = Strategy::PreferIpv4.apply(addrs.clone());
        assert!(preferred[0].is_ipv4());
        assert_eq!(preferred.len(), 3);
        assert_eq!(Strategy::AsIs.apply(addrs.clone()), addrs);
    }

    #[test]
    fn test_strategy_or_default() {
        assert_eq!(
            Strategy::AsIs.or_default(Strategy::PreferIpv6),
            Strategy::PreferIpv6
        );
        assert_eq!(
            Strategy::Ipv4Only.or_default(Strategy::PreferIpv6),
            Strategy::Ipv4Only
        );
    }
}
