//! Configuration structs consumed by the router.
//!
//! These are the deserialized form of the routing and DNS sections of a
//! proxy configuration. File formats and CLI parsing live outside this
//! crate; callers hand over the typed structs (commonly via `serde_json`).

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::types::Strategy;

/// Route section: rules, rule-sets, default detour and dialer tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteOptions {
    pub rules: Vec<RuleOptions>,
    pub rule_set: Vec<RuleSetOptions>,
    #[serde(rename = "final")]
    pub final_outbound: Option<String>,
    pub find_process: Option<bool>,
    pub stop_always_resolve_udp: bool,
    pub concurrent_dial: bool,
    /// TCP keep-alive interval in seconds; 0 keeps the built-in default.
    pub keep_alive_interval: u64,
}

/// DNS section: servers, rules, hosts, cache and fake-ip behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsOptions {
    pub servers: Vec<DnsServerOptions>,
    pub rules: Vec<DnsRuleOptions>,
    #[serde(rename = "final")]
    pub final_server: Option<String>,
    pub strategy: Strategy,
    /// Hosts entries; each value is a literal IP or an alias domain.
    pub hosts: HashMap<String, Vec<String>>,
    pub client: DnsClientOptions,
    pub reverse_mapping: bool,
    pub mapping_override: bool,
    pub client_subnet: Option<IpNet>,
    pub fake_ip: Option<FakeIpOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsClientOptions {
    pub disable_cache: bool,
    pub disable_expire: bool,
    pub independent_cache: bool,
    pub lazy_cache: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsServerOptions {
    pub tag: Option<String>,
    /// Ordered server addresses: literal IPs, hostnames, or the special
    /// forms `local`, `fakeip`, `rcode://…`, `dhcp://…`.
    pub address: Vec<String>,
    pub address_resolver: Option<String>,
    pub address_strategy: Strategy,
    pub strategy: Strategy,
    pub client_subnet: Option<IpNet>,
    pub insecure: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeIpOptions {
    pub enabled: bool,
    pub inet4_range: Option<Ipv4Net>,
    pub inet6_range: Option<Ipv6Net>,
    /// Domains matched here receive real addresses instead of fake ones.
    pub exclude_rule: Vec<DnsRuleOptions>,
}

/// One route rule: either a flat condition set or a logical tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleOptions {
    #[serde(alias = "")]
    Default(DefaultRuleOptions),
    Logical(LogicalRuleOptions),
}

impl Default for RuleOptions {
    fn default() -> Self {
        RuleOptions::Default(DefaultRuleOptions::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultRuleOptions {
    pub inbound: Vec<String>,
    pub ip_version: Option<u8>,
    pub network: Vec<String>,
    pub auth_user: Vec<String>,
    pub protocol: Vec<String>,
    pub domain: Vec<String>,
    pub domain_suffix: Vec<String>,
    pub domain_keyword: Vec<String>,
    pub domain_regex: Vec<String>,
    pub geosite: Vec<String>,
    pub source_geoip: Vec<String>,
    pub geoip: Vec<String>,
    pub ip_cidr: Vec<IpNet>,
    pub ip_is_private: bool,
    pub source_ip_cidr: Vec<IpNet>,
    pub source_ip_is_private: bool,
    pub source_port: Vec<u16>,
    pub source_port_range: Vec<String>,
    pub port: Vec<u16>,
    pub port_range: Vec<String>,
    pub process_name: Vec<String>,
    pub process_path: Vec<String>,
    pub package_name: Vec<String>,
    pub user: Vec<String>,
    pub wifi_ssid: Vec<String>,
    pub wifi_bssid: Vec<String>,
    pub rule_set: Vec<String>,
    pub rule_set_ip_cidr_match_source: bool,
    pub invert: bool,
    /// Never trigger a lazy destination lookup on behalf of this rule.
    pub skip_resolve: bool,
    pub outbound: String,
}

impl DefaultRuleOptions {
    /// A rule is valid when at least one condition field is set; inversion
    /// and the action fields alone do not count.
    pub fn is_valid(&self) -> bool {
        let blank = DefaultRuleOptions {
            invert: self.invert,
            skip_resolve: self.skip_resolve,
            outbound: self.outbound.clone(),
            rule_set_ip_cidr_match_source: self.rule_set_ip_cidr_match_source,
            ..DefaultRuleOptions::default()
        };
        *self != blank
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicalRuleOptions {
    pub mode: String,
    pub rules: Vec<RuleOptions>,
    pub invert: bool,
    pub skip_resolve: bool,
    pub outbound: String,
}

/// One DNS route rule, optionally followed by fallback rules evaluated
/// against the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DnsRuleOptions {
    #[serde(alias = "")]
    Default(DefaultDnsRuleOptions),
    Logical(LogicalDnsRuleOptions),
}

impl Default for DnsRuleOptions {
    fn default() -> Self {
        DnsRuleOptions::Default(DefaultDnsRuleOptions::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultDnsRuleOptions {
    pub inbound: Vec<String>,
    pub ip_version: Option<u8>,
    /// DNS record types, by numeric code.
    pub query_type: Vec<u16>,
    pub network: Vec<String>,
    pub auth_user: Vec<String>,
    pub protocol: Vec<String>,
    pub domain: Vec<String>,
    pub domain_suffix: Vec<String>,
    pub domain_keyword: Vec<String>,
    pub domain_regex: Vec<String>,
    pub geosite: Vec<String>,
    pub source_geoip: Vec<String>,
    pub geoip: Vec<String>,
    pub ip_cidr: Vec<IpNet>,
    pub ip_is_private: bool,
    pub source_ip_cidr: Vec<IpNet>,
    pub source_port: Vec<u16>,
    pub source_port_range: Vec<String>,
    pub port: Vec<u16>,
    pub port_range: Vec<String>,
    pub process_name: Vec<String>,
    pub process_path: Vec<String>,
    pub package_name: Vec<String>,
    pub user: Vec<String>,
    pub wifi_ssid: Vec<String>,
    pub wifi_bssid: Vec<String>,
    pub rule_set: Vec<String>,
    pub rule_set_ip_cidr_match_source: bool,
    pub rule_set_ip_cidr_accept_empty: bool,
    pub invert: bool,
    pub server: String,
    pub allow_fallthrough: bool,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpNet>,
    pub fallback_rules: Vec<FallbackRuleOptions>,
}

impl DefaultDnsRuleOptions {
    pub fn is_valid(&self) -> bool {
        let blank = DefaultDnsRuleOptions {
            invert: self.invert,
            server: self.server.clone(),
            allow_fallthrough: self.allow_fallthrough,
            disable_cache: self.disable_cache,
            rewrite_ttl: self.rewrite_ttl,
            client_subnet: self.client_subnet,
            ..DefaultDnsRuleOptions::default()
        };
        *self != blank || !self.fallback_rules.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicalDnsRuleOptions {
    pub mode: String,
    pub rules: Vec<DnsRuleOptions>,
    pub invert: bool,
    pub server: String,
    pub allow_fallthrough: bool,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpNet>,
    pub fallback_rules: Vec<FallbackRuleOptions>,
}

/// Post-response override evaluated against the answer addresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackRuleOptions {
    pub accept_result: bool,
    pub match_all: bool,
    pub ip_cidr: Vec<IpNet>,
    pub geoip: Vec<String>,
    pub rule_set: Vec<String>,
    pub ip_is_private: bool,
    pub invert: bool,
    pub server: String,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpNet>,
}

impl FallbackRuleOptions {
    pub fn is_valid(&self) -> bool {
        let blank = FallbackRuleOptions {
            invert: self.invert,
            server: self.server.clone(),
            ..FallbackRuleOptions::default()
        };
        *self != blank
    }
}

/// A named, reusable collection of headless rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSetOptions {
    pub tag: String,
    /// Inline rules. When empty, the rule-set is populated at post-start
    /// through the registered `RuleSetLoader`.
    pub rules: Vec<RuleOptions>,
}

/// Per-inbound dispatch options carried in the inbound context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundDispatchOptions {
    pub sniff_enabled: bool,
    /// Sniff timeout in milliseconds; 0 uses the built-in default.
    pub sniff_timeout: u64,
    pub sniff_override_destination: bool,
    pub domain_strategy: Strategy,
}

/// Static registration of an inbound with the router: its tag plus the
/// sniff-override rules scoped to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundRouteOptions {
    pub tag: String,
    pub sniff_override_rules: Vec<RuleOptions>,
}

/// Parse a `start:end` port range.
pub fn parse_port_range(spec: &str) -> Option<(u16, u16)> {
    let (start, end) = spec.split_once(':')?;
    let start = if start.is_empty() { 0 } else { start.parse().ok()? };
    let end = if end.is_empty() {
        u16::MAX
    } else {
        end.parse().ok()?
    };
    (start <= end).then_some((start, end))
}

/// True when the address is in a private or loopback range.
pub fn ip_is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_options_json() {
        let raw = r#"{
            "type": "default",
            "domain_suffix": ["example.com"],
            "port": [443],
            "outbound": "proxy"
        }"#;
        let rule: RuleOptions = serde_json::from_str(raw).unwrap();
        match rule {
            RuleOptions::Default(options) => {
                assert_eq!(options.domain_suffix, vec!["example.com"]);
                assert_eq!(options.port, vec![443]);
                assert_eq!(options.outbound, "proxy");
                assert!(options.is_valid());
            }
            RuleOptions::Logical(_) => panic!("expected default rule"),
        }
    }

    #[test]
    fn test_default_rule_validity() {
        let empty = DefaultRuleOptions {
            invert: true,
            outbound: "proxy".to_string(),
            ..DefaultRuleOptions::default()
        };
        assert!(!empty.is_valid());

        let with_condition = DefaultRuleOptions {
            domain: vec!["example.com".to_string()],
            outbound: "proxy".to_string(),
            ..DefaultRuleOptions::default()
        };
        assert!(with_condition.is_valid());
    }

    #[test]
    fn test_dns_rule_fallback_only_is_valid() {
        let rule = DefaultDnsRuleOptions {
            server: "remote".to_string(),
            fallback_rules: vec![FallbackRuleOptions {
                match_all: true,
                server: "local".to_string(),
                ..FallbackRuleOptions::default()
            }],
            ..DefaultDnsRuleOptions::default()
        };
        assert!(rule.is_valid());
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("1000:2000"), Some((1000, 2000)));
        assert_eq!(parse_port_range(":443"), Some((0, 443)));
        assert_eq!(parse_port_range("8000:"), Some((8000, u16::MAX)));
        assert_eq!(parse_port_range("2000:1000"), None);
        assert_eq!(parse_port_range("no-colon"), None);
    }

    #[test]
    fn test_ip_is_private() {
        assert!(ip_is_private("192.168.1.1".parse().unwrap()));
        assert!(ip_is_private("127.0.0.1".parse().unwrap()));
        assert!(ip_is_private("fd00::1".parse().unwrap()));
        assert!(!ip_is_private("8.8.8.8".parse().unwrap()));
        assert!(!ip_is_private("2001:4860:4860::8888".parse().unwrap()));
    }
}
