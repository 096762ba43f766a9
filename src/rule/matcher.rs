//! Rule condition items and the shared domain pattern matcher.

use std::collections::HashSet;
use std::net::IpAddr;

use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use parking_lot::RwLock;
use regex::Regex;

use super::RuleContext;
use crate::adapter::{GeositeEntryType, InboundContext};
use crate::config::{ip_is_private, parse_port_range};
use crate::error::{Error, Result};
use crate::types::Network;

/// Compiled domain patterns shared by domain and geosite items.
#[derive(Debug, Default)]
pub struct DomainPatterns {
    pub exact: HashSet<String>,
    pub suffix: Vec<String>,
    pub keyword: Vec<String>,
    pub regex: Vec<Regex>,
}

impl DomainPatterns {
    pub fn compile(
        exact: &[String],
        suffix: &[String],
        keyword: &[String],
        regex: &[String],
    ) -> Result<Self> {
        let compiled_regex = regex
            .iter()
            .map(|pattern| Regex::new(pattern).map_err(|err| Error::Config(err.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            exact: exact.iter().map(|d| d.to_lowercase()).collect(),
            suffix: suffix.iter().map(|d| d.to_lowercase()).collect(),
            keyword: keyword.iter().map(|d| d.to_lowercase()).collect(),
            regex: compiled_regex,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
            && self.suffix.is_empty()
            && self.keyword.is_empty()
            && self.regex.is_empty()
    }

    pub fn matches(&self, domain: &str) -> bool {
        if self.exact.contains(domain) {
            return true;
        }
        for suffix in &self.suffix {
            let bare = suffix.strip_prefix('.').unwrap_or(suffix);
            if domain == bare || domain.ends_with(&format!(".{}", bare)) {
                return true;
            }
        }
        for keyword in &self.keyword {
            if domain.contains(keyword) {
                return true;
            }
        }
        self.regex.iter().any(|regex| regex.is_match(domain))
    }
}

/// One compiled condition of a rule. A rule matches when all of its items
/// match.
#[derive(Debug)]
pub enum RuleItem {
    Inbound(Vec<String>),
    IpVersion(u8),
    Network(Vec<Network>),
    User(Vec<String>),
    Protocol(Vec<String>),
    QueryType(Vec<RecordType>),
    Domain(DomainPatterns),
    Geosite {
        codes: Vec<String>,
        compiled: RwLock<Option<DomainPatterns>>,
    },
    GeoIp {
        codes: Vec<String>,
        source: bool,
    },
    IpCidr {
        nets: Vec<IpNet>,
        source: bool,
    },
    IpIsPrivate {
        source: bool,
    },
    Port {
        ports: Vec<u16>,
        source: bool,
    },
    PortRange {
        ranges: Vec<(u16, u16)>,
        source: bool,
    },
    ProcessName(Vec<String>),
    ProcessPath(Vec<String>),
    PackageName(Vec<String>),
    WifiSsid(Vec<String>),
    WifiBssid(Vec<String>),
    RuleSet {
        tags: Vec<String>,
        match_source: bool,
        /// Treat a rule-set carrying IP rules as matched when the context
        /// has no IP information yet.
        accept_empty: bool,
    },
}

impl RuleItem {
    pub fn parse_networks(raw: &[String]) -> Result<Vec<Network>> {
        raw.iter()
            .map(|value| match value.to_lowercase().as_str() {
                "tcp" => Ok(Network::Tcp),
                "udp" => Ok(Network::Udp),
                other => Err(Error::Config(format!("unknown network: {}", other))),
            })
            .collect()
    }

    pub fn parse_port_ranges(raw: &[String]) -> Result<Vec<(u16, u16)>> {
        raw.iter()
            .map(|spec| {
                parse_port_range(spec)
                    .ok_or_else(|| Error::Config(format!("invalid port range: {}", spec)))
            })
            .collect()
    }

    /// Does this item consult destination-IP semantics, requiring the
    /// destination to be resolved first.
    pub fn consults_destination_ip(&self) -> bool {
        matches!(
            self,
            RuleItem::IpCidr { source: false, .. }
                | RuleItem::IpIsPrivate { source: false }
                | RuleItem::GeoIp { source: false, .. }
                | RuleItem::RuleSet {
                    match_source: false,
                    ..
                }
        )
    }

    pub fn matches(&self, rctx: &RuleContext, ctx: &mut InboundContext) -> bool {
        match self {
            RuleItem::Inbound(tags) => tags.iter().any(|tag| *tag == ctx.inbound),
            RuleItem::IpVersion(version) => match ctx.query_type {
                Some(RecordType::A) => *version == 4,
                Some(RecordType::AAAA) => *version == 6,
                Some(_) => false,
                None => match destination_ips(ctx).first() {
                    Some(IpAddr::V4(_)) => *version == 4,
                    Some(IpAddr::V6(_)) => *version == 6,
                    None => false,
                },
            },
            RuleItem::Network(networks) => networks.contains(&ctx.network),
            RuleItem::User(users) => ctx
                .user
                .as_ref()
                .map(|user| users.contains(user))
                .unwrap_or(false),
            RuleItem::Protocol(protocols) => ctx
                .protocol
                .as_ref()
                .map(|protocol| protocols.iter().any(|p| p == protocol))
                .unwrap_or(false),
            RuleItem::QueryType(types) => ctx
                .query_type
                .map(|query_type| types.contains(&query_type))
                .unwrap_or(false),
            RuleItem::Domain(patterns) => match_domain(patterns, ctx),
            RuleItem::Geosite { compiled, .. } => compiled
                .read()
                .as_ref()
                .map(|patterns| match_domain(patterns, ctx))
                .unwrap_or(false),
            RuleItem::GeoIp { codes, source } => {
                let country = lookup_country(rctx, ctx, *source);
                match country {
                    Some(country) => codes.iter().any(|code| *code == country),
                    None => false,
                }
            }
            RuleItem::IpCidr { nets, source } => {
                let addresses = if self.effective_source(ctx, *source) {
                    vec![ctx.source.ip()]
                } else {
                    destination_ips(ctx)
                };
                addresses
                    .iter()
                    .any(|ip| nets.iter().any(|net| net.contains(ip)))
            }
            RuleItem::IpIsPrivate { source } => {
                let addresses = if self.effective_source(ctx, *source) {
                    vec![ctx.source.ip()]
                } else {
                    destination_ips(ctx)
                };
                addresses.iter().any(|ip| ip_is_private(*ip))
            }
            RuleItem::Port { ports, source } => {
                let port = if *source {
                    ctx.source.port()
                } else {
                    ctx.destination.port()
                };
                ports.contains(&port)
            }
            RuleItem::PortRange { ranges, source } => {
                let port = if *source {
                    ctx.source.port()
                } else {
                    ctx.destination.port()
                };
                ranges.iter().any(|(start, end)| port >= *start && port <= *end)
            }
            RuleItem::ProcessName(names) => ctx
                .process_info
                .as_ref()
                .map(|info| {
                    let name = info
                        .process_path
                        .rsplit(['/', '\\'])
                        .next()
                        .unwrap_or_default();
                    names.iter().any(|n| n == name)
                })
                .unwrap_or(false),
            RuleItem::ProcessPath(paths) => ctx
                .process_info
                .as_ref()
                .map(|info| paths.contains(&info.process_path))
                .unwrap_or(false),
            RuleItem::PackageName(packages) => ctx
                .process_info
                .as_ref()
                .map(|info| packages.contains(&info.package_name))
                .unwrap_or(false),
            RuleItem::WifiSsid(ssids) => ctx
                .wifi_state
                .as_ref()
                .map(|state| ssids.contains(&state.ssid))
                .unwrap_or(false),
            RuleItem::WifiBssid(bssids) => ctx
                .wifi_state
                .as_ref()
                .map(|state| bssids.contains(&state.bssid))
                .unwrap_or(false),
            RuleItem::RuleSet {
                tags,
                match_source,
                accept_empty,
            } => {
                let rule_sets = rctx.rule_sets.read();
                if *accept_empty && !*match_source && destination_ips(ctx).is_empty() {
                    let empty_match = tags.iter().any(|tag| {
                        rule_sets
                            .get(tag)
                            .map(|rule_set| rule_set.metadata().contains_ip_cidr_rule)
                            .unwrap_or(false)
                    });
                    if empty_match {
                        return true;
                    }
                }
                let previous = ctx.rule_cache.rule_set_match_source;
                ctx.rule_cache.rule_set_match_source = *match_source;
                let matched = tags.iter().any(|tag| {
                    rule_sets
                        .get(tag)
                        .map(|rule_set| rule_set.matches(rctx, ctx))
                        .unwrap_or(false)
                });
                ctx.rule_cache.rule_set_match_source = previous;
                matched
            }
        }
    }

    /// IP items inside a rule-set honor the caller's match-source flag.
    fn effective_source(&self, ctx: &InboundContext, source: bool) -> bool {
        source || ctx.rule_cache.rule_set_match_source
    }

    /// Load geosite patterns from the reader, for items that carry codes.
    pub fn update_geosite(&self, reader: &dyn crate::adapter::GeositeReader) -> Result<()> {
        let RuleItem::Geosite { codes, compiled } = self else {
            return Ok(());
        };
        let mut patterns = DomainPatterns::default();
        for code in codes {
            for entry in reader.load(code)? {
                match entry.entry_type {
                    GeositeEntryType::Domain => {
                        patterns.exact.insert(entry.value.to_lowercase());
                    }
                    GeositeEntryType::Suffix => patterns.suffix.push(entry.value.to_lowercase()),
                    GeositeEntryType::Keyword => patterns.keyword.push(entry.value.to_lowercase()),
                    GeositeEntryType::Regex => patterns
                        .regex
                        .push(Regex::new(&entry.value).map_err(|err| Error::Config(err.to_string()))?),
                }
            }
        }
        *compiled.write() = Some(patterns);
        Ok(())
    }
}

fn match_domain(patterns: &DomainPatterns, ctx: &InboundContext) -> bool {
    if let Some(domain) = ctx.destination.domain() {
        if patterns.matches(domain) {
            return true;
        }
    }
    if let Some(domain) = &ctx.domain {
        if patterns.matches(domain) {
            return true;
        }
    }
    false
}

fn destination_ips(ctx: &InboundContext) -> Vec<IpAddr> {
    if let Some(ip) = ctx.destination.ip() {
        return vec![ip];
    }
    ctx.destination_addresses.clone()
}

fn lookup_country(rctx: &RuleContext, ctx: &mut InboundContext, source: bool) -> Option<String> {
    let source = source || ctx.rule_cache.rule_set_match_source;
    let cached = if source {
        ctx.rule_cache.source_country.clone()
    } else {
        ctx.rule_cache.destination_country.clone()
    };
    if let Some(country) = cached {
        return (!country.is_empty()).then_some(country);
    }
    let reader = rctx.geoip.read().clone()?;
    let address = if source {
        Some(ctx.source.ip())
    } else {
        destination_ips(ctx).first().copied()
    }?;
    let country = reader.lookup_country(address).unwrap_or_default();
    if source {
        ctx.rule_cache.source_country = Some(country.clone());
    } else {
        ctx.rule_cache.destination_country = Some(country.clone());
    }
    (!country.is_empty()).then_some(country)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Destination;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn ctx(destination: Destination) -> InboundContext {
        InboundContext::new(
            Network::Tcp,
            "10.0.0.1:40000".parse::<SocketAddr>().unwrap(),
            destination,
        )
    }

    fn rctx() -> RuleContext {
        RuleContext::new()
    }

    #[test]
    fn test_domain_patterns() {
        let patterns = DomainPatterns::compile(
            &["example.com".to_string()],
            &["youtube.com".to_string()],
            &["google".to_string()],
            &[r"^cdn\d+\.test$".to_string()],
        )
        .unwrap();
        assert!(patterns.matches("example.com"));
        assert!(!patterns.matches("sub.example.com"));
        assert!(patterns.matches("youtube.com"));
        assert!(patterns.matches("www.youtube.com"));
        assert!(patterns.matches("mygoogle.org"));
        assert!(patterns.matches("cdn12.test"));
        assert!(!patterns.matches("other.org"));
    }

    #[test]
    fn test_suffix_with_leading_dot() {
        let patterns = DomainPatterns::compile(&[], &[".example.com".to_string()], &[], &[]).unwrap();
        assert!(patterns.matches("example.com"));
        assert!(patterns.matches("a.example.com"));
        assert!(!patterns.matches("notexample.com"));
    }

    #[test]
    fn test_ip_cidr_destination_addresses() {
        let item = RuleItem::IpCidr {
            nets: vec!["10.0.0.0/8".parse().unwrap()],
            source: false,
        };
        let rctx = rctx();
        let mut ctx = ctx(Destination::fqdn("example.com", 443));
        assert!(!item.matches(&rctx, &mut ctx));
        ctx.destination_addresses = vec!["10.1.2.3".parse().unwrap()];
        assert!(item.matches(&rctx, &mut ctx));
    }

    #[test]
    fn test_port_range() {
        let item = RuleItem::PortRange {
            ranges: RuleItem::parse_port_ranges(&["8000:9000".to_string()]).unwrap(),
            source: false,
        };
        let rctx = rctx();
        let mut ctx = ctx(Destination::fqdn("example.com", 8443));
        assert!(item.matches(&rctx, &mut ctx));
        ctx.destination = Destination::fqdn("example.com", 443);
        assert!(!item.matches(&rctx, &mut ctx));
    }

    #[test]
    fn test_process_name_from_path() {
        let item = RuleItem::ProcessName(vec!["curl".to_string()]);
        let rctx = rctx();
        let mut ctx = ctx(Destination::fqdn("example.com", 443));
        assert!(!item.matches(&rctx, &mut ctx));
        ctx.process_info = Some(crate::adapter::ProcessInfo {
            process_path: "/usr/bin/curl".to_string(),
            ..Default::default()
        });
        assert!(item.matches(&rctx, &mut ctx));
    }

    struct TableGeoIp;

    impl crate::adapter::GeoIpReader for TableGeoIp {
        fn lookup_country(&self, ip: IpAddr) -> Option<String> {
            if ip == "1.1.1.1".parse::<IpAddr>().unwrap() {
                Some("au".to_string())
            } else {
                None
            }
        }
    }

    #[test]
    fn test_geoip_uses_reader_and_cache() {
        let rctx = rctx();
        *rctx.geoip.write() = Some(Arc::new(TableGeoIp));
        let item = RuleItem::GeoIp {
            codes: vec!["au".to_string()],
            source: false,
        };
        let mut ctx = ctx(Destination::Ip("1.1.1.1:443".parse().unwrap()));
        assert!(item.matches(&rctx, &mut ctx));
        assert_eq!(ctx.rule_cache.destination_country.as_deref(), Some("au"));

        ctx.reset_rule_cache();
        ctx.destination = Destination::Ip("8.8.8.8:443".parse().unwrap());
        assert!(!item.matches(&rctx, &mut ctx));
    }

    struct StaticGeosite;

    impl crate::adapter::GeositeReader for StaticGeosite {
        fn load(&self, code: &str) -> crate::error::Result<Vec<crate::adapter::GeositeEntry>> {
            assert_eq!(code, "google");
            Ok(vec![crate::adapter::GeositeEntry {
                entry_type: GeositeEntryType::Suffix,
                value: "google.com".to_string(),
            }])
        }
    }

    #[test]
    fn test_geosite_requires_update() {
        let item = RuleItem::Geosite {
            codes: vec!["google".to_string()],
            compiled: RwLock::new(None),
        };
        let rctx = rctx();
        let mut ctx = ctx(Destination::fqdn("www.google.com", 443));
        // Not loaded yet: no match.
        assert!(!item.matches(&rctx, &mut ctx));
        item.update_geosite(&StaticGeosite).unwrap();
        assert!(item.matches(&rctx, &mut ctx));
    }
}
