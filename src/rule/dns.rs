//! DNS route rules: condition matching plus the server/TTL/cache action,
//! with fallback rules evaluated against the response addresses.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use parking_lot::RwLock;
use uuid::Uuid;

use super::matcher::{DomainPatterns, RuleItem};
use super::{LogicalMode, RuleContext, RuleNeeds};
use crate::adapter::{GeositeReader, InboundContext};
use crate::config::{
    ip_is_private, DefaultDnsRuleOptions, DnsRuleOptions, FallbackRuleOptions,
    LogicalDnsRuleOptions,
};
use crate::error::{Error, Result};
use crate::types::{Destination, Network};

/// What a matched DNS rule asks the client to do.
#[derive(Debug, Clone, Default)]
pub struct DnsRuleAction {
    pub server: String,
    pub allow_fallthrough: bool,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpNet>,
}

/// Post-response override: matched against the answer addresses.
#[derive(Debug)]
pub struct FallbackRule {
    accept_result: bool,
    match_all: bool,
    ip_cidr: Vec<IpNet>,
    geoip: Vec<String>,
    rule_set: Vec<String>,
    ip_is_private: bool,
    invert: bool,
    pub action: DnsRuleAction,
}

impl FallbackRule {
    fn compile(options: &FallbackRuleOptions) -> Result<Self> {
        if !options.is_valid() {
            return Err(Error::Config("invalid fallback rule".to_string()));
        }
        Ok(Self {
            accept_result: options.accept_result,
            match_all: options.match_all,
            ip_cidr: options.ip_cidr.clone(),
            geoip: options.geoip.iter().map(|c| c.to_lowercase()).collect(),
            rule_set: options.rule_set.clone(),
            ip_is_private: options.ip_is_private,
            invert: options.invert,
            action: DnsRuleAction {
                server: options.server.clone(),
                allow_fallthrough: false,
                disable_cache: options.disable_cache,
                rewrite_ttl: options.rewrite_ttl,
                client_subnet: options.client_subnet,
            },
        })
    }

    pub fn accept_result(&self) -> bool {
        self.accept_result
    }

    pub fn matches(&self, rctx: &RuleContext, addresses: &[IpAddr]) -> bool {
        let matched = self.match_all || addresses.iter().any(|ip| self.match_address(rctx, *ip));
        matched != self.invert
    }

    fn match_address(&self, rctx: &RuleContext, address: IpAddr) -> bool {
        if self.ip_cidr.iter().any(|net| net.contains(&address)) {
            return true;
        }
        if self.ip_is_private && ip_is_private(address) {
            return true;
        }
        if !self.geoip.is_empty() {
            if let Some(reader) = rctx.geoip.read().clone() {
                if let Some(country) = reader.lookup_country(address) {
                    if self.geoip.contains(&country.to_lowercase()) {
                        return true;
                    }
                }
            }
        }
        if !self.rule_set.is_empty() {
            // Evaluate rule-set IP rules against the answer address.
            let mut scratch = InboundContext::new(
                Network::Udp,
                std::net::SocketAddr::new(address, 0),
                Destination::Ip(std::net::SocketAddr::new(address, 0)),
            );
            let rule_sets = rctx.rule_sets.read();
            if self.rule_set.iter().any(|tag| {
                rule_sets
                    .get(tag)
                    .map(|rule_set| rule_set.matches(rctx, &mut scratch))
                    .unwrap_or(false)
            }) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug)]
pub struct DefaultDnsRule {
    uuid: Uuid,
    items: Vec<RuleItem>,
    invert: bool,
    disabled: AtomicBool,
    action: DnsRuleAction,
    fallback: Vec<FallbackRule>,
    needs: RuleNeeds,
    rule_set_tags: Vec<String>,
}

#[derive(Debug)]
pub struct LogicalDnsRule {
    uuid: Uuid,
    mode: LogicalMode,
    rules: Vec<DnsRule>,
    invert: bool,
    disabled: AtomicBool,
    action: DnsRuleAction,
    fallback: Vec<FallbackRule>,
}

#[derive(Debug)]
pub enum DnsRule {
    Default(DefaultDnsRule),
    Logical(LogicalDnsRule),
}

impl DnsRule {
    pub fn matches(&self, rctx: &RuleContext, ctx: &mut InboundContext) -> bool {
        match self {
            DnsRule::Default(rule) => {
                let matched = rule.items.iter().all(|item| item.matches(rctx, ctx));
                matched != rule.invert
            }
            DnsRule::Logical(rule) => {
                let matched = match rule.mode {
                    LogicalMode::And => rule.rules.iter().all(|sub| sub.matches(rctx, ctx)),
                    LogicalMode::Or => rule.rules.iter().any(|sub| sub.matches(rctx, ctx)),
                };
                matched != rule.invert
            }
        }
    }

    pub fn action(&self) -> &DnsRuleAction {
        match self {
            DnsRule::Default(rule) => &rule.action,
            DnsRule::Logical(rule) => &rule.action,
        }
    }

    pub fn fallback_rules(&self) -> &[FallbackRule] {
        match self {
            DnsRule::Default(rule) => &rule.fallback,
            DnsRule::Logical(rule) => &rule.fallback,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            DnsRule::Default(rule) => rule.uuid,
            DnsRule::Logical(rule) => rule.uuid,
        }
    }

    pub fn disabled(&self) -> bool {
        match self {
            DnsRule::Default(rule) => rule.disabled.load(Ordering::Acquire),
            DnsRule::Logical(rule) => rule.disabled.load(Ordering::Acquire),
        }
    }

    pub fn set_disabled(&self, disabled: bool) {
        match self {
            DnsRule::Default(rule) => rule.disabled.store(disabled, Ordering::Release),
            DnsRule::Logical(rule) => rule.disabled.store(disabled, Ordering::Release),
        }
    }

    pub fn needs(&self) -> RuleNeeds {
        match self {
            DnsRule::Default(rule) => {
                let mut needs = rule.needs;
                needs.geoip |= rule.fallback.iter().any(|fb| !fb.geoip.is_empty());
                needs
            }
            DnsRule::Logical(rule) => {
                let mut needs = RuleNeeds::default();
                for sub in &rule.rules {
                    let sub_needs = sub.needs();
                    needs.geoip |= sub_needs.geoip;
                    needs.geosite |= sub_needs.geosite;
                    needs.process |= sub_needs.process;
                    needs.wifi |= sub_needs.wifi;
                }
                needs.geoip |= rule.fallback.iter().any(|fb| !fb.geoip.is_empty());
                needs
            }
        }
    }

    pub fn rule_set_tags(&self) -> Vec<String> {
        match self {
            DnsRule::Default(rule) => {
                let mut tags = rule.rule_set_tags.clone();
                for fb in &rule.fallback {
                    tags.extend(fb.rule_set.clone());
                }
                tags
            }
            DnsRule::Logical(rule) => {
                let mut tags: Vec<String> = rule
                    .rules
                    .iter()
                    .flat_map(DnsRule::rule_set_tags)
                    .collect();
                for fb in &rule.fallback {
                    tags.extend(fb.rule_set.clone());
                }
                tags
            }
        }
    }

    pub fn update_geosite(&self, reader: &dyn GeositeReader) -> Result<()> {
        match self {
            DnsRule::Default(rule) => {
                for item in &rule.items {
                    item.update_geosite(reader)?;
                }
                Ok(())
            }
            DnsRule::Logical(rule) => {
                for sub in &rule.rules {
                    sub.update_geosite(reader)?;
                }
                Ok(())
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Display for DnsRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsRule::Default(rule) => {
                write!(f, "dns_rule({} items)=>{}", rule.items.len(), rule.action.server)
            }
            DnsRule::Logical(rule) => write!(
                f,
                "logical_dns_rule({:?},{} rules)=>{}",
                rule.mode,
                rule.rules.len(),
                rule.action.server
            ),
        }
    }
}

pub fn compile_dns_rules(options: &[DnsRuleOptions], scope: &str) -> Result<Vec<DnsRule>> {
    options
        .iter()
        .enumerate()
        .map(|(index, rule)| {
            compile_dns_rule(rule)
                .map_err(|err| err.context(format!("parse {}[{}]", scope, index)))
        })
        .collect()
}

pub fn compile_dns_rule(options: &DnsRuleOptions) -> Result<DnsRule> {
    match options {
        DnsRuleOptions::Default(options) => Ok(DnsRule::Default(compile_default(options)?)),
        DnsRuleOptions::Logical(options) => Ok(DnsRule::Logical(compile_logical(options)?)),
    }
}

fn compile_fallbacks(options: &[FallbackRuleOptions]) -> Result<Vec<FallbackRule>> {
    options
        .iter()
        .enumerate()
        .map(|(index, fb)| {
            FallbackRule::compile(fb)
                .map_err(|err| err.context(format!("parse fallback_rule[{}]", index)))
        })
        .collect()
}

fn compile_default(options: &DefaultDnsRuleOptions) -> Result<DefaultDnsRule> {
    if !options.is_valid() {
        return Err(Error::EmptyRule);
    }
    let mut items = Vec::new();
    let mut needs = RuleNeeds::default();

    if !options.inbound.is_empty() {
        items.push(RuleItem::Inbound(options.inbound.clone()));
    }
    if let Some(version) = options.ip_version {
        if version != 4 && version != 6 {
            return Err(Error::Config(format!("invalid ip_version: {}", version)));
        }
        items.push(RuleItem::IpVersion(version));
    }
    if !options.query_type.is_empty() {
        items.push(RuleItem::QueryType(
            options
                .query_type
                .iter()
                .map(|code| RecordType::from(*code))
                .collect(),
        ));
    }
    if !options.network.is_empty() {
        items.push(RuleItem::Network(RuleItem::parse_networks(&options.network)?));
    }
    let mut users = options.user.clone();
    users.extend(options.auth_user.clone());
    if !users.is_empty() {
        items.push(RuleItem::User(users));
    }
    if !options.protocol.is_empty() {
        items.push(RuleItem::Protocol(options.protocol.clone()));
    }
    let domains = DomainPatterns::compile(
        &options.domain,
        &options.domain_suffix,
        &options.domain_keyword,
        &options.domain_regex,
    )?;
    if !domains.is_empty() {
        items.push(RuleItem::Domain(domains));
    }
    if !options.geosite.is_empty() {
        needs.geosite = true;
        items.push(RuleItem::Geosite {
            codes: options.geosite.clone(),
            compiled: RwLock::new(None),
        });
    }
    if !options.source_geoip.is_empty() {
        needs.geoip = true;
        items.push(RuleItem::GeoIp {
            codes: options.source_geoip.iter().map(|c| c.to_lowercase()).collect(),
            source: true,
        });
    }
    if !options.geoip.is_empty() {
        needs.geoip = true;
        items.push(RuleItem::GeoIp {
            codes: options.geoip.iter().map(|c| c.to_lowercase()).collect(),
            source: false,
        });
    }
    if !options.ip_cidr.is_empty() {
        items.push(RuleItem::IpCidr {
            nets: options.ip_cidr.clone(),
            source: false,
        });
    }
    if options.ip_is_private {
        items.push(RuleItem::IpIsPrivate { source: false });
    }
    if !options.source_ip_cidr.is_empty() {
        items.push(RuleItem::IpCidr {
            nets: options.source_ip_cidr.clone(),
            source: true,
        });
    }
    if !options.source_port.is_empty() {
        items.push(RuleItem::Port {
            ports: options.source_port.clone(),
            source: true,
        });
    }
    if !options.source_port_range.is_empty() {
        items.push(RuleItem::PortRange {
            ranges: RuleItem::parse_port_ranges(&options.source_port_range)?,
            source: true,
        });
    }
    if !options.port.is_empty() {
        items.push(RuleItem::Port {
            ports: options.port.clone(),
            source: false,
        });
    }
    if !options.port_range.is_empty() {
        items.push(RuleItem::PortRange {
            ranges: RuleItem::parse_port_ranges(&options.port_range)?,
            source: false,
        });
    }
    if !options.process_name.is_empty() {
        needs.process = true;
        items.push(RuleItem::ProcessName(options.process_name.clone()));
    }
    if !options.process_path.is_empty() {
        needs.process = true;
        items.push(RuleItem::ProcessPath(options.process_path.clone()));
    }
    if !options.package_name.is_empty() {
        needs.process = true;
        items.push(RuleItem::PackageName(options.package_name.clone()));
    }
    if !options.wifi_ssid.is_empty() {
        needs.wifi = true;
        items.push(RuleItem::WifiSsid(options.wifi_ssid.clone()));
    }
    if !options.wifi_bssid.is_empty() {
        needs.wifi = true;
        items.push(RuleItem::WifiBssid(options.wifi_bssid.clone()));
    }
    if !options.rule_set.is_empty() {
        items.push(RuleItem::RuleSet {
            tags: options.rule_set.clone(),
            match_source: options.rule_set_ip_cidr_match_source,
            accept_empty: options.rule_set_ip_cidr_accept_empty,
        });
    }

    Ok(DefaultDnsRule {
        uuid: Uuid::new_v4(),
        items,
        invert: options.invert,
        disabled: AtomicBool::new(false),
        action: DnsRuleAction {
            server: options.server.clone(),
            allow_fallthrough: options.allow_fallthrough,
            disable_cache: options.disable_cache,
            rewrite_ttl: options.rewrite_ttl,
            client_subnet: options.client_subnet,
        },
        fallback: compile_fallbacks(&options.fallback_rules)?,
        needs,
        rule_set_tags: options.rule_set.clone(),
    })
}

fn compile_logical(options: &LogicalDnsRuleOptions) -> Result<LogicalDnsRule> {
    let mode = LogicalMode::parse(&options.mode)?;
    if options.rules.is_empty() {
        return Err(Error::EmptyLogicalRule);
    }
    let rules = options
        .rules
        .iter()
        .enumerate()
        .map(|(index, sub)| {
            compile_dns_rule(sub).map_err(|err| err.context(format!("parse rule[{}]", index)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LogicalDnsRule {
        uuid: Uuid::new_v4(),
        mode,
        rules,
        invert: options.invert,
        disabled: AtomicBool::new(false),
        action: DnsRuleAction {
            server: options.server.clone(),
            allow_fallthrough: options.allow_fallthrough,
            disable_cache: options.disable_cache,
            rewrite_ttl: options.rewrite_ttl,
            client_subnet: options.client_subnet,
        },
        fallback: compile_fallbacks(&options.fallback_rules)?,
    })
}
