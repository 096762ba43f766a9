//! Compiled routing rules: flat condition sets, logical trees and
//! rule-sets. Rules are immutable after construction; the disabled flag is
//! the only runtime toggle.

pub mod dns;
pub mod matcher;

pub use dns::{compile_dns_rules, DnsRule, DnsRuleAction, FallbackRule};
pub use matcher::{DomainPatterns, RuleItem};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::adapter::{GeoIpReader, GeositeReader, InboundContext, RuleSetLoader};
use crate::config::{DefaultRuleOptions, LogicalRuleOptions, RuleOptions, RuleSetOptions};
use crate::error::{Error, Result};

/// Shared handles rules consult at match time. Passed explicitly at rule
/// construction instead of a back-reference into the router.
pub struct RuleContext {
    pub geoip: RwLock<Option<Arc<dyn GeoIpReader>>>,
    pub rule_sets: RwLock<HashMap<String, Arc<RuleSet>>>,
}

impl RuleContext {
    pub fn new() -> Self {
        Self {
            geoip: RwLock::new(None),
            rule_sets: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for RuleContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalMode {
    And,
    Or,
}

impl LogicalMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "and" => Ok(LogicalMode::And),
            "or" => Ok(LogicalMode::Or),
            other => Err(Error::Config(format!("unknown logical mode: {}", other))),
        }
    }
}

/// Aggregated capability needs of a compiled rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleNeeds {
    pub geoip: bool,
    pub geosite: bool,
    pub process: bool,
    pub wifi: bool,
}

impl RuleNeeds {
    fn merge(&mut self, other: RuleNeeds) {
        self.geoip |= other.geoip;
        self.geosite |= other.geosite;
        self.process |= other.process;
        self.wifi |= other.wifi;
    }
}

#[derive(Debug)]
pub struct DefaultRule {
    uuid: Uuid,
    items: Vec<RuleItem>,
    invert: bool,
    skip_resolve: bool,
    outbound: String,
    disabled: AtomicBool,
    contains_destination_ip: bool,
    needs: RuleNeeds,
    rule_set_tags: Vec<String>,
}

#[derive(Debug)]
pub struct LogicalRule {
    uuid: Uuid,
    mode: LogicalMode,
    rules: Vec<RouteRule>,
    invert: bool,
    skip_resolve: bool,
    outbound: String,
    disabled: AtomicBool,
}

/// One compiled route (or sniff-override, or rule-set member) rule.
#[derive(Debug)]
pub enum RouteRule {
    Default(DefaultRule),
    Logical(LogicalRule),
}

impl RouteRule {
    pub fn matches(&self, rctx: &RuleContext, ctx: &mut InboundContext) -> bool {
        match self {
            RouteRule::Default(rule) => {
                let matched = rule.items.iter().all(|item| item.matches(rctx, ctx));
                matched != rule.invert
            }
            RouteRule::Logical(rule) => {
                let matched = match rule.mode {
                    LogicalMode::And => rule.rules.iter().all(|sub| sub.matches(rctx, ctx)),
                    LogicalMode::Or => rule.rules.iter().any(|sub| sub.matches(rctx, ctx)),
                };
                matched != rule.invert
            }
        }
    }

    pub fn outbound(&self) -> &str {
        match self {
            RouteRule::Default(rule) => &rule.outbound,
            RouteRule::Logical(rule) => &rule.outbound,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            RouteRule::Default(rule) => rule.uuid,
            RouteRule::Logical(rule) => rule.uuid,
        }
    }

    pub fn disabled(&self) -> bool {
        match self {
            RouteRule::Default(rule) => rule.disabled.load(Ordering::Acquire),
            RouteRule::Logical(rule) => rule.disabled.load(Ordering::Acquire),
        }
    }

    pub fn set_disabled(&self, disabled: bool) {
        match self {
            RouteRule::Default(rule) => rule.disabled.store(disabled, Ordering::Release),
            RouteRule::Logical(rule) => rule.disabled.store(disabled, Ordering::Release),
        }
    }

    pub fn skip_resolve(&self) -> bool {
        match self {
            RouteRule::Default(rule) => rule.skip_resolve,
            RouteRule::Logical(rule) => {
                rule.skip_resolve || rule.rules.iter().any(RouteRule::skip_resolve)
            }
        }
    }

    /// Whether matching may consult resolved destination addresses.
    pub fn contains_destination_ip_rule(&self) -> bool {
        match self {
            RouteRule::Default(rule) => rule.contains_destination_ip,
            RouteRule::Logical(rule) => rule
                .rules
                .iter()
                .any(RouteRule::contains_destination_ip_rule),
        }
    }

    pub fn needs(&self) -> RuleNeeds {
        match self {
            RouteRule::Default(rule) => rule.needs,
            RouteRule::Logical(rule) => {
                let mut needs = RuleNeeds::default();
                for sub in &rule.rules {
                    needs.merge(sub.needs());
                }
                needs
            }
        }
    }

    /// Tags of rule-sets referenced anywhere in the tree.
    pub fn rule_set_tags(&self) -> Vec<String> {
        match self {
            RouteRule::Default(rule) => rule.rule_set_tags.clone(),
            RouteRule::Logical(rule) => rule
                .rules
                .iter()
                .flat_map(RouteRule::rule_set_tags)
                .collect(),
        }
    }

    pub fn update_geosite(&self, reader: &dyn GeositeReader) -> Result<()> {
        match self {
            RouteRule::Default(rule) => {
                for item in &rule.items {
                    item.update_geosite(reader)?;
                }
                Ok(())
            }
            RouteRule::Logical(rule) => {
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

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteRule::Default(rule) => {
                write!(f, "rule({} items)=>{}", rule.items.len(), rule.outbound)
            }
            RouteRule::Logical(rule) => write!(
                f,
                "logical({:?},{} rules)=>{}",
                rule.mode,
                rule.rules.len(),
                rule.outbound
            ),
        }
    }
}

/// Compile a list of rule options, tracing errors as `parse {scope}[{i}]`.
pub fn compile_rules(
    options: &[RuleOptions],
    scope: &str,
    allow_rule_set: bool,
) -> Result<Vec<RouteRule>> {
    options
        .iter()
        .enumerate()
        .map(|(index, rule)| {
            compile_rule(rule, allow_rule_set)
                .map_err(|err| err.context(format!("parse {}[{}]", scope, index)))
        })
        .collect()
}

pub fn compile_rule(options: &RuleOptions, allow_rule_set: bool) -> Result<RouteRule> {
    match options {
        RuleOptions::Default(options) => {
            Ok(RouteRule::Default(compile_default(options, allow_rule_set)?))
        }
        RuleOptions::Logical(options) => {
            Ok(RouteRule::Logical(compile_logical(options, allow_rule_set)?))
        }
    }
}

fn compile_default(options: &DefaultRuleOptions, allow_rule_set: bool) -> Result<DefaultRule> {
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
            codes: lowercase(&options.source_geoip),
            source: true,
        });
    }
    if !options.geoip.is_empty() {
        needs.geoip = true;
        items.push(RuleItem::GeoIp {
            codes: lowercase(&options.geoip),
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
    if options.source_ip_is_private {
        items.push(RuleItem::IpIsPrivate { source: true });
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
        if !allow_rule_set {
            return Err(Error::Config(
                "rule_set cannot reference another rule_set".to_string(),
            ));
        }
        items.push(RuleItem::RuleSet {
            tags: options.rule_set.clone(),
            match_source: options.rule_set_ip_cidr_match_source,
            accept_empty: false,
        });
    }

    let contains_destination_ip = items.iter().any(RuleItem::consults_destination_ip);
    Ok(DefaultRule {
        uuid: Uuid::new_v4(),
        items,
        invert: options.invert,
        skip_resolve: options.skip_resolve,
        outbound: options.outbound.clone(),
        disabled: AtomicBool::new(false),
        contains_destination_ip,
        needs,
        rule_set_tags: options.rule_set.clone(),
    })
}

fn compile_logical(options: &LogicalRuleOptions, allow_rule_set: bool) -> Result<LogicalRule> {
    let mode = LogicalMode::parse(&options.mode)?;
    if options.rules.is_empty() {
        return Err(Error::EmptyLogicalRule);
    }
    let rules = options
        .rules
        .iter()
        .enumerate()
        .map(|(index, sub)| {
            compile_rule(sub, allow_rule_set)
                .map_err(|err| err.context(format!("parse rule[{}]", index)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LogicalRule {
        uuid: Uuid::new_v4(),
        mode,
        rules,
        invert: options.invert,
        skip_resolve: options.skip_resolve,
        outbound: options.outbound.clone(),
        disabled: AtomicBool::new(false),
    })
}

fn lowercase(values: &[String]) -> Vec<String> {
    values.iter().map(|value| value.to_lowercase()).collect()
}

/// Rule-set capability summary, available once its rules are loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleSetMetadata {
    pub contains_process_rule: bool,
    pub contains_wifi_rule: bool,
    pub contains_ip_cidr_rule: bool,
}

/// Named collection of headless rules, referenced from route and DNS rules.
#[derive(Debug)]
pub struct RuleSet {
    tag: String,
    rules: RwLock<Vec<RouteRule>>,
    metadata: RwLock<RuleSetMetadata>,
    needs_loading: bool,
}

impl RuleSet {
    pub fn new(options: &RuleSetOptions) -> Result<Arc<Self>> {
        let rules = compile_rules(&options.rules, "rule_set rule", false)
            .map_err(|err| err.context(format!("parse rule-set[{}]", options.tag)))?;
        let metadata = metadata_of(&rules);
        Ok(Arc::new(Self {
            tag: options.tag.clone(),
            needs_loading: rules.is_empty(),
            rules: RwLock::new(rules),
            metadata: RwLock::new(metadata),
        }))
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn needs_loading(&self) -> bool {
        self.needs_loading
    }

    pub fn metadata(&self) -> RuleSetMetadata {
        *self.metadata.read()
    }

    /// Fetch contents through the loader; used for rule-sets declared
    /// without inline rules.
    pub async fn load_from(&self, loader: &dyn RuleSetLoader) -> Result<()> {
        let options = loader.load(&self.tag).await?;
        let rules = compile_rules(&options, "rule_set rule", false)
            .map_err(|err| err.context(format!("parse rule-set[{}]", self.tag)))?;
        *self.metadata.write() = metadata_of(&rules);
        *self.rules.write() = rules;
        Ok(())
    }

    pub fn matches(&self, rctx: &RuleContext, ctx: &mut InboundContext) -> bool {
        let rules = self.rules.read();
        rules.iter().any(|rule| rule.matches(rctx, ctx))
    }

    pub fn update_geosite(&self, reader: &dyn GeositeReader) -> Result<()> {
        for rule in self.rules.read().iter() {
            rule.update_geosite(reader)?;
        }
        Ok(())
    }

    pub fn post_start(&self) -> Result<()> {
        Ok(())
    }

    pub fn cleanup(&self) {}
}

fn metadata_of(rules: &[RouteRule]) -> RuleSetMetadata {
    let mut metadata = RuleSetMetadata::default();
    for rule in rules {
        let needs = rule.needs();
        metadata.contains_process_rule |= needs.process;
        metadata.contains_wifi_rule |= needs.wifi;
        metadata.contains_ip_cidr_rule |= rule.contains_destination_ip_rule();
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Destination, Network};

    fn ctx(destination: Destination) -> InboundContext {
        InboundContext::new(
            Network::Tcp,
            "10.0.0.1:40000".parse().unwrap(),
            destination,
        )
    }

    fn default_rule(options: DefaultRuleOptions) -> RouteRule {
        compile_rule(&RuleOptions::Default(options), true).unwrap()
    }

    #[test]
    fn test_empty_rule_rejected() {
        let err = compile_rule(
            &RuleOptions::Default(DefaultRuleOptions {
                invert: true,
                outbound: "proxy".to_string(),
                ..DefaultRuleOptions::default()
            }),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, Error::EmptyRule));
    }

    #[test]
    fn test_index_trace_on_error() {
        let rules = vec![
            RuleOptions::Default(DefaultRuleOptions {
                domain: vec!["ok.example".to_string()],
                outbound: "proxy".to_string(),
                ..DefaultRuleOptions::default()
            }),
            RuleOptions::Default(DefaultRuleOptions::default()),
        ];
        let err = compile_rules(&rules, "rule", true).unwrap_err();
        assert!(err.to_string().starts_with("parse rule[1]:"));
    }

    #[test]
    fn test_domain_rule_matches() {
        let rule = default_rule(DefaultRuleOptions {
            domain_suffix: vec!["example.com".to_string()],
            outbound: "proxy".to_string(),
            ..DefaultRuleOptions::default()
        });
        let rctx = RuleContext::new();
        let mut ctx = ctx(Destination::fqdn("www.example.com", 443));
        assert!(rule.matches(&rctx, &mut ctx));
        assert!(!rule.contains_destination_ip_rule());
    }

    #[test]
    fn test_invert() {
        let rule = default_rule(DefaultRuleOptions {
            domain: vec!["example.com".to_string()],
            invert: true,
            outbound: "proxy".to_string(),
            ..DefaultRuleOptions::default()
        });
        let rctx = RuleContext::new();
        let mut matching = ctx(Destination::fqdn("example.com", 443));
        assert!(!rule.matches(&rctx, &mut matching));
        let mut other = ctx(Destination::fqdn("other.org", 443));
        assert!(rule.matches(&rctx, &mut other));
    }

    #[test]
    fn test_logical_and_or() {
        let sub_domain = RuleOptions::Default(DefaultRuleOptions {
            domain_suffix: vec!["example.com".to_string()],
            ..DefaultRuleOptions::default()
        });
        let sub_port = RuleOptions::Default(DefaultRuleOptions {
            port: vec![443],
            ..DefaultRuleOptions::default()
        });
        let and_rule = compile_rule(
            &RuleOptions::Logical(LogicalRuleOptions {
                mode: "and".to_string(),
                rules: vec![sub_domain.clone(), sub_port.clone()],
                outbound: "proxy".to_string(),
                ..LogicalRuleOptions::default()
            }),
            true,
        )
        .unwrap();
        let rctx = RuleContext::new();
        let mut both = ctx(Destination::fqdn("www.example.com", 443));
        assert!(and_rule.matches(&rctx, &mut both));
        let mut one = ctx(Destination::fqdn("www.example.com", 80));
        assert!(!and_rule.matches(&rctx, &mut one));

        let or_rule = compile_rule(
            &RuleOptions::Logical(LogicalRuleOptions {
                mode: "or".to_string(),
                rules: vec![sub_domain, sub_port],
                outbound: "proxy".to_string(),
                ..LogicalRuleOptions::default()
            }),
            true,
        )
        .unwrap();
        let mut one = ctx(Destination::fqdn("www.example.com", 80));
        assert!(or_rule.matches(&rctx, &mut one));
    }

    #[test]
    fn test_logical_requires_rules_and_known_mode() {
        let empty = compile_rule(
            &RuleOptions::Logical(LogicalRuleOptions {
                mode: "and".to_string(),
                outbound: "proxy".to_string(),
                ..LogicalRuleOptions::default()
            }),
            true,
        );
        assert!(matches!(empty, Err(Error::EmptyLogicalRule)));

        let bad_mode = compile_rule(
            &RuleOptions::Logical(LogicalRuleOptions {
                mode: "xor".to_string(),
                rules: vec![RuleOptions::Default(DefaultRuleOptions {
                    port: vec![443],
                    ..DefaultRuleOptions::default()
                })],
                outbound: "proxy".to_string(),
                ..LogicalRuleOptions::default()
            }),
            true,
        );
        assert!(bad_mode.is_err());
    }

    #[test]
    fn test_disabled_flag() {
        let rule = default_rule(DefaultRuleOptions {
            port: vec![443],
            outbound: "proxy".to_string(),
            ..DefaultRuleOptions::default()
        });
        assert!(!rule.disabled());
        rule.set_disabled(true);
        assert!(rule.disabled());
    }

    #[test]
    fn test_contains_destination_ip() {
        let rule = default_rule(DefaultRuleOptions {
            ip_cidr: vec!["10.0.0.0/8".parse().unwrap()],
            outbound: "proxy".to_string(),
            ..DefaultRuleOptions::default()
        });
        assert!(rule.contains_destination_ip_rule());

        let source_only = default_rule(DefaultRuleOptions {
            source_ip_cidr: vec!["10.0.0.0/8".parse().unwrap()],
            outbound: "proxy".to_string(),
            ..DefaultRuleOptions::default()
        });
        assert!(!source_only.contains_destination_ip_rule());
    }

    #[test]
    fn test_rule_set_membership() {
        let rule_set = RuleSet::new(&RuleSetOptions {
            tag: "ads".to_string(),
            rules: vec![RuleOptions::Default(DefaultRuleOptions {
                domain_suffix: vec!["ads.example".to_string()],
                ..DefaultRuleOptions::default()
            })],
        })
        .unwrap();
        let rctx = RuleContext::new();
        rctx.rule_sets
            .write()
            .insert("ads".to_string(), rule_set.clone());

        let rule = default_rule(DefaultRuleOptions {
            rule_set: vec!["ads".to_string()],
            outbound: "block".to_string(),
            ..DefaultRuleOptions::default()
        });
        let mut ctx = ctx(Destination::fqdn("banner.ads.example", 443));
        assert!(rule.matches(&rctx, &mut ctx));
        assert!(!rule_set.needs_loading());
    }

    #[test]
    fn test_rule_set_cannot_nest() {
        let err = RuleSet::new(&RuleSetOptions {
            tag: "outer".to_string(),
            rules: vec![RuleOptions::Default(DefaultRuleOptions {
                rule_set: vec!["inner".to_string()],
                ..DefaultRuleOptions::default()
            })],
        })
        .unwrap_err();
        assert!(err.to_string().contains("rule_set cannot reference"));
    }

    #[test]
    fn test_rule_set_metadata() {
        let rule_set = RuleSet::new(&RuleSetOptions {
            tag: "probe".to_string(),
            rules: vec![RuleOptions::Default(DefaultRuleOptions {
                process_name: vec!["curl".to_string()],
                wifi_ssid: vec!["Home".to_string()],
                ..DefaultRuleOptions::default()
            })],
        })
        .unwrap();
        let metadata = rule_set.metadata();
        assert!(metadata.contains_process_rule);
        assert!(metadata.contains_wifi_rule);
        assert!(!metadata.contains_ip_cidr_rule);
    }
}
