//! The router: configuration ingestion, rule compilation, lifecycle and the
//! DNS brain behind the dispatch pipeline in `dispatch`.

mod dispatch;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{
    CacheFile, ClashServer, ConntrackKiller, DispatchContext, DnsExchanger, GeoIpReader,
    GeositeReader, Inbound, InboundContext, Monitor, Outbound, OutboundProvider, ProcessSearcher,
    RuleSetLoader, V2RayServer, WifiState, WifiStateProvider,
};
use crate::config::{DnsOptions, InboundRouteOptions, RouteOptions};
use crate::constant;
use crate::dns::fakeip::DomainPredicate;
use crate::dns::transport::TransportSetOptions;
use crate::dns::{
    build_transports, DnsClient, DnsClientConfig, DnsReverseMapping, FakeIpStore, Hosts,
    QueryOptions, Transport, TransportSet,
};
use crate::error::{Error, Result};
use crate::rule::dns::compile_dns_rule;
use crate::rule::{compile_dns_rules, compile_rules, DnsRule, RouteRule, RuleContext, RuleSet};
use crate::sniff::{default_packet_sniffers, default_stream_sniffers, Sniffer};
use crate::types::{DialerConfig, Destination, Network, Strategy};

/// Pause state shared with the dispatch gate.
pub struct PauseManager {
    device_paused: AtomicBool,
    network_paused: AtomicBool,
}

impl PauseManager {
    fn new() -> Self {
        Self {
            device_paused: AtomicBool::new(false),
            network_paused: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.device_paused.load(Ordering::Acquire) || self.network_paused.load(Ordering::Acquire)
    }

    pub fn device_pause(&self) {
        self.device_paused.store(true, Ordering::Release);
    }

    pub fn device_wake(&self) {
        self.device_paused.store(false, Ordering::Release);
    }

    pub fn is_device_paused(&self) -> bool {
        self.device_paused.load(Ordering::Acquire)
    }

    pub fn network_pause(&self) {
        self.network_paused.store(true, Ordering::Release);
    }

    pub fn network_wake(&self) {
        self.network_paused.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Suspend,
    Resume,
}

/// Externally-owned collaborators handed to the router at construction.
#[derive(Default)]
pub struct RouterCollaborators {
    pub cache_file: Option<Arc<dyn CacheFile>>,
    pub geoip: Option<Arc<dyn GeoIpReader>>,
    pub geosite: Option<Arc<dyn GeositeReader>>,
    pub process_searcher: Option<Arc<dyn ProcessSearcher>>,
    pub wifi: Option<Arc<dyn WifiStateProvider>>,
    pub conntrack: Option<Arc<dyn ConntrackKiller>>,
    pub rule_set_loader: Option<Arc<dyn RuleSetLoader>>,
    pub interface_monitor: Option<Arc<dyn Monitor>>,
    pub network_monitor: Option<Arc<dyn Monitor>>,
    pub power_listener: Option<Arc<dyn Monitor>>,
    pub package_manager: Option<Arc<dyn Monitor>>,
    pub time_service: Option<Arc<dyn Monitor>>,
}

pub(crate) struct OutboundRecord {
    pub outbound: Arc<dyn Outbound>,
    pub use_ip: Option<bool>,
    pub interface_listener: bool,
}

pub(crate) struct ProviderRecord {
    pub provider: Arc<dyn OutboundProvider>,
    pub interface_listener: bool,
}

/// Everything registered at `initialize`; immutable afterwards.
pub(crate) struct Registry {
    pub inbound_by_tag: HashMap<String, Arc<dyn Inbound>>,
    pub outbounds: Vec<OutboundRecord>,
    pub outbound_by_tag: HashMap<String, usize>,
    pub providers: Vec<ProviderRecord>,
    pub provider_by_tag: HashMap<String, usize>,
    pub default_connection: Option<Arc<dyn Outbound>>,
    pub default_packet: Option<Arc<dyn Outbound>>,
}

pub struct Router {
    pub(crate) rctx: Arc<RuleContext>,
    pub(crate) rules: Vec<RouteRule>,
    rule_by_uuid: HashMap<Uuid, usize>,
    pub(crate) dns_rules: Vec<DnsRule>,
    dns_rule_by_uuid: HashMap<Uuid, usize>,
    pub(crate) sniff_override_rules: HashMap<String, Vec<RouteRule>>,
    rule_sets: Vec<Arc<RuleSet>>,
    default_detour: Option<String>,
    pub(crate) default_domain_strategy: Strategy,
    pub(crate) stop_always_resolve_udp: bool,
    dialer_config: DialerConfig,
    pub(crate) dns_client: Arc<DnsClient>,
    pub(crate) transports: TransportSet,
    pub(crate) fake_ip_store: Option<Arc<FakeIpStore>>,
    pub(crate) dns_reverse_mapping: Option<Arc<DnsReverseMapping>>,
    pub(crate) dns_mapping_override: bool,
    pub(crate) registry: RwLock<Option<Arc<Registry>>>,
    pub(crate) pause: PauseManager,
    pub(crate) conntrack: Option<Arc<dyn ConntrackKiller>>,
    pub(crate) process_searcher: RwLock<Option<Arc<dyn ProcessSearcher>>>,
    wifi_provider: Option<Arc<dyn WifiStateProvider>>,
    pub(crate) wifi_state: RwLock<Option<WifiState>>,
    geoip_reader: Option<Arc<dyn GeoIpReader>>,
    geosite_reader: Mutex<Option<Arc<dyn GeositeReader>>>,
    rule_set_loader: Option<Arc<dyn RuleSetLoader>>,
    interface_monitor: Option<Arc<dyn Monitor>>,
    network_monitor: Option<Arc<dyn Monitor>>,
    power_listener: Option<Arc<dyn Monitor>>,
    package_manager: Option<Arc<dyn Monitor>>,
    time_service: Option<Arc<dyn Monitor>>,
    collaborator_process_searcher: Option<Arc<dyn ProcessSearcher>>,
    need_geoip: bool,
    need_geosite: bool,
    need_find_process: bool,
    stop_find_process: bool,
    need_wifi_state: AtomicBool,
    pub(crate) clash_server: RwLock<Option<Arc<dyn ClashServer>>>,
    pub(crate) v2ray_server: RwLock<Option<Arc<dyn V2RayServer>>>,
    pub(crate) stream_sniffers: Vec<Sniffer>,
    pub(crate) packet_sniffers: Vec<Sniffer>,
    lifecycle: CancellationToken,
    pub(crate) started: AtomicBool,
}

/// Fake-ip exclude gate backed by compiled DNS rules.
struct ExcludeRules {
    rules: Vec<DnsRule>,
    rctx: Arc<RuleContext>,
}

impl DomainPredicate for ExcludeRules {
    fn matches(&self, domain: &str) -> bool {
        let mut scratch = InboundContext::new(
            Network::Udp,
            std::net::SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
            Destination::fqdn(domain, 0),
        );
        self.rules
            .iter()
            .any(|rule| rule.matches(&self.rctx, &mut scratch))
    }
}

impl Router {
    pub fn new(
        route: RouteOptions,
        dns: DnsOptions,
        inbounds: &[InboundRouteOptions],
        collaborators: RouterCollaborators,
    ) -> Result<Arc<Self>> {
        let rctx = Arc::new(RuleContext::new());
        let hosts = Arc::new(Hosts::new(dns.hosts.clone())?);

        let dns_reverse_mapping = dns.reverse_mapping.then(|| Arc::new(DnsReverseMapping::new()));
        let dns_client = Arc::new(DnsClient::new(
            DnsClientConfig {
                disable_cache: dns.client.disable_cache,
                disable_expire: dns.client.disable_expire,
                independent_cache: dns.client.independent_cache,
                lazy_cache: dns.client.lazy_cache,
            },
            hosts.clone(),
            collaborators.cache_file.clone(),
            dns_reverse_mapping.clone(),
        ));

        let fake_ip_store = match &dns.fake_ip {
            Some(options) if options.enabled => {
                let exclude: Option<Arc<dyn DomainPredicate>> = if options.exclude_rule.is_empty() {
                    None
                } else {
                    let exclude_rules = options
                        .exclude_rule
                        .iter()
                        .enumerate()
                        .map(|(index, rule)| {
                            compile_dns_rule(rule).map_err(|err| {
                                err.context(format!("parse fakeip exclude_rule[{}]", index))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Some(Arc::new(ExcludeRules {
                        rules: exclude_rules,
                        rctx: rctx.clone(),
                    }))
                };
                Some(Arc::new(FakeIpStore::new(
                    options.inet4_range,
                    options.inet6_range,
                    exclude,
                    collaborators.cache_file.clone(),
                )))
            }
            _ => None,
        };

        let rules = compile_rules(&route.rules, "rule", true)?;
        let dns_rules = compile_dns_rules(&dns.rules, "dns rule")?;

        let mut sniff_override_rules = HashMap::new();
        for (inbound_index, inbound) in inbounds.iter().enumerate() {
            let compiled = inbound
                .sniff_override_rules
                .iter()
                .enumerate()
                .map(|(rule_index, rule)| {
                    crate::rule::compile_rule(rule, true).map_err(|err| {
                        err.context(format!(
                            "parse inbound[{}] sniff_override_rule[{}]",
                            inbound_index, rule_index
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            sniff_override_rules.insert(inbound.tag.clone(), compiled);
        }

        let mut rule_sets = Vec::with_capacity(route.rule_set.len());
        {
            let mut registered = rctx.rule_sets.write();
            for (index, options) in route.rule_set.iter().enumerate() {
                if registered.contains_key(&options.tag) {
                    return Err(Error::DuplicateRuleSetTag(options.tag.clone()));
                }
                let rule_set = RuleSet::new(options)
                    .map_err(|err| err.context(format!("parse rule-set[{}]", index)))?;
                registered.insert(options.tag.clone(), rule_set.clone());
                rule_sets.push(rule_set);
            }
        }
        validate_rule_set_references(&rules, &dns_rules, &sniff_override_rules, &rctx)?;

        let transports = build_transports(TransportSetOptions {
            servers: &dns.servers,
            final_server: dns.final_server.as_deref(),
            default_client_subnet: dns.client_subnet,
            hosts: hosts.clone(),
            fakeip_store: fake_ip_store.clone(),
        })?;
        for (index, rule) in dns_rules.iter().enumerate() {
            for server in dns_rule_servers(rule) {
                if transports.transport(&server).is_none() {
                    return Err(Error::DefaultDnsServerNotFound(server)
                        .context(format!("parse dns rule[{}]", index)));
                }
            }
        }

        let need_geoip = rules.iter().any(|rule| rule.needs().geoip)
            || dns_rules.iter().any(|rule| rule.needs().geoip)
            || sniff_override_rules
                .values()
                .flatten()
                .any(|rule| rule.needs().geoip);
        let need_geosite = rules.iter().any(|rule| rule.needs().geosite)
            || dns_rules.iter().any(|rule| rule.needs().geosite)
            || sniff_override_rules
                .values()
                .flatten()
                .any(|rule| rule.needs().geosite);
        let need_find_process = route.find_process.unwrap_or_else(|| {
            rules.iter().any(|rule| rule.needs().process)
                || dns_rules.iter().any(|rule| rule.needs().process)
        });
        let stop_find_process = route.find_process == Some(false);
        let need_wifi_state = rules.iter().any(|rule| rule.needs().wifi)
            || dns_rules.iter().any(|rule| rule.needs().wifi);

        let dialer_config = DialerConfig {
            concurrent_dial: route.concurrent_dial,
            tcp_keep_alive_interval: if route.keep_alive_interval == 0 {
                constant::TCP_KEEP_ALIVE_INTERVAL
            } else {
                std::time::Duration::from_secs(route.keep_alive_interval)
            },
        };

        let rule_by_uuid = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| (rule.uuid(), index))
            .collect();
        let dns_rule_by_uuid = dns_rules
            .iter()
            .enumerate()
            .map(|(index, rule)| (rule.uuid(), index))
            .collect();

        Ok(Arc::new(Self {
            rctx,
            rules,
            rule_by_uuid,
            dns_rules,
            dns_rule_by_uuid,
            sniff_override_rules,
            rule_sets,
            default_detour: route.final_outbound,
            default_domain_strategy: dns.strategy,
            stop_always_resolve_udp: route.stop_always_resolve_udp,
            dialer_config,
            dns_client,
            transports,
            fake_ip_store,
            dns_reverse_mapping,
            dns_mapping_override: dns.mapping_override,
            registry: RwLock::new(None),
            pause: PauseManager::new(),
            conntrack: collaborators.conntrack,
            process_searcher: RwLock::new(None),
            wifi_provider: collaborators.wifi,
            wifi_state: RwLock::new(None),
            geoip_reader: collaborators.geoip,
            geosite_reader: Mutex::new(collaborators.geosite),
            rule_set_loader: collaborators.rule_set_loader,
            interface_monitor: collaborators.interface_monitor,
            network_monitor: collaborators.network_monitor,
            power_listener: collaborators.power_listener,
            package_manager: collaborators.package_manager,
            time_service: collaborators.time_service,
            collaborator_process_searcher: collaborators.process_searcher,
            need_geoip,
            need_geosite,
            need_find_process,
            stop_find_process,
            need_wifi_state: AtomicBool::new(need_wifi_state),
            clash_server: RwLock::new(None),
            v2ray_server: RwLock::new(None),
            stream_sniffers: default_stream_sniffers(),
            packet_sniffers: default_packet_sniffers(),
            lifecycle: CancellationToken::new(),
            started: AtomicBool::new(false),
        }))
    }

    /// Register inbounds, providers and outbounds. Idempotence: a second
    /// call is rejected.
    pub fn initialize(
        &self,
        inbounds: Vec<Arc<dyn Inbound>>,
        providers: Vec<Arc<dyn OutboundProvider>>,
        outbounds: Vec<Arc<dyn Outbound>>,
    ) -> Result<()> {
        let mut registry_slot = self.registry.write();
        if registry_slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let inbound_by_tag = inbounds
            .into_iter()
            .map(|inbound| (inbound.tag().to_string(), inbound))
            .collect();
        let records: Vec<OutboundRecord> = outbounds
            .into_iter()
            .map(|outbound| OutboundRecord {
                use_ip: outbound.use_ip(),
                interface_listener: outbound.as_interface_listener().is_some(),
                outbound,
            })
            .collect();
        let outbound_by_tag: HashMap<String, usize> = records
            .iter()
            .enumerate()
            .map(|(index, record)| (record.outbound.tag().to_string(), index))
            .collect();
        let provider_records: Vec<ProviderRecord> = providers
            .into_iter()
            .map(|provider| ProviderRecord {
                interface_listener: provider.as_interface_listener().is_some(),
                provider,
            })
            .collect();
        let provider_by_tag = provider_records
            .iter()
            .enumerate()
            .map(|(index, record)| (record.provider.tag().to_string(), index))
            .collect();

        let mut default_connection = None;
        let mut default_packet = None;
        if let Some(detour) = &self.default_detour {
            let index = outbound_by_tag
                .get(detour)
                .ok_or_else(|| Error::DefaultDetourNotFound(detour.clone()))?;
            let record = &records[*index];
            if record.outbound.network().contains(&Network::Tcp) {
                default_connection = Some(record.outbound.clone());
            }
            if record.outbound.network().contains(&Network::Udp) {
                default_packet = Some(record.outbound.clone());
            }
        }
        if default_connection.is_none() {
            default_connection = records
                .iter()
                .find(|record| record.outbound.network().contains(&Network::Tcp))
                .map(|record| record.outbound.clone());
        }
        if default_packet.is_none() {
            default_packet = records
                .iter()
                .find(|record| record.outbound.network().contains(&Network::Udp))
                .map(|record| record.outbound.clone());
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if !outbound_by_tag.contains_key(rule.outbound()) {
                return Err(Error::RuleOutboundNotFound {
                    index,
                    tag: rule.outbound().to_string(),
                });
            }
        }

        *registry_slot = Some(Arc::new(Registry {
            inbound_by_tag,
            outbounds: records,
            outbound_by_tag,
            providers: provider_records,
            provider_by_tag,
            default_connection,
            default_packet,
        }));
        Ok(())
    }

    pub(crate) fn registry(&self) -> Result<Arc<Registry>> {
        self.registry
            .read()
            .clone()
            .ok_or_else(|| Error::Config("router is not initialized".to_string()))
    }

    pub fn dialer_config(&self) -> &DialerConfig {
        &self.dialer_config
    }

    pub fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        let registry = self.registry.read().clone()?;
        registry
            .outbound_by_tag
            .get(tag)
            .map(|index| registry.outbounds[*index].outbound.clone())
    }

    /// Static outbounds first, then provider groups.
    pub fn outbound_with_provider(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        if let Some(outbound) = self.outbound(tag) {
            return Some(outbound);
        }
        let registry = self.registry.read().clone()?;
        registry
            .providers
            .iter()
            .find_map(|record| record.provider.outbound(tag))
    }

    pub fn outbounds_with_provider(&self) -> Vec<Arc<dyn Outbound>> {
        let Some(registry) = self.registry.read().clone() else {
            return Vec::new();
        };
        let mut outbounds: Vec<Arc<dyn Outbound>> = registry
            .outbounds
            .iter()
            .map(|record| record.outbound.clone())
            .collect();
        for record in &registry.providers {
            outbounds.extend(record.provider.outbounds());
        }
        outbounds
    }

    pub fn outbound_providers(&self) -> Vec<Arc<dyn OutboundProvider>> {
        let Some(registry) = self.registry.read().clone() else {
            return Vec::new();
        };
        registry
            .providers
            .iter()
            .map(|record| record.provider.clone())
            .collect()
    }

    pub fn outbound_provider(&self, tag: &str) -> Option<Arc<dyn OutboundProvider>> {
        let registry = self.registry.read().clone()?;
        registry
            .provider_by_tag
            .get(tag)
            .map(|index| registry.providers[*index].provider.clone())
    }

    pub fn default_outbound(&self, network: Network) -> Result<Arc<dyn Outbound>> {
        let registry = self.registry()?;
        match network {
            Network::Tcp => registry
                .default_connection
                .clone()
                .ok_or(Error::MissingDefaultOutbound("TCP")),
            Network::Udp => registry
                .default_packet
                .clone()
                .ok_or(Error::MissingDefaultOutbound("UDP")),
        }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn rule(&self, uuid: Uuid) -> Option<&RouteRule> {
        self.rule_by_uuid.get(&uuid).map(|index| &self.rules[*index])
    }

    pub fn dns_rules(&self) -> &[DnsRule] {
        &self.dns_rules
    }

    pub fn dns_rule(&self, uuid: Uuid) -> Option<&DnsRule> {
        self.dns_rule_by_uuid
            .get(&uuid)
            .map(|index| &self.dns_rules[*index])
    }

    pub fn rule_sets(&self) -> &[Arc<RuleSet>] {
        &self.rule_sets
    }

    pub fn rule_set(&self, tag: &str) -> Option<Arc<RuleSet>> {
        self.rctx.rule_sets.read().get(tag).cloned()
    }

    pub fn fake_ip_store(&self) -> Option<Arc<FakeIpStore>> {
        self.fake_ip_store.clone()
    }

    pub fn default_dns_server(&self) -> String {
        self.transports.default_transport().name().to_string()
    }

    pub fn need_wifi_state(&self) -> bool {
        self.need_wifi_state.load(Ordering::Acquire)
    }

    pub fn pause_manager(&self) -> &PauseManager {
        &self.pause
    }

    pub fn clash_server(&self) -> Option<Arc<dyn ClashServer>> {
        self.clash_server.read().clone()
    }

    pub fn set_clash_server(&self, server: Option<Arc<dyn ClashServer>>) {
        *self.clash_server.write() = server;
    }

    pub fn v2ray_server(&self) -> Option<Arc<dyn V2RayServer>> {
        self.v2ray_server.read().clone()
    }

    pub fn set_v2ray_server(&self, server: Option<Arc<dyn V2RayServer>>) {
        *self.v2ray_server.write() = server;
    }

    // Lifecycle -----------------------------------------------------------

    pub fn pre_start(&self) -> Result<()> {
        if let Some(monitor) = &self.interface_monitor {
            monitor
                .start()
                .map_err(|err| err.context("initialize interface monitor"))?;
        }
        if let Some(monitor) = &self.network_monitor {
            monitor
                .start()
                .map_err(|err| err.context("initialize network monitor"))?;
        }
        if let Some(store) = &self.fake_ip_store {
            store
                .start()
                .map_err(|err| err.context("initialize fakeip store"))?;
            let store = store.clone();
            let lifecycle = self.lifecycle.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = lifecycle.cancelled() => return,
                        _ = tokio::time::sleep(constant::FAKE_IP_SAVE_INTERVAL) => {
                            store.save_checkpoint();
                        }
                    }
                }
            });
        }
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        if self.need_geoip {
            let reader = self.geoip_reader.clone().ok_or_else(|| {
                Error::Config("geoip rules configured without a geoip reader".to_string())
            })?;
            *self.rctx.geoip.write() = Some(reader);
        }
        if self.need_geosite {
            let reader = self
                .geosite_reader
                .lock()
                .take()
                .ok_or_else(|| {
                    Error::Config("geosite rules configured without a geosite reader".to_string())
                })?;
            for rule in &self.rules {
                if let Err(err) = rule.update_geosite(reader.as_ref()) {
                    error!("failed to initialize geosite: {}", err);
                }
            }
            for rule in &self.dns_rules {
                if let Err(err) = rule.update_geosite(reader.as_ref()) {
                    error!("failed to initialize geosite: {}", err);
                }
            }
            for rules in self.sniff_override_rules.values() {
                for rule in rules {
                    if let Err(err) = rule.update_geosite(reader.as_ref()) {
                        error!("failed to initialize geosite: {}", err);
                    }
                }
            }
            for rule_set in &self.rule_sets {
                if let Err(err) = rule_set.update_geosite(reader.as_ref()) {
                    error!("failed to initialize geosite: {}", err);
                }
            }
            // The reader (and its database) is released here.
        }

        if let Some(listener) = &self.power_listener {
            if let Err(err) = listener.start() {
                warn!("initialize power listener: {}", err);
            }
        }

        self.dns_client.start();

        if let Some(manager) = &self.package_manager {
            if !self.stop_find_process && self.need_find_process {
                if let Err(err) = manager.start() {
                    error!("start package manager: {}", err);
                }
            }
        }

        for (index, rule) in self.dns_rules.iter().enumerate() {
            rule.start()
                .map_err(|err| err.context(format!("initialize DNS rule[{}]", index)))?;
        }
        for (tag, rules) in &self.sniff_override_rules {
            for (index, rule) in rules.iter().enumerate() {
                rule.start().map_err(|err| {
                    err.context(format!(
                        "initialize inbound[{}] sniff_override_rule[{}]",
                        tag, index
                    ))
                })?;
            }
        }
        self.transports.start_all()?;
        if let Some(service) = &self.time_service {
            service
                .start()
                .map_err(|err| err.context("initialize time service"))?;
        }
        Ok(())
    }

    pub async fn post_start(&self) -> Result<()> {
        let pending: Vec<Arc<RuleSet>> = self
            .rule_sets
            .iter()
            .filter(|rule_set| rule_set.needs_loading())
            .cloned()
            .collect();
        if !pending.is_empty() {
            let loader = self.rule_set_loader.clone().ok_or_else(|| {
                Error::Config("rule-set without inline rules requires a loader".to_string())
            })?;
            let semaphore = Arc::new(tokio::sync::Semaphore::new(
                constant::RULE_SET_START_CONCURRENCY,
            ));
            let mut group: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();
            for rule_set in pending {
                let loader = loader.clone();
                let semaphore = semaphore.clone();
                group.spawn(async move {
                    let _permit = semaphore.acquire().await.map_err(|_| {
                        Error::Config("rule-set bootstrap canceled".to_string())
                    })?;
                    rule_set
                        .load_from(loader.as_ref())
                        .await
                        .map_err(|err| err.context(format!("initialize rule-set[{}]", rule_set.tag())))
                });
            }
            while let Some(joined) = group.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        // Fail fast: abandon the remaining loads.
                        group.abort_all();
                        return Err(err);
                    }
                    Err(err) => {
                        group.abort_all();
                        return Err(Error::Config(format!("rule-set bootstrap panicked: {}", err)));
                    }
                }
            }
        }

        let mut need_find_process = self.need_find_process;
        let mut need_wifi = self.need_wifi_state.load(Ordering::Acquire);
        for rule_set in &self.rule_sets {
            let metadata = rule_set.metadata();
            need_find_process |= metadata.contains_process_rule;
            need_wifi |= metadata.contains_wifi_rule;
        }
        self.need_wifi_state.store(need_wifi, Ordering::Release);

        if !self.stop_find_process && need_find_process {
            match &self.collaborator_process_searcher {
                Some(searcher) => {
                    *self.process_searcher.write() = Some(searcher.clone());
                }
                None => warn!("create process searcher: no searcher available"),
            }
        }
        if need_wifi && self.wifi_provider.is_some() {
            self.update_wifi_state();
        }

        for (index, rule) in self.rules.iter().enumerate() {
            rule.start()
                .map_err(|err| err.context(format!("initialize rule[{}]", index)))?;
        }
        for rule_set in &self.rule_sets {
            rule_set
                .post_start()
                .map_err(|err| err.context(format!("post start rule_set[{}]", rule_set.tag())))?;
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Close everything in reverse dependency order; the first error is
    /// returned, later ones are logged.
    pub fn close(&self) -> Result<()> {
        self.lifecycle.cancel();
        let mut errors: Vec<Error> = Vec::new();
        for (index, rule) in self.rules.iter().enumerate() {
            if let Err(err) = rule.close() {
                errors.push(err.context(format!("close rule[{}]", index)));
            }
        }
        for (index, rule) in self.dns_rules.iter().enumerate() {
            if let Err(err) = rule.close() {
                errors.push(err.context(format!("close dns rule[{}]", index)));
            }
        }
        errors.extend(self.transports.close_all());
        for (name, monitor) in [
            ("interface monitor", &self.interface_monitor),
            ("network monitor", &self.network_monitor),
            ("package manager", &self.package_manager),
            ("power listener", &self.power_listener),
            ("time service", &self.time_service),
        ] {
            if let Some(monitor) = monitor {
                if let Err(err) = monitor.close() {
                    errors.push(err.context(format!("close {}", name)));
                }
            }
        }
        if let Some(store) = &self.fake_ip_store {
            if let Err(err) = store.close() {
                errors.push(err.context("close fakeip store"));
            }
        }
        let mut errors = errors.into_iter();
        match errors.next() {
            None => Ok(()),
            Some(first) => {
                for err in errors {
                    error!("close: {}", err);
                }
                Err(first)
            }
        }
    }

    pub fn cleanup(&self) {
        for rule_set in &self.rule_sets {
            rule_set.cleanup();
        }
    }

    // Network / power events ---------------------------------------------

    pub fn notify_network_update(&self, no_route: bool) {
        if no_route {
            self.pause.network_pause();
            error!("missing default interface");
        } else {
            self.pause.network_wake();
            info!("updated default interface");
        }
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.reset_network();
    }

    pub fn reset_network(&self) {
        if let Some(conntrack) = &self.conntrack {
            conntrack.close_all();
        }
        if let Some(registry) = self.registry.read().clone() {
            for record in &registry.providers {
                if record.interface_listener {
                    if let Some(listener) = record.provider.as_interface_listener() {
                        listener.interface_updated();
                    }
                }
            }
            for record in &registry.outbounds {
                if record.interface_listener {
                    if let Some(listener) = record.outbound.as_interface_listener() {
                        listener.interface_updated();
                    }
                }
            }
        }
        self.transports.reset_all();
    }

    pub fn notify_power_event(&self, event: PowerEvent) {
        match event {
            PowerEvent::Suspend => {
                self.pause.device_pause();
                self.reset_network();
            }
            PowerEvent::Resume => {
                if !self.pause.is_device_paused() {
                    return;
                }
                self.pause.device_wake();
                self.reset_network();
            }
        }
    }

    pub fn update_wifi_state(&self) {
        let Some(provider) = &self.wifi_provider else {
            return;
        };
        let state = provider.read_wifi_state();
        let mut current = self.wifi_state.write();
        if *current != state {
            match &state {
                Some(state) => info!("updated WIFI state: SSID={}, BSSID={}", state.ssid, state.bssid),
                None => info!("updated WIFI state: disconnected"),
            }
            *current = state;
        }
    }

    /// Log a dispatch error the way the pipeline reports them.
    pub fn report_error(&self, err: &Error) {
        if err.is_closed() {
            debug!("connection closed: {}", err);
        } else {
            error!("{}", err);
        }
    }

    // DNS operations ------------------------------------------------------

    /// Route one DNS query through the DNS rules to a transport.
    pub async fn exchange_message(
        &self,
        metadata: &mut InboundContext,
        message: &Message,
    ) -> Result<Message> {
        let Some(domain) = crate::dns::question_domain(message) else {
            let options = self.query_options_for(None, None);
            return self
                .dns_client
                .exchange(&self.transports.default_transport(), message, &options)
                .await;
        };
        metadata.query_type = crate::dns::question_type(message);
        metadata.destination = Destination::fqdn(domain.clone(), 0);

        let mut response: Option<Message> = None;
        for (index, rule) in self.dns_rules.iter().enumerate() {
            if rule.disabled() {
                continue;
            }
            metadata.reset_rule_cache();
            if !rule.matches(&self.rctx, metadata) {
                continue;
            }
            let action = rule.action();
            debug!("dns match[{}] {} => {}", index, rule, action.server);
            let transport = match self.transports.transport(&action.server) {
                Some(transport) => transport,
                None => {
                    error!("dns server not found: {}", action.server);
                    continue;
                }
            };
            let transport = self.fake_ip_gate(transport, &domain, metadata.query_type);
            let options = self.query_options_for(Some(&transport), Some(action));
            let mut exchanged = self.dns_client.exchange(&transport, message, &options).await?;

            let addresses = crate::dns::message_addresses(&exchanged);
            for fallback in rule.fallback_rules() {
                if !fallback.matches(&self.rctx, &addresses) {
                    continue;
                }
                if fallback.accept_result() {
                    break;
                }
                let Some(fallback_transport) = self.transports.transport(&fallback.action.server)
                else {
                    error!("dns server not found: {}", fallback.action.server);
                    break;
                };
                let fallback_transport =
                    self.fake_ip_gate(fallback_transport, &domain, metadata.query_type);
                let options = QueryOptions {
                    strategy: self.effective_strategy(&fallback_transport, Strategy::AsIs),
                    disable_cache: fallback.action.disable_cache,
                    rewrite_ttl: fallback.action.rewrite_ttl,
                    client_subnet: fallback.action.client_subnet,
                };
                exchanged = self
                    .dns_client
                    .exchange(&fallback_transport, message, &options)
                    .await?;
                break;
            }

            if action.allow_fallthrough && crate::dns::message_addresses(&exchanged).is_empty() {
                response = Some(exchanged);
                continue;
            }
            return Ok(exchanged);
        }
        if let Some(response) = response {
            return Ok(response);
        }
        let transport =
            self.fake_ip_gate(self.transports.default_transport(), &domain, metadata.query_type);
        let options = self.query_options_for(Some(&transport), None);
        self.dns_client.exchange(&transport, message, &options).await
    }

    /// Resolve a domain, selecting server and strategy through DNS rules.
    pub async fn lookup(
        &self,
        metadata: &mut InboundContext,
        domain: &str,
        strategy: Strategy,
    ) -> Result<Vec<IpAddr>> {
        let previous_destination = metadata.destination.clone();
        metadata.destination = Destination::fqdn(domain, 0);
        metadata.query_type = None;

        let mut selected = None;
        for rule in &self.dns_rules {
            if rule.disabled() {
                continue;
            }
            metadata.reset_rule_cache();
            if rule.matches(&self.rctx, metadata) {
                let action = rule.action();
                if let Some(transport) = self.transports.transport(&action.server) {
                    selected = Some((transport, action.clone()));
                    break;
                }
                error!("dns server not found: {}", action.server);
            }
        }
        metadata.destination = previous_destination;

        let (transport, action) = match selected {
            Some((transport, action)) => (transport, Some(action)),
            None => (self.transports.default_transport(), None),
        };
        let transport = self.fake_ip_gate(transport, domain, None);
        let effective = self.effective_strategy(&transport, strategy);
        let options = QueryOptions {
            strategy: effective,
            disable_cache: action.as_ref().map(|a| a.disable_cache).unwrap_or(false),
            rewrite_ttl: action.as_ref().and_then(|a| a.rewrite_ttl),
            client_subnet: action.as_ref().and_then(|a| a.client_subnet),
        };
        self.dns_client
            .lookup(&transport, domain, effective, &options)
            .await
    }

    /// Resolve with the default transport and default strategy.
    pub async fn lookup_default(
        &self,
        metadata: &mut InboundContext,
        domain: &str,
    ) -> Result<Vec<IpAddr>> {
        self.lookup(metadata, domain, Strategy::AsIs).await
    }

    /// Excluded domains (and non-address queries) may not be served fake
    /// addresses; swap in the default transport.
    fn fake_ip_gate(
        &self,
        transport: Arc<dyn Transport>,
        domain: &str,
        query_type: Option<RecordType>,
    ) -> Arc<dyn Transport> {
        if !transport.is_fake_ip() {
            return transport;
        }
        let address_query = matches!(query_type, None | Some(RecordType::A) | Some(RecordType::AAAA));
        let excluded = self
            .fake_ip_store
            .as_ref()
            .map(|store| store.excluded(domain))
            .unwrap_or(false);
        if !address_query || excluded {
            return self.transports.default_transport();
        }
        transport
    }

    fn effective_strategy(&self, transport: &Arc<dyn Transport>, requested: Strategy) -> Strategy {
        requested
            .or_default(
                self.transports
                    .strategy_override(transport.name())
                    .unwrap_or(self.default_domain_strategy),
            )
    }

    fn query_options_for(
        &self,
        transport: Option<&Arc<dyn Transport>>,
        action: Option<&crate::rule::DnsRuleAction>,
    ) -> QueryOptions {
        let strategy = match transport {
            Some(transport) => self.effective_strategy(transport, Strategy::AsIs),
            None => self.default_domain_strategy,
        };
        QueryOptions {
            strategy,
            disable_cache: action.map(|a| a.disable_cache).unwrap_or(false),
            rewrite_ttl: action.and_then(|a| a.rewrite_ttl),
            client_subnet: action.and_then(|a| a.client_subnet),
        }
    }
}

#[async_trait]
impl DnsExchanger for Router {
    async fn exchange(
        &self,
        _ctx: &DispatchContext,
        metadata: &mut InboundContext,
        message: &Message,
    ) -> Result<Message> {
        self.exchange_message(metadata, message).await
    }
}

fn dns_rule_servers(rule: &DnsRule) -> Vec<String> {
    let mut servers = Vec::new();
    if !rule.action().server.is_empty() {
        servers.push(rule.action().server.clone());
    }
    for fallback in rule.fallback_rules() {
        if !fallback.action.server.is_empty() {
            servers.push(fallback.action.server.clone());
        }
    }
    servers
}

fn validate_rule_set_references(
    rules: &[RouteRule],
    dns_rules: &[DnsRule],
    sniff_override_rules: &HashMap<String, Vec<RouteRule>>,
    rctx: &Arc<RuleContext>,
) -> Result<()> {
    let registered = rctx.rule_sets.read();
    let mut check = |tags: Vec<String>| -> Result<()> {
        for tag in tags {
            if !registered.contains_key(&tag) {
                return Err(Error::RuleSetNotFound(tag));
            }
        }
        Ok(())
    };
    for rule in rules {
        check(rule.rule_set_tags())?;
    }
    for rule in dns_rules {
        check(rule.rule_set_tags())?;
    }
    for rules in sniff_override_rules.values() {
        for rule in rules {
            check(rule.rule_set_tags())?;
        }
    }
    Ok(())
}
