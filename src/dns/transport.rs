//! DNS transports and the dependency-ordered set construction.
//!
//! Servers are materialized with a fixed-point worklist: a server becomes a
//! transport once its address is a literal IP, a special scheme, resolvable
//! from hosts, or its declared `address_resolver` is already materialized.
//! A pass without progress while servers remain is a circular reference.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::debug;

use super::fakeip::FakeIpStore;
use super::hosts::Hosts;
use super::{address_query, address_response, message_addresses, question_domain, question_type, rcode_response};
use crate::config::DnsServerOptions;
use crate::constant;
use crate::error::{Error, Result};
use crate::types::{Destination, Strategy};

/// A named DNS server handle.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Raw exchange; caching and strategy live in the client façade.
    async fn exchange(&self, message: &Message) -> Result<Message>;

    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Drop warm state after a network change.
    fn reset(&self) {}

    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Fake-ip capability; a transport exposing it may not be the default.
    fn is_fake_ip(&self) -> bool {
        false
    }
}

/// Attach an EDNS client-subnet option to the outgoing query.
pub(crate) fn apply_client_subnet(message: &mut Message, subnet: IpNet) {
    let mut edns = message.extensions().clone().unwrap_or_else(Edns::new);
    edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
        subnet.addr(),
        subnet.prefix_len(),
        0,
    )));
    message.set_edns(edns);
}

fn has_client_subnet(message: &Message) -> bool {
    message
        .extensions()
        .as_ref()
        .map(|edns| edns.option(EdnsCode::Subnet).is_some())
        .unwrap_or(false)
}

struct AddressResolver {
    transport: Arc<dyn Transport>,
    strategy: Strategy,
}

/// Plain UDP transport with optional bootstrap through another transport
/// when its own address is a hostname.
pub struct UdpTransport {
    name: String,
    addresses: Vec<Destination>,
    resolver: Option<AddressResolver>,
    hosts: Arc<Hosts>,
    client_subnet: Option<IpNet>,
    resolved: Mutex<Option<SocketAddr>>,
}

impl UdpTransport {
    fn new(
        name: String,
        addresses: Vec<Destination>,
        resolver: Option<AddressResolver>,
        hosts: Arc<Hosts>,
        client_subnet: Option<IpNet>,
    ) -> Self {
        Self {
            name,
            addresses,
            resolver,
            hosts,
            client_subnet,
            resolved: Mutex::new(None),
        }
    }

    async fn server_address(&self) -> Result<SocketAddr> {
        if let Some(cached) = *self.resolved.lock() {
            return Ok(cached);
        }
        let mut last_error: Option<Error> = None;
        for address in &self.addresses {
            match address {
                Destination::Ip(addr) => {
                    *self.resolved.lock() = Some(*addr);
                    return Ok(*addr);
                }
                Destination::Fqdn(domain, port) => {
                    let from_hosts = self.hosts.lookup(domain, Strategy::AsIs);
                    if let Some(ip) = from_hosts.first() {
                        let addr = SocketAddr::new(*ip, *port);
                        *self.resolved.lock() = Some(addr);
                        return Ok(addr);
                    }
                    let Some(resolver) = &self.resolver else {
                        last_error = Some(Error::Resolve {
                            domain: domain.clone(),
                            message: "no address resolver".to_string(),
                        });
                        continue;
                    };
                    match resolve_via(&resolver.transport, domain, resolver.strategy).await {
                        Ok(addresses) if !addresses.is_empty() => {
                            let addr = SocketAddr::new(addresses[0], *port);
                            *self.resolved.lock() = Some(addr);
                            return Ok(addr);
                        }
                        Ok(_) => {
                            last_error = Some(Error::Resolve {
                                domain: domain.clone(),
                                message: "empty response".to_string(),
                            });
                        }
                        Err(err) => last_error = Some(err),
                    }
                }
            }
        }
        Err(last_error.unwrap_or(Error::MissingAddress))
    }
}

/// Resolve a hostname through a transport, outside the cache path.
async fn resolve_via(
    transport: &Arc<dyn Transport>,
    domain: &str,
    strategy: Strategy,
) -> Result<Vec<IpAddr>> {
    let strategy = strategy.or_default(Strategy::PreferIpv4);
    let mut addresses = Vec::new();
    if strategy != Strategy::Ipv6Only {
        let response = transport.exchange(&address_query(domain, RecordType::A)?).await?;
        addresses.extend(message_addresses(&response));
    }
    if strategy != Strategy::Ipv4Only && (addresses.is_empty() || strategy != Strategy::PreferIpv4)
    {
        let response = transport
            .exchange(&address_query(domain, RecordType::AAAA)?)
            .await?;
        addresses.extend(message_addresses(&response));
    }
    Ok(strategy.apply(addresses))
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        let server = self.server_address().await?;
        let bind: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind).await.map_err(Error::Io)?;
        socket.connect(server).await.map_err(Error::Io)?;

        let mut outgoing = message.clone();
        if let Some(subnet) = self.client_subnet {
            // Rule-level subnets set by the client take precedence.
            if !has_client_subnet(&outgoing) {
                apply_client_subnet(&mut outgoing, subnet);
            }
        }
        let encoded = outgoing.to_bytes()?;
        socket.send(&encoded).await.map_err(Error::Io)?;

        let mut buffer = vec![0u8; 4096];
        let exchange = async {
            loop {
                let n = socket.recv(&mut buffer).await.map_err(Error::Io)?;
                match Message::from_bytes(&buffer[..n]) {
                    Ok(response) if response.id() == message.id() => return Ok(response),
                    Ok(_) => continue,
                    Err(err) => {
                        debug!("transport[{}]: bad response: {}", self.name, err);
                        continue;
                    }
                }
            }
        };
        tokio::time::timeout(constant::QUERY_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("query to {} timed out", server),
                ))
            })?
    }

    fn reset(&self) {
        *self.resolved.lock() = None;
    }
}

/// System-resolver transport serving `local` and `dhcp://` addresses.
pub struct LocalTransport {
    name: String,
}

impl LocalTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        let Some(domain) = question_domain(message) else {
            return Ok(rcode_response(message, ResponseCode::FormErr));
        };
        let query_type = question_type(message).unwrap_or(RecordType::A);
        if query_type != RecordType::A && query_type != RecordType::AAAA {
            return Ok(rcode_response(message, ResponseCode::NotImp));
        }
        let resolved = tokio::net::lookup_host((domain.as_str(), 0))
            .await
            .map_err(|err| Error::Resolve {
                domain: domain.clone(),
                message: err.to_string(),
            })?;
        let addresses: Vec<IpAddr> = resolved.map(|addr| addr.ip()).collect();
        Ok(address_response(
            message,
            &addresses,
            constant::DEFAULT_DNS_TTL,
        ))
    }
}

/// Transport answering every query with a fixed response code.
pub struct RcodeTransport {
    name: String,
    code: ResponseCode,
}

impl RcodeTransport {
    fn parse(name: String, spec: &str) -> Result<Self> {
        let code = match spec {
            "success" => ResponseCode::NoError,
            "format_error" => ResponseCode::FormErr,
            "server_failure" => ResponseCode::ServFail,
            "name_error" => ResponseCode::NXDomain,
            "not_implemented" => ResponseCode::NotImp,
            "refused" => ResponseCode::Refused,
            other => {
                return Err(Error::Config(format!("unknown rcode: {}", other)));
            }
        };
        Ok(Self { name, code })
    }
}

#[async_trait]
impl Transport for RcodeTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        Ok(rcode_response(message, self.code))
    }
}

/// Transport allocating synthetic addresses from the fake-ip store.
pub struct FakeIpTransport {
    name: String,
    store: Arc<FakeIpStore>,
    upstream: Option<Arc<dyn Transport>>,
}

#[async_trait]
impl Transport for FakeIpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        let Some(domain) = question_domain(message) else {
            return Ok(rcode_response(message, ResponseCode::FormErr));
        };
        let query_type = question_type(message).unwrap_or(RecordType::A);
        let ipv6 = match query_type {
            RecordType::A => false,
            RecordType::AAAA => true,
            _ => {
                if let Some(upstream) = &self.upstream {
                    return upstream.exchange(message).await;
                }
                return Ok(rcode_response(message, ResponseCode::NoError));
            }
        };
        let address = self.store.create(&domain, ipv6)?;
        // TTL 1 keeps downstream resolvers from pinning synthetic addresses.
        Ok(address_response(message, &[address], 1))
    }

    fn is_fake_ip(&self) -> bool {
        true
    }
}

/// The constructed set: declaration order, tag lookup, default, and
/// per-transport strategy overrides.
pub struct TransportSet {
    transports: Vec<Arc<dyn Transport>>,
    by_tag: HashMap<String, Arc<dyn Transport>>,
    default: Arc<dyn Transport>,
    strategies: HashMap<String, Strategy>,
}

impl std::fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSet")
            .field("transports", &self.transports.len())
            .field("by_tag", &self.by_tag.keys().collect::<Vec<_>>())
            .field("strategies", &self.strategies)
            .finish()
    }
}

impl TransportSet {
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    pub fn transport(&self, tag: &str) -> Option<Arc<dyn Transport>> {
        self.by_tag.get(tag).cloned()
    }

    pub fn default_transport(&self) -> Arc<dyn Transport> {
        self.default.clone()
    }

    /// Domain-strategy override declared on the named server.
    pub fn strategy_override(&self, name: &str) -> Option<Strategy> {
        self.strategies.get(name).copied()
    }

    pub fn start_all(&self) -> Result<()> {
        for (index, transport) in self.transports.iter().enumerate() {
            transport
                .start()
                .map_err(|err| err.context(format!("initialize DNS transport[{}]", index)))?;
        }
        Ok(())
    }

    pub fn reset_all(&self) {
        for transport in &self.transports {
            transport.reset();
        }
    }

    pub fn close_all(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        for (index, transport) in self.transports.iter().enumerate() {
            if let Err(err) = transport.close() {
                errors.push(err.context(format!("close dns transport[{}]", index)));
            }
        }
        errors
    }
}

pub struct TransportSetOptions<'a> {
    pub servers: &'a [DnsServerOptions],
    pub final_server: Option<&'a str>,
    pub default_client_subnet: Option<IpNet>,
    pub hosts: Arc<Hosts>,
    pub fakeip_store: Option<Arc<FakeIpStore>>,
}

enum AddressKind {
    Local,
    FakeIp,
    Rcode(String),
    Server(Destination),
}

/// Classify one declared address; `Err` is a configuration error, the bool
/// is whether materialization depends on an upstream resolver.
fn classify_address(address: &str, hosts: &Hosts) -> Result<(AddressKind, bool)> {
    let trimmed = address.trim();
    match trimmed.to_lowercase().as_str() {
        "" => return Err(Error::Config("empty address".to_string())),
        "local" => return Ok((AddressKind::Local, false)),
        "fakeip" => return Ok((AddressKind::FakeIp, false)),
        _ => {}
    }
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_lowercase()), rest),
        None => (None, trimmed),
    };
    match scheme.as_deref() {
        Some("rcode") => return Ok((AddressKind::Rcode(rest.to_string()), false)),
        Some("dhcp") => return Ok((AddressKind::Local, false)),
        Some("udp") | None => {}
        Some(other) => {
            return Err(Error::Config(format!("unsupported scheme: {}", other)));
        }
    }
    if rest.is_empty() {
        return Err(Error::Config("missing hostname".to_string()));
    }
    // Literal address, optionally with a port.
    if let Ok(addr) = rest.parse::<SocketAddr>() {
        return Ok((AddressKind::Server(Destination::Ip(addr)), false));
    }
    if let Ok(ip) = rest.parse::<IpAddr>() {
        return Ok((
            AddressKind::Server(Destination::Ip(SocketAddr::new(ip, 53))),
            false,
        ));
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (rest, 53),
        },
        None => (rest, 53),
    };
    let destination = Destination::fqdn(host, port);
    let resolvable = !hosts
        .lookup(&hosts.exact_domain(host), Strategy::AsIs)
        .is_empty();
    Ok((AddressKind::Server(destination), !resolvable))
}

/// Build all transports with the fixed-point worklist.
pub fn build_transports(options: TransportSetOptions<'_>) -> Result<TransportSet> {
    let server_count = options.servers.len();
    let mut tags = Vec::with_capacity(server_count);
    let mut tag_set = HashSet::new();
    for (index, server) in options.servers.iter().enumerate() {
        let tag = match &server.tag {
            Some(tag) if !tag.is_empty() => tag.clone(),
            _ => index.to_string(),
        };
        if !tag_set.insert(tag.clone()) {
            return Err(Error::DuplicateDnsServerTag(tag));
        }
        tags.push(tag);
    }

    let mut built: HashMap<String, Arc<dyn Transport>> = HashMap::new();
    let mut ordered: Vec<Option<Arc<dyn Transport>>> = vec![None; server_count];
    let mut strategies = HashMap::new();

    loop {
        let before = built.len();
        for (index, server) in options.servers.iter().enumerate() {
            let tag = &tags[index];
            if built.contains_key(tag) {
                continue;
            }
            if server.address.is_empty() {
                return Err(Error::MissingAddress.context(format!("parse dns server[{}]", tag)));
            }
            let mut kinds = Vec::with_capacity(server.address.len());
            let mut needs_upstream = false;
            for (address_index, address) in server.address.iter().enumerate() {
                let (kind, requires) =
                    classify_address(address, &options.hosts).map_err(|err| {
                        err.context(format!(
                            "parse dns server[{}].address[{}]",
                            tag, address_index
                        ))
                    })?;
                needs_upstream |= requires;
                kinds.push(kind);
            }
            let resolver = if needs_upstream {
                let resolver_tag = server.address_resolver.as_deref().filter(|t| !t.is_empty());
                let Some(resolver_tag) = resolver_tag else {
                    return Err(Error::MissingAddressResolver
                        .context(format!("parse dns server[{}]", tag)));
                };
                if !tag_set.contains(resolver_tag) {
                    return Err(Error::AddressResolverNotFound(resolver_tag.to_string())
                        .context(format!("parse dns server[{}]", tag)));
                }
                match built.get(resolver_tag) {
                    Some(upstream) => Some(AddressResolver {
                        transport: upstream.clone(),
                        strategy: server.address_strategy,
                    }),
                    // Not materialized yet; retry on a later pass.
                    None => continue,
                }
            } else {
                None
            };

            let client_subnet = server.client_subnet.or(options.default_client_subnet);
            let transport = create_transport(
                tag.clone(),
                kinds,
                resolver,
                options.hosts.clone(),
                client_subnet,
                options.fakeip_store.as_ref(),
            )
            .map_err(|err| err.context(format!("parse dns server[{}]", tag)))?;
            ordered[index] = Some(transport.clone());
            built.insert(tag.clone(), transport);
            if server.strategy != Strategy::AsIs {
                strategies.insert(tag.clone(), server.strategy);
            }
        }
        if built.len() == server_count {
            break;
        }
        if built.len() == before {
            let unresolved: Vec<String> = tags
                .iter()
                .filter(|tag| !built.contains_key(*tag))
                .cloned()
                .collect();
            return Err(Error::CircularDnsServers(unresolved.join(" ")));
        }
    }

    let mut transports: Vec<Arc<dyn Transport>> = ordered.into_iter().flatten().collect();

    let default = match options.final_server {
        Some(tag) if !tag.is_empty() => built
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::DefaultDnsServerNotFound(tag.to_string()))?,
        _ => {
            if transports.is_empty() {
                let local: Arc<dyn Transport> = Arc::new(LocalTransport::new("local"));
                transports.push(local.clone());
                built.insert("local".to_string(), local);
            }
            transports[0].clone()
        }
    };
    if default.is_fake_ip() {
        return Err(Error::DefaultDnsServerIsFakeIp);
    }

    Ok(TransportSet {
        transports,
        by_tag: built,
        default,
        strategies,
    })
}

fn create_transport(
    tag: String,
    kinds: Vec<AddressKind>,
    resolver: Option<AddressResolver>,
    hosts: Arc<Hosts>,
    client_subnet: Option<IpNet>,
    fakeip_store: Option<&Arc<FakeIpStore>>,
) -> Result<Arc<dyn Transport>> {
    let server_addresses: Vec<Destination> = kinds
        .iter()
        .filter_map(|kind| match kind {
            AddressKind::Server(destination) => Some(destination.clone()),
            _ => None,
        })
        .collect();

    if kinds.iter().any(|kind| matches!(kind, AddressKind::FakeIp)) {
        let store = fakeip_store
            .ok_or_else(|| Error::Config("fakeip is not enabled".to_string()))?
            .clone();
        let upstream: Option<Arc<dyn Transport>> = if server_addresses.is_empty() {
            None
        } else {
            Some(Arc::new(UdpTransport::new(
                format!("{}/upstream", tag),
                server_addresses,
                resolver,
                hosts,
                client_subnet,
            )))
        };
        return Ok(Arc::new(FakeIpTransport {
            name: tag,
            store,
            upstream,
        }));
    }
    if let Some(AddressKind::Rcode(spec)) = kinds
        .iter()
        .find(|kind| matches!(kind, AddressKind::Rcode(_)))
    {
        return Ok(Arc::new(RcodeTransport::parse(tag, spec)?));
    }
    if kinds.iter().any(|kind| matches!(kind, AddressKind::Local)) {
        return Ok(Arc::new(LocalTransport::new(tag)));
    }
    Ok(Arc::new(UdpTransport::new(
        tag,
        server_addresses,
        resolver,
        hosts,
        client_subnet,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsServerOptions;
    use std::collections::HashMap as StdHashMap;

    fn hosts() -> Arc<Hosts> {
        Arc::new(Hosts::new(StdHashMap::new()).unwrap())
    }

    fn server(tag: &str, address: &[&str], resolver: Option<&str>) -> DnsServerOptions {
        DnsServerOptions {
            tag: Some(tag.to_string()),
            address: address.iter().map(|a| a.to_string()).collect(),
            address_resolver: resolver.map(|r| r.to_string()),
            ..DnsServerOptions::default()
        }
    }

    fn build(servers: &[DnsServerOptions]) -> Result<TransportSet> {
        build_transports(TransportSetOptions {
            servers,
            final_server: None,
            default_client_subnet: None,
            hosts: hosts(),
            fakeip_store: None,
        })
    }

    #[test]
    fn test_dependency_chain_materializes() {
        let servers = vec![
            server("b", &["1.0.0.1"], None),
            server("a", &["dns.example.com"], Some("b")),
        ];
        let set = build(&servers).unwrap();
        assert_eq!(set.transports().len(), 2);
        assert!(set.transport("a").is_some());
        assert_eq!(set.default_transport().name(), "b");
    }

    #[test]
    fn test_circular_reference_names_unresolved_tags() {
        let servers = vec![
            server("a", &["dns.b.net"], Some("b")),
            server("b", &["dns.a.net"], Some("a")),
        ];
        let err = build(&servers).unwrap_err();
        assert_eq!(
            err.to_string(),
            "found circular reference in dns servers: a b"
        );
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let servers = vec![
            server("a", &["1.1.1.1"], None),
            server("a", &["8.8.8.8"], None),
        ];
        assert!(matches!(
            build(&servers),
            Err(Error::DuplicateDnsServerTag(tag)) if tag == "a"
        ));
    }

    #[test]
    fn test_missing_resolver_for_hostname() {
        let servers = vec![server("a", &["dns.example.com"], None)];
        let err = build(&servers).unwrap_err();
        assert!(err.to_string().contains("missing address_resolver"));
    }

    #[test]
    fn test_unknown_resolver_tag() {
        let servers = vec![server("a", &["dns.example.com"], Some("nope"))];
        let err = build(&servers).unwrap_err();
        assert!(err.to_string().contains("address resolver not found: nope"));
    }

    #[test]
    fn test_hosts_resolvable_address_needs_no_resolver() {
        let mut raw = StdHashMap::new();
        raw.insert("dns.example.com".to_string(), vec!["1.1.1.1".to_string()]);
        let servers = vec![server("a", &["dns.example.com"], None)];
        let set = build_transports(TransportSetOptions {
            servers: &servers,
            final_server: None,
            default_client_subnet: None,
            hosts: Arc::new(Hosts::new(raw).unwrap()),
            fakeip_store: None,
        })
        .unwrap();
        assert_eq!(set.transports().len(), 1);
    }

    #[test]
    fn test_default_cannot_be_fakeip() {
        let store = Arc::new(FakeIpStore::new(
            Some("198.18.0.0/15".parse().unwrap()),
            None,
            None,
            None,
        ));
        let servers = vec![server("fake", &["fakeip"], None)];
        let err = build_transports(TransportSetOptions {
            servers: &servers,
            final_server: None,
            default_client_subnet: None,
            hosts: hosts(),
            fakeip_store: Some(store),
        })
        .unwrap_err();
        assert!(matches!(err, Error::DefaultDnsServerIsFakeIp));
    }

    #[test]
    fn test_empty_server_list_synthesizes_local_default() {
        let set = build(&[]).unwrap();
        assert_eq!(set.transports().len(), 1);
        assert_eq!(set.default_transport().name(), "local");
    }

    #[test]
    fn test_untagged_server_uses_index() {
        let servers = vec![DnsServerOptions {
            address: vec!["1.1.1.1".to_string()],
            ..DnsServerOptions::default()
        }];
        let set = build(&servers).unwrap();
        assert!(set.transport("0").is_some());
    }

    #[tokio::test]
    async fn test_rcode_transport() {
        let transport = RcodeTransport::parse("r".to_string(), "refused").unwrap();
        let query = address_query("example.com", RecordType::A).unwrap();
        let response = transport.exchange(&query).await.unwrap();
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert_eq!(response.id(), query.id());
    }

    #[tokio::test]
    async fn test_fakeip_transport_allocates() {
        let store = Arc::new(FakeIpStore::new(
            Some("198.18.0.0/15".parse().unwrap()),
            None,
            None,
            None,
        ));
        let transport = FakeIpTransport {
            name: "fake".to_string(),
            store: store.clone(),
            upstream: None,
        };
        let query = address_query("example.com", RecordType::A).unwrap();
        let response = transport.exchange(&query).await.unwrap();
        let addresses = message_addresses(&response);
        assert_eq!(addresses.len(), 1);
        assert_eq!(store.lookup(addresses[0]).as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn test_udp_transport_exchange() {
        // Minimal one-shot DNS server answering with a fixed address.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let query = Message::from_bytes(&buf[..n]).unwrap();
            let response =
                address_response(&query, &["93.184.216.34".parse().unwrap()], 300);
            socket
                .send_to(&response.to_bytes().unwrap(), peer)
                .await
                .unwrap();
        });

        let transport = UdpTransport::new(
            "test".to_string(),
            vec![Destination::Ip(server_addr)],
            None,
            hosts(),
            None,
        );
        let query = address_query("example.com", RecordType::A).unwrap();
        let response = transport.exchange(&query).await.unwrap();
        assert_eq!(
            message_addresses(&response),
            vec!["93.184.216.34".parse::<IpAddr>().unwrap()]
        );
    }
}
