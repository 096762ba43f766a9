//! Connection and packet dispatch: destination rewriting, sniffing, rule
//! matching and handoff to the chosen outbound.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use super::Router;
use crate::adapter::{
    CachedPacket, CachedPacketConn, CachedStream, DispatchContext, InboundContext, NatPacketConn,
    Outbound, PacketConn, StreamConn,
};
use crate::constant;
use crate::error::{Error, Result};
use crate::sniff::{packet_retry_sniffers, peek_stream, sniff_packet, SniffOutcome};
use crate::types::{Destination, DnsMode, Network, Strategy};

// Legacy multiplex and UDP-over-TCP magic destinations, rejected with a
// deprecation error.
const MUX_DESTINATION: &str = "sp.mux.sing-box.arpa";
const VMESS_MUX_DESTINATION: &str = "v1.mux.cool";
const UOT_MAGIC_ADDRESS: &str = "sp.v2.udp-over-tcp.arpa";
const UOT_LEGACY_MAGIC_ADDRESS: &str = "sp.udp-over-tcp.arpa";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveStatus {
    NotNeeded,
    Pending,
    Resolved,
    Failed,
}

impl Router {
    pub async fn route_connection(
        &self,
        ctx: DispatchContext,
        conn: Box<dyn StreamConn>,
        mut metadata: InboundContext,
    ) -> Result<()> {
        if self.pause.is_paused() {
            return Err(Error::DevicePaused(metadata.destination.to_string()));
        }

        if let Some(detour_tag) = metadata.inbound_detour.take() {
            if metadata.last_inbound.as_deref() == Some(detour_tag.as_str()) {
                return Err(Error::DetourLoop(detour_tag));
            }
            let registry = self.registry()?;
            let Some(detour) = registry.inbound_by_tag.get(&detour_tag).cloned() else {
                return Err(Error::InboundDetourNotFound(detour_tag));
            };
            let Some(injectable) = detour.as_injectable() else {
                return Err(Error::InboundDetourNotInjectable(detour_tag));
            };
            if !injectable.network().contains(&Network::Tcp) {
                return Err(Error::InjectNetworkUnsupported("TCP"));
            }
            metadata.last_inbound = Some(std::mem::replace(&mut metadata.inbound, detour_tag));
            return injectable
                .new_connection(ctx, conn, metadata)
                .await
                .map_err(|err| err.context("inject"));
        }

        if let Some(conntrack) = &self.conntrack {
            conntrack.check();
        }
        metadata.network = Network::Tcp;

        if let Some(domain) = metadata.destination.domain() {
            match domain {
                MUX_DESTINATION => {
                    return Err(Error::Deprecated(
                        "global multiplex is deprecated, enable multiplex in inbound options instead",
                    ));
                }
                VMESS_MUX_DESTINATION => {
                    return Err(Error::Deprecated("global multiplex (v2ray legacy) not supported"));
                }
                UOT_MAGIC_ADDRESS => {
                    return Err(Error::Deprecated("global UoT not supported"));
                }
                UOT_LEGACY_MAGIC_ADDRESS => {
                    return Err(Error::Deprecated("global UoT (legacy) not supported"));
                }
                _ => {}
            }
        }

        self.reverse_fake_ip(&mut metadata)?;
        self.apply_reverse_mapping(&mut metadata);

        let mut conn: Box<dyn StreamConn> = conn;
        if metadata.inbound_options.sniff_enabled {
            let timeout = metadata.sniff_timeout();
            let peeked = peek_stream(&mut conn, &mut metadata, &self.stream_sniffers, timeout)
                .await
                .map_err(Error::Io)?;
            if let Some(protocol) = &metadata.protocol {
                match &metadata.sniff_host {
                    Some(host) => debug!("sniffed protocol: {}, domain: {}", protocol, host),
                    None => debug!("sniffed protocol: {}", protocol),
                }
            }
            if !metadata.destination.is_fqdn()
                && metadata.inbound_options.sniff_override_destination
                && metadata
                    .sniff_host
                    .as_deref()
                    .map(is_domain_name)
                    .unwrap_or(false)
                && self.match_sniff_override(&metadata)
            {
                let host = metadata.sniff_host.clone().unwrap_or_default();
                let port = metadata.destination.port();
                metadata.origin_destination = Some(metadata.destination.clone());
                metadata.destination = Destination::fqdn(host, port);
                debug!("connection destination is overridden as {}", metadata.destination);
            }
            if !peeked.is_empty() {
                conn = Box::new(CachedStream::new(conn, peeked));
            }
        }

        self.resolve_destination(&mut metadata).await?;

        let (matched_rule, detour, child_ctx) = self
            .match_outbound(&ctx, &mut metadata, self.default_outbound(Network::Tcp)?)
            .await?;
        if !detour.network().contains(&Network::Tcp) {
            return Err(Error::NoSupportedOutbound("TCP"));
        }

        let mut conn = conn;
        if let Some(clash) = self.clash_server.read().clone() {
            conn = clash.routed_connection(conn, &metadata, matched_rule);
        }
        if let Some(v2ray) = self.v2ray_server.read().clone() {
            conn = v2ray.routed_connection(
                &metadata.inbound,
                detour.tag(),
                metadata.user.as_deref(),
                conn,
            );
        }
        detour.new_connection(child_ctx, conn, metadata).await
    }

    pub async fn route_packet_connection(
        &self,
        ctx: DispatchContext,
        conn: Arc<dyn PacketConn>,
        mut metadata: InboundContext,
    ) -> Result<()> {
        if self.pause.is_paused() {
            return Err(Error::DevicePaused(metadata.destination.to_string()));
        }

        if let Some(detour_tag) = metadata.inbound_detour.take() {
            if metadata.last_inbound.as_deref() == Some(detour_tag.as_str()) {
                return Err(Error::DetourLoop(detour_tag));
            }
            let registry = self.registry()?;
            let Some(detour) = registry.inbound_by_tag.get(&detour_tag).cloned() else {
                return Err(Error::InboundDetourNotFound(detour_tag));
            };
            let Some(injectable) = detour.as_injectable() else {
                return Err(Error::InboundDetourNotInjectable(detour_tag));
            };
            if !injectable.network().contains(&Network::Udp) {
                return Err(Error::InjectNetworkUnsupported("UDP"));
            }
            metadata.last_inbound = Some(std::mem::replace(&mut metadata.inbound, detour_tag));
            return injectable
                .new_packet_connection(ctx, conn, metadata)
                .await
                .map_err(|err| err.context("inject"));
        }

        if let Some(conntrack) = &self.conntrack {
            conntrack.check();
        }
        metadata.network = Network::Udp;

        let mut destination_overridden = self.reverse_fake_ip(&mut metadata)?;
        destination_overridden |= self.apply_reverse_mapping(&mut metadata);

        let mut conn: Arc<dyn PacketConn> = conn;
        if metadata.inbound_options.sniff_enabled || destination_unspecified(&metadata.destination)
        {
            let mut fragments: Vec<CachedPacket> = Vec::new();
            let mut buffer = vec![0u8; 65535];
            loop {
                let (n, packet_destination) = conn.read_packet(&mut buffer).await?;
                let payload = buffer[..n].to_vec();
                if destination_unspecified(&metadata.destination) {
                    metadata.destination = packet_destination.clone();
                }
                if metadata.inbound_options.sniff_enabled {
                    let sniffers = if fragments.is_empty() {
                        self.packet_sniffers.clone()
                    } else {
                        packet_retry_sniffers()
                    };
                    let outcome = sniff_packet(&mut metadata, &payload, &sniffers);
                    if outcome == SniffOutcome::Fragmented && fragments.is_empty() {
                        debug!("attempt to sniff fragmented QUIC client hello");
                        fragments.push(CachedPacket {
                            payload,
                            destination: packet_destination,
                        });
                        continue;
                    }
                    if let Some(protocol) = &metadata.protocol {
                        match (&metadata.sniff_host, &metadata.client) {
                            (Some(host), Some(client)) => debug!(
                                "sniffed packet protocol: {}, domain: {}, client: {}",
                                protocol, host, client
                            ),
                            (Some(host), None) => {
                                debug!("sniffed packet protocol: {}, domain: {}", protocol, host)
                            }
                            (None, Some(client)) => {
                                debug!("sniffed packet protocol: {}, client: {}", protocol, client)
                            }
                            (None, None) => debug!("sniffed packet protocol: {}", protocol),
                        }
                        if !metadata.destination.is_fqdn()
                            && metadata.inbound_options.sniff_override_destination
                            && metadata
                                .sniff_host
                                .as_deref()
                                .map(is_domain_name)
                                .unwrap_or(false)
                            && self.match_sniff_override(&metadata)
                        {
                            let host = metadata.sniff_host.clone().unwrap_or_default();
                            let port = metadata.destination.port();
                            metadata.origin_destination = Some(metadata.destination.clone());
                            metadata.destination = Destination::fqdn(host, port);
                            destination_overridden = true;
                            debug!(
                                "packet destination is overridden as {}",
                                metadata.destination
                            );
                        }
                    }
                }
                fragments.push(CachedPacket {
                    payload,
                    destination: packet_destination,
                });
                conn = Arc::new(CachedPacketConn::new(conn, fragments));
                break;
            }
        }

        self.resolve_destination(&mut metadata).await?;

        let (matched_rule, detour, child_ctx) = self
            .match_outbound(&ctx, &mut metadata, self.default_outbound(Network::Udp)?)
            .await?;
        if !detour.network().contains(&Network::Udp) {
            return Err(Error::NoSupportedOutbound("UDP"));
        }

        if let Some(clash) = self.clash_server.read().clone() {
            conn = clash.routed_packet_connection(conn, &metadata, matched_rule);
        }
        if let Some(v2ray) = self.v2ray_server.read().clone() {
            conn = v2ray.routed_packet_connection(
                &metadata.inbound,
                detour.tag(),
                metadata.user.as_deref(),
                conn,
            );
        }
        if destination_overridden {
            if let Some(origin) = &metadata.origin_destination {
                conn = Arc::new(NatPacketConn::new(
                    conn,
                    origin.clone(),
                    metadata.destination.clone(),
                ));
            }
        }
        if self.must_resolve(&detour, &metadata) {
            let domain = metadata
                .destination
                .domain()
                .unwrap_or_default()
                .to_string();
            let addresses = self.lookup_default(&mut metadata, &domain).await?;
            debug!(
                "resolved [{}]",
                addresses
                    .iter()
                    .map(|ip| ip.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            metadata.destination_addresses = addresses;
        }
        detour.new_packet_connection(child_ctx, conn, metadata).await
    }

    /// Destination inside the fake range: recover the FQDN.
    fn reverse_fake_ip(&self, metadata: &mut InboundContext) -> Result<bool> {
        let Some(store) = &self.fake_ip_store else {
            return Ok(false);
        };
        let Some(ip) = metadata.destination.ip() else {
            return Ok(false);
        };
        if !store.contains(ip) {
            return Ok(false);
        }
        let Some(domain) = store.lookup(ip) else {
            return Err(Error::MissingFakeIpContext);
        };
        debug!("found fakeip domain: {}", domain);
        let port = metadata.destination.port();
        metadata.origin_destination = Some(metadata.destination.clone());
        metadata.destination = Destination::fqdn(domain, port);
        metadata.dns_mode = DnsMode::FakeIp;
        debug!("destination is overridden as {}", metadata.destination);
        Ok(true)
    }

    /// Literal-IP destination remembered by the reverse mapping: annotate,
    /// and rewrite when mapping override is on.
    fn apply_reverse_mapping(&self, metadata: &mut InboundContext) -> bool {
        let Some(mapping) = &self.dns_reverse_mapping else {
            return false;
        };
        let Some(ip) = metadata.destination.ip() else {
            return false;
        };
        let Some(domain) = mapping.query(ip) else {
            return false;
        };
        debug!("found reverse mapped domain: {}", domain);
        metadata.domain = Some(domain.clone());
        metadata.dns_mode = DnsMode::RedirHost;
        if self.dns_mapping_override {
            let port = metadata.destination.port();
            metadata.origin_destination = Some(metadata.destination.clone());
            metadata.destination = Destination::fqdn(domain, port);
            debug!("destination is overridden as {}", metadata.destination);
            return true;
        }
        false
    }

    /// Hosts-first destination resolution with the effective strategy.
    async fn resolve_destination(&self, metadata: &mut InboundContext) -> Result<()> {
        let Destination::Fqdn(domain, port) = metadata.destination.clone() else {
            return Ok(());
        };
        let exact = self.dns_client.exact_domain_from_hosts(&domain);
        if exact != domain {
            metadata.destination = Destination::fqdn(exact.clone(), port);
        }
        let inbound_strategy = metadata.inbound_options.domain_strategy;
        let strategy = inbound_strategy.or_default(self.default_domain_strategy);
        let from_hosts = self.dns_client.addrs_from_hosts(&exact, strategy);
        if !from_hosts.is_empty() {
            metadata.destination_addresses = from_hosts;
        } else if inbound_strategy != Strategy::AsIs {
            let addresses = self.lookup(metadata, &exact, inbound_strategy).await?;
            debug!(
                "resolved [{}]",
                addresses
                    .iter()
                    .map(|ip| ip.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            metadata.destination_addresses = addresses;
        }
        Ok(())
    }

    async fn match_outbound(
        &self,
        ctx: &DispatchContext,
        metadata: &mut InboundContext,
        default: Arc<dyn Outbound>,
    ) -> Result<(Option<Uuid>, Arc<dyn Outbound>, DispatchContext)> {
        let (matched_rule, outbound) = self.match0(metadata, default).await;
        if let Some(ancestor) = &ctx.outbound_tag {
            if ancestor == outbound.tag() {
                return Err(Error::OutboundLoopback {
                    kind: outbound.outbound_type().to_string(),
                    tag: outbound.tag().to_string(),
                });
            }
        }
        let child = ctx.with_outbound(outbound.tag());
        Ok((matched_rule, outbound, child))
    }

    async fn match0(
        &self,
        metadata: &mut InboundContext,
        default: Arc<dyn Outbound>,
    ) -> (Option<Uuid>, Arc<dyn Outbound>) {
        if metadata.process_info.is_none() {
            let searcher = self.process_searcher.read().clone();
            if let Some(searcher) = searcher {
                let origin_destination = match &metadata.origin_destination {
                    Some(Destination::Ip(addr)) => Some(*addr),
                    _ => metadata
                        .destination
                        .ip()
                        .map(|ip| SocketAddr::new(ip, metadata.destination.port())),
                };
                match searcher
                    .find_process_info(metadata.network, metadata.source, origin_destination)
                    .await
                {
                    Ok(process_info) => {
                        if !process_info.process_path.is_empty() {
                            info!("found process path: {}", process_info.process_path);
                        } else if !process_info.package_name.is_empty() {
                            info!("found package name: {}", process_info.package_name);
                        } else if !process_info.user.is_empty() {
                            info!("found user: {}", process_info.user);
                        }
                        metadata.process_info = Some(process_info);
                    }
                    Err(err) => info!("failed to search process: {}", err),
                }
            }
        }
        if metadata.wifi_state.is_none() && self.need_wifi_state() {
            metadata.wifi_state = self.wifi_state.read().clone();
        }

        let mut resolve_status =
            if metadata.destination.is_fqdn() && metadata.destination_addresses.is_empty() {
                ResolveStatus::Pending
            } else {
                ResolveStatus::NotNeeded
            };
        let mut chosen: Option<(Option<Uuid>, Arc<dyn Outbound>)> = None;

        for (index, rule) in self.rules.iter().enumerate() {
            if rule.disabled() {
                continue;
            }
            metadata.reset_rule_cache();
            if resolve_status == ResolveStatus::Pending
                && !rule.skip_resolve()
                && rule.contains_destination_ip_rule()
            {
                let domain = metadata
                    .destination
                    .domain()
                    .unwrap_or_default()
                    .to_string();
                match self.lookup_default(metadata, &domain).await {
                    Ok(addresses) => {
                        resolve_status = ResolveStatus::Resolved;
                        metadata.is_resolved = true;
                        metadata.destination_addresses = addresses;
                    }
                    Err(err) => {
                        resolve_status = ResolveStatus::Failed;
                        debug!("lazy resolve failed: {}", err);
                    }
                }
                metadata.reset_rule_cache();
            }
            if rule.matches(&self.rctx, metadata) {
                let detour = rule.outbound();
                debug!("match[{}] {} => {}", index, rule, detour);
                if let Some(outbound) = self.outbound(detour) {
                    chosen = Some((Some(rule.uuid()), outbound));
                    break;
                }
                error!("outbound not found: {}", detour);
            }
        }

        let (matched_rule, outbound) = chosen.unwrap_or((None, default));
        if resolve_status == ResolveStatus::Resolved && !self.must_use_ip(&outbound, metadata) {
            // Do not leak resolver results to an outbound that re-resolves.
            metadata.destination_addresses = Vec::new();
        }
        (matched_rule, outbound)
    }

    fn must_use_ip(&self, outbound: &Arc<dyn Outbound>, metadata: &InboundContext) -> bool {
        let real = self
            .outbound_with_provider(outbound.tag())
            .unwrap_or_else(|| outbound.clone());
        if let Some(use_ip) = real.use_ip() {
            return use_ip;
        }
        if metadata.network == Network::Tcp {
            return false;
        }
        if self.stop_always_resolve_udp {
            return false;
        }
        let outbound_type = real.outbound_type();
        outbound_type != constant::TYPE_BLOCK && outbound_type != constant::TYPE_DNS
    }

    /// UDP-only forced resolution before handoff.
    pub(crate) fn must_resolve(
        &self,
        outbound: &Arc<dyn Outbound>,
        metadata: &InboundContext,
    ) -> bool {
        if metadata.is_resolved {
            return false;
        }
        if self.stop_always_resolve_udp {
            return false;
        }
        if !metadata.destination.is_fqdn() {
            return false;
        }
        if !metadata.destination_addresses.is_empty() {
            return false;
        }
        let real = self
            .outbound_with_provider(outbound.tag())
            .unwrap_or_else(|| outbound.clone());
        let outbound_type = real.outbound_type();
        if outbound_type == constant::TYPE_BLOCK || outbound_type == constant::TYPE_DNS {
            return false;
        }
        real.use_ip() != Some(false)
    }

    fn match_sniff_override(&self, metadata: &InboundContext) -> bool {
        let Some(rules) = self.sniff_override_rules.get(&metadata.inbound) else {
            return false;
        };
        let Some(host) = &metadata.sniff_host else {
            return false;
        };
        let mut scratch = metadata.clone();
        scratch.destination = Destination::fqdn(host.clone(), metadata.destination.port());
        rules.iter().any(|rule| {
            scratch.reset_rule_cache();
            !rule.disabled() && rule.matches(&self.rctx, &mut scratch)
        })
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

fn destination_unspecified(destination: &Destination) -> bool {
    destination.ip().map(|ip| ip.is_unspecified()).unwrap_or(false)
}

fn is_domain_name(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 255
        && host.parse::<std::net::IpAddr>().is_err()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}
