//! Capability interfaces between the router and its collaborators.
//!
//! Outbounds, inbounds, providers, probes and observability sidecars are
//! owned by the enclosing application; the router sees them only through
//! the narrow traits defined here.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::InboundDispatchOptions;
use crate::constant;
use crate::error::Result;
use crate::types::{Destination, DnsMode, Network};

/// Byte-stream connection handed between inbounds, the router and outbounds.
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamConn for T {}

/// One pre-read datagram retained by a caching packet connection.
#[derive(Debug, Clone)]
pub struct CachedPacket {
    pub payload: Vec<u8>,
    pub destination: Destination,
}

/// Packet connection. Reads yield the per-datagram destination; writes carry
/// the address the datagram should appear to involve.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, Destination)>;

    async fn write_packet(&self, buf: &[u8], destination: &Destination) -> Result<usize>;

    /// Drain one pre-read datagram without copying through a read buffer.
    /// Connections that do not cache return `None`.
    fn read_cached_packet(&self) -> Option<CachedPacket> {
        None
    }

    async fn close(&self) -> Result<()>;
}

/// Stream wrapper that replays previously peeked bytes before the inner
/// connection, used to hand sniffed prefixes to the outbound.
pub struct CachedStream {
    buffer: Vec<u8>,
    offset: usize,
    inner: Box<dyn StreamConn>,
}

impl CachedStream {
    pub fn new(inner: Box<dyn StreamConn>, buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            offset: 0,
            inner,
        }
    }
}

impl AsyncRead for CachedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.buffer.len() {
            let remaining = &self.buffer[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            if self.offset == self.buffer.len() {
                self.buffer = Vec::new();
                self.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CachedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Packet connection wrapper that replays pre-read datagrams first.
pub struct CachedPacketConn {
    inner: Arc<dyn PacketConn>,
    cached: Mutex<VecDeque<CachedPacket>>,
}

impl CachedPacketConn {
    pub fn new(inner: Arc<dyn PacketConn>, cached: Vec<CachedPacket>) -> Self {
        Self {
            inner,
            cached: Mutex::new(cached.into()),
        }
    }
}

#[async_trait]
impl PacketConn for CachedPacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, Destination)> {
        if let Some(packet) = self.read_cached_packet() {
            let n = packet.payload.len().min(buf.len());
            buf[..n].copy_from_slice(&packet.payload[..n]);
            return Ok((n, packet.destination));
        }
        self.inner.read_packet(buf).await
    }

    async fn write_packet(&self, buf: &[u8], destination: &Destination) -> Result<usize> {
        self.inner.write_packet(buf, destination).await
    }

    fn read_cached_packet(&self) -> Option<CachedPacket> {
        self.cached.lock().pop_front()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// NAT adapter for overridden packet destinations: the outbound sees the
/// rewritten destination while replies appear to the client as coming from
/// the original one.
pub struct NatPacketConn {
    inner: Arc<dyn PacketConn>,
    origin: Destination,
    replaced: Destination,
}

impl NatPacketConn {
    pub fn new(inner: Arc<dyn PacketConn>, origin: Destination, replaced: Destination) -> Self {
        Self {
            inner,
            origin,
            replaced,
        }
    }
}

#[async_trait]
impl PacketConn for NatPacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, Destination)> {
        let (n, destination) = self.inner.read_packet(buf).await?;
        if destination == self.origin {
            return Ok((n, self.replaced.clone()));
        }
        Ok((n, destination))
    }

    async fn write_packet(&self, buf: &[u8], destination: &Destination) -> Result<usize> {
        if *destination == self.replaced {
            return self.inner.write_packet(buf, &self.origin).await;
        }
        self.inner.write_packet(buf, destination).await
    }

    fn read_cached_packet(&self) -> Option<CachedPacket> {
        let mut packet = self.inner.read_cached_packet()?;
        if packet.destination == self.origin {
            packet.destination = self.replaced.clone();
        }
        Some(packet)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Per-dispatch handle: cancellation plus the ancestor outbound tag used
/// for loopback detection when an outbound re-enters the router.
#[derive(Clone, Default)]
pub struct DispatchContext {
    pub cancel: CancellationToken,
    pub outbound_tag: Option<String>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child context carrying the chosen outbound tag.
    pub fn with_outbound(&self, tag: impl Into<String>) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            outbound_tag: Some(tag.into()),
        }
    }
}

/// Result of a process probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub process_path: String,
    pub package_name: String,
    pub user: String,
    pub user_id: Option<i32>,
}

/// WiFi association state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiState {
    pub ssid: String,
    pub bssid: String,
}

/// Per-rule scratch, reset before each rule is evaluated.
#[derive(Debug, Clone, Default)]
pub struct RuleCache {
    pub destination_country: Option<String>,
    pub source_country: Option<String>,
    /// Set while evaluating a rule-set referenced with
    /// `rule_set_ip_cidr_match_source`: IP items match the source instead.
    pub rule_set_match_source: bool,
}

/// Per-connection state flowing through the dispatch pipeline. Mutated only
/// by the dispatching task until the outbound takes ownership.
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub network: Network,
    pub source: SocketAddr,
    pub destination: Destination,
    /// Preserved original destination when the pipeline overrides it.
    pub origin_destination: Option<Destination>,
    /// Resolved addresses for an FQDN destination, possibly lazily filled.
    pub destination_addresses: Vec<IpAddr>,
    pub inbound: String,
    pub last_inbound: Option<String>,
    pub inbound_detour: Option<String>,
    pub inbound_options: InboundDispatchOptions,
    pub user: Option<String>,
    pub process_info: Option<ProcessInfo>,
    pub wifi_state: Option<WifiState>,
    /// Sniffed application protocol, e.g. `tls` or `http`.
    pub protocol: Option<String>,
    pub sniff_host: Option<String>,
    pub client: Option<String>,
    /// Domain learned from reverse DNS mapping.
    pub domain: Option<String>,
    /// Query type when the context describes a DNS query.
    pub query_type: Option<RecordType>,
    pub dns_mode: DnsMode,
    pub is_resolved: bool,
    pub rule_cache: RuleCache,
}

impl InboundContext {
    pub fn new(network: Network, source: SocketAddr, destination: Destination) -> Self {
        Self {
            network,
            source,
            destination,
            origin_destination: None,
            destination_addresses: Vec::new(),
            inbound: String::new(),
            last_inbound: None,
            inbound_detour: None,
            inbound_options: InboundDispatchOptions::default(),
            user: None,
            process_info: None,
            wifi_state: None,
            protocol: None,
            sniff_host: None,
            client: None,
            domain: None,
            query_type: None,
            dns_mode: DnsMode::None,
            is_resolved: false,
            rule_cache: RuleCache::default(),
        }
    }

    pub fn reset_rule_cache(&mut self) {
        self.rule_cache = RuleCache::default();
    }

    /// Effective sniff timeout for this inbound.
    pub fn sniff_timeout(&self) -> Duration {
        if self.inbound_options.sniff_timeout == 0 {
            constant::READ_PAYLOAD_TIMEOUT
        } else {
            Duration::from_millis(self.inbound_options.sniff_timeout)
        }
    }
}

/// Serves relayed DNS queries; implemented by the router.
#[async_trait]
pub trait DnsExchanger: Send + Sync {
    async fn exchange(
        &self,
        ctx: &DispatchContext,
        metadata: &mut InboundContext,
        message: &hickory_proto::op::Message,
    ) -> Result<hickory_proto::op::Message>;
}

/// Egress transport capability.
#[async_trait]
pub trait Outbound: Send + Sync {
    fn tag(&self) -> &str;

    /// Protocol type name, e.g. `direct`, `block`, `dns`.
    fn outbound_type(&self) -> &str;

    fn network(&self) -> &[Network];

    async fn new_connection(
        &self,
        ctx: DispatchContext,
        conn: Box<dyn StreamConn>,
        metadata: InboundContext,
    ) -> Result<()>;

    async fn new_packet_connection(
        &self,
        ctx: DispatchContext,
        conn: Arc<dyn PacketConn>,
        metadata: InboundContext,
    ) -> Result<()>;

    /// Whether this outbound dials resolved IPs itself. `None` means the
    /// capability is not declared and type-based defaults apply.
    fn use_ip(&self) -> Option<bool> {
        None
    }

    /// Interface-update capability; queried once at registration.
    fn as_interface_listener(&self) -> Option<&dyn InterfaceUpdateListener> {
        None
    }
}

/// Network-change notification capability.
pub trait InterfaceUpdateListener: Send + Sync {
    fn interface_updated(&self);
}

/// Externally-owned service driven by the router lifecycle: interface and
/// network monitors, power listener, package manager, time service.
pub trait Monitor: Send + Sync {
    fn start(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Ingress listener capability. Only detour targets need the injectable
/// surface.
pub trait Inbound: Send + Sync {
    fn tag(&self) -> &str;

    fn as_injectable(&self) -> Option<&dyn InjectableInbound> {
        None
    }
}

/// Inbound that accepts connections re-injected by the router.
#[async_trait]
pub trait InjectableInbound: Send + Sync {
    fn network(&self) -> &[Network];

    async fn new_connection(
        &self,
        ctx: DispatchContext,
        conn: Box<dyn StreamConn>,
        metadata: InboundContext,
    ) -> Result<()>;

    async fn new_packet_connection(
        &self,
        ctx: DispatchContext,
        conn: Arc<dyn PacketConn>,
        metadata: InboundContext,
    ) -> Result<()>;
}

/// Dynamic outbound group refreshed from a remote subscription.
#[async_trait]
pub trait OutboundProvider: Send + Sync {
    fn tag(&self) -> &str;

    fn provider_type(&self) -> &str;

    fn outbounds(&self) -> Vec<Arc<dyn Outbound>>;

    fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>>;

    /// Trigger a URL test over the group.
    async fn check_outbounds(&self, force: bool);

    fn as_interface_listener(&self) -> Option<&dyn InterfaceUpdateListener> {
        None
    }
}

/// Snapshot of fake-ip allocations for persistence.
#[derive(Debug, Clone, Default)]
pub struct FakeIpSnapshot {
    pub inet4_current: Option<IpAddr>,
    pub inet6_current: Option<IpAddr>,
    pub entries: Vec<(String, IpAddr)>,
}

/// Optional persistent cache. Absence means in-memory only.
pub trait CacheFile: Send + Sync {
    /// Whether rejected-query results should be persisted.
    fn store_rdrc(&self) -> bool {
        false
    }

    fn load_rdrc(&self, _transport: &str, _domain: &str, _query_type: u16) -> bool {
        false
    }

    fn save_rdrc(&self, _transport: &str, _domain: &str, _query_type: u16) {}

    fn load_provider_expand(&self, _tag: &str) -> Option<bool> {
        None
    }

    fn store_provider_expand(&self, _tag: &str, _is_expand: bool) -> Result<()> {
        Ok(())
    }

    fn load_fake_ip(&self) -> Option<FakeIpSnapshot> {
        None
    }

    fn store_fake_ip(&self, _snapshot: &FakeIpSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Process probe capability.
#[async_trait]
pub trait ProcessSearcher: Send + Sync {
    async fn find_process_info(
        &self,
        network: Network,
        source: SocketAddr,
        destination: Option<SocketAddr>,
    ) -> Result<ProcessInfo>;
}

/// WiFi state capability.
pub trait WifiStateProvider: Send + Sync {
    fn read_wifi_state(&self) -> Option<WifiState>;
}

/// GeoIP database capability: country code for an address.
pub trait GeoIpReader: Send + Sync {
    fn lookup_country(&self, ip: IpAddr) -> Option<String>;
}

/// Kind of one geosite pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeositeEntryType {
    Domain,
    Suffix,
    Keyword,
    Regex,
}

#[derive(Debug, Clone)]
pub struct GeositeEntry {
    pub entry_type: GeositeEntryType,
    pub value: String,
}

/// Geosite database capability: domain patterns for a named category.
pub trait GeositeReader: Send + Sync {
    fn load(&self, code: &str) -> Result<Vec<GeositeEntry>>;
}

/// Loads rule-set contents not declared inline.
#[async_trait]
pub trait RuleSetLoader: Send + Sync {
    async fn load(&self, tag: &str) -> Result<Vec<crate::config::RuleOptions>>;
}

/// Connection-table hook signalled on dispatch and on network reset.
pub trait ConntrackKiller: Send + Sync {
    fn check(&self);

    fn close_all(&self);
}

/// Clash observability sidecar: wraps routed connections with trackers.
pub trait ClashServer: Send + Sync {
    fn routed_connection(
        &self,
        conn: Box<dyn StreamConn>,
        metadata: &InboundContext,
        matched_rule: Option<Uuid>,
    ) -> Box<dyn StreamConn>;

    fn routed_packet_connection(
        &self,
        conn: Arc<dyn PacketConn>,
        metadata: &InboundContext,
        matched_rule: Option<Uuid>,
    ) -> Arc<dyn PacketConn>;
}

/// V2Ray stats sidecar.
pub trait V2RayServer: Send + Sync {
    fn routed_connection(
        &self,
        inbound: &str,
        outbound: &str,
        user: Option<&str>,
        conn: Box<dyn StreamConn>,
    ) -> Box<dyn StreamConn>;

    fn routed_packet_connection(
        &self,
        inbound: &str,
        outbound: &str,
        user: Option<&str>,
        conn: Arc<dyn PacketConn>,
    ) -> Arc<dyn PacketConn>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn dest(host: &str, port: u16) -> Destination {
        Destination::fqdn(host, port)
    }

    #[tokio::test]
    async fn test_cached_stream_replays_buffer() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b" world").await.unwrap();
        drop(server);

        let mut conn = CachedStream::new(Box::new(client), b"hello".to_vec());
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    struct NullPacketConn;

    #[async_trait]
    impl PacketConn for NullPacketConn {
        async fn read_packet(&self, _buf: &mut [u8]) -> Result<(usize, Destination)> {
            Err(crate::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "closed",
            )))
        }

        async fn write_packet(&self, buf: &[u8], _destination: &Destination) -> Result<usize> {
            Ok(buf.len())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cached_packet_conn_drains_before_inner() {
        let conn = CachedPacketConn::new(
            Arc::new(NullPacketConn),
            vec![CachedPacket {
                payload: vec![1, 2, 3],
                destination: dest("example.com", 53),
            }],
        );
        let mut buf = [0u8; 16];
        let (n, destination) = conn.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        assert_eq!(destination, dest("example.com", 53));
        assert!(conn.read_packet(&mut buf).await.is_err());
    }

    struct RecordingPacketConn {
        written: Mutex<Vec<Destination>>,
    }

    #[async_trait]
    impl PacketConn for RecordingPacketConn {
        async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, Destination)> {
            buf[0] = 9;
            Ok((
                1,
                Destination::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(198, 18, 0, 1)),
                    443,
                )),
            ))
        }

        async fn write_packet(&self, buf: &[u8], destination: &Destination) -> Result<usize> {
            self.written.lock().push(destination.clone());
            Ok(buf.len())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_nat_packet_conn_rewrites_both_directions() {
        let origin = Destination::Ip(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(198, 18, 0, 1)),
            443,
        ));
        let replaced = dest("example.com", 443);
        let inner = Arc::new(RecordingPacketConn {
            written: Mutex::new(Vec::new()),
        });
        let conn = NatPacketConn::new(inner.clone(), origin.clone(), replaced.clone());

        let mut buf = [0u8; 4];
        let (_, destination) = conn.read_packet(&mut buf).await.unwrap();
        assert_eq!(destination, replaced);

        conn.write_packet(&[0], &replaced).await.unwrap();
        assert_eq!(inner.written.lock()[0], origin);
    }

    #[test]
    fn test_dispatch_context_child() {
        let ctx = DispatchContext::new();
        assert!(ctx.outbound_tag.is_none());
        let child = ctx.with_outbound("proxy");
        assert_eq!(child.outbound_tag.as_deref(), Some("proxy"));
        ctx.cancel.cancel();
        assert!(child.cancel.is_cancelled());
    }

    #[test]
    fn test_sniff_timeout_default() {
        let ctx = InboundContext::new(
            Network::Tcp,
            "127.0.0.1:1080".parse().unwrap(),
            dest("example.com", 443),
        );
        assert_eq!(ctx.sniff_timeout(), constant::READ_PAYLOAD_TIMEOUT);
    }
}
