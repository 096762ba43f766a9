use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;

use super::{Router, RouterCollaborators};
use crate::adapter::{
    DispatchContext, InboundContext, Outbound, PacketConn, StreamConn,
};
use crate::config::{
    DefaultDnsRuleOptions, DefaultRuleOptions, DnsOptions, DnsRuleOptions, DnsServerOptions,
    FakeIpOptions, InboundRouteOptions, RouteOptions, RuleOptions,
};
use crate::dns::{address_query, address_response, message_addresses};
use crate::error::{Error, Result};
use crate::types::{Destination, DnsMode, Network, Strategy};

struct MockOutbound {
    tag: String,
    kind: &'static str,
    networks: Vec<Network>,
    use_ip: Option<bool>,
    streams: Mutex<Vec<(InboundContext, Vec<u8>)>>,
    packets: Mutex<Vec<(InboundContext, Arc<dyn PacketConn>)>>,
}

impl MockOutbound {
    fn new(tag: &str) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            kind: "direct",
            networks: vec![Network::Tcp, Network::Udp],
            use_ip: None,
            streams: Mutex::new(Vec::new()),
            packets: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Outbound for MockOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &str {
        self.kind
    }

    fn network(&self) -> &[Network] {
        &self.networks
    }

    async fn new_connection(
        &self,
        _ctx: DispatchContext,
        mut conn: Box<dyn StreamConn>,
        metadata: InboundContext,
    ) -> Result<()> {
        let mut bytes = Vec::new();
        let _ = conn.read_to_end(&mut bytes).await;
        self.streams.lock().push((metadata, bytes));
        Ok(())
    }

    async fn new_packet_connection(
        &self,
        _ctx: DispatchContext,
        conn: Arc<dyn PacketConn>,
        metadata: InboundContext,
    ) -> Result<()> {
        self.packets.lock().push((metadata, conn));
        Ok(())
    }

    fn use_ip(&self) -> Option<bool> {
        self.use_ip
    }
}

struct NullInbound {
    tag: String,
}

impl crate::adapter::Inbound for NullInbound {
    fn tag(&self) -> &str {
        &self.tag
    }
}

fn tcp_metadata(destination: Destination) -> InboundContext {
    let mut metadata = InboundContext::new(
        Network::Tcp,
        "10.0.0.9:52000".parse::<SocketAddr>().unwrap(),
        destination,
    );
    metadata.inbound = "in".to_string();
    metadata
}

fn udp_metadata(destination: Destination) -> InboundContext {
    let mut metadata = tcp_metadata(destination);
    metadata.network = Network::Udp;
    metadata
}

async fn build_router(
    route: RouteOptions,
    dns: DnsOptions,
    inbounds: &[InboundRouteOptions],
    outbounds: Vec<Arc<dyn Outbound>>,
) -> Arc<Router> {
    let router = Router::new(route, dns, inbounds, RouterCollaborators::default()).unwrap();
    router.initialize(vec![], vec![], outbounds).unwrap();
    router.pre_start().unwrap();
    router.start().unwrap();
    router.post_start().await.unwrap();
    router
}

/// One-address mock DNS server counting every received query.
async fn spawn_dns_server(counter: Arc<AtomicUsize>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buffer = vec![0u8; 2048];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buffer).await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let Ok(query) = Message::from_bytes(&buffer[..n]) else {
                continue;
            };
            let addresses: Vec<IpAddr> = vec!["1.2.3.4".parse().unwrap()];
            let response = address_response(&query, &addresses, 60);
            let _ = socket.send_to(&response.to_bytes().unwrap(), peer).await;
        }
    });
    address
}

struct ChannelPacketConn {
    incoming: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<(Vec<u8>, Destination)>>,
    outgoing: tokio::sync::mpsc::Sender<(Vec<u8>, Destination)>,
}

#[async_trait]
impl PacketConn for ChannelPacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, Destination)> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some((payload, destination)) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok((n, destination))
            }
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "closed",
            ))),
        }
    }

    async fn write_packet(&self, buf: &[u8], destination: &Destination) -> Result<usize> {
        let _ = self.outgoing.send((buf.to_vec(), destination.clone())).await;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn channel_packet_conn() -> (
    Arc<ChannelPacketConn>,
    tokio::sync::mpsc::Sender<(Vec<u8>, Destination)>,
    tokio::sync::mpsc::Receiver<(Vec<u8>, Destination)>,
) {
    let (in_tx, in_rx) = tokio::sync::mpsc::channel(8);
    let (out_tx, out_rx) = tokio::sync::mpsc::channel(8);
    (
        Arc::new(ChannelPacketConn {
            incoming: tokio::sync::Mutex::new(in_rx),
            outgoing: out_tx,
        }),
        in_tx,
        out_rx,
    )
}

#[tokio::test]
async fn test_fake_ip_reverse() {
    let dns = DnsOptions {
        servers: vec![
            DnsServerOptions {
                tag: Some("remote".to_string()),
                address: vec!["rcode://success".to_string()],
                ..DnsServerOptions::default()
            },
            DnsServerOptions {
                tag: Some("fake".to_string()),
                address: vec!["fakeip".to_string()],
                ..DnsServerOptions::default()
            },
        ],
        rules: vec![DnsRuleOptions::Default(DefaultDnsRuleOptions {
            domain_suffix: vec!["example.com".to_string()],
            server: "fake".to_string(),
            ..DefaultDnsRuleOptions::default()
        })],
        final_server: Some("remote".to_string()),
        fake_ip: Some(FakeIpOptions {
            enabled: true,
            inet4_range: Some("198.18.0.0/15".parse().unwrap()),
            ..FakeIpOptions::default()
        }),
        ..DnsOptions::default()
    };
    let outbound = MockOutbound::new("direct-out");
    let router = build_router(
        RouteOptions::default(),
        dns,
        &[],
        vec![outbound.clone()],
    )
    .await;

    // A DNS query allocates the synthetic address.
    let query = address_query("example.com", RecordType::A).unwrap();
    let mut dns_metadata = udp_metadata(Destination::fqdn("example.com", 0));
    let response = router
        .exchange_message(&mut dns_metadata, &query)
        .await
        .unwrap();
    let fake = message_addresses(&response)[0];
    assert_eq!(fake, "198.18.0.1".parse::<IpAddr>().unwrap());

    // A later connection to the synthetic address recovers the FQDN.
    let (client, server) = tokio::io::duplex(64);
    drop(client);
    let metadata = tcp_metadata(Destination::Ip(SocketAddr::new(fake, 443)));
    router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap();

    let recorded = outbound.streams.lock();
    let (metadata, _) = &recorded[0];
    assert_eq!(metadata.destination, Destination::fqdn("example.com", 443));
    assert_eq!(
        metadata.origin_destination,
        Some(Destination::Ip(SocketAddr::new(fake, 443)))
    );
    assert_eq!(metadata.dns_mode, DnsMode::FakeIp);
}

#[test]
fn test_circular_dns_servers() {
    let dns = DnsOptions {
        servers: vec![
            DnsServerOptions {
                tag: Some("a".to_string()),
                address: vec!["dns.b.net".to_string()],
                address_resolver: Some("b".to_string()),
                ..DnsServerOptions::default()
            },
            DnsServerOptions {
                tag: Some("b".to_string()),
                address: vec!["dns.a.net".to_string()],
                address_resolver: Some("a".to_string()),
                ..DnsServerOptions::default()
            },
        ],
        ..DnsOptions::default()
    };
    let err = Router::new(
        RouteOptions::default(),
        dns,
        &[],
        RouterCollaborators::default(),
    )
    .err()
    .unwrap();
    assert_eq!(
        err.to_string(),
        "found circular reference in dns servers: a b"
    );
}

#[tokio::test]
async fn test_detour_loop() {
    let outbound = MockOutbound::new("direct-out");
    let router = build_router(
        RouteOptions::default(),
        DnsOptions::default(),
        &[],
        vec![outbound],
    )
    .await;

    let (_client, server) = tokio::io::duplex(64);
    let mut metadata = tcp_metadata(Destination::fqdn("example.com", 443));
    metadata.inbound = "A".to_string();
    metadata.last_inbound = Some("A".to_string());
    metadata.inbound_detour = Some("A".to_string());
    let err = router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "routing loop on detour: A");
}

#[tokio::test]
async fn test_inbound_detour_lookup_and_injectability() {
    let outbound = MockOutbound::new("direct-out");
    let router = Router::new(
        RouteOptions::default(),
        DnsOptions::default(),
        &[],
        RouterCollaborators::default(),
    )
    .unwrap();
    router
        .initialize(
            vec![Arc::new(NullInbound {
                tag: "B".to_string(),
            })],
            vec![],
            vec![outbound],
        )
        .unwrap();
    router.pre_start().unwrap();
    router.start().unwrap();
    router.post_start().await.unwrap();

    // Unknown detour target.
    let (_client, server) = tokio::io::duplex(64);
    let mut metadata = tcp_metadata(Destination::fqdn("example.com", 443));
    metadata.inbound_detour = Some("C".to_string());
    let err = router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "inbound detour not found: C");

    // Known but not injectable.
    let (_client, server) = tokio::io::duplex(64);
    let mut metadata = tcp_metadata(Destination::fqdn("example.com", 443));
    metadata.inbound_detour = Some("B".to_string());
    let err = router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "inbound detour is not injectable: B");
}

#[tokio::test]
async fn test_sniff_override() {
    let inbounds = vec![InboundRouteOptions {
        tag: "in".to_string(),
        sniff_override_rules: vec![RuleOptions::Default(DefaultRuleOptions {
            domain: vec!["site.test".to_string()],
            ..DefaultRuleOptions::default()
        })],
    }];
    let outbound = MockOutbound::new("direct-out");
    let router = build_router(
        RouteOptions::default(),
        DnsOptions::default(),
        &inbounds,
        vec![outbound.clone()],
    )
    .await;

    let hello = crate::sniff::test_client_hello("site.test");
    let (client, server) = tokio::io::duplex(4096);
    {
        use tokio::io::AsyncWriteExt;
        let mut client = client;
        client.write_all(&hello).await.unwrap();
        drop(client);
    }
    let mut metadata = tcp_metadata(Destination::Ip("1.2.3.4:443".parse().unwrap()));
    metadata.inbound_options.sniff_enabled = true;
    metadata.inbound_options.sniff_override_destination = true;
    router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap();

    let recorded = outbound.streams.lock();
    let (metadata, replayed) = &recorded[0];
    assert_eq!(metadata.destination, Destination::fqdn("site.test", 443));
    assert_eq!(
        metadata.origin_destination,
        Some(Destination::Ip("1.2.3.4:443".parse().unwrap()))
    );
    assert_eq!(metadata.protocol.as_deref(), Some("tls"));
    // Peeked bytes are replayed to the outbound.
    assert_eq!(replayed, &hello);
}

#[tokio::test]
async fn test_udp_must_resolve_performs_one_lookup() {
    let counter = Arc::new(AtomicUsize::new(0));
    let server_addr = spawn_dns_server(counter.clone()).await;
    let dns = DnsOptions {
        servers: vec![DnsServerOptions {
            tag: Some("upstream".to_string()),
            address: vec![server_addr.to_string()],
            ..DnsServerOptions::default()
        }],
        strategy: Strategy::Ipv4Only,
        ..DnsOptions::default()
    };
    let outbound = MockOutbound::new("direct-out");
    let router = build_router(RouteOptions::default(), dns, &[], vec![outbound.clone()]).await;

    let (conn, _in_tx, _out_rx) = channel_packet_conn();
    let metadata = udp_metadata(Destination::fqdn("res.example", 9999));
    router
        .route_packet_connection(DispatchContext::new(), conn, metadata)
        .await
        .unwrap();

    let recorded = outbound.packets.lock();
    let (metadata, _) = &recorded[0];
    assert_eq!(
        metadata.destination_addresses,
        vec!["1.2.3.4".parse::<IpAddr>().unwrap()]
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tcp_dispatch_without_ip_rules_never_resolves() {
    let counter = Arc::new(AtomicUsize::new(0));
    let server_addr = spawn_dns_server(counter.clone()).await;
    let dns = DnsOptions {
        servers: vec![DnsServerOptions {
            tag: Some("upstream".to_string()),
            address: vec![server_addr.to_string()],
            ..DnsServerOptions::default()
        }],
        ..DnsOptions::default()
    };
    let route = RouteOptions {
        rules: vec![RuleOptions::Default(DefaultRuleOptions {
            domain_suffix: vec!["example.com".to_string()],
            outbound: "direct-out".to_string(),
            ..DefaultRuleOptions::default()
        })],
        ..RouteOptions::default()
    };
    let outbound = MockOutbound::new("direct-out");
    let router = build_router(route, dns, &[], vec![outbound.clone()]).await;

    let (client, server) = tokio::io::duplex(64);
    drop(client);
    let metadata = tcp_metadata(Destination::fqdn("www.example.com", 80));
    router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap();

    assert_eq!(outbound.streams.lock().len(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_first_match_wins() {
    let route = RouteOptions {
        rules: vec![
            RuleOptions::Default(DefaultRuleOptions {
                domain_suffix: vec!["example.com".to_string()],
                outbound: "first".to_string(),
                ..DefaultRuleOptions::default()
            }),
            RuleOptions::Default(DefaultRuleOptions {
                port: vec![443],
                outbound: "second".to_string(),
                ..DefaultRuleOptions::default()
            }),
        ],
        ..RouteOptions::default()
    };
    let first = MockOutbound::new("first");
    let second = MockOutbound::new("second");
    let router = build_router(
        route,
        DnsOptions::default(),
        &[],
        vec![first.clone(), second.clone()],
    )
    .await;

    let (client, server) = tokio::io::duplex(64);
    drop(client);
    let metadata = tcp_metadata(Destination::fqdn("www.example.com", 443));
    router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap();
    assert_eq!(first.streams.lock().len(), 1);
    assert!(second.streams.lock().is_empty());
}

#[tokio::test]
async fn test_disabled_rule_is_skipped() {
    let route = RouteOptions {
        rules: vec![
            RuleOptions::Default(DefaultRuleOptions {
                port: vec![443],
                outbound: "first".to_string(),
                ..DefaultRuleOptions::default()
            }),
            RuleOptions::Default(DefaultRuleOptions {
                port: vec![443],
                outbound: "second".to_string(),
                ..DefaultRuleOptions::default()
            }),
        ],
        ..RouteOptions::default()
    };
    let first = MockOutbound::new("first");
    let second = MockOutbound::new("second");
    let router = build_router(
        route,
        DnsOptions::default(),
        &[],
        vec![first.clone(), second.clone()],
    )
    .await;
    router.rules()[0].set_disabled(true);

    let (client, server) = tokio::io::duplex(64);
    drop(client);
    let metadata = tcp_metadata(Destination::fqdn("x.test", 443));
    router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap();
    assert!(first.streams.lock().is_empty());
    assert_eq!(second.streams.lock().len(), 1);
}

struct LoopOutbound {
    tag: String,
    networks: Vec<Network>,
    router: Mutex<Option<Arc<Router>>>,
}

#[async_trait]
impl Outbound for LoopOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &str {
        "loop"
    }

    fn network(&self) -> &[Network] {
        &self.networks
    }

    async fn new_connection(
        &self,
        ctx: DispatchContext,
        conn: Box<dyn StreamConn>,
        metadata: InboundContext,
    ) -> Result<()> {
        let router = self.router.lock().clone().unwrap();
        router.route_connection(ctx, conn, metadata).await
    }

    async fn new_packet_connection(
        &self,
        _ctx: DispatchContext,
        _conn: Arc<dyn PacketConn>,
        _metadata: InboundContext,
    ) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_outbound_loopback_detected() {
    let route = RouteOptions {
        rules: vec![RuleOptions::Default(DefaultRuleOptions {
            network: vec!["tcp".to_string()],
            outbound: "looper".to_string(),
            ..DefaultRuleOptions::default()
        })],
        ..RouteOptions::default()
    };
    let looper = Arc::new(LoopOutbound {
        tag: "looper".to_string(),
        networks: vec![Network::Tcp, Network::Udp],
        router: Mutex::new(None),
    });
    let router = build_router(
        route,
        DnsOptions::default(),
        &[],
        vec![looper.clone()],
    )
    .await;
    *looper.router.lock() = Some(router.clone());

    let (_client, server) = tokio::io::duplex(64);
    let metadata = tcp_metadata(Destination::fqdn("x.test", 443));
    let err = router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("connection loopback in outbound/loop[looper]"));
}

#[tokio::test]
async fn test_paused_device_rejects_dispatch() {
    let outbound = MockOutbound::new("direct-out");
    let router = build_router(
        RouteOptions::default(),
        DnsOptions::default(),
        &[],
        vec![outbound],
    )
    .await;
    router.pause_manager().device_pause();

    let (_client, server) = tokio::io::duplex(64);
    let metadata = tcp_metadata(Destination::fqdn("example.com", 443));
    let err = router
        .route_connection(DispatchContext::new(), Box::new(server), metadata)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("while device paused"));
    router.pause_manager().device_wake();
}

#[tokio::test]
async fn test_initialize_is_not_repeatable() {
    let router = Router::new(
        RouteOptions::default(),
        DnsOptions::default(),
        &[],
        RouterCollaborators::default(),
    )
    .unwrap();
    let outbound = MockOutbound::new("direct-out");
    router
        .initialize(vec![], vec![], vec![outbound.clone()])
        .unwrap();
    let err = router
        .initialize(vec![], vec![], vec![outbound])
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyInitialized));
}

#[tokio::test]
async fn test_initialize_validates_rule_outbounds() {
    let route = RouteOptions {
        rules: vec![RuleOptions::Default(DefaultRuleOptions {
            port: vec![443],
            outbound: "missing".to_string(),
            ..DefaultRuleOptions::default()
        })],
        ..RouteOptions::default()
    };
    let router = Router::new(
        route,
        DnsOptions::default(),
        &[],
        RouterCollaborators::default(),
    )
    .unwrap();
    let err = router
        .initialize(vec![], vec![], vec![MockOutbound::new("direct-out")])
        .unwrap_err();
    assert!(err.to_string().contains("outbound not found for rule[0]: missing"));
}

#[tokio::test]
async fn test_default_detour_must_exist() {
    let route = RouteOptions {
        final_outbound: Some("ghost".to_string()),
        ..RouteOptions::default()
    };
    let router = Router::new(
        route,
        DnsOptions::default(),
        &[],
        RouterCollaborators::default(),
    )
    .unwrap();
    let err = router
        .initialize(vec![], vec![], vec![MockOutbound::new("direct-out")])
        .unwrap_err();
    assert_eq!(err.to_string(), "default detour not found: ghost");
}

#[tokio::test]
async fn test_udp_destination_override_wraps_nat() {
    let dns = DnsOptions {
        servers: vec![
            DnsServerOptions {
                tag: Some("remote".to_string()),
                address: vec!["rcode://success".to_string()],
                ..DnsServerOptions::default()
            },
            DnsServerOptions {
                tag: Some("fake".to_string()),
                address: vec!["fakeip".to_string()],
                ..DnsServerOptions::default()
            },
        ],
        rules: vec![DnsRuleOptions::Default(DefaultDnsRuleOptions {
            domain_suffix: vec!["game.example".to_string()],
            server: "fake".to_string(),
            ..DefaultDnsRuleOptions::default()
        })],
        final_server: Some("remote".to_string()),
        fake_ip: Some(FakeIpOptions {
            enabled: true,
            inet4_range: Some("198.18.0.0/15".parse().unwrap()),
            ..FakeIpOptions::default()
        }),
        ..DnsOptions::default()
    };
    let route = RouteOptions {
        stop_always_resolve_udp: true,
        ..RouteOptions::default()
    };
    let outbound = MockOutbound::new("direct-out");
    let router = build_router(route, dns, &[], vec![outbound.clone()]).await;

    let query = address_query("game.example", RecordType::A).unwrap();
    let mut dns_metadata = udp_metadata(Destination::fqdn("game.example", 0));
    let response = router
        .exchange_message(&mut dns_metadata, &query)
        .await
        .unwrap();
    let fake = message_addresses(&response)[0];

    let (conn, _in_tx, mut out_rx) = channel_packet_conn();
    let fake_destination = Destination::Ip(SocketAddr::new(fake, 7777));
    let metadata = udp_metadata(fake_destination.clone());
    router
        .route_packet_connection(DispatchContext::new(), conn, metadata)
        .await
        .unwrap();

    let (metadata, wrapped) = {
        let recorded = outbound.packets.lock();
        let (metadata, conn) = &recorded[0];
        (metadata.clone(), conn.clone())
    };
    assert_eq!(metadata.destination, Destination::fqdn("game.example", 7777));
    assert_eq!(metadata.dns_mode, DnsMode::FakeIp);

    // Replies written against the FQDN surface to the client as coming from
    // the synthetic address.
    wrapped
        .write_packet(b"reply", &metadata.destination)
        .await
        .unwrap();
    let (_, reply_destination) = out_rx.recv().await.unwrap();
    assert_eq!(reply_destination, fake_destination);
}
