//! Routing and DNS resolution core for a tunneling proxy.
//!
//! This library takes inbound byte-streams and packet-streams together with
//! an inbound context and produces an outbound dispatch: a chosen egress
//! transport plus a possibly rewritten destination. It provides:
//! - Rule-based routing (domain, CIDR, GeoIP/Geosite, port, process, WiFi,
//!   rule-sets, logical trees) with first-match-wins semantics
//! - A DNS client with named transports, a dependency graph over address
//!   resolvers, hosts shortcuts, caching and per-rule server selection
//! - Fake-IP allocation with reverse mapping back to the original FQDN
//! - Payload sniffing (TLS, HTTP, DNS, QUIC, STUN) with destination override
//! - A DNS pseudo-outbound relaying framed queries over stream and packet
//!   connections
//! - A framed control channel for health checks and provider listings
//!
//! Concrete proxy protocols, listeners and platform probes stay outside the
//! crate; they plug in through the capability traits in [`adapter`].
//!
//! # Example
//!
//! ```rust
//! use tunnel_router::config::{DnsOptions, RouteOptions};
//! use tunnel_router::router::{Router, RouterCollaborators};
//!
//! let router = Router::new(
//!     RouteOptions::default(),
//!     DnsOptions::default(),
//!     &[],
//!     RouterCollaborators::default(),
//! )
//! .unwrap();
//! router.initialize(vec![], vec![], vec![]).unwrap();
//! ```

pub mod adapter;
pub mod config;
pub mod constant;
pub mod control;
pub mod dns;
pub mod error;
pub mod outbound;
pub mod router;
pub mod rule;
pub mod sniff;
pub mod types;
pub mod urltest;

// Re-export commonly used items
pub use adapter::{
    CacheFile, ClashServer, ConntrackKiller, DispatchContext, DnsExchanger, GeoIpReader,
    GeositeReader, Inbound, InboundContext, InjectableInbound, Monitor, Outbound,
    OutboundProvider, PacketConn, ProcessSearcher, RuleSetLoader, StreamConn, V2RayServer,
    WifiStateProvider,
};
pub use config::{DnsOptions, InboundRouteOptions, RouteOptions};
pub use dns::{DnsClient, DnsReverseMapping, FakeIpStore, Transport};
pub use error::{Error, Result};
pub use outbound::DnsOutbound;
pub use router::{PowerEvent, Router, RouterCollaborators};
pub use types::{Destination, DialerConfig, DnsMode, Network, Strategy};
pub use urltest::{HistoryStorage, UrlTestHistory};
