//! Outbound implementations owned by this crate.
//!
//! Concrete proxy protocols live outside; the router only ships the DNS
//! pseudo-outbound that answers relayed queries through its own exchange.

mod dns;

pub use dns::DnsOutbound;
