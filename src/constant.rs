//! Timeouts shared across the router.

use std::time::Duration;

pub const TCP_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(75);
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(300);
pub const DNS_TIMEOUT: Duration = Duration::from_secs(30);
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const UDP_TIMEOUT: Duration = Duration::from_secs(300);
pub const START_TIMEOUT: Duration = Duration::from_secs(10);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const FAKE_IP_SAVE_INTERVAL: Duration = Duration::from_secs(10);

/// MTU assumed for DNS responses relayed over packet connections.
pub const DNS_PACKET_MTU: usize = 1024;

/// Concurrency bound for the rule-set bootstrap group.
pub const RULE_SET_START_CONCURRENCY: usize = 5;

/// Default TTL for synthesized DNS answers (hosts, fake-ip, local).
pub const DEFAULT_DNS_TTL: u32 = 60;

/// Outbound type names the router special-cases.
pub const TYPE_BLOCK: &str = "block";
pub const TYPE_DNS: &str = "dns";
