//! DNS client façade: hosts shortcut, response cache, strategy enforcement
//! and the rejected-query (RDRC) store.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::reverse::DnsReverseMapping;
use super::transport::Transport;
use super::{address_query, is_rejected, message_addresses, question_domain, question_type};
use crate::adapter::CacheFile;
use crate::constant;
use crate::dns::hosts::Hosts;
use crate::error::{Error, Result};
use crate::types::Strategy;

const CACHE_CAPACITY: usize = 4096;

/// Per-query options, filled from the matched DNS rule.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub strategy: Strategy,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpNet>,
}

#[derive(Debug, Clone)]
pub struct DnsClientConfig {
    pub disable_cache: bool,
    pub disable_expire: bool,
    /// Key the cache by transport so servers never share entries.
    pub independent_cache: bool,
    /// Serve expired entries once with TTL zero instead of blocking on a
    /// refresh; the entry is dropped so the next query goes out.
    pub lazy_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    transport: Option<String>,
    domain: String,
    query_type: RecordType,
}

struct CacheEntry {
    message: Message,
    expires_at: Instant,
}

pub struct DnsClient {
    config: DnsClientConfig,
    hosts: Arc<Hosts>,
    cache: Mutex<LruCache<CacheKey, CacheEntry>>,
    cache_file: Option<Arc<dyn CacheFile>>,
    reverse_mapping: Option<Arc<DnsReverseMapping>>,
}

impl DnsClient {
    pub fn new(
        config: DnsClientConfig,
        hosts: Arc<Hosts>,
        cache_file: Option<Arc<dyn CacheFile>>,
        reverse_mapping: Option<Arc<DnsReverseMapping>>,
    ) -> Self {
        Self {
            config,
            hosts,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
            cache_file,
            reverse_mapping,
        }
    }

    pub fn start(&self) {}

    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    /// Follow hosts aliases to the effective domain.
    pub fn exact_domain_from_hosts(&self, domain: &str) -> String {
        self.hosts.exact_domain(domain)
    }

    /// Addresses from the hosts table, ordered per strategy.
    pub fn addrs_from_hosts(&self, domain: &str, strategy: Strategy) -> Vec<IpAddr> {
        self.hosts.lookup(domain, strategy)
    }

    /// Exchange one query through the transport, honoring cache and RDRC.
    pub async fn exchange(
        &self,
        transport: &Arc<dyn Transport>,
        message: &Message,
        options: &QueryOptions,
    ) -> Result<Message> {
        let Some(domain) = question_domain(message) else {
            return transport.exchange(message).await;
        };
        let query_type = question_type(message).unwrap_or(RecordType::A);

        // Hosts beat every transport, including for raw exchanges.
        let hosts_addresses = self.hosts.lookup(&domain, options.strategy);
        if !hosts_addresses.is_empty()
            && matches!(query_type, RecordType::A | RecordType::AAAA)
        {
            return Ok(super::address_response(
                message,
                &hosts_addresses,
                constant::DEFAULT_DNS_TTL,
            ));
        }

        let cache_enabled = !self.config.disable_cache && !options.disable_cache;
        let key = CacheKey {
            transport: self
                .config
                .independent_cache
                .then(|| transport.name().to_string()),
            domain: domain.clone(),
            query_type,
        };
        if cache_enabled {
            if let Some(mut cached) = self.cache_lookup(&key) {
                cached.set_id(message.id());
                return Ok(cached);
            }
        }

        if let Some(cache_file) = &self.cache_file {
            if cache_file.store_rdrc()
                && cache_file.load_rdrc(transport.name(), &domain, u16::from(query_type))
            {
                debug!("rdrc: rejected {} {:?} via {}", domain, query_type, transport.name());
                return Ok(super::rcode_response(
                    message,
                    hickory_proto::op::ResponseCode::NXDomain,
                ));
            }
        }

        let mut outgoing = message.clone();
        if let Some(subnet) = options.client_subnet {
            super::transport::apply_client_subnet(&mut outgoing, subnet);
        }
        let mut response = transport.exchange(&outgoing).await?;

        if let Some(ttl) = options.rewrite_ttl {
            let mut answers = response.take_answers();
            for record in &mut answers {
                record.set_ttl(ttl);
            }
            response.insert_answers(answers);
        }

        if is_rejected(&response) {
            if let Some(cache_file) = &self.cache_file {
                if cache_file.store_rdrc() {
                    cache_file.save_rdrc(transport.name(), &domain, u16::from(query_type));
                }
            }
            return Ok(response);
        }

        if let Some(reverse) = &self.reverse_mapping {
            for record in response.answers() {
                if let Some(address) = record_address(record) {
                    reverse.save(address, &domain, record.ttl());
                }
            }
        }

        if cache_enabled {
            let ttl = response
                .answers()
                .iter()
                .map(|record| record.ttl())
                .min()
                .unwrap_or(constant::DEFAULT_DNS_TTL);
            if ttl > 0 {
                let mut stored = response.clone();
                stored.set_id(0);
                self.cache.lock().put(
                    key,
                    CacheEntry {
                        message: stored,
                        expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
                    },
                );
            }
        }
        Ok(response)
    }

    fn cache_lookup(&self, key: &CacheKey) -> Option<Message> {
        let mut cache = self.cache.lock();
        let entry = cache.get(key)?;
        let now = Instant::now();
        if self.config.disable_expire || entry.expires_at > now {
            return Some(entry.message.clone());
        }
        if self.config.lazy_cache {
            let mut stale = entry.message.clone();
            let mut answers = stale.take_answers();
            for record in &mut answers {
                record.set_ttl(0);
            }
            stale.insert_answers(answers);
            cache.pop(key);
            return Some(stale);
        }
        cache.pop(key);
        None
    }

    /// Resolve a domain to addresses via the transport, hosts first.
    pub async fn lookup(
        &self,
        transport: &Arc<dyn Transport>,
        domain: &str,
        strategy: Strategy,
        options: &QueryOptions,
    ) -> Result<Vec<IpAddr>> {
        let domain = self.hosts.exact_domain(domain);
        let from_hosts = self.hosts.lookup(&domain, strategy);
        if !from_hosts.is_empty() {
            return Ok(from_hosts);
        }
        let mut options = options.clone();
        options.strategy = strategy;

        let mut addresses = Vec::new();
        match strategy {
            Strategy::Ipv4Only => {
                let response = self
                    .exchange(transport, &address_query(&domain, RecordType::A)?, &options)
                    .await?;
                addresses.extend(message_addresses(&response));
            }
            Strategy::Ipv6Only => {
                let response = self
                    .exchange(
                        transport,
                        &address_query(&domain, RecordType::AAAA)?,
                        &options,
                    )
                    .await?;
                addresses.extend(message_addresses(&response));
            }
            _ => {
                let v4_query = address_query(&domain, RecordType::A)?;
                let v6_query = address_query(&domain, RecordType::AAAA)?;
                let (v4, v6) = tokio::join!(
                    self.exchange(transport, &v4_query, &options),
                    self.exchange(transport, &v6_query, &options),
                );
                // One failing family is fine as long as the other answers.
                if let Ok(response) = &v4 {
                    addresses.extend(message_addresses(response));
                }
                if let Ok(response) = &v6 {
                    addresses.extend(message_addresses(response));
                }
                if addresses.is_empty() {
                    if let Err(err) = v4 {
                        return Err(err);
                    }
                    if let Err(err) = v6 {
                        return Err(err);
                    }
                }
            }
        }
        let addresses = strategy.apply(addresses);
        if addresses.is_empty() {
            return Err(Error::Resolve {
                domain,
                message: "empty result".to_string(),
            });
        }
        Ok(addresses)
    }
}

fn record_address(record: &hickory_proto::rr::Record) -> Option<IpAddr> {
    match record.data() {
        hickory_proto::rr::RData::A(a) => Some(IpAddr::V4(a.0)),
        hickory_proto::rr::RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}
