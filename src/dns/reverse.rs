//! Reverse mapping of resolved addresses back to the domain that produced
//! them, used to annotate literal-IP destinations.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

const DEFAULT_CAPACITY: usize = 1024;

struct ReverseEntry {
    domain: String,
    expires_at: Instant,
}

pub struct DnsReverseMapping {
    cache: Mutex<LruCache<IpAddr, ReverseEntry>>,
}

impl DnsReverseMapping {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_CAPACITY).unwrap(),
            )),
        }
    }

    /// Remember that `address` was just resolved from `domain`, valid for
    /// the record TTL.
    pub fn save(&self, address: IpAddr, domain: &str, ttl: u32) {
        let mut cache = self.cache.lock();
        cache.put(
            address,
            ReverseEntry {
                domain: domain.to_string(),
                expires_at: Instant::now() + Duration::from_secs(u64::from(ttl.max(1))),
            },
        );
    }

    pub fn query(&self, address: IpAddr) -> Option<String> {
        let mut cache = self.cache.lock();
        match cache.get(&address) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.domain.clone()),
            Some(_) => {
                cache.pop(&address);
                None
            }
            None => None,
        }
    }
}

impl Default for DnsReverseMapping {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_query() {
        let mapping = DnsReverseMapping::new();
        let addr: IpAddr = "93.184.216.34".parse().unwrap();
        mapping.save(addr, "example.com", 60);
        assert_eq!(mapping.query(addr).as_deref(), Some("example.com"));
        assert!(mapping.query("1.1.1.1".parse().unwrap()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let mapping = DnsReverseMapping::new();
        let addr: IpAddr = "93.184.216.34".parse().unwrap();
        mapping.save(addr, "example.com", 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(mapping.query(addr).is_none());
    }
}
