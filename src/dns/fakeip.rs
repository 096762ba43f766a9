//! Fake-IP store: synthetic addresses handed out per domain so the tunnel
//! can intercept traffic by IP and recover the original name.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use tracing::warn;

use crate::adapter::{CacheFile, FakeIpSnapshot};
use crate::error::{Error, Result};

/// Gate deciding which domains must receive real addresses.
pub trait DomainPredicate: Send + Sync {
    fn matches(&self, domain: &str) -> bool;
}

#[derive(Default)]
struct FakeIpState {
    domain4: HashMap<String, Ipv4Addr>,
    domain6: HashMap<String, Ipv6Addr>,
    address_to_domain: HashMap<IpAddr, String>,
    next4: u32,
    next6: u128,
}

pub struct FakeIpStore {
    inet4_range: Option<Ipv4Net>,
    inet6_range: Option<Ipv6Net>,
    exclude: Option<Arc<dyn DomainPredicate>>,
    cache_file: Option<Arc<dyn CacheFile>>,
    state: Mutex<FakeIpState>,
}

impl FakeIpStore {
    pub fn new(
        inet4_range: Option<Ipv4Net>,
        inet6_range: Option<Ipv6Net>,
        exclude: Option<Arc<dyn DomainPredicate>>,
        cache_file: Option<Arc<dyn CacheFile>>,
    ) -> Self {
        Self {
            inet4_range,
            inet6_range,
            exclude,
            cache_file,
            state: Mutex::new(FakeIpState::default()),
        }
    }

    /// Load persisted allocations, keeping the allocator position stable
    /// across restarts.
    pub fn start(&self) -> Result<()> {
        let Some(cache_file) = &self.cache_file else {
            return Ok(());
        };
        let Some(snapshot) = cache_file.load_fake_ip() else {
            return Ok(());
        };
        let mut state = self.state.lock();
        for (domain, address) in snapshot.entries {
            match address {
                IpAddr::V4(v4) => {
                    state.domain4.insert(domain.clone(), v4);
                }
                IpAddr::V6(v6) => {
                    state.domain6.insert(domain.clone(), v6);
                }
            }
            state.address_to_domain.insert(address, domain);
        }
        if let (Some(IpAddr::V4(current)), Some(range)) =
            (snapshot.inet4_current, self.inet4_range)
        {
            state.next4 = u32::from(current).wrapping_sub(u32::from(range.network()));
        }
        if let (Some(IpAddr::V6(current)), Some(range)) =
            (snapshot.inet6_current, self.inet6_range)
        {
            state.next6 = u128::from(current).wrapping_sub(u128::from(range.network()));
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.save()
    }

    /// Persist the current allocations through the cache file, if any.
    pub fn save(&self) -> Result<()> {
        let Some(cache_file) = &self.cache_file else {
            return Ok(());
        };
        let snapshot = {
            let state = self.state.lock();
            FakeIpSnapshot {
                inet4_current: self
                    .inet4_range
                    .map(|range| IpAddr::V4(Ipv4Addr::from(u32::from(range.network()) + state.next4))),
                inet6_current: self
                    .inet6_range
                    .map(|range| IpAddr::V6(Ipv6Addr::from(u128::from(range.network()) + state.next6))),
                entries: state
                    .address_to_domain
                    .iter()
                    .map(|(address, domain)| (domain.clone(), *address))
                    .collect(),
            }
        };
        cache_file.store_fake_ip(&snapshot)
    }

    /// Whether the address falls inside a fake range.
    pub fn contains(&self, address: IpAddr) -> bool {
        match address {
            IpAddr::V4(v4) => self
                .inet4_range
                .map(|range| range.contains(&v4))
                .unwrap_or(false),
            IpAddr::V6(v6) => self
                .inet6_range
                .map(|range| range.contains(&v6))
                .unwrap_or(false),
        }
    }

    /// Whether the domain is excluded from fake allocation.
    pub fn excluded(&self, domain: &str) -> bool {
        self.exclude
            .as_ref()
            .map(|rule| rule.matches(domain))
            .unwrap_or(false)
    }

    /// Allocate (or return the existing) fake address for the domain.
    /// Idempotent per domain and family.
    pub fn create(&self, domain: &str, ipv6: bool) -> Result<IpAddr> {
        let domain = domain.to_lowercase();
        let mut state = self.state.lock();
        if ipv6 {
            if let Some(existing) = state.domain6.get(&domain) {
                return Ok(IpAddr::V6(*existing));
            }
            let range = self
                .inet6_range
                .ok_or_else(|| Error::Config("missing fakeip inet6_range".to_string()))?;
            let capacity = 1u128
                .checked_shl(128 - u32::from(range.prefix_len()))
                .unwrap_or(u128::MAX);
            // Skip the network address.
            state.next6 += 1;
            if state.next6 >= capacity {
                return Err(Error::Config("fakeip inet6_range exhausted".to_string()));
            }
            let address = Ipv6Addr::from(u128::from(range.network()) + state.next6);
            state.domain6.insert(domain.clone(), address);
            state.address_to_domain.insert(IpAddr::V6(address), domain);
            Ok(IpAddr::V6(address))
        } else {
            if let Some(existing) = state.domain4.get(&domain) {
                return Ok(IpAddr::V4(*existing));
            }
            let range = self
                .inet4_range
                .ok_or_else(|| Error::Config("missing fakeip inet4_range".to_string()))?;
            let capacity = 1u32
                .checked_shl(32 - u32::from(range.prefix_len()))
                .unwrap_or(u32::MAX);
            state.next4 += 1;
            if state.next4 >= capacity {
                return Err(Error::Config("fakeip inet4_range exhausted".to_string()));
            }
            let address = Ipv4Addr::from(u32::from(range.network()) + state.next4);
            state.domain4.insert(domain.clone(), address);
            state.address_to_domain.insert(IpAddr::V4(address), domain);
            Ok(IpAddr::V4(address))
        }
    }

    /// The domain bound to a fake address.
    pub fn lookup(&self, address: IpAddr) -> Option<String> {
        self.state.lock().address_to_domain.get(&address).cloned()
    }

    /// Periodic persistence entry point; errors are logged, not fatal.
    pub fn save_checkpoint(&self) {
        if let Err(err) = self.save() {
            warn!("save fakeip metadata: {}", err);
        }
    }
}
