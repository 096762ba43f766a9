//! Static hosts table consulted before any transport.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::types::Strategy;

/// How deep an alias chain may go before it is treated as a loop.
const MAX_ALIAS_DEPTH: usize = 8;

#[derive(Debug, Clone)]
enum HostEntry {
    Addr(IpAddr),
    Alias(String),
}

/// Hosts entries map a domain to literal addresses or to another domain
/// (a CNAME-style shortcut).
#[derive(Debug, Default)]
pub struct Hosts {
    entries: HashMap<String, Vec<HostEntry>>,
}

impl Hosts {
    pub fn new(raw: HashMap<String, Vec<String>>) -> Result<Self> {
        let mut entries = HashMap::with_capacity(raw.len());
        for (domain, values) in raw {
            if values.is_empty() {
                return Err(Error::Config(format!("empty hosts entry: {}", domain)));
            }
            let mut parsed = Vec::with_capacity(values.len());
            for value in values {
                match value.parse::<IpAddr>() {
                    Ok(addr) => parsed.push(HostEntry::Addr(addr)),
                    Err(_) => parsed.push(HostEntry::Alias(value.to_lowercase())),
                }
            }
            entries.insert(domain.to_lowercase(), parsed);
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Follow alias entries to the effective domain. Returns the input when
    /// no alias applies.
    pub fn exact_domain(&self, domain: &str) -> String {
        let mut current = domain.to_lowercase();
        for _ in 0..MAX_ALIAS_DEPTH {
            let alias = self.entries.get(&current).and_then(|values| {
                values.iter().find_map(|entry| match entry {
                    HostEntry::Alias(next) => Some(next.clone()),
                    HostEntry::Addr(_) => None,
                })
            });
            match alias {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current
    }

    /// Addresses for the domain, following aliases, ordered per strategy.
    pub fn lookup(&self, domain: &str, strategy: Strategy) -> Vec<IpAddr> {
        let mut current = domain.to_lowercase();
        for _ in 0..MAX_ALIAS_DEPTH {
            let Some(values) = self.entries.get(&current) else {
                return Vec::new();
            };
            let addresses: Vec<IpAddr> = values
                .iter()
                .filter_map(|entry| match entry {
                    HostEntry::Addr(addr) => Some(*addr),
                    HostEntry::Alias(_) => None,
                })
                .collect();
            if !addresses.is_empty() {
                return strategy.apply(addresses);
            }
            match values.iter().find_map(|entry| match entry {
                HostEntry::Alias(next) => Some(next.clone()),
                HostEntry::Addr(_) => None,
            }) {
                Some(next) if next != current => current = next,
                _ => return Vec::new(),
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(entries: &[(&str, &[&str])]) -> Hosts {
        let raw = entries
            .iter()
            .map(|(domain, values)| {
                (
                    domain.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect();
        Hosts::new(raw).unwrap()
    }

    #[test]
    fn test_lookup_addresses() {
        let hosts = hosts(&[("example.com", &["1.2.3.4", "2001:db8::1"])]);
        let all = hosts.lookup("Example.com", Strategy::AsIs);
        assert_eq!(all.len(), 2);
        let v4_only = hosts.lookup("example.com", Strategy::Ipv4Only);
        assert_eq!(v4_only, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_alias_chain() {
        let hosts = hosts(&[
            ("www.example.com", &["example.com"]),
            ("example.com", &["1.2.3.4"]),
        ]);
        assert_eq!(hosts.exact_domain("www.example.com"), "example.com");
        assert_eq!(
            hosts.lookup("www.example.com", Strategy::AsIs),
            vec!["1.2.3.4".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn test_alias_loop_bounded() {
        let hosts = hosts(&[("a.test", &["b.test"]), ("b.test", &["a.test"])]);
        // Must terminate; no addresses exist anywhere on the chain.
        assert!(hosts.lookup("a.test", Strategy::AsIs).is_empty());
    }

    #[test]
    fn test_unknown_domain() {
        let hosts = hosts(&[("example.com", &["1.2.3.4"])]);
        assert!(hosts.lookup("other.org", Strategy::AsIs).is_empty());
        assert_eq!(hosts.exact_domain("other.org"), "other.org");
    }

    #[test]
    fn test_empty_entry_rejected() {
        let mut raw = HashMap::new();
        raw.insert("example.com".to_string(), Vec::new());
        assert!(Hosts::new(raw).is_err());
    }
}
