//! Token-ring snapshot.
//!
//! Replica computation lives outside this crate; the dispatch core only
//! carries an immutable ring snapshot from the session to the request
//! processors so that token-aware policies have something to consult.
//!
//! Handoff contract: a `TokenMap` is transferred by `Arc` and has no
//! interior mutability, so the sender cannot mutate it after publishing.

use std::collections::BTreeMap;

use crate::cluster::host::{Address, HostMap};

#[derive(Debug, Default)]
pub struct TokenMap {
    version: u64,
    ring: BTreeMap<i64, Address>,
}

impl TokenMap {
    /// Builds a snapshot from the current host registry.
    pub(crate) fn build(hosts: &HostMap, version: u64) -> Self {
        let mut ring = BTreeMap::new();
        for host in hosts.values() {
            for token in &host.tokens {
                ring.insert(*token, host.address);
            }
        }
        TokenMap { version, ring }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// The host owning the token range this token falls into: the first ring
    /// entry at or after the token, wrapping around at the end of the ring.
    pub fn owner_of(&self, token: i64) -> Option<Address> {
        self.ring
            .range(token..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, address)| *address)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::host::Host;

    fn host_with_tokens(addr: &str, tokens: &[i64]) -> Arc<Host> {
        let mut host = Host::new(Address::new(addr.parse().unwrap()), None, false);
        host.tokens = tokens.to_vec();
        Arc::new(host)
    }

    #[test]
    fn owner_lookup_wraps_around() {
        let a = host_with_tokens("10.0.0.1:9042", &[-100, 500]);
        let b = host_with_tokens("10.0.0.2:9042", &[200]);
        let mut hosts = HostMap::new();
        hosts.insert(a.address, a.clone());
        hosts.insert(b.address, b.clone());

        let map = TokenMap::build(&hosts, 3);
        assert_eq!(map.version(), 3);
        assert_eq!(map.owner_of(-500), Some(a.address));
        assert_eq!(map.owner_of(0), Some(b.address));
        assert_eq!(map.owner_of(300), Some(a.address));
        // Past the last token the ring wraps to its first entry.
        assert_eq!(map.owner_of(501), Some(a.address));
    }

    #[test]
    fn empty_ring_owns_nothing() {
        let map = TokenMap::default();
        assert!(map.is_empty());
        assert_eq!(map.owner_of(0), None);
    }
}
