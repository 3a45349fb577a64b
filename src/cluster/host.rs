//! Hosts and their addresses.
//!
//! `Address` is the primary key throughout the crate: pools, plans and the
//! host registry are all keyed by it. `Host` carries the atomically mutated
//! state bits (UP/DOWN and the mark-and-sweep marker); everything else about
//! a host is immutable once discovered.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;
use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::warn;

/// Address of a database node, with total ordering and a stable hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(SocketAddr);

impl Address {
    pub fn new(addr: SocketAddr) -> Self {
        Address(addr)
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub(crate) fn inner(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address(addr)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Up,
    Down,
}

/// A database node known to the session.
#[derive(Debug)]
pub struct Host {
    pub address: Address,
    /// Hostname this host was resolved from, if it came from a DNS name.
    pub hostname: Option<String>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    /// Tokens owned by this host, as reported by topology discovery.
    pub tokens: Vec<i64>,

    up: AtomicBool,
    mark: AtomicBool,
}

pub type HostMap = HashMap<Address, Arc<Host>>;

impl Host {
    pub(crate) fn new(address: Address, hostname: Option<String>, mark: bool) -> Self {
        Host {
            address,
            hostname,
            datacenter: None,
            rack: None,
            tokens: Vec::new(),
            up: AtomicBool::new(false),
            mark: AtomicBool::new(mark),
        }
    }

    pub fn state(&self) -> HostState {
        if self.is_up() {
            HostState::Up
        } else {
            HostState::Down
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub(crate) fn set_up(&self) {
        self.up.store(true, Ordering::Release);
    }

    pub(crate) fn set_down(&self) {
        self.up.store(false, Ordering::Release);
    }

    pub(crate) fn mark(&self) -> bool {
        self.mark.load(Ordering::Relaxed)
    }

    pub(crate) fn set_mark(&self, mark: bool) {
        self.mark.store(mark, Ordering::Relaxed);
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// A database server known on session startup: either a literal address or
/// a DNS name resolved at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactPoint {
    Hostname(String),
    Address(SocketAddr),
}

#[derive(Error, Debug)]
pub(crate) enum DnsLookupError {
    #[error("failed to perform DNS lookup within {0}ms")]
    Timeout(u128),
    #[error("empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

async fn lookup_host_with_timeout(
    host: impl ToSocketAddrs,
    timeout: Option<Duration>,
) -> Result<impl Iterator<Item = SocketAddr>, DnsLookupError> {
    if let Some(timeout) = timeout {
        match tokio::time::timeout(timeout, lookup_host(host)).await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(DnsLookupError::Timeout(timeout.as_millis())),
        }
    } else {
        lookup_host(host).await.map_err(Into::into)
    }
}

/// Resolves a contact-point name, preferring IPv4 addresses.
///
/// The name may or may not carry a port; if the bare form fails to parse,
/// the lookup is retried as `(name, default_port)`.
async fn resolve_hostname(
    hostname: &str,
    default_port: u16,
    timeout: Option<Duration>,
) -> Result<SocketAddr, DnsLookupError> {
    let addrs = match lookup_host_with_timeout(hostname, timeout).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        Err(DnsLookupError::Timeout(t)) => return Err(DnsLookupError::Timeout(t)),
        Err(e) => {
            let addrs = lookup_host_with_timeout((hostname, default_port), timeout)
                .await
                .or(Err(e))?;
            itertools::Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| DnsLookupError::EmptyAddressListForHost(hostname.to_owned()))
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedContactPoint {
    pub(crate) address: SocketAddr,
    pub(crate) hostname: Option<String>,
}

/// Turns the configured contact points into addresses. Names that fail to
/// resolve are logged and skipped; deciding whether the remaining set is
/// empty is the caller's business.
pub(crate) async fn resolve_contact_points(
    contact_points: &[ContactPoint],
    default_port: u16,
    timeout: Option<Duration>,
) -> Vec<ResolvedContactPoint> {
    let mut resolved: Vec<ResolvedContactPoint> = Vec::with_capacity(contact_points.len());

    let mut to_resolve: Vec<&String> = Vec::new();
    for point in contact_points {
        match point {
            ContactPoint::Hostname(hostname) => to_resolve.push(hostname),
            ContactPoint::Address(address) => resolved.push(ResolvedContactPoint {
                address: *address,
                hostname: None,
            }),
        }
    }

    let lookups = to_resolve.into_iter().map(|hostname| async move {
        match resolve_hostname(hostname, default_port, timeout).await {
            Ok(address) => Some(ResolvedContactPoint {
                address,
                hostname: Some(hostname.clone()),
            }),
            Err(e) => {
                warn!("Hostname resolution failed for {}: {}", hostname, e);
                None
            }
        }
    });
    let looked_up: Vec<_> = futures::future::join_all(lookups).await;
    resolved.extend(looked_up.into_iter().flatten());

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s.parse().unwrap())
    }

    #[test]
    fn host_identity_is_the_address() {
        let a = Host::new(addr("10.0.0.1:9042"), None, false);
        let mut b = Host::new(addr("10.0.0.1:9042"), Some("db1".into()), true);
        b.datacenter = Some("dc1".into());
        assert_eq!(a, b);

        let c = Host::new(addr("10.0.0.2:9042"), None, false);
        assert_ne!(a, c);
    }

    #[test]
    fn host_state_bits() {
        let host = Host::new(addr("10.0.0.1:9042"), None, false);
        assert_eq!(host.state(), HostState::Down);
        host.set_up();
        assert!(host.is_up());
        host.set_down();
        assert_eq!(host.state(), HostState::Down);

        assert!(!host.mark());
        host.set_mark(true);
        assert!(host.mark());
    }

    #[tokio::test]
    async fn literal_contact_points_skip_dns() {
        let points = [
            ContactPoint::Address("127.0.0.1:9042".parse().unwrap()),
            ContactPoint::Address("127.0.0.2:9999".parse().unwrap()),
        ];
        let resolved = resolve_contact_points(&points, 9042, None).await;
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|r| r.hostname.is_none()));
    }

    #[tokio::test]
    async fn unresolvable_names_are_dropped() {
        let points = [ContactPoint::Hostname("definitely.nohost.invalid".into())];
        let resolved =
            resolve_contact_points(&points, 9042, Some(Duration::from_secs(2))).await;
        assert!(resolved.is_empty());
    }
}
