//! Host-selection policies.
//!
//! For every request the chosen policy produces a *query plan*: an ordered
//! iterator of hosts the dispatcher will try in turn. Policies also keep
//! their own view of the cluster, updated through the `on_*` hooks posted by
//! each request processor.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::cluster::host::{Host, HostMap};
use crate::cluster::token_map::TokenMap;

/// How a policy wants a host treated when building pools and plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDistance {
    Local,
    Remote,
    /// The host never appears in this policy's plans.
    Ignore,
}

/// Request properties a policy may use for routing.
#[derive(Debug, Default, Clone)]
pub struct RoutingInfo<'a> {
    pub keyspace: Option<&'a str>,
    /// Partition token, when the statement layer computed one.
    pub token: Option<i64>,
    pub is_idempotent: bool,
}

/// An ordered iterator of candidate hosts for one request.
pub type QueryPlan = Box<dyn Iterator<Item = Arc<Host>> + Send>;

pub trait LoadBalancingPolicy: Send + Sync + fmt::Debug {
    /// Called once on the session context before any plan is requested.
    fn init(&self, connected_host: Option<&Arc<Host>>, hosts: &HostMap);

    fn distance(&self, host: &Host) -> HostDistance;

    fn new_query_plan(
        &self,
        routing: &RoutingInfo<'_>,
        token_map: Option<&TokenMap>,
    ) -> QueryPlan;

    fn on_add(&self, host: &Arc<Host>);
    fn on_remove(&self, host: &Host);
    fn on_up(&self, _host: &Arc<Host>) {}
    fn on_down(&self, _host: &Host) {}

    fn name(&self) -> String;
}

/// Plain round-robin over every known, non-ignored host. The reference
/// policy for this core; datacenter- and token-aware policies plug in
/// through the same trait.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    hosts: RwLock<Vec<Arc<Host>>>,
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn init(&self, _connected_host: Option<&Arc<Host>>, hosts: &HostMap) {
        let mut view: Vec<Arc<Host>> = hosts.values().cloned().collect();
        view.sort_by_key(|h| h.address);
        *self.hosts.write().unwrap() = view;
    }

    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn new_query_plan(
        &self,
        _routing: &RoutingInfo<'_>,
        _token_map: Option<&TokenMap>,
    ) -> QueryPlan {
        let candidates: Vec<Arc<Host>> = self
            .hosts
            .read()
            .unwrap()
            .iter()
            .filter(|h| h.is_up())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Box::new(std::iter::empty());
        }
        let start = self.index.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let rotated: Vec<Arc<Host>> = candidates[start..]
            .iter()
            .chain(candidates[..start].iter())
            .cloned()
            .collect();
        Box::new(rotated.into_iter())
    }

    fn on_add(&self, host: &Arc<Host>) {
        let mut hosts = self.hosts.write().unwrap();
        if !hosts.iter().any(|h| h.address == host.address) {
            hosts.push(host.clone());
            hosts.sort_by_key(|h| h.address);
        }
    }

    fn on_remove(&self, host: &Host) {
        self.hosts
            .write()
            .unwrap()
            .retain(|h| h.address != host.address);
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_owned()
    }
}
