//! Map of host address → connection pool, owned by one request processor.
//!
//! Keyspace propagation is eventually consistent: `set_keyspace` only
//! affects connections opened afterwards; existing connections are not
//! re-keyed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::cluster::host::Address;
use crate::errors::CriticalError;
use crate::network::connection::PooledConnection;
use crate::network::connection_pool::{ConnectionPool, PoolSettings};
use crate::network::pool_connector::{connect_pool, PoolConnectOutcome};
use crate::observability::metrics::Metrics;

/// Surface through which pools and the dispatch path inform the owning
/// request processor.
pub(crate) trait PoolListener: Send + Sync {
    fn on_up(&self, address: Address);
    fn on_down(&self, address: Address);
    fn on_critical_error(&self, address: Address, error: CriticalError);
    /// A response carried `SET_KEYSPACE`.
    fn on_keyspace_changed(&self, keyspace: &str);
    /// A response carried a prepared id whose result metadata changed.
    fn on_result_metadata_changed(&self, id: &Bytes);
}

pub(crate) struct ConnectionPoolManager {
    settings: PoolSettings,
    pools: RwLock<HashMap<Address, Arc<ConnectionPool>>>,
    keyspace: ArcSwapOption<String>,
    listener: RwLock<Option<Weak<dyn PoolListener>>>,
    closing: AtomicBool,
    // Back-reference handed to every pool.
    weak_self: Weak<ConnectionPoolManager>,
    metrics: Arc<Metrics>,
}

impl ConnectionPoolManager {
    pub(crate) fn new(settings: PoolSettings, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            settings,
            pools: RwLock::new(HashMap::new()),
            keyspace: ArcSwapOption::empty(),
            listener: RwLock::new(None),
            closing: AtomicBool::new(false),
            weak_self: weak_self.clone(),
            metrics,
        })
    }

    pub(crate) fn set_listener(&self, listener: Weak<dyn PoolListener>) {
        *self.listener.write().unwrap() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn PoolListener>> {
        self.listener.read().unwrap().as_ref()?.upgrade()
    }

    pub(crate) fn current_keyspace(&self) -> Option<String> {
        self.keyspace.load_full().map(|ks| (*ks).clone())
    }

    /// Future connections will open with this keyspace.
    pub(crate) fn set_keyspace(&self, keyspace: &str) {
        self.keyspace.store(Some(Arc::new(keyspace.to_owned())));
    }

    /// Bootstrap fan-out: connects a pool for every address in parallel and
    /// returns the outcomes that failed critically or on the keyspace.
    /// Successful pools (even ones still reconnecting towards full size)
    /// are retained.
    pub(crate) async fn init(&self, addresses: Vec<Address>) -> Vec<PoolConnectOutcome> {
        let connects = addresses.into_iter().map(|address| {
            connect_pool(
                address,
                self.settings.clone(),
                self.current_keyspace(),
                self.weak_self.clone(),
                self.metrics.clone(),
            )
        });
        let outcomes = join_all(connects).await;

        let mut failures = Vec::new();
        for outcome in outcomes {
            if outcome.is_ok() {
                debug!(
                    "[{}] Pool initialized with {} connections",
                    outcome.address, outcome.connected
                );
                self.pools.write().unwrap().insert(outcome.address, outcome.pool.clone());
            } else {
                failures.push(outcome);
            }
        }
        failures
    }

    /// Launches a pool for a newly discovered host. The pool becomes
    /// visible to `find_least_busy` once its initial fan-out resolves.
    pub(crate) fn add(&self, address: Address) {
        if self.closing.load(Ordering::Acquire)
            || self.pools.read().unwrap().contains_key(&address)
        {
            return;
        }

        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let outcome = connect_pool(
                address,
                manager.settings.clone(),
                manager.current_keyspace(),
                manager.weak_self.clone(),
                manager.metrics.clone(),
            )
            .await;

            if let Some(critical) = outcome.critical {
                manager.notify_critical_error(address, critical);
                return;
            }
            if let Some(message) = outcome.keyspace_error {
                warn!("[{}] Dropping pool, keyspace rejected: {}", address, message);
                return;
            }

            let mut pools = manager.pools.write().unwrap();
            if manager.closing.load(Ordering::Acquire) || pools.contains_key(&address) {
                drop(pools);
                outcome.pool.close();
                return;
            }
            pools.insert(address, outcome.pool);
        });
    }

    /// Closes and drops the pool for a removed host.
    pub(crate) fn remove(&self, address: Address) {
        let pool = self.pools.write().unwrap().remove(&address);
        if let Some(pool) = pool {
            pool.close();
        }
    }

    /// Thread-safe least-busy lookup for the dispatch path.
    pub(crate) fn find_least_busy(&self, address: Address) -> Option<Arc<PooledConnection>> {
        self.pools.read().unwrap().get(&address)?.find_least_busy()
    }

    /// Snapshot of addresses with at least one open connection.
    pub(crate) fn available(&self) -> Vec<Address> {
        self.pools
            .read()
            .unwrap()
            .iter()
            .filter(|(_, pool)| pool.connection_count() > 0)
            .map(|(address, _)| *address)
            .collect()
    }

    /// Closes every pool. After this no pool is OPEN and no reconnect is
    /// armed.
    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::Release);
        let pools: Vec<_> = self.pools.write().unwrap().drain().collect();
        for (_, pool) in pools {
            pool.close();
        }
    }

    pub(crate) fn notify_up(&self, address: Address) {
        if let Some(listener) = self.listener() {
            listener.on_up(address);
        }
    }

    pub(crate) fn notify_down(&self, address: Address) {
        if let Some(listener) = self.listener() {
            listener.on_down(address);
        }
    }

    pub(crate) fn notify_critical_error(&self, address: Address, error: CriticalError) {
        if let Some(listener) = self.listener() {
            listener.on_critical_error(address, error);
        }
    }
}
