//! A pool of connections to one host.
//!
//! Readers (`find_least_busy`, the write path) may run on any thread;
//! structural changes serialize on the pool's rwlock. Once `close()` has
//! run, no new connection enters the pool and no connector may be
//! scheduled.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::cluster::host::Address;
use crate::errors::{BrokenConnectionError, ConnectionError};
use crate::network::connection::{ConnectionConfig, ErrorReceiver, PooledConnection};
use crate::network::connector::{ConnectOutcome, PooledConnector};
use crate::network::pool_manager::ConnectionPoolManager;
use crate::observability::metrics::Metrics;
use crate::policies::reconnect::ReconnectionPolicy;

/// Settings shared by every pool of one pool manager.
#[derive(Clone)]
pub(crate) struct PoolSettings {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) connections_per_host: NonZeroUsize,
    pub(crate) connector_timeout: Duration,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
}

#[cfg(test)]
impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connection_config: ConnectionConfig::default(),
            connections_per_host: NonZeroUsize::new(1).unwrap(),
            connector_timeout: Duration::from_secs(5),
            reconnection_policy: Arc::new(
                crate::policies::reconnect::ExponentialReconnectionPolicy::default(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Open,
    Closing,
    Closed,
}

struct PendingConnector {
    id: u64,
    // Dropping the handle cancels the connector.
    _handle: RemoteHandle<()>,
}

struct PoolInner {
    close_state: CloseState,
    connections: Vec<Arc<PooledConnection>>,
    pending: Vec<PendingConnector>,
}

pub(crate) struct ConnectionPool {
    address: Address,
    settings: PoolSettings,
    inner: RwLock<PoolInner>,
    reconnect_schedule: StdMutex<Box<dyn Iterator<Item = Duration> + Send>>,
    next_connector_id: AtomicU64,
    // Back-reference; validity is guarded by the close-state machine.
    manager: Weak<ConnectionPoolManager>,
    // Handed to spawned watchers and connectors.
    weak_self: Weak<ConnectionPool>,
    metrics: Arc<Metrics>,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: Address,
        settings: PoolSettings,
        manager: Weak<ConnectionPoolManager>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let reconnect_schedule = StdMutex::new(settings.reconnection_policy.new_schedule());
        Arc::new_cyclic(|weak_self| Self {
            address,
            settings,
            inner: RwLock::new(PoolInner {
                close_state: CloseState::Open,
                connections: Vec::new(),
                pending: Vec::new(),
            }),
            reconnect_schedule,
            next_connector_id: AtomicU64::new(0),
            manager,
            weak_self: weak_self.clone(),
            metrics,
        })
    }

    /// The connection with the fewest outstanding requests, if any.
    pub(crate) fn find_least_busy(&self) -> Option<Arc<PooledConnection>> {
        let inner = self.inner.read().unwrap();
        inner
            .connections
            .iter()
            .min_by_key(|c| c.inflight())
            .cloned()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.inner.read().unwrap().connections.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.read().unwrap().close_state == CloseState::Closed
    }

    /// Adds a freshly connected socket to the pool and starts watching it
    /// for transport errors. A connection arriving after `close()` is
    /// dropped on the spot, which closes it.
    pub(crate) fn add_connection(
        &self,
        connection: Arc<PooledConnection>,
        error_receiver: ErrorReceiver,
    ) {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.close_state != CloseState::Open {
                return;
            }
            inner.connections.push(connection.clone());
        }
        self.metrics.inc_total_connections();

        let Some(pool) = self.weak_self.upgrade() else {
            return;
        };
        let watched = Arc::downgrade(&connection);
        drop(connection);
        tokio::spawn(async move {
            let error = error_receiver
                .await
                .unwrap_or(BrokenConnectionError::ChannelClosed);
            if let Some(connection) = watched.upgrade() {
                debug!("[{}] Connection broken: {}", pool.address, error);
                pool.close_connection(&connection);
            }
        });
    }

    /// Removes a closed connection; while the pool is still open, a
    /// replacement connector is scheduled.
    pub(crate) fn close_connection(&self, connection: &Arc<PooledConnection>) {
        let mut inner = self.inner.write().unwrap();
        let before = inner.connections.len();
        inner.connections.retain(|c| !Arc::ptr_eq(c, connection));
        if inner.connections.len() == before {
            return;
        }
        debug!("[{}] Removed connection", connection.address());
        self.metrics.dec_total_connections();
        if inner.close_state == CloseState::Open {
            self.internal_schedule_reconnect(&mut inner);
        }
    }

    pub(crate) fn schedule_reconnect(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.close_state == CloseState::Open {
            self.internal_schedule_reconnect(&mut inner);
        }
    }

    fn internal_schedule_reconnect(&self, inner: &mut PoolInner) {
        let Some(pool) = self.weak_self.upgrade() else {
            return;
        };
        let delay = self
            .reconnect_schedule
            .lock()
            .unwrap()
            .next()
            .expect("reconnection schedules are infinite");
        let id = self.next_connector_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[{}] Scheduling reconnect in {} ms",
            self.address,
            delay.as_millis()
        );

        let (fut, handle) = async move {
            tokio::time::sleep(delay).await;
            let keyspace = pool
                .manager
                .upgrade()
                .and_then(|manager| manager.current_keyspace());
            let connector = PooledConnector {
                address: pool.address,
                config: pool.settings.connection_config.clone(),
                keyspace,
                timeout: pool.settings.connector_timeout,
            };
            let outcome = connector.connect().await;
            pool.handle_reconnect(id, outcome);
        }
        .remote_handle();
        tokio::spawn(fut);
        inner.pending.push(PendingConnector { id, _handle: handle });
    }

    fn handle_reconnect(&self, id: u64, outcome: ConnectOutcome) {
        let still_open = {
            let mut inner = self.inner.write().unwrap();
            inner.pending.retain(|p| p.id != id);
            inner.close_state == CloseState::Open
        };
        if !still_open {
            // A Connected outcome's socket is dropped here, closing it.
            return;
        }

        match outcome {
            ConnectOutcome::Connected {
                connection,
                error_receiver,
            } => {
                debug!("[{}] Reconnected", self.address);
                *self.reconnect_schedule.lock().unwrap() =
                    self.settings.reconnection_policy.new_schedule();
                self.add_connection(connection, error_receiver);
                if let Some(manager) = self.manager.upgrade() {
                    manager.notify_up(self.address);
                }
            }
            ConnectOutcome::Critical(critical) => {
                warn!(
                    "[{}] Reconnect hit a critical error: {}",
                    self.address, critical
                );
                if let Some(manager) = self.manager.upgrade() {
                    manager.notify_critical_error(self.address, critical);
                }
            }
            ConnectOutcome::Keyspace { keyspace, message } => {
                warn!(
                    "[{}] Could not set keyspace '{}' on reconnect: {}",
                    self.address, keyspace, message
                );
                self.schedule_reconnect();
            }
            ConnectOutcome::NonCritical(error) => {
                if matches!(error, ConnectionError::ConnectTimeout) {
                    self.metrics.inc_connection_timeouts();
                }
                debug!("[{}] Reconnect failed: {}", self.address, error);
                self.schedule_reconnect();
            }
        }
    }

    /// Reports the host up or down to the manager after a pool-level
    /// connect attempt.
    pub(crate) fn notify_up_or_down(&self) {
        let connected = self.connection_count() > 0;
        if let Some(manager) = self.manager.upgrade() {
            if connected {
                manager.notify_up(self.address);
            } else {
                manager.notify_down(self.address);
            }
        }
    }

    /// Cancels pending connectors, drops live connections and transitions
    /// OPEN → CLOSING → CLOSED. Idempotent.
    pub(crate) fn close(&self) {
        let (connections, pending) = {
            let mut inner = self.inner.write().unwrap();
            if inner.close_state != CloseState::Open {
                return;
            }
            inner.close_state = CloseState::Closing;
            (
                std::mem::take(&mut inner.connections),
                std::mem::take(&mut inner.pending),
            )
        };

        for _ in &connections {
            self.metrics.dec_total_connections();
        }
        drop(pending);
        drop(connections);

        self.inner.write().unwrap().close_state = CloseState::Closed;
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.inner.read().unwrap().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::wire_connection;
    use crate::policies::reconnect::ConstantReconnectionPolicy;
    use bytes::Bytes;
    use tokio::io::DuplexStream;

    fn test_address() -> Address {
        Address::new("127.0.0.1:9042".parse().unwrap())
    }

    fn test_pool(settings: PoolSettings) -> Arc<ConnectionPool> {
        ConnectionPool::new(
            test_address(),
            settings,
            Weak::new(),
            Arc::new(Metrics::new()),
        )
    }

    fn connection_pair() -> (Arc<PooledConnection>, ErrorReceiver, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let (connection, error_receiver) = wire_connection(test_address(), client);
        (Arc::new(connection), error_receiver, server)
    }

    fn slow_reconnects() -> PoolSettings {
        PoolSettings {
            reconnection_policy: Arc::new(ConstantReconnectionPolicy::new(Duration::from_secs(
                3600,
            ))),
            ..PoolSettings::default()
        }
    }

    #[tokio::test]
    async fn least_busy_has_minimal_inflight() {
        let pool = test_pool(PoolSettings::default());

        let (idle, idle_errors, _idle_server) = connection_pair();
        let (busy, busy_errors, _busy_server) = connection_pair();
        // Two writes the server never answers keep `busy` loaded.
        let _rx1 = busy
            .try_write(crate::frame::RequestOpcode::Query, Bytes::from_static(b"x"))
            .unwrap();
        let _rx2 = busy
            .try_write(crate::frame::RequestOpcode::Query, Bytes::from_static(b"y"))
            .unwrap();

        pool.add_connection(busy.clone(), busy_errors);
        pool.add_connection(idle.clone(), idle_errors);

        let least = pool.find_least_busy().unwrap();
        assert!(Arc::ptr_eq(&least, &idle));
    }

    #[tokio::test]
    async fn closed_pool_rejects_new_connections() {
        let pool = test_pool(PoolSettings::default());
        pool.close();
        assert!(pool.is_closed());

        let (connection, error_receiver, _server) = connection_pair();
        pool.add_connection(connection, error_receiver);
        assert_eq!(pool.connection_count(), 0);
        assert!(pool.find_least_busy().is_none());
    }

    #[tokio::test]
    async fn losing_a_connection_schedules_a_reconnect() {
        let pool = test_pool(slow_reconnects());
        let (connection, error_receiver, _server) = connection_pair();
        pool.add_connection(connection.clone(), error_receiver);

        pool.close_connection(&connection);
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.pending_count(), 1);
    }

    #[tokio::test]
    async fn close_cancels_pending_connectors() {
        let pool = test_pool(slow_reconnects());
        pool.schedule_reconnect();
        assert_eq!(pool.pending_count(), 1);

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pool = test_pool(PoolSettings::default());
        let (connection, error_receiver, _server) = connection_pair();
        pool.add_connection(connection, error_receiver);

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.metrics.get_total_connections(), 0);
    }
}
