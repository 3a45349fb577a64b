//! Pool-level connect: N pooled connectors for one host, fanned out in
//! parallel.
//!
//! The first critical error wins and cancels the remaining connectors;
//! otherwise the outcome is "connected with k live connections" where k may
//! be less than N (failed slots keep reconnecting in the background). The
//! outcome is produced exactly once, when the last connector resolves.

use std::sync::{Arc, Weak};

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use crate::cluster::host::Address;
use crate::errors::{ConnectionError, CriticalError};
use crate::network::connection_pool::{ConnectionPool, PoolSettings};
use crate::network::connector::{ConnectOutcome, PooledConnector};
use crate::network::pool_manager::ConnectionPoolManager;
use crate::observability::metrics::Metrics;

pub(crate) struct PoolConnectOutcome {
    pub(crate) address: Address,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) connected: usize,
    pub(crate) critical: Option<CriticalError>,
    pub(crate) keyspace_error: Option<String>,
}

impl PoolConnectOutcome {
    pub(crate) fn is_ok(&self) -> bool {
        self.critical.is_none() && self.keyspace_error.is_none()
    }
}

pub(crate) async fn connect_pool(
    address: Address,
    settings: PoolSettings,
    keyspace: Option<String>,
    manager: Weak<ConnectionPoolManager>,
    metrics: Arc<Metrics>,
) -> PoolConnectOutcome {
    let pool = ConnectionPool::new(address, settings.clone(), manager, metrics.clone());

    let mut attempts: FuturesUnordered<_> = (0..settings.connections_per_host.get())
        .map(|_| {
            PooledConnector {
                address,
                config: settings.connection_config.clone(),
                keyspace: keyspace.clone(),
                timeout: settings.connector_timeout,
            }
            .connect()
        })
        .collect();

    let mut critical: Option<CriticalError> = None;
    let mut keyspace_error: Option<String> = None;

    while let Some(outcome) = attempts.next().await {
        match outcome {
            ConnectOutcome::Connected {
                connection,
                error_receiver,
            } => {
                pool.add_connection(connection, error_receiver);
            }
            ConnectOutcome::Critical(error) => {
                warn!("[{}] Unable to connect: {}", address, error);
                critical = Some(error);
                // Cancel the remaining connectors and tear the pool down.
                drop(attempts);
                pool.close();
                break;
            }
            ConnectOutcome::Keyspace { keyspace, message } => {
                warn!(
                    "[{}] Keyspace '{}' rejected while connecting: {}",
                    address, keyspace, message
                );
                keyspace_error = Some(message);
                drop(attempts);
                pool.close();
                break;
            }
            ConnectOutcome::NonCritical(error) => {
                if matches!(error, ConnectionError::ConnectTimeout) {
                    metrics.inc_connection_timeouts();
                }
                debug!("[{}] Connector failed: {}", address, error);
                pool.schedule_reconnect();
            }
        }
    }

    let connected = pool.connection_count();
    pool.notify_up_or_down();

    PoolConnectOutcome {
        address,
        pool,
        connected,
        critical,
        keyspace_error,
    }
}
