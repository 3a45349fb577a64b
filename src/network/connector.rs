//! One connection attempt: socket, handshake and the optional keyspace set,
//! classified into the outcome the pool machinery acts on.
//!
//! Cancellation is by dropping the future (callers hold it behind a
//! `RemoteHandle`); cancelling after completion is a no-op.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cluster::host::Address;
use crate::errors::{ConnectionError, CriticalError};
use crate::network::connection::{open_connection, ConnectionConfig, ErrorReceiver, PooledConnection};

/// Outcome of a single pooled-connection attempt.
pub(crate) enum ConnectOutcome {
    Connected {
        connection: Arc<PooledConnection>,
        error_receiver: ErrorReceiver,
    },
    /// Timeouts and transient transport errors; the pool schedules a
    /// backoff reconnect.
    NonCritical(ConnectionError),
    /// Authentication, protocol or TLS failure; reconnecting cannot help.
    Critical(CriticalError),
    /// The initial `USE` failed: the keyspace does not exist.
    Keyspace { keyspace: String, message: String },
}

pub(crate) struct PooledConnector {
    pub(crate) address: Address,
    pub(crate) config: ConnectionConfig,
    pub(crate) keyspace: Option<String>,
    /// Covers the whole attempt, handshake and keyspace set included.
    pub(crate) timeout: Duration,
}

impl PooledConnector {
    pub(crate) async fn connect(self) -> ConnectOutcome {
        match tokio::time::timeout(self.timeout, self.connect_inner()).await {
            Ok(outcome) => outcome,
            Err(_) => ConnectOutcome::NonCritical(ConnectionError::ConnectTimeout),
        }
    }

    async fn connect_inner(&self) -> ConnectOutcome {
        let (connection, error_receiver) = match open_connection(self.address, &self.config).await
        {
            Ok(pair) => pair,
            Err(ConnectionError::Critical(critical)) => {
                return ConnectOutcome::Critical(critical)
            }
            Err(error) => {
                debug!("[{}] Connection attempt failed: {}", self.address, error);
                return ConnectOutcome::NonCritical(error);
            }
        };

        if let Some(keyspace) = &self.keyspace {
            if let Err(error) = connection.use_keyspace(keyspace).await {
                return match error {
                    ConnectionError::Db { message, .. } => ConnectOutcome::Keyspace {
                        keyspace: keyspace.clone(),
                        message,
                    },
                    ConnectionError::Critical(critical) => ConnectOutcome::Critical(critical),
                    other => ConnectOutcome::NonCritical(other),
                };
            }
        }

        ConnectOutcome::Connected {
            connection: Arc::new(connection),
            error_receiver,
        }
    }
}
