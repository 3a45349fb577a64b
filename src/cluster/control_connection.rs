//! The control connection.
//!
//! One handshaken connection to some reachable host, established during
//! bootstrap. Topology and schema gossip parsing live outside this crate;
//! what the dispatch core consumes is the connected host, the negotiated
//! protocol version, bootstrap error propagation and the schema-agreement
//! observer seam.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::{ConnectError, ConnectionError, CriticalError};
use crate::frame::PROTOCOL_VERSION;
use crate::cluster::host::Host;
use crate::network::connection::{
    open_connection, ConnectionConfig, ErrorReceiver, PooledConnection,
};

/// Consulted while a request stalls on a schema change. Implementations
/// typically compare peer schema versions through the metadata layer.
#[async_trait]
pub trait SchemaAgreementObserver: Send + Sync {
    /// Whether all live peers currently report the same schema version.
    async fn is_agreed(&self) -> bool;
}

/// Default observer: a lone view of the schema is trivially in agreement.
#[derive(Debug, Default)]
pub struct LocalSchemaAgreement;

#[async_trait]
impl SchemaAgreementObserver for LocalSchemaAgreement {
    async fn is_agreed(&self) -> bool {
        true
    }
}

pub(crate) struct ControlConnection {
    connected_host: Arc<Host>,
    // Keeps the control socket open; dropping it winds the router down.
    _connection: PooledConnection,
    _error_receiver: ErrorReceiver,
}

impl ControlConnection {
    /// Walks the candidate hosts in order and keeps the first connection
    /// that completes the handshake. If every host fails, the first
    /// critical error (if any) is the bootstrap error; otherwise no host
    /// was available.
    pub(crate) async fn connect(
        candidates: &[Arc<Host>],
        config: &ConnectionConfig,
    ) -> Result<Self, ConnectError> {
        let mut first_critical: Option<CriticalError> = None;
        let mut last_error: Option<ConnectionError> = None;

        for host in candidates {
            match open_connection(host.address, config).await {
                Ok((connection, error_receiver)) => {
                    debug!("[{}] Control connection established", host.address);
                    return Ok(Self {
                        connected_host: host.clone(),
                        _connection: connection,
                        _error_receiver: error_receiver,
                    });
                }
                Err(ConnectionError::Critical(critical)) => {
                    warn!(
                        "[{}] Control connection failed critically: {}",
                        host.address, critical
                    );
                    first_critical.get_or_insert(critical);
                }
                Err(error) => {
                    warn!("[{}] Control connection failed: {}", host.address, error);
                    last_error = Some(error);
                }
            }
        }

        Err(match first_critical {
            Some(critical) => ConnectError::Critical(critical),
            None => ConnectError::NoHostsAvailable(match last_error {
                Some(error) => format!("unable to reach any contact point: {error}"),
                None => "unable to reach any contact point".to_owned(),
            }),
        })
    }

    pub(crate) fn connected_host(&self) -> &Arc<Host> {
        &self.connected_host
    }

    pub(crate) fn protocol_version(&self) -> u8 {
        PROTOCOL_VERSION
    }

    pub(crate) async fn close(self) {
        debug!(
            "[{}] Closing control connection",
            self.connected_host.address
        );
        // Dropping the connection cancels its router task.
    }
}
