//! The session: top-level lifecycle, host registry and the dispatch plane.
//!
//! State machine: `Closed → Connecting → Connected → Closing → Closed`,
//! never skipping a state. Bootstrap resolves the contact points, walks
//! them with the control connection, then builds the request queue and the
//! request-processor manager; any failure rolls the session back to
//! `Closed` with the first error as the connect error.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::client::config::SessionConfig;
use crate::client::execution_profile::ExecutionProfile;
use crate::cluster::control_connection::ControlConnection;
use crate::cluster::host::{resolve_contact_points, Address, Host, HostMap};
use crate::cluster::token_map::TokenMap;
use crate::errors::{CloseError, ConnectError, ExecutionError};
use crate::execution::processor_manager::{ProcessorManagerConfig, RequestProcessorManager};
use crate::execution::request_handler::{RequestHandler, ResponseFuture};
use crate::execution::request_processor::{ProcessorListener, ProcessorSettings};
use crate::execution::request_queue::RequestQueue;
use crate::frame::Request;
use crate::network::connection::ConnectionConfig;
use crate::network::connection_pool::PoolSettings;
use crate::observability::metrics::Metrics;
use crate::policies::load_balancing::RoundRobinPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Closed,
    Connecting,
    Connected,
    Closing,
}

/// The dispatch plane, present while the session is connected.
struct ExecState {
    request_queue: Arc<RequestQueue>,
    processor_manager: Arc<RequestProcessorManager>,
}

struct SessionInner {
    state: StdMutex<SessionState>,
    connected: AtomicBool,
    hosts: RwLock<HostMap>,
    current_host_mark: AtomicBool,
    token_map_version: AtomicU64,
    exec: ArcSwapOption<ExecState>,
    control: StdMutex<Option<ControlConnection>>,
    metrics: Arc<Metrics>,
    prepared_ids: StdMutex<HashSet<Bytes>>,
}

/// A session owns a fleet of connections to every reachable node and
/// dispatches requests through them.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: StdMutex::new(SessionState::Closed),
                connected: AtomicBool::new(false),
                hosts: RwLock::new(HostMap::new()),
                current_host_mark: AtomicBool::new(true),
                token_map_version: AtomicU64::new(0),
                exec: ArcSwapOption::empty(),
                control: StdMutex::new(None),
                metrics: Arc::new(Metrics::new()),
                prepared_ids: StdMutex::new(HashSet::new()),
            }),
        }
    }

    /// Connects to the cluster described by `config`, optionally opening
    /// every connection with `USE <keyspace>`.
    pub async fn connect(
        &self,
        config: SessionConfig,
        keyspace: Option<&str>,
    ) -> Result<(), ConnectError> {
        config.validate()?;
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != SessionState::Closed {
                return Err(ConnectError::UnableToConnect(
                    "already connecting, connected or closing".to_owned(),
                ));
            }
            *state = SessionState::Connecting;
        }
        debug!("Issued connect");

        // Each connect is a fresh universe.
        self.inner.hosts.write().unwrap().clear();
        self.inner.current_host_mark.store(true, Ordering::Relaxed);
        self.inner.prepared_ids.lock().unwrap().clear();

        match self.inner.clone().do_connect(config, keyspace).await {
            Ok(()) => {
                let raced_close = {
                    let mut state = self.inner.state.lock().unwrap();
                    if *state == SessionState::Connecting {
                        *state = SessionState::Connected;
                        false
                    } else {
                        true
                    }
                };
                if raced_close {
                    self.inner.teardown().await;
                    return Err(ConnectError::UnableToConnect(
                        "session was closed while connecting".to_owned(),
                    ));
                }
                self.inner.connected.store(true, Ordering::Release);
                debug!("Session is connected");
                Ok(())
            }
            Err(error) => {
                *self.inner.state.lock().unwrap() = SessionState::Closing;
                self.inner.teardown().await;
                *self.inner.state.lock().unwrap() = SessionState::Closed;
                Err(error)
            }
        }
    }

    /// Enqueues a request onto the shared queue and wakes a processor.
    /// The returned future fails immediately if the session is not
    /// connected or the queue is at capacity.
    pub fn execute(&self, request: Request) -> ResponseFuture {
        let (handler, future) = RequestHandler::new(request);

        if !self.inner.connected.load(Ordering::Acquire) {
            handler.set_error(ExecutionError::NoHostsAvailable(
                "session is not connected".to_owned(),
            ));
            return future;
        }
        let Some(exec) = self.inner.exec.load_full() else {
            handler.set_error(ExecutionError::NoHostsAvailable(
                "session is not connected".to_owned(),
            ));
            return future;
        };

        match exec.request_queue.enqueue(handler) {
            Ok(()) => exec.processor_manager.notify_request(),
            Err(handler) => handler.set_error(ExecutionError::RequestQueueFull),
        }
        future
    }

    /// Prepares a statement; on success the prepared id is recorded and,
    /// when configured, the PREPARE is replicated to all available hosts in
    /// the background.
    pub fn prepare(&self, statement: &str) -> ResponseFuture {
        self.execute(Request::prepare(statement))
    }

    /// Closes the session: stops the processors, closes every pool and the
    /// control connection, and fails whatever was still queued.
    pub async fn close(&self) -> Result<(), CloseError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                SessionState::Closing | SessionState::Closed => {
                    return Err(CloseError::UnableToClose)
                }
                _ => *state = SessionState::Closing,
            }
        }
        debug!("Issued close");
        self.inner.connected.store(false, Ordering::Release);
        self.inner.teardown().await;
        *self.inner.state.lock().unwrap() = SessionState::Closed;
        debug!("Session is disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn get_metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Prepared-statement ids observed on PREPARED responses.
    pub fn prepared_ids(&self) -> Vec<Bytes> {
        self.inner.prepared_ids.lock().unwrap().iter().cloned().collect()
    }

    /// Reconciles the host registry with a topology snapshot from the
    /// metadata layer, using mark-and-sweep: discovered hosts inherit the
    /// refresh's mark, hosts still bearing the previous mark are purged.
    /// During the initial connect unreachable contact points are silently
    /// dropped with a warning instead of firing removal events.
    pub fn refresh_hosts(
        &self,
        discovered: impl IntoIterator<Item = SocketAddr>,
        is_initial_connection: bool,
    ) {
        let inner = &self.inner;
        let current_mark = inner.current_host_mark.load(Ordering::Relaxed);
        for address in discovered {
            let address = Address::new(address);
            let existing = inner.hosts.read().unwrap().get(&address).cloned();
            let host = match existing {
                Some(host) => host,
                None => inner.add_host(address, None),
            };
            host.set_mark(current_mark);
        }
        inner.purge_hosts(is_initial_connection);
        inner.publish_token_map();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionInner {
    async fn do_connect(
        self: Arc<Self>,
        config: SessionConfig,
        keyspace: Option<&str>,
    ) -> Result<(), ConnectError> {
        let resolved =
            resolve_contact_points(&config.contact_points, config.port, config.resolve_timeout)
                .await;
        for point in resolved {
            self.add_host(Address::new(point.address), point.hostname);
        }

        let hosts: HostMap = self.hosts.read().unwrap().clone();
        if hosts.is_empty() {
            return Err(ConnectError::NoHostsAvailable(
                "no contact points provided or none resolved".to_owned(),
            ));
        }

        let mut candidates: Vec<Arc<Host>> = hosts.values().cloned().collect();
        candidates.sort_by_key(|h| h.address);
        if config.use_randomized_contact_points {
            candidates.shuffle(&mut rand::rng());
        }

        let connection_config = ConnectionConfig {
            connect_timeout: config.connect_timeout,
            tcp_nodelay: config.tcp_nodelay,
        };
        let control = ControlConnection::connect(&candidates, &connection_config).await?;
        debug!(
            "Control connection ready (protocol v{})",
            control.protocol_version()
        );
        let connected_host = control.connected_host().clone();

        let request_queue = Arc::new(RequestQueue::with_capacity(config.request_queue_capacity));
        let token_map = Arc::new(TokenMap::build(
            &hosts,
            self.token_map_version.fetch_add(1, Ordering::Relaxed) + 1,
        ));

        let mut default_profile: ExecutionProfile = config.default_execution_profile.clone();
        if default_profile.load_balancing_policy.is_none() {
            default_profile.load_balancing_policy = Some(Arc::new(RoundRobinPolicy::new()));
        }

        let manager_config = ProcessorManagerConfig {
            num_processors: config.num_io_workers,
            pool_settings: PoolSettings {
                connection_config,
                connections_per_host: config.connections_per_host,
                connector_timeout: config.connect_timeout,
                reconnection_policy: config.reconnection_policy.clone(),
            },
            processor_settings: ProcessorSettings {
                flush_ratio: config.flush_ratio,
                max_schema_wait_time: config.max_schema_wait_time,
                schema_agreement_interval: config.schema_agreement_interval,
                prepare_on_all_hosts: config.prepare_on_all_hosts,
            },
            default_profile,
            profiles: config.execution_profiles.clone(),
            timestamp_generator: config.timestamp_generator.clone(),
            schema_agreement: config.schema_agreement.clone(),
            token_map,
            keyspace: keyspace.map(str::to_owned),
        };

        let listener_arc: Arc<dyn ProcessorListener> = self.clone();
        let listener: Weak<dyn ProcessorListener> = Arc::downgrade(&listener_arc);
        let processor_manager = RequestProcessorManager::initialize(
            manager_config,
            &connected_host,
            &hosts,
            request_queue.clone(),
            listener,
            self.metrics.clone(),
        )
        .await?;

        *self.control.lock().unwrap() = Some(control);
        self.exec.store(Some(Arc::new(ExecState {
            request_queue,
            processor_manager,
        })));
        Ok(())
    }

    async fn teardown(&self) {
        if let Some(exec) = self.exec.swap(None) {
            exec.processor_manager.close().await;
        }
        let control = self.control.lock().unwrap().take();
        if let Some(control) = control {
            control.close().await;
        }
    }

    /// Registers a newly discovered host; it carries the mark of the
    /// refresh in progress (the inverse of the current mark).
    fn add_host(&self, address: Address, hostname: Option<String>) -> Arc<Host> {
        debug!("Adding new host: {}", address);
        let mark = !self.current_host_mark.load(Ordering::Relaxed);
        let host = Arc::new(Host::new(address, hostname, mark));
        self.hosts.write().unwrap().insert(address, host.clone());
        if let Some(exec) = self.exec.load_full() {
            exec.processor_manager.notify_host_add(&host);
        }
        host
    }

    /// Removes hosts the refresh did not stamp with the current mark, then
    /// toggles the mark. Two consecutive no-op refreshes leave the registry
    /// unchanged.
    fn purge_hosts(&self, is_initial_connection: bool) {
        let current_mark = self.current_host_mark.load(Ordering::Relaxed);
        let stale: Vec<Arc<Host>> = self
            .hosts
            .read()
            .unwrap()
            .values()
            .filter(|host| host.mark() != current_mark)
            .cloned()
            .collect();
        for host in stale {
            if is_initial_connection {
                warn!("Unable to reach contact point {}", host.address);
                self.hosts.write().unwrap().remove(&host.address);
            } else {
                warn!("Host {} removed", host.address);
                self.remove_host(&host);
            }
        }
        self.current_host_mark.store(!current_mark, Ordering::Relaxed);
    }

    fn remove_host(&self, host: &Arc<Host>) {
        host.set_down();
        self.hosts.write().unwrap().remove(&host.address);
        if let Some(exec) = self.exec.load_full() {
            exec.processor_manager.notify_host_remove(host);
        }
    }

    /// Rebuilds the token-ring snapshot and hands it to every processor.
    fn publish_token_map(&self) {
        let Some(exec) = self.exec.load_full() else {
            return;
        };
        let hosts = self.hosts.read().unwrap().clone();
        let version = self.token_map_version.fetch_add(1, Ordering::Relaxed) + 1;
        let token_map = Arc::new(TokenMap::build(&hosts, version));
        exec.processor_manager.notify_token_map_update(&token_map);
    }
}

impl ProcessorListener for SessionInner {
    fn on_keyspace_update(&self, keyspace: &str) {
        debug!("Propagating keyspace '{}' to all pool managers", keyspace);
        if let Some(exec) = self.exec.load_full() {
            exec.processor_manager.notify_keyspace_update(keyspace);
        }
    }

    fn on_prepared_metadata_update(&self, id: &Bytes) {
        self.prepared_ids.lock().unwrap().insert(id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn registered_addresses(session: &Session) -> Vec<Address> {
        let mut addresses: Vec<Address> =
            session.inner.hosts.read().unwrap().keys().copied().collect();
        addresses.sort();
        addresses
    }

    #[tokio::test]
    async fn execute_without_connect_fails_with_no_hosts() {
        let session = Session::new();
        let result = session.execute(Request::query("SELECT 1")).await;
        assert!(matches!(result, Err(ExecutionError::NoHostsAvailable(_))));
    }

    #[tokio::test]
    async fn close_on_a_closed_session_is_rejected() {
        let session = Session::new();
        assert!(matches!(
            session.close().await,
            Err(CloseError::UnableToClose)
        ));
    }

    #[test]
    fn host_mark_refresh_is_an_involution() {
        let session = Session::new();
        session.inner.add_host(Address::new(addr("10.0.0.1:9042")), None);
        session.inner.add_host(Address::new(addr("10.0.0.2:9042")), None);
        let before = registered_addresses(&session);

        let discovered = [addr("10.0.0.1:9042"), addr("10.0.0.2:9042")];
        session.refresh_hosts(discovered, false);
        assert_eq!(registered_addresses(&session), before);
        session.refresh_hosts(discovered, false);
        assert_eq!(registered_addresses(&session), before);
    }

    #[test]
    fn undiscovered_hosts_are_purged_on_refresh() {
        let session = Session::new();
        session.inner.add_host(Address::new(addr("10.0.0.1:9042")), None);
        let kept = session.inner.add_host(Address::new(addr("10.0.0.2:9042")), None);

        session.refresh_hosts([addr("10.0.0.2:9042")], false);

        assert_eq!(registered_addresses(&session), vec![kept.address]);
    }

    #[test]
    fn refresh_discovers_new_hosts() {
        let session = Session::new();
        session.inner.add_host(Address::new(addr("10.0.0.1:9042")), None);

        session.refresh_hosts([addr("10.0.0.1:9042"), addr("10.0.0.3:9042")], false);

        assert_eq!(
            registered_addresses(&session),
            vec![
                Address::new(addr("10.0.0.1:9042")),
                Address::new(addr("10.0.0.3:9042")),
            ]
        );
    }
}
