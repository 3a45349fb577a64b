//! The workhorse: one worker task owning one connection-pool manager.
//!
//! A processor sleeps on its wake handle until the round-robin notifier (or
//! its own re-arm timer) prods it, then drains the shared request queue,
//! binding every handler to its execution profile and spawning the request's
//! retry loop. The flush/backoff cycle caps how much of the loop's time is
//! spent draining: after a drain that took `t`, the next one is delayed by
//! `t × (100 − R) / R` so connection management is not starved under heavy
//! request load.
//!
//! Control-plane changes (host add/remove/up/down, token-map and keyspace
//! updates) arrive as posted tasks and are executed between flushes, in
//! post order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::execution_profile::ExecutionProfile;
use crate::cluster::control_connection::SchemaAgreementObserver;
use crate::cluster::host::{Address, Host, HostMap};
use crate::cluster::token_map::TokenMap;
use crate::errors::{ConnectError, CriticalError, ExecutionError};
use crate::execution::request_handler::{run_request, RequestContext, RequestHandler};
use crate::execution::request_queue::RequestQueue;
use crate::frame::{self, Consistency, RequestKind, Response};
use crate::network::connection_pool::PoolSettings;
use crate::network::pool_manager::{ConnectionPoolManager, PoolListener};
use crate::observability::metrics::Metrics;
use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::timestamp_generator::TimestampGenerator;

/// Per-processor tunables.
#[derive(Debug, Clone)]
pub(crate) struct ProcessorSettings {
    /// Percentage of loop time a processor may spend draining the queue.
    pub(crate) flush_ratio: u32,
    pub(crate) max_schema_wait_time: Duration,
    pub(crate) schema_agreement_interval: Duration,
    pub(crate) prepare_on_all_hosts: bool,
}

/// Control-plane work posted to a processor's loop.
pub(crate) enum ProcessorTask {
    HostAdd(Arc<Host>),
    HostRemove(Arc<Host>),
    HostUp(Address),
    HostDown(Address),
    /// Ownership handoff: the sender must not touch the map afterwards.
    TokenMapUpdate(Arc<TokenMap>),
    KeyspaceUpdate(String),
    Close,
}

/// Callbacks a processor raises towards the session.
pub(crate) trait ProcessorListener: Send + Sync {
    fn on_keyspace_update(&self, keyspace: &str);
    fn on_prepared_metadata_update(&self, id: &Bytes);
}

/// An execution profile with its load-balancing policy resolved (profiles
/// without one inherit the default profile's policy).
struct BoundProfile {
    profile: ExecutionProfile,
    policy: Arc<dyn LoadBalancingPolicy>,
}

enum HostEvent {
    Add,
    Up,
    Down,
}

pub(crate) struct RequestProcessor {
    manager: Arc<ConnectionPoolManager>,
    request_queue: Arc<RequestQueue>,
    wake: Notify,
    is_flushing: AtomicBool,
    is_closing: AtomicBool,
    settings: ProcessorSettings,

    hosts: StdMutex<HostMap>,
    token_map: ArcSwapOption<TokenMap>,
    default_profile: BoundProfile,
    profiles: HashMap<String, BoundProfile>,
    policies: Vec<Arc<dyn LoadBalancingPolicy>>,
    timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
    schema_agreement: Arc<dyn SchemaAgreementObserver>,

    metrics: Arc<Metrics>,
    task_sender: mpsc::UnboundedSender<ProcessorTask>,
    listener: Weak<dyn ProcessorListener>,
    // Handed to the retry loops spawned per request.
    weak_self: Weak<RequestProcessor>,
}

impl RequestProcessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pool_settings: PoolSettings,
        settings: ProcessorSettings,
        request_queue: Arc<RequestQueue>,
        default_profile: ExecutionProfile,
        profiles: HashMap<String, ExecutionProfile>,
        timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
        schema_agreement: Arc<dyn SchemaAgreementObserver>,
        token_map: Arc<TokenMap>,
        listener: Weak<dyn ProcessorListener>,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessorTask>) {
        let default_policy = default_profile
            .load_balancing_policy
            .clone()
            .unwrap_or_else(|| Arc::new(RoundRobinPolicy::new()));

        let mut policies: Vec<Arc<dyn LoadBalancingPolicy>> = vec![default_policy.clone()];
        let bound_profiles: HashMap<String, BoundProfile> = profiles
            .into_iter()
            .map(|(name, profile)| {
                let policy = match &profile.load_balancing_policy {
                    Some(policy) => {
                        trace!("Built load balancing policy for '{}' execution profile", name);
                        if !policies.iter().any(|p| Arc::ptr_eq(p, policy)) {
                            policies.push(policy.clone());
                        }
                        policy.clone()
                    }
                    None => default_policy.clone(),
                };
                (name, BoundProfile { profile, policy })
            })
            .collect();

        let (task_sender, task_receiver) = mpsc::unbounded_channel();
        let manager = ConnectionPoolManager::new(pool_settings, metrics.clone());

        let processor = Arc::new_cyclic(|weak_self| Self {
            manager: manager.clone(),
            request_queue,
            wake: Notify::new(),
            is_flushing: AtomicBool::new(false),
            is_closing: AtomicBool::new(false),
            settings,
            hosts: StdMutex::new(HostMap::new()),
            token_map: ArcSwapOption::new(Some(token_map)),
            default_profile: BoundProfile {
                profile: default_profile,
                policy: default_policy,
            },
            profiles: bound_profiles,
            policies,
            timestamp_generator,
            schema_agreement,
            metrics,
            task_sender,
            listener,
            weak_self: weak_self.clone(),
        });

        let pool_listener_arc: Arc<dyn PoolListener> = processor.clone();
        let pool_listener: Weak<dyn PoolListener> = Arc::downgrade(&pool_listener_arc);
        manager.set_listener(pool_listener);

        (processor, task_receiver)
    }

    /// Bootstrap: initialize the policies and fan the pool manager out to
    /// every host. Hosts whose pool failed are dropped; a keyspace error or
    /// an all-hosts failure aborts the connect.
    pub(crate) async fn connect(
        &self,
        connected_host: &Arc<Host>,
        hosts: &HostMap,
        keyspace: Option<&str>,
    ) -> Result<(), ConnectError> {
        *self.hosts.lock().unwrap() = hosts.clone();
        for policy in &self.policies {
            policy.init(Some(connected_host), hosts);
        }
        if let Some(keyspace) = keyspace {
            self.manager.set_keyspace(keyspace);
        }

        let addresses: Vec<Address> = hosts.keys().copied().collect();
        let failures = self.manager.init(addresses).await;

        let mut first_critical: Option<CriticalError> = None;
        let mut keyspace_rejected = false;
        {
            let mut local_hosts = self.hosts.lock().unwrap();
            for failure in &failures {
                if failure.keyspace_error.is_some() {
                    keyspace_rejected = true;
                }
                if first_critical.is_none() {
                    first_critical = failure.critical.clone();
                }
                local_hosts.remove(&failure.address);
            }
        }

        if keyspace_rejected {
            return Err(ConnectError::UnableToSetKeyspace(
                keyspace.unwrap_or_default().to_owned(),
            ));
        }

        let remaining = self.hosts.lock().unwrap();
        if remaining.is_empty() {
            return Err(match first_critical {
                Some(critical) => ConnectError::Critical(critical),
                None => {
                    ConnectError::NoHostsAvailable("unable to connect to any hosts".to_owned())
                }
            });
        }
        for host in remaining.values() {
            host.set_up();
        }
        Ok(())
    }

    pub(crate) async fn run(
        self: Arc<Self>,
        mut tasks: mpsc::UnboundedReceiver<ProcessorTask>,
    ) {
        let mut reflush_at = Instant::now();
        let mut reflush_scheduled = false;

        loop {
            tokio::select! {
                _ = self.wake.notified() => {
                    self.flush(&mut reflush_at, &mut reflush_scheduled);
                }
                _ = tokio::time::sleep_until(reflush_at), if reflush_scheduled => {
                    reflush_scheduled = false;
                    self.flush(&mut reflush_at, &mut reflush_scheduled);
                }
                task = tasks.recv() => {
                    match task {
                        Some(ProcessorTask::Close) | None => break,
                        Some(task) => self.handle_task(task),
                    }
                }
            }
            if self.is_closing.load(Ordering::Acquire) {
                break;
            }
        }

        self.manager.close();
    }

    /// One drain cycle; decides whether and when to re-arm itself.
    fn flush(&self, reflush_at: &mut Instant, reflush_scheduled: &mut bool) {
        let start = Instant::now();

        while let Some(handler) = self.request_queue.dequeue() {
            self.dispatch(handler);
        }

        if self.is_closing.load(Ordering::Acquire) {
            return;
        }

        self.is_flushing.store(false, Ordering::Release);
        if self.request_queue.is_empty()
            || self
                .is_flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            *reflush_scheduled = false;
            return;
        }

        // More requests arrived while draining; yield proportionally before
        // the next cycle.
        let processing = reflush_delay(start.elapsed(), self.settings.flush_ratio);
        if processing >= Duration::from_millis(1) {
            *reflush_at = Instant::now() + processing;
            *reflush_scheduled = true;
        } else {
            self.wake.notify_one();
        }
    }

    /// Binds a drained handler to its profile and spawns its retry loop.
    fn dispatch(&self, handler: RequestHandler) {
        let Some(processor) = self.weak_self.upgrade() else {
            handler.set_error(ExecutionError::SessionClosed);
            return;
        };
        let bound = match handler.request.execution_profile() {
            None => &self.default_profile,
            Some(name) => match self.profiles.get(name) {
                Some(bound) => {
                    trace!("Using execution profile '{}'", name);
                    bound
                }
                None => {
                    let name = name.to_owned();
                    handler.set_error(ExecutionError::ExecutionProfileInvalid(name));
                    return;
                }
            },
        };

        let ctx = RequestContext {
            profile: bound.profile.clone(),
            policy: bound.policy.clone(),
            token_map: self.token_map.load_full(),
            timestamp_generator: self.timestamp_generator.clone(),
            manager: self.manager.clone(),
            processor,
            metrics: self.metrics.clone(),
        };
        tokio::spawn(run_request(handler, ctx));
    }

    fn handle_task(&self, task: ProcessorTask) {
        match task {
            ProcessorTask::HostAdd(host) => {
                self.hosts.lock().unwrap().insert(host.address, host.clone());
                self.manager.add(host.address);
                self.host_event(&host, HostEvent::Add);
            }
            ProcessorTask::HostRemove(host) => {
                self.hosts.lock().unwrap().remove(&host.address);
                self.manager.remove(host.address);
                for policy in &self.policies {
                    policy.on_remove(&host);
                }
            }
            ProcessorTask::HostUp(address) => match self.get_host(address) {
                Some(host) => {
                    host.set_up();
                    self.host_event(&host, HostEvent::Up);
                }
                None => debug!("Tried to up host {} that doesn't exist", address),
            },
            ProcessorTask::HostDown(address) => match self.get_host(address) {
                Some(host) => {
                    host.set_down();
                    self.host_event(&host, HostEvent::Down);
                }
                None => debug!("Tried to down host {} that doesn't exist", address),
            },
            ProcessorTask::TokenMapUpdate(token_map) => {
                self.token_map.store(Some(token_map));
            }
            ProcessorTask::KeyspaceUpdate(keyspace) => {
                self.manager.set_keyspace(&keyspace);
            }
            // Handled by the run loop.
            ProcessorTask::Close => {}
        }
    }

    fn get_host(&self, address: Address) -> Option<Arc<Host>> {
        self.hosts.lock().unwrap().get(&address).cloned()
    }

    fn host_event(&self, host: &Arc<Host>, event: HostEvent) {
        let mut ignored = true;
        for policy in &self.policies {
            if policy.distance(host) != HostDistance::Ignore {
                ignored = false;
                match event {
                    HostEvent::Add => policy.on_add(host),
                    HostEvent::Up => policy.on_up(host),
                    HostEvent::Down => policy.on_down(host),
                }
            }
        }
        if ignored {
            debug!("Host {} will be ignored by all query plans", host.address);
        }
    }

    /// Post-processing for dispatch-relevant responses.
    pub(crate) async fn handle_response(
        &self,
        request: &crate::frame::Request,
        host: &Host,
        response: &Response,
    ) {
        match response {
            Response::SetKeyspace(keyspace) => {
                debug!("Keyspace changed to '{}'", keyspace);
                self.on_keyspace_changed(keyspace);
            }
            Response::SchemaChange { change, target, .. } => {
                trace!("Schema change ({} {}), awaiting agreement", change, target);
                self.wait_for_schema_agreement().await;
            }
            Response::Prepared { id, .. } => {
                self.on_result_metadata_changed(id);
                self.prepare_on_all(request, host.address);
            }
            _ => {}
        }
    }

    /// Stalls until all peers agree on the schema or the configured wait
    /// time elapses, whichever comes first.
    pub(crate) async fn wait_for_schema_agreement(&self) {
        let deadline = Instant::now() + self.settings.max_schema_wait_time;
        loop {
            if self.schema_agreement.is_agreed().await {
                return;
            }
            if Instant::now() + self.settings.schema_agreement_interval >= deadline {
                warn!(
                    "Schema agreement not reached within {:?}; completing the request anyway",
                    self.settings.max_schema_wait_time
                );
                return;
            }
            tokio::time::sleep(self.settings.schema_agreement_interval).await;
        }
    }

    /// Replicates a successful PREPARE to every other available host in the
    /// background; the user's future never blocks on these.
    pub(crate) fn prepare_on_all(&self, request: &crate::frame::Request, current: Address) {
        if !self.settings.prepare_on_all_hosts {
            return;
        }
        let Some(statement) = request.prepared_statement() else {
            return;
        };
        let addresses = self.manager.available();
        if addresses.is_empty() || (addresses.len() == 1 && addresses[0] == current) {
            return;
        }

        let (opcode, body) = frame::serialize_request(
            &RequestKind::Prepare {
                statement: statement.to_owned(),
            },
            Consistency::default(),
            None,
        );
        for address in addresses {
            if address == current {
                continue;
            }
            let Some(connection) = self.manager.find_least_busy(address) else {
                continue;
            };
            match connection.try_write(opcode, body.clone()) {
                Ok(receiver) => {
                    tokio::spawn(async move {
                        if !matches!(receiver.await, Ok(Ok(_))) {
                            debug!("[{}] Background prepare failed", address);
                        }
                    });
                }
                Err(_) => debug!("[{}] Background prepare refused", address),
            }
        }
    }

    pub(crate) fn notify(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.is_flushing.load(Ordering::Acquire)
    }

    pub(crate) fn post(&self, task: ProcessorTask) {
        let _ = self.task_sender.send(task);
    }

    pub(crate) fn close(&self) {
        self.is_closing.store(true, Ordering::Release);
        let _ = self.task_sender.send(ProcessorTask::Close);
        self.wake.notify_one();
    }

    fn listener_ref(&self) -> Option<Arc<dyn ProcessorListener>> {
        self.listener.upgrade()
    }
}

impl PoolListener for RequestProcessor {
    fn on_up(&self, address: Address) {
        let _ = self.task_sender.send(ProcessorTask::HostUp(address));
    }

    fn on_down(&self, address: Address) {
        let _ = self.task_sender.send(ProcessorTask::HostDown(address));
    }

    fn on_critical_error(&self, address: Address, error: CriticalError) {
        warn!("[{}] Critical connection error: {}", address, error);
        let _ = self.task_sender.send(ProcessorTask::HostDown(address));
    }

    fn on_keyspace_changed(&self, keyspace: &str) {
        if let Some(listener) = self.listener_ref() {
            listener.on_keyspace_update(keyspace);
        }
    }

    fn on_result_metadata_changed(&self, id: &Bytes) {
        if let Some(listener) = self.listener_ref() {
            listener.on_prepared_metadata_update(id);
        }
    }
}

/// Time to yield to non-flush work after a drain that took `flush_time`,
/// keeping the drain share of the loop at `flush_ratio` percent.
pub(crate) fn reflush_delay(flush_time: Duration, flush_ratio: u32) -> Duration {
    flush_time * (100 - flush_ratio) / flush_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::control_connection::LocalSchemaAgreement;
    use crate::frame::Request;

    #[test]
    fn reflush_delay_follows_the_flush_ratio() {
        // 90% flushing leaves one ninth of the drain time for other work.
        assert_eq!(
            reflush_delay(Duration::from_millis(9), 90),
            Duration::from_millis(1)
        );
        assert_eq!(
            reflush_delay(Duration::from_micros(900), 90),
            Duration::from_micros(100)
        );
        // A 50/50 split yields as long as it drained.
        assert_eq!(
            reflush_delay(Duration::from_millis(4), 50),
            Duration::from_millis(4)
        );
    }

    struct NoopListener;

    impl ProcessorListener for NoopListener {
        fn on_keyspace_update(&self, _keyspace: &str) {}
        fn on_prepared_metadata_update(&self, _id: &Bytes) {}
    }

    fn test_processor() -> (Arc<RequestProcessor>, mpsc::UnboundedReceiver<ProcessorTask>) {
        let listener: Arc<dyn ProcessorListener> = Arc::new(NoopListener);
        RequestProcessor::new(
            PoolSettings::default(),
            ProcessorSettings {
                flush_ratio: 90,
                max_schema_wait_time: Duration::from_millis(100),
                schema_agreement_interval: Duration::from_millis(10),
                prepare_on_all_hosts: true,
            },
            Arc::new(RequestQueue::with_capacity(16)),
            ExecutionProfile::default(),
            HashMap::new(),
            None,
            Arc::new(LocalSchemaAgreement),
            Arc::new(TokenMap::default()),
            Arc::downgrade(&listener),
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn unknown_profile_fails_the_request() {
        let (processor, _tasks) = test_processor();
        let (handler, future) =
            RequestHandler::new(Request::query("SELECT 1").with_execution_profile("acceptance"));
        processor.dispatch(handler);
        match future.await {
            Err(ExecutionError::ExecutionProfileInvalid(name)) => assert_eq!(name, "acceptance"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn schema_wait_gives_up_after_the_deadline() {
        struct NeverAgrees;

        #[async_trait::async_trait]
        impl SchemaAgreementObserver for NeverAgrees {
            async fn is_agreed(&self) -> bool {
                false
            }
        }

        let listener: Arc<dyn ProcessorListener> = Arc::new(NoopListener);
        let (processor, _tasks) = RequestProcessor::new(
            PoolSettings::default(),
            ProcessorSettings {
                flush_ratio: 90,
                max_schema_wait_time: Duration::from_millis(50),
                schema_agreement_interval: Duration::from_millis(10),
                prepare_on_all_hosts: false,
            },
            Arc::new(RequestQueue::with_capacity(4)),
            ExecutionProfile::default(),
            HashMap::new(),
            None,
            Arc::new(NeverAgrees),
            Arc::new(TokenMap::default()),
            Arc::downgrade(&listener),
            Arc::new(Metrics::new()),
        );

        let started = std::time::Instant::now();
        processor.wait_for_schema_agreement().await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
