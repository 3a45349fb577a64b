//! Round-robin fan-in across the request processors.
//!
//! `notify_request` advances an atomic cursor and wakes the chosen
//! processor — unless that processor is already flushing, in which case the
//! notification is absorbed: the queue is shared, so the ongoing drain will
//! pick the request up. Broadcast operations fan out through per-processor
//! task channels, never synchronously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::future::{join_all, RemoteHandle};
use futures::FutureExt;
use tracing::debug;

use crate::client::execution_profile::ExecutionProfile;
use crate::cluster::control_connection::SchemaAgreementObserver;
use crate::cluster::host::{Host, HostMap};
use crate::cluster::token_map::TokenMap;
use crate::errors::{ConnectError, ExecutionError};
use crate::execution::request_processor::{
    ProcessorListener, ProcessorSettings, ProcessorTask, RequestProcessor,
};
use crate::execution::request_queue::RequestQueue;
use crate::network::connection_pool::PoolSettings;
use crate::observability::metrics::Metrics;
use crate::policies::timestamp_generator::TimestampGenerator;

/// Everything the initializer needs to build the processors.
pub(crate) struct ProcessorManagerConfig {
    pub(crate) num_processors: usize,
    pub(crate) pool_settings: PoolSettings,
    pub(crate) processor_settings: ProcessorSettings,
    pub(crate) default_profile: ExecutionProfile,
    pub(crate) profiles: HashMap<String, ExecutionProfile>,
    pub(crate) timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
    pub(crate) schema_agreement: Arc<dyn SchemaAgreementObserver>,
    pub(crate) token_map: Arc<TokenMap>,
    pub(crate) keyspace: Option<String>,
}

pub(crate) struct RequestProcessorManager {
    processors: Vec<Arc<RequestProcessor>>,
    // Dropping a handle cancels the worker; close() awaits them instead.
    run_handles: StdMutex<Vec<RemoteHandle<()>>>,
    current: AtomicUsize,
    request_queue: Arc<RequestQueue>,
}

impl RequestProcessorManager {
    /// Builds and connects K processors. Failures are expected to be alike
    /// across processors; the first one is propagated and everything is
    /// torn down again.
    pub(crate) async fn initialize(
        config: ProcessorManagerConfig,
        connected_host: &Arc<Host>,
        hosts: &HostMap,
        request_queue: Arc<RequestQueue>,
        listener: Weak<dyn ProcessorListener>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, ConnectError> {
        let num_processors = config.num_processors.max(1);
        let mut processors = Vec::with_capacity(num_processors);
        let mut run_handles = Vec::with_capacity(num_processors);

        for _ in 0..num_processors {
            let (processor, task_receiver) = RequestProcessor::new(
                config.pool_settings.clone(),
                config.processor_settings.clone(),
                request_queue.clone(),
                config.default_profile.clone(),
                config.profiles.clone(),
                config.timestamp_generator.clone(),
                config.schema_agreement.clone(),
                config.token_map.clone(),
                listener.clone(),
                metrics.clone(),
            );
            let (fut, handle) = processor.clone().run(task_receiver).remote_handle();
            tokio::spawn(fut);
            run_handles.push(handle);
            processors.push(processor);
        }
        debug!("Created {} request processors", num_processors);

        let manager = Arc::new(Self {
            processors,
            run_handles: StdMutex::new(run_handles),
            current: AtomicUsize::new(0),
            request_queue,
        });

        let connects = manager
            .processors
            .iter()
            .map(|p| p.connect(connected_host, hosts, config.keyspace.as_deref()));
        let results = join_all(connects).await;

        if let Some(error) = results.into_iter().find_map(Result::err) {
            manager.close().await;
            return Err(error);
        }
        Ok(manager)
    }

    /// Wakes the next processor in round-robin order, unless it is already
    /// flushing (the notification is then coalesced into the ongoing
    /// drain).
    pub(crate) fn notify_request(&self) {
        let index = self.current.fetch_add(1, Ordering::Relaxed) % self.processors.len();
        let processor = &self.processors[index];
        if !processor.is_flushing() {
            processor.notify();
        }
    }

    pub(crate) fn notify_host_add(&self, host: &Arc<Host>) {
        for processor in &self.processors {
            processor.post(ProcessorTask::HostAdd(host.clone()));
        }
    }

    pub(crate) fn notify_host_remove(&self, host: &Arc<Host>) {
        for processor in &self.processors {
            processor.post(ProcessorTask::HostRemove(host.clone()));
        }
    }

    /// Ownership handoff: the sender must not mutate the map after this.
    pub(crate) fn notify_token_map_update(&self, token_map: &Arc<TokenMap>) {
        for processor in &self.processors {
            processor.post(ProcessorTask::TokenMapUpdate(token_map.clone()));
        }
    }

    pub(crate) fn notify_keyspace_update(&self, keyspace: &str) {
        for processor in &self.processors {
            processor.post(ProcessorTask::KeyspaceUpdate(keyspace.to_owned()));
        }
    }

    /// Cooperative shutdown: stop the processors, join their tasks, then
    /// fail whatever is still sitting in the queue.
    pub(crate) async fn close(&self) {
        for processor in &self.processors {
            processor.close();
        }
        let handles: Vec<RemoteHandle<()>> = {
            let mut run_handles = self.run_handles.lock().unwrap();
            run_handles.drain(..).collect()
        };
        for handle in handles {
            handle.await;
        }
        while let Some(handler) = self.request_queue.dequeue() {
            handler.set_error(ExecutionError::SessionClosed);
        }
    }
}
