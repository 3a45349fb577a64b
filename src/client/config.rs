//! Session configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use crate::client::execution_profile::ExecutionProfile;
use crate::cluster::control_connection::{LocalSchemaAgreement, SchemaAgreementObserver};
use crate::cluster::host::ContactPoint;
use crate::errors::ConnectError;
use crate::policies::reconnect::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::timestamp_generator::TimestampGenerator;

/// Configuration options for a `Session`, consumed by `Session::connect`.
#[derive(Clone)]
pub struct SessionConfig {
    /// Database servers known on session startup: literal addresses or DNS
    /// names. Names resolve at connect time with `resolve_timeout`.
    pub contact_points: Vec<ContactPoint>,

    /// Port applied to contact points given without one.
    pub port: u16,

    /// Per-name DNS resolution timeout. `None` waits indefinitely.
    pub resolve_timeout: Option<Duration>,

    /// Shuffle the contact points before the control connection walks them,
    /// spreading control-connection load across clients.
    pub use_randomized_contact_points: bool,

    /// Number of request-processor workers (K).
    pub num_io_workers: usize,

    /// Capacity of the shared request queue; enqueueing past it fails the
    /// request with `RequestQueueFull`.
    pub request_queue_capacity: usize,

    /// Connections every processor keeps to every host (N).
    pub connections_per_host: NonZeroUsize,

    /// Timeout for one connection attempt, handshake included. A timed-out
    /// connector counts as a non-critical failure and is retried with
    /// backoff.
    pub connect_timeout: Duration,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,

    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,

    /// Client-side timestamp generator. `None` leaves timestamps to the
    /// server.
    pub timestamp_generator: Option<Arc<dyn TimestampGenerator>>,

    /// Profile used by requests that do not name one.
    pub default_execution_profile: ExecutionProfile,

    /// Named execution profiles selectable per request.
    pub execution_profiles: HashMap<String, ExecutionProfile>,

    /// Replicate successful PREPAREs to every available host in the
    /// background.
    pub prepare_on_all_hosts: bool,

    /// Upper bound on the schema-agreement stall after a SCHEMA_CHANGE
    /// response.
    pub max_schema_wait_time: Duration,

    /// How often the schema-agreement observer is polled while waiting.
    pub schema_agreement_interval: Duration,

    /// Agreement oracle consulted during the stall; the default reports
    /// agreement immediately.
    pub schema_agreement: Arc<dyn SchemaAgreementObserver>,

    /// Percentage of a processor's loop spent draining the request queue;
    /// the remainder is yielded to connection management.
    pub flush_ratio: u32,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            contact_points: Vec::new(),
            port: 9042,
            resolve_timeout: Some(Duration::from_secs(2)),
            use_randomized_contact_points: false,
            num_io_workers: 1,
            request_queue_capacity: 8192,
            connections_per_host: NonZeroUsize::new(1).unwrap(),
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            timestamp_generator: None,
            default_execution_profile: ExecutionProfile::default(),
            execution_profiles: HashMap::new(),
            prepare_on_all_hosts: true,
            max_schema_wait_time: Duration::from_secs(10),
            schema_agreement_interval: Duration::from_millis(200),
            schema_agreement: Arc::new(LocalSchemaAgreement),
            flush_ratio: 90,
        }
    }

    /// Adds a contact point: a literal `ip:port` address, a literal IP (the
    /// configured port is appended at resolve time), or a DNS name.
    ///
    /// ```
    /// # use cassium::SessionConfig;
    /// let mut config = SessionConfig::new();
    /// config.add_contact_point("127.0.0.1:9042");
    /// config.add_contact_point("db1.example.com");
    /// ```
    pub fn add_contact_point(&mut self, contact_point: impl AsRef<str>) {
        let contact_point = contact_point.as_ref();
        match contact_point.parse::<SocketAddr>() {
            Ok(address) => self
                .contact_points
                .push(ContactPoint::Address(address)),
            Err(_) => self
                .contact_points
                .push(ContactPoint::Hostname(contact_point.to_owned())),
        }
    }

    pub fn add_contact_points(&mut self, contact_points: impl IntoIterator<Item = impl AsRef<str>>) {
        for contact_point in contact_points {
            self.add_contact_point(contact_point);
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConnectError> {
        if !(1..=99).contains(&self.flush_ratio) {
            return Err(ConnectError::UnableToInit(format!(
                "flush_ratio must be within 1..=99, got {}",
                self.flush_ratio
            )));
        }
        if self.num_io_workers == 0 {
            return Err(ConnectError::UnableToInit(
                "num_io_workers must be at least 1".to_owned(),
            ));
        }
        if self.request_queue_capacity == 0 {
            return Err(ConnectError::UnableToInit(
                "request_queue_capacity must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}
