//! Client-side request dispatch core for Cassandra-compatible wide-column
//! clusters.
//!
//! A [`Session`] owns a fleet of connections to every reachable node and
//! pushes user requests through them according to a pluggable host-selection
//! policy. The crate is organized around three cooperating subsystems:
//!
//! * **Session lifecycle & host registry** ([`client`], [`cluster`]) —
//!   bootstrap (contact-point resolution, control-connection handshake, pool
//!   initialization), run-time host add/remove/up/down bookkeeping, and
//!   orderly shutdown.
//! * **Request-processor pool** ([`execution`]) — a fixed set of worker
//!   tasks, each owning a connection-pool manager, draining a process-wide
//!   lock-free request queue and scheduling requests on the least-busy
//!   connection for a host picked by the load-balancing policy.
//! * **Per-host connection pools** ([`network`]) — N concurrent connections
//!   per live host with parallel connector fan-out, critical-error
//!   detection and backoff-driven reconnects.
//!
//! The CQL wire protocol is opaque to this crate beyond the frame envelope
//! and the handful of RESULT kinds that drive dispatch (`SET_KEYSPACE`,
//! `SCHEMA_CHANGE`, `PREPARED`); see [`frame`].
//!
//! ```no_run
//! use cassium::{Request, Session, SessionConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = SessionConfig::new();
//! config.add_contact_point("127.0.0.1:9042");
//!
//! let session = Session::new();
//! session.connect(config, None).await?;
//!
//! let response = session.execute(Request::query("SELECT host_id FROM system.local")).await?;
//! println!("{response:?}");
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cluster;
pub mod errors;
pub mod execution;
pub mod frame;
pub mod observability;
pub mod policies;

pub(crate) mod network;

pub use client::config::SessionConfig;
pub use client::execution_profile::ExecutionProfile;
pub use client::session::Session;
pub use cluster::host::{Address, ContactPoint, Host, HostState};
pub use execution::request_handler::ResponseFuture;
pub use frame::{Consistency, Request, Response};
