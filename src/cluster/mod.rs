//! Cluster-side bookkeeping: the host registry, contact-point resolution,
//! the control connection and the token-ring snapshot.

pub mod control_connection;
pub mod host;
pub mod token_map;
