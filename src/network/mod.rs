//! Connections, per-host pools and the pool managers owned by each request
//! processor.

pub(crate) mod connection;
pub(crate) mod connection_pool;
pub(crate) mod connector;
pub(crate) mod pool_connector;
pub(crate) mod pool_manager;
