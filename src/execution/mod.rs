//! The request-processor pool: the shared lock-free queue, the per-request
//! dispatch machinery and the worker tasks that drain the queue.

pub(crate) mod processor_manager;
pub mod request_handler;
pub(crate) mod request_processor;
pub(crate) mod request_queue;
