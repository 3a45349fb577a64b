//! Request retry policies.
//!
//! A `RetryPolicy` opens a fresh `RetrySession` for every request; the
//! session is consulted each time an attempt fails with a database error and
//! decides whether to retry on the same host, move to the next host in the
//! plan, or give up.

use std::fmt;

use crate::frame::error_codes;

/// Information about a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// Database error code from the ERROR frame.
    pub error_code: i32,
    pub error_message: &'a str,
    /// Whether the caller marked the request as idempotent.
    pub is_idempotent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetrySameNode,
    RetryNextNode,
    DontRetry,
}

pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Called for each new request; starts a session of retry decisions.
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Used throughout a single request to decide when to retry it.
pub trait RetrySession: Send + Sync {
    fn decide_should_retry(&mut self, info: RequestInfo<'_>) -> RetryDecision;

    /// Reset before reusing for a new request.
    fn reset(&mut self);
}

/// Default retry policy: retries in cases judged safe to retry.
///
/// * Unavailable and bootstrapping nodes: one try on the next host — another
///   coordinator may see a healthier cluster.
/// * Overloaded/server/truncate errors: one try on the next host, but only
///   for idempotent requests (the write may have been applied).
/// * Read timeouts: one retry on the same host.
/// * Write timeouts: one retry on the same host, idempotent requests only.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::default())
    }
}

#[derive(Default)]
struct DefaultRetrySession {
    was_unavailable_retry: bool,
    was_next_node_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, info: RequestInfo<'_>) -> RetryDecision {
        match info.error_code {
            error_codes::UNAVAILABLE | error_codes::IS_BOOTSTRAPPING => {
                if self.was_unavailable_retry {
                    RetryDecision::DontRetry
                } else {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextNode
                }
            }
            error_codes::SERVER_ERROR
            | error_codes::OVERLOADED
            | error_codes::TRUNCATE_ERROR => {
                if info.is_idempotent && !self.was_next_node_retry {
                    self.was_next_node_retry = true;
                    RetryDecision::RetryNextNode
                } else {
                    RetryDecision::DontRetry
                }
            }
            error_codes::READ_TIMEOUT => {
                if self.was_read_timeout_retry {
                    RetryDecision::DontRetry
                } else {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameNode
                }
            }
            error_codes::WRITE_TIMEOUT => {
                if info.is_idempotent && !self.was_write_timeout_retry {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameNode
                } else {
                    RetryDecision::DontRetry
                }
            }
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::default();
    }
}

/// Forwards all errors directly to the caller; never retries.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FallthroughRetrySession)
    }
}

struct FallthroughRetrySession;

impl RetrySession for FallthroughRetrySession {
    fn decide_should_retry(&mut self, _info: RequestInfo<'_>) -> RetryDecision {
        RetryDecision::DontRetry
    }

    fn reset(&mut self) {}
}
