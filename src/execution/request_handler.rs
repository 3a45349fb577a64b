//! A single request in flight.
//!
//! A `RequestHandler` is what travels through the request queue: the opaque
//! request plus the oneshot completing the user's future. The draining
//! processor binds it to an execution profile and spawns the retry loop
//! below: walk the query plan, pick the least-busy connection per host,
//! interpret the dispatch-relevant responses and consult the retry policy
//! on database errors. Idempotent requests may additionally race
//! speculative flights over a shared plan cursor.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::client::execution_profile::ExecutionProfile;
use crate::cluster::host::Host;
use crate::cluster::token_map::TokenMap;
use crate::errors::{BrokenConnectionError, ExecutionError};
use crate::execution::request_processor::RequestProcessor;
use crate::frame::{self, ParsedResponse, Request, Response};
use crate::network::connection::{ResponseReceiver, TaskResponse};
use crate::network::pool_manager::ConnectionPoolManager;
use crate::observability::metrics::Metrics;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoutingInfo};
use crate::policies::retry::{RequestInfo, RetryDecision};
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;
use crate::policies::timestamp_generator::TimestampGenerator;

/// Future returned by `Session::execute`; resolves with the response or the
/// error that failed the request.
pub struct ResponseFuture {
    receiver: oneshot::Receiver<Result<Response, ExecutionError>>,
}

impl Future for ResponseFuture {
    type Output = Result<Response, ExecutionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ExecutionError::SessionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RequestHandler {
    pub(crate) request: Request,
    response_sender: oneshot::Sender<Result<Response, ExecutionError>>,
    pub(crate) enqueue_time: Instant,
}

impl RequestHandler {
    pub(crate) fn new(request: Request) -> (Self, ResponseFuture) {
        let (response_sender, receiver) = oneshot::channel();
        (
            Self {
                request,
                response_sender,
                enqueue_time: Instant::now(),
            },
            ResponseFuture { receiver },
        )
    }

    pub(crate) fn set_error(self, error: ExecutionError) {
        let _ = self.response_sender.send(Err(error));
    }

    fn complete(self, result: Result<Response, ExecutionError>) {
        let _ = self.response_sender.send(result);
    }
}

/// Everything a drained request is bound to before its retry loop runs.
pub(crate) struct RequestContext {
    pub(crate) profile: ExecutionProfile,
    pub(crate) policy: Arc<dyn LoadBalancingPolicy>,
    pub(crate) token_map: Option<Arc<TokenMap>>,
    pub(crate) timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
    pub(crate) manager: Arc<ConnectionPoolManager>,
    pub(crate) processor: Arc<RequestProcessor>,
    pub(crate) metrics: Arc<Metrics>,
}

pub(crate) async fn run_request(handler: RequestHandler, ctx: RequestContext) {
    // Requests can outlive their timeout while still queued.
    if let Some(timeout) = ctx.profile.request_timeout {
        if handler.enqueue_time.elapsed() >= timeout {
            ctx.metrics.inc_pending_request_timeouts();
            handler.set_error(ExecutionError::RequestTimeout(timeout));
            return;
        }
    }

    let started = Instant::now();
    let result = execute_request(&handler.request, &ctx).await;
    match &result {
        Ok(_) => ctx
            .metrics
            .record_request_latency(started.elapsed().as_micros() as u64),
        Err(ExecutionError::RequestTimeout(_)) => ctx.metrics.inc_request_timeouts(),
        Err(_) => {}
    }
    handler.complete(result);
}

/// Hosts shared by the flights of one request; every flight pulls from the
/// same plan so speculative attempts target distinct hosts.
struct PlanCursor {
    hosts: Vec<Arc<Host>>,
    next: AtomicUsize,
}

impl PlanCursor {
    fn take_next(&self) -> Option<Arc<Host>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.hosts.get(index).cloned()
    }
}

async fn execute_request(
    request: &Request,
    ctx: &RequestContext,
) -> Result<Response, ExecutionError> {
    let deadline = ctx.profile.request_timeout.map(|t| Instant::now() + t);
    let timestamp = ctx
        .timestamp_generator
        .as_ref()
        .map(|generator| generator.next_timestamp());

    let keyspace = ctx.manager.current_keyspace();
    let routing = RoutingInfo {
        keyspace: keyspace.as_deref(),
        token: None,
        is_idempotent: request.idempotent,
    };
    let cursor = PlanCursor {
        hosts: ctx
            .policy
            .new_query_plan(&routing, ctx.token_map.as_deref())
            .collect(),
        next: AtomicUsize::new(0),
    };

    match &ctx.profile.speculative_execution_policy {
        Some(speculative) if request.idempotent => {
            race_flights(request, ctx, &cursor, timestamp, deadline, speculative.as_ref()).await
        }
        _ => run_flight(request, ctx, &cursor, timestamp, deadline).await,
    }
}

/// One pass over the (shared) plan with its own retry session.
async fn run_flight(
    request: &Request,
    ctx: &RequestContext,
    cursor: &PlanCursor,
    timestamp: Option<i64>,
    deadline: Option<Instant>,
) -> Result<Response, ExecutionError> {
    let (opcode, body) = frame::serialize_request(&request.kind, ctx.profile.consistency, timestamp);
    let mut retry_session = ctx.profile.retry_policy.new_session();
    let mut last_error: Option<ExecutionError> = None;

    'hosts: while let Some(host) = cursor.take_next() {
        if !host.is_up() {
            continue;
        }
        loop {
            // Same-host attempt loop; left through the retry decision.
            let Some(connection) = ctx.manager.find_least_busy(host.address) else {
                continue 'hosts;
            };
            let Ok(receiver) = connection.try_write(opcode, body.clone()) else {
                continue 'hosts;
            };
            trace!("[{}] Request dispatched", host.address);

            let raw = match await_response(receiver, deadline).await {
                Ok(raw) => raw,
                Err(AttemptError::Timeout) => {
                    // The frame stays on the wire; the inflight slot is
                    // consumed by the response or the connection dropping.
                    let timeout = ctx.profile.request_timeout.unwrap_or_default();
                    return Err(ExecutionError::RequestTimeout(timeout));
                }
                Err(AttemptError::Broken(error)) => {
                    last_error = Some(ExecutionError::Broken(error));
                    continue 'hosts;
                }
            };

            match frame::parse_response(raw.opcode, raw.body) {
                Err(frame_error) => {
                    last_error = Some(ExecutionError::Broken(frame_error.into()));
                    continue 'hosts;
                }
                Ok(ParsedResponse::Db { code, message }) => {
                    let decision = retry_session.decide_should_retry(RequestInfo {
                        error_code: code,
                        error_message: &message,
                        is_idempotent: request.idempotent,
                    });
                    match decision {
                        RetryDecision::RetrySameNode => {
                            ctx.metrics.inc_retries();
                            continue;
                        }
                        RetryDecision::RetryNextNode => {
                            ctx.metrics.inc_retries();
                            last_error = Some(ExecutionError::Db { code, message });
                            continue 'hosts;
                        }
                        RetryDecision::DontRetry => {
                            return Err(ExecutionError::Db { code, message })
                        }
                    }
                }
                Ok(ParsedResponse::Response(response)) => {
                    ctx.processor.handle_response(request, &host, &response).await;
                    return Ok(response);
                }
            }
        }
    }

    Err(ExecutionError::NoHostsAvailable(match last_error {
        Some(error) => format!("query plan exhausted, last error: {error}"),
        None => "no host in the query plan was reachable".to_owned(),
    }))
}

/// Races the initial flight against speculative ones launched on the
/// policy's schedule; the first completed response wins.
async fn race_flights(
    request: &Request,
    ctx: &RequestContext,
    cursor: &PlanCursor,
    timestamp: Option<i64>,
    deadline: Option<Instant>,
    policy: &dyn SpeculativeExecutionPolicy,
) -> Result<Response, ExecutionError> {
    let mut flights = FuturesUnordered::new();
    flights.push(run_flight(request, ctx, cursor, timestamp, deadline));
    let mut launched = 1;
    let max_flights = policy.max_retry_count() + 1;
    let mut next_launch_at = Instant::now() + policy.retry_interval(1);
    let mut last_error: Option<ExecutionError> = None;

    loop {
        if flights.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                ExecutionError::NoHostsAvailable(
                    "no host in the query plan was reachable".to_owned(),
                )
            }));
        }

        if launched < max_flights {
            tokio::select! {
                finished = flights.next() => match finished {
                    Some(Ok(response)) => return Ok(response),
                    Some(Err(error @ ExecutionError::RequestTimeout(_))) => return Err(error),
                    Some(Err(error)) => last_error = Some(error),
                    None => {}
                },
                _ = tokio::time::sleep_until(next_launch_at) => {
                    ctx.metrics.inc_speculative_executions();
                    flights.push(run_flight(request, ctx, cursor, timestamp, deadline));
                    launched += 1;
                    next_launch_at = Instant::now() + policy.retry_interval(launched);
                }
            }
        } else {
            match flights.next().await {
                Some(Ok(response)) => return Ok(response),
                Some(Err(error @ ExecutionError::RequestTimeout(_))) => return Err(error),
                Some(Err(error)) => last_error = Some(error),
                None => {}
            }
        }
    }
}

enum AttemptError {
    Timeout,
    Broken(BrokenConnectionError),
}

async fn await_response(
    receiver: ResponseReceiver,
    deadline: Option<Instant>,
) -> Result<TaskResponse, AttemptError> {
    let received = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, receiver).await {
            Ok(received) => received,
            Err(_) => return Err(AttemptError::Timeout),
        },
        None => receiver.await,
    };
    match received {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(broken)) => Err(AttemptError::Broken(broken)),
        Err(_) => Err(AttemptError::Broken(BrokenConnectionError::ChannelClosed)),
    }
}
