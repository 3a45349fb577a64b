//! A single pooled connection.
//!
//! Each connection runs one background *router* task multiplexing requests
//! over i16 stream ids: a writer half drains the submit channel and a reader
//! half completes waiting response handlers. When either half fails, every
//! pending handler is completed with the error and an error receiver fires
//! so the owning pool can remove the connection and schedule a reconnect.
//!
//! `inflight` counts the outstanding requests on the socket; the pool's
//! least-busy selection reads it from any thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::cluster::host::Address;
use crate::errors::{BrokenConnectionError, ConnectionError, CriticalError};
use crate::frame::{
    self, error_codes, FrameParams, ParsedResponse, RequestOpcode, ResponseOpcode,
    EVENT_STREAM_ID, PROTOCOL_VERSION,
};

/// Transport settings for a single connection attempt.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) tcp_nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
        }
    }
}

/// Fires once when the connection breaks; held by the owning pool.
pub(crate) type ErrorReceiver = oneshot::Receiver<BrokenConnectionError>;

const SUBMIT_CHANNEL_CAPACITY: usize = 1024;
const IO_BUFFER_SIZE: usize = 8192;

pub(crate) struct PooledConnection {
    address: Address,
    inflight: Arc<AtomicU32>,
    submit: mpsc::Sender<Task>,
    _worker_handle: RemoteHandle<()>,
}

struct Task {
    opcode: RequestOpcode,
    body: Bytes,
    response_sender: oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>,
}

#[derive(Debug)]
pub(crate) struct TaskResponse {
    pub(crate) opcode: ResponseOpcode,
    pub(crate) body: Bytes,
}

pub(crate) type ResponseReceiver =
    oneshot::Receiver<Result<TaskResponse, BrokenConnectionError>>;

/// The write path refused the frame: the connection is gone or its submit
/// channel is full. Dispatch reacts by trying the next host in the plan.
#[derive(Debug)]
pub(crate) struct WriteRefused;

impl PooledConnection {
    pub(crate) fn address(&self) -> Address {
        self.address
    }

    pub(crate) fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Enqueues a frame without blocking and reserves an inflight slot. The
    /// slot is released by the router when the response (or the connection's
    /// death) consumes it.
    pub(crate) fn try_write(
        &self,
        opcode: RequestOpcode,
        body: Bytes,
    ) -> Result<ResponseReceiver, WriteRefused> {
        let (response_sender, receiver) = oneshot::channel();
        self.inflight.fetch_add(1, Ordering::Relaxed);
        match self.submit.try_send(Task {
            opcode,
            body,
            response_sender,
        }) {
            Ok(()) => Ok(receiver),
            Err(_) => {
                self.inflight.fetch_sub(1, Ordering::Relaxed);
                Err(WriteRefused)
            }
        }
    }

    /// Awaitable request path used for the handshake, keyspace setting and
    /// control probes.
    pub(crate) async fn send_request(
        &self,
        opcode: RequestOpcode,
        body: Bytes,
    ) -> Result<TaskResponse, BrokenConnectionError> {
        let (response_sender, receiver) = oneshot::channel();
        self.inflight.fetch_add(1, Ordering::Relaxed);
        let sent = self
            .submit
            .send(Task {
                opcode,
                body,
                response_sender,
            })
            .await;
        if sent.is_err() {
            self.inflight.fetch_sub(1, Ordering::Relaxed);
            return Err(BrokenConnectionError::ChannelClosed);
        }
        receiver
            .await
            .map_err(|_| BrokenConnectionError::ChannelClosed)?
    }

    /// Issues `USE <keyspace>` on this connection.
    pub(crate) async fn use_keyspace(&self, keyspace: &str) -> Result<(), ConnectionError> {
        let (opcode, body) = frame::use_keyspace_request(keyspace);
        let response = self.send_request(opcode, body).await?;
        match frame::parse_response(response.opcode, response.body)? {
            ParsedResponse::Response(_) => Ok(()),
            ParsedResponse::Db { code, message } => Err(classify_db_error(code, message)),
        }
    }
}

struct ResponseHandlerMap {
    handlers: HashMap<i16, oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>>,
    next_stream: i16,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            next_stream: 0,
        }
    }

    fn allocate(
        &mut self,
        sender: oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>,
    ) -> Result<i16, oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>> {
        for _ in 0..=i16::MAX as u32 {
            let stream = self.next_stream;
            self.next_stream = if self.next_stream == i16::MAX {
                0
            } else {
                self.next_stream + 1
            };
            if !self.handlers.contains_key(&stream) {
                self.handlers.insert(stream, sender);
                return Ok(stream);
            }
        }
        Err(sender)
    }

    fn complete(
        &mut self,
        stream: i16,
    ) -> Option<oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>> {
        self.handlers.remove(&stream)
    }

    fn into_handlers(
        self,
    ) -> HashMap<i16, oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>> {
        self.handlers
    }
}

async fn router(
    stream: impl AsyncRead + AsyncWrite,
    task_receiver: mpsc::Receiver<Task>,
    error_sender: oneshot::Sender<BrokenConnectionError>,
    inflight: Arc<AtomicU32>,
) {
    let (read_half, write_half) = split(stream);
    // Shared between the reader and writer halves, which run interleaved on
    // this one task; the lock is never held across an await point.
    let handler_map = StdMutex::new(ResponseHandlerMap::new());

    let r = reader(BufReader::with_capacity(IO_BUFFER_SIZE, read_half), &handler_map, &inflight);
    let w = writer(
        BufWriter::with_capacity(IO_BUFFER_SIZE, write_half),
        &handler_map,
        task_receiver,
        &inflight,
    );

    let error = match futures::try_join!(r, w) {
        Ok(_) => return, // connection dropped by its owner
        Err(error) => error,
    };

    // Fail everything that was still waiting and release its slots.
    for (_, handler) in handler_map.into_inner().unwrap().into_handlers() {
        inflight.fetch_sub(1, Ordering::Relaxed);
        let _ = handler.send(Err(error.clone()));
    }

    let _ = error_sender.send(error);
}

async fn reader(
    mut read_half: impl AsyncRead + Unpin,
    handler_map: &StdMutex<ResponseHandlerMap>,
    inflight: &AtomicU32,
) -> Result<(), BrokenConnectionError> {
    loop {
        let (params, opcode, body) = frame::read_response(&mut read_half)
            .await
            .map_err(BrokenConnectionError::Frame)?;

        if params.stream < 0 {
            // Server-generated events; the dispatch core does not register
            // for any, so anything here is dropped.
            if params.stream == EVENT_STREAM_ID {
                trace!("Ignoring server event frame");
            }
            continue;
        }

        let handler = handler_map.lock().unwrap().complete(params.stream);
        match handler {
            Some(sender) => {
                inflight.fetch_sub(1, Ordering::Relaxed);
                // The receiving side may have given up; that is fine.
                let _ = sender.send(Ok(TaskResponse { opcode, body }));
            }
            None => {
                debug!("Received response with unexpected stream id {}", params.stream);
                return Err(BrokenConnectionError::UnexpectedStreamId(params.stream));
            }
        }
    }
}

async fn writer(
    mut write_half: impl AsyncWrite + Unpin,
    handler_map: &StdMutex<ResponseHandlerMap>,
    mut task_receiver: mpsc::Receiver<Task>,
    inflight: &AtomicU32,
) -> Result<(), BrokenConnectionError> {
    // When the owning PooledConnection is dropped the channel closes and the
    // whole router winds down.
    while let Some(first) = task_receiver.recv().await {
        let mut task = Some(first);
        while let Some(current) = task.take() {
            let allocation = handler_map.lock().unwrap().allocate(current.response_sender);
            match allocation {
                Ok(stream) => {
                    let params = FrameParams {
                        version: PROTOCOL_VERSION,
                        flags: 0x00,
                        stream,
                    };
                    frame::write_request(&mut write_half, params, current.opcode, &current.body)
                        .await
                        .map_err(BrokenConnectionError::Frame)?;
                }
                Err(sender) => {
                    inflight.fetch_sub(1, Ordering::Relaxed);
                    let _ = sender.send(Err(BrokenConnectionError::UnableToAllocStreamId));
                }
            }
            // Coalesce whatever is already queued into one flush.
            task = task_receiver.try_recv().ok();
        }
        write_half
            .flush()
            .await
            .map_err(|e| BrokenConnectionError::Write(Arc::new(e)))?;
    }
    Ok(())
}

/// Wires a router task around an established stream. Split out of
/// `open_connection` so tests can run connections over in-memory duplexes.
pub(crate) fn wire_connection(
    address: Address,
    stream: impl AsyncRead + AsyncWrite + Send + 'static,
) -> (PooledConnection, ErrorReceiver) {
    let (submit, task_receiver) = mpsc::channel(SUBMIT_CHANNEL_CAPACITY);
    let (error_sender, error_receiver) = oneshot::channel();
    let inflight = Arc::new(AtomicU32::new(0));

    let (fut, worker_handle) =
        router(stream, task_receiver, error_sender, inflight.clone()).remote_handle();
    tokio::spawn(fut);

    let connection = PooledConnection {
        address,
        inflight,
        submit,
        _worker_handle: worker_handle,
    };
    (connection, error_receiver)
}

fn classify_db_error(code: i32, message: String) -> ConnectionError {
    match code {
        error_codes::BAD_CREDENTIALS => {
            ConnectionError::Critical(CriticalError::Authentication(message))
        }
        error_codes::PROTOCOL_ERROR => {
            ConnectionError::Critical(CriticalError::ProtocolMismatch(message))
        }
        _ => ConnectionError::Db { code, message },
    }
}

/// Establishes a socket to `address` and performs the STARTUP handshake.
pub(crate) async fn open_connection(
    address: Address,
    config: &ConnectionConfig,
) -> Result<(PooledConnection, ErrorReceiver), ConnectionError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address.inner()))
        .await
        .map_err(|_| ConnectionError::ConnectTimeout)?
        .map_err(|e| ConnectionError::Io(Arc::new(e)))?;
    if config.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("[{}] Could not set TCP_NODELAY: {}", address, e);
        }
    }

    let (connection, error_receiver) = wire_connection(address, stream);

    let startup = connection
        .send_request(RequestOpcode::Startup, frame::startup_body())
        .await?;
    match startup.opcode {
        ResponseOpcode::Ready => {}
        ResponseOpcode::Authenticate => {
            return Err(ConnectionError::Critical(CriticalError::Authentication(
                "server requires authentication, but no authenticator is configured".to_owned(),
            )));
        }
        ResponseOpcode::Error => {
            let (code, message) = frame::parse_error_body(&startup.body)?;
            return Err(classify_db_error(code, message));
        }
        other => {
            return Err(ConnectionError::Critical(CriticalError::ProtocolMismatch(
                format!("unexpected response {other:?} to STARTUP"),
            )));
        }
    }

    trace!("[{}] Connection handshake complete", address);
    Ok((connection, error_receiver))
}
