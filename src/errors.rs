//! Error taxonomy of the dispatch core.
//!
//! Transient errors are absorbed by retry and reconnect machinery; critical
//! errors surface on the connect future during bootstrap or mark a host DOWN
//! at runtime. A single pool's critical error does not fail the session
//! unless every pool is critical.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error while reading or writing a single protocol frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// The direction bit marks the frame as client-generated.
    #[error("received a frame marked as coming from a client")]
    FrameFromClient,

    #[error("unsupported protocol version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unknown response opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("malformed {0} body")]
    MalformedBody(&'static str),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(Arc::new(err))
    }
}

/// A failure that cannot be retried and must be reported: the server will
/// keep rejecting the connection no matter how often we reconnect.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CriticalError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("TLS failure: {0}")]
    Tls(String),
}

/// An established connection stopped working.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("write failed: {0}")]
    Write(Arc<std::io::Error>),

    #[error("connection worker terminated")]
    ChannelClosed,

    #[error("received a response with unexpected stream id {0}")]
    UnexpectedStreamId(i16),

    #[error("could not allocate a stream id")]
    UnableToAllocStreamId,
}

/// Error while establishing or using a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("connect timeout")]
    ConnectTimeout,

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Critical(CriticalError),

    #[error(transparent)]
    Broken(#[from] BrokenConnectionError),

    /// The server responded with an ERROR frame that is not critical.
    #[error("database error {code:#06x}: {message}")]
    Db { code: i32, message: String },
}

/// Error that failed a `Session::connect` call.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("unable to connect: {0}")]
    UnableToConnect(String),

    #[error("error initializing session: {0}")]
    UnableToInit(String),

    #[error("no hosts available: {0}")]
    NoHostsAvailable(String),

    #[error("keyspace '{0}' does not exist")]
    UnableToSetKeyspace(String),

    #[error(transparent)]
    Critical(CriticalError),

    #[error(transparent)]
    Connection(ConnectionError),
}

/// Error that failed a `Session::close` call.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CloseError {
    #[error("already closing or closed")]
    UnableToClose,
}

/// Error that failed a single user request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    #[error("no hosts available: {0}")]
    NoHostsAvailable(String),

    #[error("the request queue has reached capacity")]
    RequestQueueFull,

    #[error("execution profile '{0}' does not exist")]
    ExecutionProfileInvalid(String),

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("database error {code:#06x}: {message}")]
    Db { code: i32, message: String },

    #[error(transparent)]
    Broken(#[from] BrokenConnectionError),

    #[error("session closed before the request completed")]
    SessionClosed,
}
