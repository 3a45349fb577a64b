//! CQL binary protocol envelope.
//!
//! The dispatch core treats request bodies as opaque byte blobs supplied by
//! the statement layer; it builds frames itself only for the three messages
//! it must emit on its own (`STARTUP`, `USE`, `PREPARE`) and parses response
//! bodies only as far as dispatch requires: the ERROR code, and the RESULT
//! kinds that trigger keyspace propagation, schema-agreement waiting and
//! prepare-on-all-hosts.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::FrameError;

pub(crate) const PROTOCOL_VERSION: u8 = 0x04;
const DIRECTION_RESPONSE: u8 = 0x80;
const HEADER_SIZE: usize = 9;

/// Flag in QUERY bodies announcing a trailing client-side timestamp.
const QUERY_FLAG_DEFAULT_TIMESTAMP: u8 = 0x20;

/// Server-generated events arrive on this reserved stream.
pub(crate) const EVENT_STREAM_ID: i16 = -1;

/// Database error codes the core needs to recognize.
pub(crate) mod error_codes {
    pub(crate) const SERVER_ERROR: i32 = 0x0000;
    pub(crate) const PROTOCOL_ERROR: i32 = 0x000A;
    pub(crate) const BAD_CREDENTIALS: i32 = 0x0100;
    pub(crate) const UNAVAILABLE: i32 = 0x1000;
    pub(crate) const OVERLOADED: i32 = 0x1001;
    pub(crate) const IS_BOOTSTRAPPING: i32 = 0x1002;
    pub(crate) const TRUNCATE_ERROR: i32 = 0x1003;
    pub(crate) const WRITE_TIMEOUT: i32 = 0x1100;
    pub(crate) const READ_TIMEOUT: i32 = 0x1200;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RequestOpcode {
    Startup = 0x01,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Batch = 0x0D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x00 => Ok(ResponseOpcode::Error),
            0x02 => Ok(ResponseOpcode::Ready),
            0x03 => Ok(ResponseOpcode::Authenticate),
            0x06 => Ok(ResponseOpcode::Supported),
            0x08 => Ok(ResponseOpcode::Result),
            0x0C => Ok(ResponseOpcode::Event),
            0x10 => Ok(ResponseOpcode::AuthSuccess),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// Parts of the frame header not determined by the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameParams {
    pub(crate) version: u8,
    pub(crate) flags: u8,
    pub(crate) stream: i16,
}

pub(crate) async fn write_request(
    writer: &mut (impl AsyncWrite + Unpin),
    params: FrameParams,
    opcode: RequestOpcode,
    body: &[u8],
) -> Result<(), FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    {
        let mut buf = &mut header[..];
        buf.put_u8(params.version);
        buf.put_u8(params.flags);
        buf.put_i16(params.stream);
        buf.put_u8(opcode as u8);
        buf.put_u32(body.len() as u32);
    }
    writer.write_all(&header).await?;
    writer.write_all(body).await?;
    Ok(())
}

pub(crate) async fn read_response(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];
    let version = buf.get_u8();
    if version & DIRECTION_RESPONSE != DIRECTION_RESPONSE {
        return Err(FrameError::FrameFromClient);
    }
    if version & 0x7F != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version & 0x7F));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();
    let opcode = ResponseOpcode::try_from(buf.get_u8())?;
    let length = buf.get_u32() as usize;

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body[..]).await?;

    let params = FrameParams {
        version,
        flags,
        stream,
    };
    Ok((params, opcode, body.into()))
}

/* Body building primitives. Only the notations the core itself emits. */

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn put_long_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8], what: &'static str) -> Result<String, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::MalformedBody(what));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(FrameError::MalformedBody(what));
    }
    let s = String::from_utf8(buf[..len].to_vec()).map_err(|_| FrameError::MalformedBody(what))?;
    buf.advance(len);
    Ok(s)
}

fn get_short_bytes(buf: &mut &[u8], what: &'static str) -> Result<Bytes, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::MalformedBody(what));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(FrameError::MalformedBody(what));
    }
    let bytes = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(bytes)
}

/// STARTUP body: a string map with the CQL version the driver speaks.
pub(crate) fn startup_body() -> Bytes {
    let mut body = Vec::new();
    body.put_u16(1);
    put_string(&mut body, "CQL_VERSION");
    put_string(&mut body, "3.0.0");
    body.into()
}

/// Consistency level carried in QUERY frames the core builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Consistency(pub u16);

impl Consistency {
    pub const ANY: Consistency = Consistency(0x0000);
    pub const ONE: Consistency = Consistency(0x0001);
    pub const TWO: Consistency = Consistency(0x0002);
    pub const THREE: Consistency = Consistency(0x0003);
    pub const QUORUM: Consistency = Consistency(0x0004);
    pub const ALL: Consistency = Consistency(0x0005);
    pub const LOCAL_QUORUM: Consistency = Consistency(0x0006);
    pub const EACH_QUORUM: Consistency = Consistency(0x0007);
    pub const LOCAL_ONE: Consistency = Consistency(0x000A);
}

impl Default for Consistency {
    fn default() -> Self {
        Consistency::ONE
    }
}

fn query_body(statement: &str, consistency: Consistency, timestamp: Option<i64>) -> Bytes {
    let mut body = Vec::with_capacity(statement.len() + 16);
    put_long_string(&mut body, statement);
    body.put_u16(consistency.0);
    match timestamp {
        Some(ts) => {
            body.put_u8(QUERY_FLAG_DEFAULT_TIMESTAMP);
            body.put_i64(ts);
        }
        None => body.put_u8(0x00),
    }
    body.into()
}

fn prepare_body(statement: &str) -> Bytes {
    let mut body = Vec::with_capacity(statement.len() + 4);
    put_long_string(&mut body, statement);
    body.into()
}

/// A user request, opaque to the dispatch core beyond what routing needs.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) kind: RequestKind,
    pub(crate) execution_profile: Option<String>,
    pub(crate) idempotent: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum RequestKind {
    Query { statement: String },
    Prepare { statement: String },
    Execute { id: Bytes, parameters: Bytes },
    Batch { body: Bytes },
}

impl Request {
    /// An unprepared statement.
    pub fn query(statement: impl Into<String>) -> Self {
        Self::from_kind(RequestKind::Query {
            statement: statement.into(),
        })
    }

    /// A PREPARE for the given statement.
    pub fn prepare(statement: impl Into<String>) -> Self {
        Self::from_kind(RequestKind::Prepare {
            statement: statement.into(),
        })
    }

    /// An EXECUTE of a previously prepared statement. `parameters` is the
    /// pre-serialized parameter section (consistency, flags, values) built
    /// by the statement layer.
    pub fn execute(id: impl Into<Bytes>, parameters: impl Into<Bytes>) -> Self {
        Self::from_kind(RequestKind::Execute {
            id: id.into(),
            parameters: parameters.into(),
        })
    }

    /// A BATCH with a pre-serialized body.
    pub fn batch(body: impl Into<Bytes>) -> Self {
        Self::from_kind(RequestKind::Batch { body: body.into() })
    }

    fn from_kind(kind: RequestKind) -> Self {
        Self {
            kind,
            execution_profile: None,
            idempotent: false,
        }
    }

    /// Route this request through the named execution profile instead of the
    /// session default.
    pub fn with_execution_profile(mut self, name: impl Into<String>) -> Self {
        self.execution_profile = Some(name.into());
        self
    }

    /// Mark the request as safe to apply more than once. Retry policies may
    /// retry idempotent requests more aggressively.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub(crate) fn execution_profile(&self) -> Option<&str> {
        self.execution_profile.as_deref()
    }

    pub(crate) fn prepared_statement(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Prepare { statement } => Some(statement),
            _ => None,
        }
    }
}

pub(crate) fn serialize_request(
    kind: &RequestKind,
    consistency: Consistency,
    timestamp: Option<i64>,
) -> (RequestOpcode, Bytes) {
    match kind {
        RequestKind::Query { statement } => (
            RequestOpcode::Query,
            query_body(statement, consistency, timestamp),
        ),
        RequestKind::Prepare { statement } => (RequestOpcode::Prepare, prepare_body(statement)),
        RequestKind::Execute { id, parameters } => {
            let mut body = Vec::with_capacity(2 + id.len() + parameters.len());
            body.put_u16(id.len() as u16);
            body.extend_from_slice(id);
            body.extend_from_slice(parameters);
            (RequestOpcode::Execute, body.into())
        }
        RequestKind::Batch { body } => (RequestOpcode::Batch, body.clone()),
    }
}

/// The frame the core writes to set a pool's keyspace on a new connection.
pub(crate) fn use_keyspace_request(keyspace: &str) -> (RequestOpcode, Bytes) {
    (
        RequestOpcode::Query,
        query_body(&format!("USE {keyspace}"), Consistency::ONE, None),
    )
}

/* Response parsing, limited to the dispatch triggers. */

mod result_kinds {
    pub(super) const VOID: i32 = 0x0001;
    pub(super) const ROWS: i32 = 0x0002;
    pub(super) const SET_KEYSPACE: i32 = 0x0003;
    pub(super) const PREPARED: i32 = 0x0004;
    pub(super) const SCHEMA_CHANGE: i32 = 0x0005;
}

/// A response delivered to a request future. Payloads the dispatch core does
/// not interpret stay as raw bytes for the statement layer to decode.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Response {
    /// RESULT/VOID.
    Void,
    /// RESULT/ROWS with the undecoded rows payload.
    Rows(Bytes),
    /// RESULT/SET_KEYSPACE; triggers keyspace propagation to every pool
    /// manager.
    SetKeyspace(String),
    /// RESULT/PREPARED; triggers prepare-on-all-hosts when configured.
    Prepared {
        id: Bytes,
        /// Undecoded metadata following the id.
        metadata: Bytes,
    },
    /// RESULT/SCHEMA_CHANGE; triggers the schema-agreement wait.
    SchemaChange {
        change: String,
        target: String,
        /// Undecoded remainder of the event body.
        options: Bytes,
    },
}

/// What a connection hands back for one stream: either a dispatchable
/// response or a database error to run through the retry policy.
#[derive(Debug, Clone)]
pub(crate) enum ParsedResponse {
    Response(Response),
    Db { code: i32, message: String },
}

pub(crate) fn parse_error_body(body: &[u8]) -> Result<(i32, String), FrameError> {
    let mut buf = body;
    if buf.remaining() < 4 {
        return Err(FrameError::MalformedBody("ERROR"));
    }
    let code = buf.get_i32();
    let message = get_string(&mut buf, "ERROR")?;
    Ok((code, message))
}

fn parse_result_body(body: Bytes) -> Result<Response, FrameError> {
    let mut buf = &body[..];
    if buf.remaining() < 4 {
        return Err(FrameError::MalformedBody("RESULT"));
    }
    match buf.get_i32() {
        result_kinds::VOID => Ok(Response::Void),
        result_kinds::ROWS => Ok(Response::Rows(body.slice(4..))),
        result_kinds::SET_KEYSPACE => {
            let keyspace = get_string(&mut buf, "SET_KEYSPACE")?;
            Ok(Response::SetKeyspace(keyspace))
        }
        result_kinds::PREPARED => {
            let id = get_short_bytes(&mut buf, "PREPARED")?;
            let metadata = body.slice(body.len() - buf.remaining()..);
            Ok(Response::Prepared { id, metadata })
        }
        result_kinds::SCHEMA_CHANGE => {
            let change = get_string(&mut buf, "SCHEMA_CHANGE")?;
            let target = get_string(&mut buf, "SCHEMA_CHANGE")?;
            let options = body.slice(body.len() - buf.remaining()..);
            Ok(Response::SchemaChange {
                change,
                target,
                options,
            })
        }
        _ => Err(FrameError::MalformedBody("RESULT")),
    }
}

pub(crate) fn parse_response(
    opcode: ResponseOpcode,
    body: Bytes,
) -> Result<ParsedResponse, FrameError> {
    match opcode {
        ResponseOpcode::Result => parse_result_body(body).map(ParsedResponse::Response),
        ResponseOpcode::Error => {
            let (code, message) = parse_error_body(&body)?;
            Ok(ParsedResponse::Db { code, message })
        }
        other => Err(FrameError::UnknownOpcode(other as u8)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_frame(stream: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.put_u8(PROTOCOL_VERSION | DIRECTION_RESPONSE);
        frame.put_u8(0x00);
        frame.put_i16(stream);
        frame.put_u8(opcode);
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(body);
        frame
    }

    #[tokio::test]
    async fn response_round_trip() {
        let mut body = Vec::new();
        body.put_i32(result_kinds::VOID);
        let frame = server_frame(7, ResponseOpcode::Result as u8, &body);

        let mut reader = &frame[..];
        let (params, opcode, body) = read_response(&mut reader).await.unwrap();
        assert_eq!(params.stream, 7);
        assert_eq!(opcode, ResponseOpcode::Result);
        assert!(matches!(
            parse_response(opcode, body).unwrap(),
            ParsedResponse::Response(Response::Void)
        ));
    }

    #[tokio::test]
    async fn rejects_client_frames() {
        let mut frame = server_frame(0, ResponseOpcode::Ready as u8, &[]);
        frame[0] = PROTOCOL_VERSION; // direction bit cleared
        let mut reader = &frame[..];
        assert!(matches!(
            read_response(&mut reader).await,
            Err(FrameError::FrameFromClient)
        ));
    }

    #[test]
    fn parses_set_keyspace() {
        let mut body = Vec::new();
        body.put_i32(result_kinds::SET_KEYSPACE);
        put_string(&mut body, "metrics");
        let parsed = parse_response(ResponseOpcode::Result, body.into()).unwrap();
        match parsed {
            ParsedResponse::Response(Response::SetKeyspace(ks)) => assert_eq!(ks, "metrics"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn parses_prepared_id() {
        let mut body = Vec::new();
        body.put_i32(result_kinds::PREPARED);
        body.put_u16(4);
        body.extend_from_slice(b"\x01\x02\x03\x04");
        body.extend_from_slice(b"trailing-metadata");
        let parsed = parse_response(ResponseOpcode::Result, body.into()).unwrap();
        match parsed {
            ParsedResponse::Response(Response::Prepared { id, metadata }) => {
                assert_eq!(&id[..], b"\x01\x02\x03\x04");
                assert_eq!(&metadata[..], b"trailing-metadata");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn parses_schema_change() {
        let mut body = Vec::new();
        body.put_i32(result_kinds::SCHEMA_CHANGE);
        put_string(&mut body, "CREATED");
        put_string(&mut body, "TABLE");
        let parsed = parse_response(ResponseOpcode::Result, body.into()).unwrap();
        match parsed {
            ParsedResponse::Response(Response::SchemaChange { change, target, .. }) => {
                assert_eq!(change, "CREATED");
                assert_eq!(target, "TABLE");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn parses_error_body() {
        let mut body = Vec::new();
        body.put_i32(error_codes::BAD_CREDENTIALS);
        put_string(&mut body, "bad password");
        let (code, message) = parse_error_body(&body).unwrap();
        assert_eq!(code, error_codes::BAD_CREDENTIALS);
        assert_eq!(message, "bad password");
    }

    #[test]
    fn query_body_carries_timestamp_flag() {
        let body = query_body("SELECT 1", Consistency::QUORUM, Some(42));
        let mut buf = &body[..];
        let len = buf.get_u32() as usize;
        buf.advance(len);
        assert_eq!(buf.get_u16(), Consistency::QUORUM.0);
        assert_eq!(buf.get_u8(), QUERY_FLAG_DEFAULT_TIMESTAMP);
        assert_eq!(buf.get_i64(), 42);
    }

    #[test]
    fn truncated_error_body_is_rejected() {
        let mut body = Vec::new();
        body.put_i32(error_codes::SERVER_ERROR);
        body.put_u16(100); // declared length exceeds the remaining bytes
        assert!(parse_error_body(&body).is_err());
    }
}
