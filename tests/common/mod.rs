//! An in-process database node for integration tests: accepts real TCP
//! connections, answers the STARTUP handshake and replies to requests based
//! on the statement text (`USE …` → SET_KEYSPACE, DDL → SCHEMA_CHANGE,
//! `syntax-error …` → ERROR, anything else → VOID).

use std::net::SocketAddr;

use bytes::{Buf, BufMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

const VERSION_RESPONSE: u8 = 0x84;

const OPCODE_ERROR: u8 = 0x00;
const OPCODE_STARTUP: u8 = 0x01;
const OPCODE_READY: u8 = 0x02;
const OPCODE_AUTHENTICATE: u8 = 0x03;
const OPCODE_QUERY: u8 = 0x07;
const OPCODE_RESULT: u8 = 0x08;
const OPCODE_PREPARE: u8 = 0x09;
const OPCODE_EXECUTE: u8 = 0x0A;
const OPCODE_BATCH: u8 = 0x0D;

const RESULT_VOID: i32 = 0x0001;
const RESULT_SET_KEYSPACE: i32 = 0x0003;
const RESULT_PREPARED: i32 = 0x0004;
const RESULT_SCHEMA_CHANGE: i32 = 0x0005;

pub const MOCK_PREPARED_ID: &[u8] = b"mock-prepared-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeBehavior {
    /// STARTUP is answered with READY.
    Ready,
    /// STARTUP is answered with AUTHENTICATE, which the driver (carrying no
    /// authenticator) treats as a critical error.
    RequireAuth,
}

pub struct MockNode {
    pub address: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl MockNode {
    pub async fn start(behavior: HandshakeBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move {
            // Connection tasks live in the JoinSet so aborting the accept
            // task tears every open connection down with it.
            let mut connections = JoinSet::new();
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        connections.spawn(serve_connection(stream, behavior));
                    }
                    Err(_) => return,
                }
            }
        });
        Self {
            address,
            accept_task,
        }
    }

    pub fn contact_point(&self) -> String {
        self.address.to_string()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, behavior: HandshakeBehavior) {
    loop {
        let Some((stream_id, opcode, body)) = read_request(&mut stream).await else {
            return;
        };

        let ok = match opcode {
            OPCODE_STARTUP => match behavior {
                HandshakeBehavior::Ready => {
                    write_frame(&mut stream, stream_id, OPCODE_READY, &[]).await
                }
                HandshakeBehavior::RequireAuth => {
                    let mut payload = Vec::new();
                    put_string(
                        &mut payload,
                        "org.apache.cassandra.auth.PasswordAuthenticator",
                    );
                    write_frame(&mut stream, stream_id, OPCODE_AUTHENTICATE, &payload).await
                }
            },
            OPCODE_QUERY => {
                let statement = parse_long_string(&body).unwrap_or_default();
                answer_query(&mut stream, stream_id, &statement).await
            }
            OPCODE_PREPARE => {
                let mut payload = Vec::new();
                payload.put_i32(RESULT_PREPARED);
                payload.put_u16(MOCK_PREPARED_ID.len() as u16);
                payload.extend_from_slice(MOCK_PREPARED_ID);
                write_frame(&mut stream, stream_id, OPCODE_RESULT, &payload).await
            }
            OPCODE_EXECUTE | OPCODE_BATCH => {
                write_void_result(&mut stream, stream_id).await
            }
            _ => {
                let mut payload = Vec::new();
                payload.put_i32(0x000A);
                put_string(&mut payload, "unexpected opcode");
                write_frame(&mut stream, stream_id, OPCODE_ERROR, &payload).await
            }
        };
        if !ok {
            return;
        }
    }
}

async fn answer_query(stream: &mut TcpStream, stream_id: i16, statement: &str) -> bool {
    if let Some(keyspace) = statement.strip_prefix("USE ") {
        let mut payload = Vec::new();
        payload.put_i32(RESULT_SET_KEYSPACE);
        put_string(&mut payload, keyspace.trim());
        return write_frame(stream, stream_id, OPCODE_RESULT, &payload).await;
    }
    if statement.starts_with("CREATE") || statement.starts_with("ALTER") || statement.starts_with("DROP") {
        let mut payload = Vec::new();
        payload.put_i32(RESULT_SCHEMA_CHANGE);
        put_string(&mut payload, "CREATED");
        put_string(&mut payload, "TABLE");
        return write_frame(stream, stream_id, OPCODE_RESULT, &payload).await;
    }
    if statement.starts_with("syntax-error") {
        let mut payload = Vec::new();
        payload.put_i32(0x2000);
        put_string(&mut payload, "mock syntax error");
        return write_frame(stream, stream_id, OPCODE_ERROR, &payload).await;
    }
    write_void_result(stream, stream_id).await
}

async fn write_void_result(stream: &mut TcpStream, stream_id: i16) -> bool {
    let mut payload = Vec::new();
    payload.put_i32(RESULT_VOID);
    write_frame(stream, stream_id, OPCODE_RESULT, &payload).await
}

async fn read_request(stream: &mut TcpStream) -> Option<(i16, u8, Vec<u8>)> {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).await.ok()?;
    let stream_id = i16::from_be_bytes([header[2], header[3]]);
    let opcode = header[4];
    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.ok()?;
    Some((stream_id, opcode, body))
}

async fn write_frame(stream: &mut TcpStream, stream_id: i16, opcode: u8, body: &[u8]) -> bool {
    let mut frame = Vec::with_capacity(9 + body.len());
    frame.put_u8(VERSION_RESPONSE);
    frame.put_u8(0x00);
    frame.put_i16(stream_id);
    frame.put_u8(opcode);
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(body);
    stream.write_all(&frame).await.is_ok()
}

fn parse_long_string(mut body: &[u8]) -> Option<String> {
    if body.remaining() < 4 {
        return None;
    }
    let length = body.get_u32() as usize;
    if body.remaining() < length {
        return None;
    }
    String::from_utf8(body[..length].to_vec()).ok()
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .try_init();
}
