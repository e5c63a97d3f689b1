//! Scripted in-process CQL server for integration tests

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use cqlwire_driver::cqlwire_frame::primitives::{
    read_long_string, read_short, read_short_bytes, write_consistency, write_inet, write_int,
    write_short_bytes, write_string, write_string_multimap,
};
use cqlwire_driver::cqlwire_frame::{
    BufferedStrategy, BufferingStrategy, Consistency, FrameBody, FrameHeader, FrameWriter, Opcode,
};
use cqlwire_driver::host::{Host, HostDistance};
use cqlwire_driver::policies::{LoadBalancingPolicy, QueryPlan};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A request frame as the server saw it
#[derive(Debug, Clone)]
pub struct Received {
    /// Accept order of the connection, starting at 0
    pub connection: usize,
    pub version: u8,
    pub stream_id: i16,
    pub opcode: Opcode,
    pub compressed: bool,
    /// CQL text of QUERY and PREPARE
    pub cql: Option<String>,
    /// Consistency of QUERY
    pub consistency: Option<Consistency>,
    /// Statement id of EXECUTE
    pub prepared_id: Option<Bytes>,
    pub body: Bytes,
}

/// What the server does with a request
#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(Opcode, Bytes),
    /// Never answer
    Silent,
    /// Drop the connection without answering
    Close,
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn ready() -> Self {
        Self::Respond(Opcode::Ready, Bytes::new())
    }

    pub fn void() -> Self {
        let mut body = BytesMut::new();
        write_int(&mut body, 1);
        Self::Respond(Opcode::Result, body.freeze())
    }

    pub fn rows(column_count: i32) -> Self {
        let mut body = BytesMut::new();
        write_int(&mut body, 2);
        write_int(&mut body, 0x0004);
        write_int(&mut body, column_count);
        write_int(&mut body, 0);
        Self::Respond(Opcode::Result, body.freeze())
    }

    pub fn set_keyspace(keyspace: &str) -> Self {
        let mut body = BytesMut::new();
        write_int(&mut body, 3);
        write_string(&mut body, keyspace).unwrap();
        Self::Respond(Opcode::Result, body.freeze())
    }

    pub fn prepared(id: &[u8]) -> Self {
        let mut body = BytesMut::new();
        write_int(&mut body, 4);
        write_short_bytes(&mut body, id).unwrap();
        write_int(&mut body, 0x0001);
        write_int(&mut body, 0);
        Self::Respond(Opcode::Result, body.freeze())
    }

    pub fn supported() -> Self {
        let mut body = BytesMut::new();
        let options = std::collections::HashMap::from([
            ("CQL_VERSION".to_string(), vec!["3.0.0".to_string()]),
            ("COMPRESSION".to_string(), vec!["lz4".to_string()]),
        ]);
        write_string_multimap(&mut body, &options).unwrap();
        Self::Respond(Opcode::Supported, body.freeze())
    }

    pub fn authenticate(authenticator: &str) -> Self {
        let mut body = BytesMut::new();
        write_string(&mut body, authenticator).unwrap();
        Self::Respond(Opcode::Authenticate, body.freeze())
    }

    pub fn auth_success() -> Self {
        let mut body = BytesMut::new();
        write_int(&mut body, -1);
        Self::Respond(Opcode::AuthSuccess, body.freeze())
    }

    pub fn error(code: i32, message: &str) -> Self {
        Self::Respond(Opcode::Error, error_head(code, message).freeze())
    }

    pub fn read_timeout(consistency: Consistency, received: i32, block_for: i32, data: bool) -> Self {
        let mut body = error_head(0x1200, "Operation timed out");
        write_consistency(&mut body, consistency);
        write_int(&mut body, received);
        write_int(&mut body, block_for);
        body.put_u8(u8::from(data));
        Self::Respond(Opcode::Error, body.freeze())
    }

    pub fn write_timeout(consistency: Consistency, received: i32, block_for: i32, write_type: &str) -> Self {
        let mut body = error_head(0x1100, "Operation timed out");
        write_consistency(&mut body, consistency);
        write_int(&mut body, received);
        write_int(&mut body, block_for);
        write_string(&mut body, write_type).unwrap();
        Self::Respond(Opcode::Error, body.freeze())
    }

    pub fn unavailable(consistency: Consistency, required: i32, alive: i32) -> Self {
        let mut body = error_head(0x1000, "Cannot achieve consistency level");
        write_consistency(&mut body, consistency);
        write_int(&mut body, required);
        write_int(&mut body, alive);
        Self::Respond(Opcode::Error, body.freeze())
    }

    pub fn unprepared(id: &[u8]) -> Self {
        let mut body = error_head(0x2500, "Prepared query not found");
        write_short_bytes(&mut body, id).unwrap();
        Self::Respond(Opcode::Error, body.freeze())
    }

    pub fn overloaded() -> Self {
        Self::error(0x1001, "Server is overloaded")
    }

    pub fn syntax_error() -> Self {
        Self::error(0x2000, "line 1:0 no viable alternative")
    }
}

fn error_head(code: i32, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    write_int(&mut body, code);
    write_string(&mut body, message).unwrap();
    body
}

/// Answers every request like a healthy single node
pub fn default_reply(request: &Received) -> MockReply {
    match request.opcode {
        Opcode::Startup | Opcode::Register | Opcode::Credentials => MockReply::ready(),
        Opcode::Options => MockReply::supported(),
        Opcode::Prepare => MockReply::prepared(b"stmt-1"),
        Opcode::Query => match request.cql.as_deref() {
            Some(cql) if cql.starts_with("USE ") => MockReply::set_keyspace(cql[4..].trim()),
            Some(cql) if cql.starts_with("SELECT") => MockReply::rows(1),
            _ => MockReply::void(),
        },
        _ => MockReply::void(),
    }
}

type Handler = Arc<dyn Fn(&Received) -> MockReply + Send + Sync>;

struct ServerState {
    handler: Mutex<Handler>,
    requests: Mutex<Vec<Received>>,
    registered: Mutex<Vec<(u8, Arc<tokio::sync::Mutex<OwnedWriteHalf>>)>>,
    accepted: AtomicUsize,
    killed: watch::Sender<bool>,
}

/// Listens on an ephemeral localhost port until dropped
pub struct MockServer {
    address: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::with_handler(default_reply).await
    }

    pub async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Received) -> MockReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            handler: Mutex::new(Arc::new(handler)),
            requests: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            killed: watch::channel(false).0,
        });
        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let connection = accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(Arc::clone(&accept_state), socket, connection));
            }
        });
        Self {
            address,
            state,
            task,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Replace the request handler for requests received from now on
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Received) -> MockReply + Send + Sync + 'static,
    {
        *self.state.handler.lock() = Arc::new(handler);
    }

    pub fn requests(&self) -> Vec<Received> {
        self.state.requests.lock().clone()
    }

    /// Recorded requests with `opcode`
    pub fn requests_with(&self, opcode: Opcode) -> Vec<Received> {
        self.requests()
            .into_iter()
            .filter(|r| r.opcode == opcode)
            .collect()
    }

    /// Recorded QUERY texts in arrival order
    pub fn queries(&self) -> Vec<String> {
        self.requests_with(Opcode::Query)
            .into_iter()
            .filter_map(|r| r.cql)
            .collect()
    }

    pub fn connections_accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Push a STATUS_CHANGE or TOPOLOGY_CHANGE event to registered connections
    pub async fn push_event(&self, kind: &str, change: &str, address: SocketAddr) {
        let mut body = BytesMut::new();
        write_string(&mut body, kind).unwrap();
        write_string(&mut body, change).unwrap();
        write_inet(&mut body, &address);
        let body = body.freeze();

        let targets = self.state.registered.lock().clone();
        for (version, writer) in targets {
            let mut frame = FrameWriter::new(version | 0x80, -1, Opcode::Event);
            frame.body_mut().extend_from_slice(&body);
            let frame = frame.finish(None).unwrap();
            let _ = writer.lock().await.write_all(&frame).await;
        }
    }

    /// Stop accepting and drop every open connection, like a dead node
    pub fn stop(&self) {
        self.task.abort();
        self.state.killed.send_replace(true);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(state: Arc<ServerState>, socket: tokio::net::TcpStream, connection: usize) {
    let (mut reader, writer) = socket.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut strategy = BufferedStrategy::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut killed = state.killed.subscribe();
    if *killed.borrow_and_update() {
        return;
    }

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = killed.changed() => {
                let _ = writer.lock().await.shutdown().await;
                return;
            }
        };
        let n = match read {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let mut received = Vec::new();
        for frame in strategy.process(&buf[..n]) {
            let Ok(frame) = frame else { return };
            let FrameBody::Buffered(body) = frame.body else {
                return;
            };
            let header = frame.header;
            received.push(decode_request(connection, &header, body));
        }

        for request in received {
            state.requests.lock().push(request.clone());
            if request.opcode == Opcode::Register {
                state
                    .registered
                    .lock()
                    .push((request.version, Arc::clone(&writer)));
            }
            let handler = Arc::clone(&*state.handler.lock());
            let reply = handler(&request);
            if !respond(&writer, &request, reply).await {
                let _ = writer.lock().await.shutdown().await;
                return;
            }
        }
    }
}

fn decode_request(connection: usize, header: &FrameHeader, body: Bytes) -> Received {
    let opcode = header.opcode;
    let mut cursor = body.clone();
    let parsed = if header.is_compressed() { None } else { Some(opcode) };
    let (cql, consistency, prepared_id) = match parsed {
        Some(Opcode::Query) => {
            let cql = read_long_string(&mut cursor).ok();
            let consistency = read_short(&mut cursor)
                .ok()
                .and_then(|c| Consistency::try_from(c).ok());
            (cql, consistency, None)
        }
        Some(Opcode::Prepare) => (read_long_string(&mut cursor).ok(), None, None),
        Some(Opcode::Execute) => (None, None, read_short_bytes(&mut cursor).ok()),
        _ => (None, None, None),
    };
    Received {
        connection,
        version: header.version,
        stream_id: header.stream_id,
        opcode,
        compressed: header.is_compressed(),
        cql,
        consistency,
        prepared_id,
        body,
    }
}

/// Returns false when the connection should be dropped
async fn respond(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    request: &Received,
    reply: MockReply,
) -> bool {
    match reply {
        MockReply::Respond(opcode, body) => {
            let _ = write_frame(writer, request, opcode, &body).await;
            true
        }
        MockReply::Silent => true,
        MockReply::Close => false,
        MockReply::Delay(delay, inner) => {
            let writer = Arc::clone(writer);
            let request = request.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let MockReply::Respond(opcode, body) = *inner {
                    let _ = write_frame(&writer, &request, opcode, &body).await;
                }
            });
            true
        }
    }
}

async fn write_frame(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    request: &Received,
    opcode: Opcode,
    body: &[u8],
) -> std::io::Result<()> {
    let mut frame = FrameWriter::new(request.version | 0x80, request.stream_id, opcode);
    frame.body_mut().extend_from_slice(body);
    let frame = frame.finish(None).unwrap();
    writer.lock().await.write_all(&frame).await
}

/// Route driver logs to the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Accepts one connection, answers its STARTUP with READY and then never
/// reads again. The task holds the socket until aborted.
pub async fn stalled_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut strategy = BufferedStrategy::new();
        let mut buf = vec![0u8; 4096];
        let startup = loop {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up before STARTUP");
            if let Some(frame) = strategy.process(&buf[..n]).next() {
                break frame.unwrap();
            }
        };
        let ready = FrameWriter::new(
            startup.header.version | 0x80,
            startup.header.stream_id,
            Opcode::Ready,
        )
        .finish(None)
        .unwrap();
        socket.write_all(&ready).await.unwrap();
        std::future::pending::<()>().await;
    });
    (address, task)
}

/// An address nothing listens on
pub async fn closed_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    address
}

/// Plans hosts in a fixed address order, all local
#[derive(Debug)]
pub struct FixedOrderPolicy {
    order: Vec<SocketAddr>,
}

impl FixedOrderPolicy {
    pub fn new(order: Vec<SocketAddr>) -> Self {
        Self { order }
    }
}

impl LoadBalancingPolicy for FixedOrderPolicy {
    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn new_query_plan(&self, _routing_key: Option<&[u8]>, hosts: Vec<Arc<Host>>) -> QueryPlan {
        let mut ordered = Vec::with_capacity(hosts.len());
        for address in &self.order {
            if let Some(host) = hosts.iter().find(|h| h.address() == *address) {
                ordered.push(Arc::clone(host));
            }
        }
        Box::new(ordered.into_iter())
    }
}
