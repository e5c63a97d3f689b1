//! Multiplexed connection to one Cassandra node
//!
//! A [`Connection`] owns one TCP socket. Up to 128 requests share it, each
//! tagged with a stream id from the connection's [`StreamTable`]. A spawned
//! read task feeds socket bytes through the configured
//! [`BufferingStrategy`] and completes the operation registered for each
//! response's stream id. Frames on the event stream go to the configured
//! [`EventHandler`].
//!
//! Any transport fault makes the connection defunct: every pending
//! operation is completed with the fault and the [`ConnectionObserver`] is
//! told so the owner can mark the host down. Reads and writes both race the
//! shutdown signal, so a peer that stops reading cannot pin a caller.

mod handshake;
mod idle;
mod streams;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use cqlwire_frame::{
    BufferingMode, BufferingStrategy, Compressor, Consistency, Event, EventType, Frame, FrameBody,
    FrameError, FrameHeader, ProtocolVersion, QueryParameters, Request, Response, ResultBody,
    SerializedRequest,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::auth::AuthProvider;
use crate::error::ConnectionError;
use crate::pending::{PendingOperation, pending_operation};
use idle::IdleTimer;
use streams::{AllocError, StreamTable};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Startup,
    Authenticating,
    Ready,
    Defunct,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Startup,
            3 => Self::Authenticating,
            4 => Self::Ready,
            _ => Self::Defunct,
        }
    }
}

/// Receives server push events
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Told when a connection becomes unusable because of a fault
pub trait ConnectionObserver: Send + Sync {
    fn on_defunct(&self, address: SocketAddr, error: &ConnectionError);
}

/// Settings applied to every connection a session opens
#[derive(Clone)]
pub struct ConnectionConfig {
    pub protocol_version: ProtocolVersion,
    pub cql_version: String,
    /// Body codec negotiated in STARTUP. Forces buffered framing.
    pub compressor: Option<Arc<dyn Compressor>>,
    pub buffering: BufferingMode,
    pub connect_timeout: Duration,
    /// Abort the connection when a written request sees no bytes back
    /// within this window
    pub idle_timeout: Option<Duration>,
    pub tcp_nodelay: bool,
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub event_handler: Option<Arc<dyn EventHandler>>,
    pub observer: Option<Arc<dyn ConnectionObserver>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V2,
            cql_version: "3.0.0".to_string(),
            compressor: None,
            buffering: BufferingMode::Streaming,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(12)),
            tcp_nodelay: true,
            auth: None,
            event_handler: None,
            observer: None,
        }
    }
}

impl ConnectionConfig {
    /// Framing actually used on the socket
    pub fn effective_buffering(&self) -> BufferingMode {
        if self.compressor.is_some() {
            BufferingMode::Buffered
        } else {
            self.buffering
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("protocol_version", &self.protocol_version)
            .field("cql_version", &self.cql_version)
            .field("compressor", &self.compressor.as_ref().map(|c| c.name()))
            .field("buffering", &self.buffering)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("auth", &self.auth.is_some())
            .field("event_handler", &self.event_handler.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) address: SocketAddr,
    config: Arc<ConnectionConfig>,
    state: AtomicU8,
    streams: Mutex<StreamTable>,
    /// Taken out and dropped when the socket is torn down
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    defunct_cause: Mutex<Option<ConnectionError>>,
    shutdown: watch::Sender<bool>,
    idle: IdleTimer,
    total_requests: AtomicU64,
    keyspace: Mutex<Option<String>>,
}

impl Shared {
    fn new(id: u64, address: SocketAddr, config: Arc<ConnectionConfig>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            address,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            streams: Mutex::new(StreamTable::new()),
            writer: tokio::sync::Mutex::new(None),
            defunct_cause: Mutex::new(None),
            shutdown,
            idle: IdleTimer::new(config.idle_timeout),
            total_requests: AtomicU64::new(0),
            keyspace: Mutex::new(None),
            config,
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// States are ordered, so a late transition never revives a defunct
    /// connection
    fn set_state(&self, state: ConnectionState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Why the connection died, or [`ConnectionError::Closed`] if it has not
    fn cause(&self) -> ConnectionError {
        self.defunct_cause
            .lock()
            .clone()
            .unwrap_or(ConnectionError::Closed)
    }

    /// Tear the connection down. The first cause wins; every pending
    /// operation is completed with it.
    pub(crate) fn defunct(&self, cause: ConnectionError, notify: bool) {
        {
            let mut slot = self.defunct_cause.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(cause.clone());
        }
        self.set_state(ConnectionState::Defunct);
        self.shutdown.send_replace(true);
        // A writer holding the lock drops the half itself once it sees shutdown
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        let pending = self.streams.lock().close();
        let failed = pending.len();
        for completer in pending {
            completer.complete(Err(cause.clone()));
        }

        if notify {
            warn!(
                connection = self.id,
                address = %self.address,
                failed,
                error = %cause,
                "Connection defunct"
            );
            if let Some(observer) = &self.config.observer {
                observer.on_defunct(self.address, &cause);
            }
        } else {
            debug!(connection = self.id, address = %self.address, failed, "Connection closed");
        }
    }

    fn dispatch(&self, frame: Frame) {
        if frame.header.is_event() {
            self.dispatch_event(frame);
            return;
        }
        let stream_id = frame.stream_id();
        let completer = self.streams.lock().release(stream_id);
        match completer {
            Some(completer) => {
                trace!(connection = self.id, stream_id, opcode = ?frame.opcode(), "Response");
                completer.complete(Ok(frame));
            }
            None => warn!(
                connection = self.id,
                address = %self.address,
                stream_id,
                "Response for unknown stream id dropped"
            ),
        }
    }

    fn dispatch_event(&self, frame: Frame) {
        let Some(handler) = self.config.event_handler.clone() else {
            trace!(connection = self.id, "Event dropped, no handler");
            return;
        };
        let compressor = self.config.compressor.clone();
        let address = self.address;
        match frame.body {
            FrameBody::Buffered(body) => {
                deliver_event(&frame.header, body, compressor.as_deref(), &*handler, address);
            }
            FrameBody::Streaming(stream) => {
                let header = frame.header;
                tokio::spawn(async move {
                    match stream.collect().await {
                        Ok(body) => {
                            deliver_event(&header, body, compressor.as_deref(), &*handler, address);
                        }
                        Err(error) => debug!(%address, %error, "Event body aborted"),
                    }
                });
            }
        }
    }
}

fn deliver_event(
    header: &FrameHeader,
    body: Bytes,
    compressor: Option<&dyn Compressor>,
    handler: &dyn EventHandler,
    address: SocketAddr,
) {
    let decoded = decode_event(header, body, compressor);
    match decoded {
        Ok(event) => {
            debug!(%address, ?event, "Server event");
            handler.on_event(event);
        }
        Err(error) => warn!(%address, %error, "Undecodable event frame"),
    }
}

fn decode_event(
    header: &FrameHeader,
    body: Bytes,
    compressor: Option<&dyn Compressor>,
) -> Result<Event, FrameError> {
    let body = if header.is_compressed() {
        compressor
            .ok_or(FrameError::MissingCompressor)?
            .decompress(&body)?
    } else {
        body
    };
    match Response::decode(header.opcode, body)? {
        Response::Event(event) => Ok(event),
        _ => Err(FrameError::UnexpectedOpcode(header.opcode)),
    }
}

/// Open the TCP socket
async fn connect_socket(shared: &Shared) -> Result<TcpStream, ConnectionError> {
    shared.set_state(ConnectionState::Connecting);
    let timeout = shared.config.connect_timeout;
    let socket = tokio::time::timeout(timeout, TcpStream::connect(shared.address))
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(timeout))??;
    socket.set_nodelay(shared.config.tcp_nodelay)?;
    Ok(socket)
}

/// Resolves once the connection is shut down or its state is gone
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Defuncts the connection if a request write is abandoned halfway, since
/// the peer would see a torn frame.
struct WriteGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.defunct(
                ConnectionError::from(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "request write abandoned",
                )),
                true,
            );
        }
    }
}

/// An open, multiplexed connection
pub struct Connection {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Connect, run the handshake and optionally switch keyspace.
    ///
    /// The returned connection is [`ConnectionState::Ready`].
    pub async fn open(
        address: SocketAddr,
        config: Arc<ConnectionConfig>,
        keyspace: Option<&str>,
    ) -> Result<Self, ConnectionError> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, %address, "Opening connection");

        let shared = Arc::new(Shared::new(id, address, config));
        let socket = connect_socket(&shared).await?;
        let (reader, writer) = socket.into_split();
        *shared.writer.lock().await = Some(writer);
        shared.set_state(ConnectionState::Startup);

        let strategy = shared.config.effective_buffering().strategy();

        let mut tasks = vec![tokio::spawn(read_loop(Arc::clone(&shared), reader, strategy))];
        if let Some(timeout) = shared.idle.timeout() {
            tasks.push(tokio::spawn(idle::watchdog(
                Arc::downgrade(&shared),
                shared.idle.subscribe(),
                shared.shutdown.subscribe(),
                timeout,
            )));
        }

        let connection = Self { shared, tasks };
        if let Err(error) = handshake::run(&connection, keyspace).await {
            debug!(connection = id, %address, %error, "Handshake failed");
            connection.shared.defunct(error.clone(), false);
            return Err(error);
        }
        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.shared.config.protocol_version
    }

    pub fn compressor(&self) -> Option<&dyn Compressor> {
        self.shared.config.compressor.as_deref()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Requests waiting for a response
    pub fn in_flight(&self) -> usize {
        self.shared.streams.lock().in_flight()
    }

    /// Requests written since the connection opened
    pub fn total_requests(&self) -> u64 {
        self.shared.total_requests.load(Ordering::Relaxed)
    }

    /// Keyspace the connection last switched to
    pub fn keyspace(&self) -> Option<String> {
        self.shared.keyspace.lock().clone()
    }

    /// The fault that made the connection defunct, if any
    pub fn defunct_cause(&self) -> Option<ConnectionError> {
        self.shared.defunct_cause.lock().clone()
    }

    /// Write a request and return the operation its response completes.
    ///
    /// Fails straight away when no stream id is free or the connection is
    /// not ready. A failed write still returns the operation; it completes
    /// with the write error.
    pub async fn issue(
        &self,
        request: SerializedRequest,
    ) -> Result<PendingOperation<Frame, ConnectionError>, ConnectionError> {
        match self.state() {
            ConnectionState::Ready => self.write_request(request).await,
            ConnectionState::Defunct => Err(self.shared.cause()),
            state => Err(ConnectionError::NotReady(state)),
        }
    }

    async fn write_request(
        &self,
        mut request: SerializedRequest,
    ) -> Result<PendingOperation<Frame, ConnectionError>, ConnectionError> {
        let shared = &*self.shared;
        let mut shutdown = shared.shutdown.subscribe();
        let mut writer = tokio::select! {
            writer = shared.writer.lock() => writer,
            () = shutdown_signal(&mut shutdown) => return Err(shared.cause()),
        };
        let Some(half) = writer.as_mut() else {
            return Err(shared.cause());
        };

        let (completer, pending) = pending_operation();
        let allocated = shared.streams.lock().allocate(completer.clone());
        let stream_id = match allocated {
            Ok(id) => id,
            Err(AllocError::Exhausted) => return Err(ConnectionError::StreamsExhausted),
            Err(AllocError::Closed) => {
                writer.take();
                return Err(shared.cause());
            }
        };
        request.set_stream(stream_id);
        trace!(connection = shared.id, stream_id, opcode = ?request.opcode(), "Request");

        shared.idle.arm();
        let mut guard = WriteGuard {
            shared,
            armed: true,
        };
        let written = tokio::select! {
            written = half.write_all(request.as_bytes()) => Some(written),
            () = shutdown_signal(&mut shutdown) => None,
        };
        guard.armed = false;
        let Some(written) = written else {
            // Torn down mid-write; defunct already failed this stream id
            writer.take();
            trace!(connection = shared.id, stream_id, "Write abandoned on shutdown");
            return Err(shared.cause());
        };
        drop(writer);

        shared.total_requests.fetch_add(1, Ordering::Relaxed);
        if let Err(error) = written {
            let error = ConnectionError::from(error);
            if let Some(completer) = shared.streams.lock().release(stream_id) {
                completer.complete_inline(Err(error.clone()));
            }
            shared.defunct(error, true);
        }
        Ok(pending)
    }

    /// Issue a request and decode its response.
    ///
    /// ERROR responses come back as [`Response::Error`]; only transport
    /// and framing faults are errors here.
    pub async fn request(&self, request: SerializedRequest) -> Result<Response, ConnectionError> {
        let pending = self.issue(request).await?;
        self.await_response(pending).await
    }

    async fn await_response(
        &self,
        pending: PendingOperation<Frame, ConnectionError>,
    ) -> Result<Response, ConnectionError> {
        let frame = pending.wait().await?;
        let (header, body) = match frame.into_body(self.compressor()).await {
            Ok(decoded) => decoded,
            Err(error) => {
                return Err(self.defunct_cause().unwrap_or(ConnectionError::Protocol(error)));
            }
        };
        Ok(Response::decode(header.opcode, body)?)
    }

    /// Serialize and send a request
    pub async fn send(&self, request: &Request) -> Result<Response, ConnectionError> {
        let serialized = request.serialize(self.protocol_version(), self.compressor())?;
        self.request(serialized).await
    }

    /// Request/response without the ready check, for the handshake
    async fn exchange(&self, request: &Request) -> Result<Response, ConnectionError> {
        if let Some(cause) = self.defunct_cause() {
            return Err(cause);
        }
        let serialized = request.serialize(self.protocol_version(), self.compressor())?;
        let pending = self.write_request(serialized).await?;
        self.await_response(pending).await
    }

    /// OPTIONS, returning the SUPPORTED map
    pub async fn options(
        &self,
    ) -> Result<std::collections::HashMap<String, Vec<String>>, ConnectionError> {
        match self.send(&Request::Options).await? {
            Response::Supported(options) => Ok(options),
            Response::Error(error) => Err(ConnectionError::Server(error)),
            other => Err(ConnectionError::UnexpectedResponse(other.kind())),
        }
    }

    /// Subscribe this connection to server push events
    pub async fn register(&self, events: &[EventType]) -> Result<(), ConnectionError> {
        match self.send(&Request::Register(events.to_vec())).await? {
            Response::Ready => Ok(()),
            Response::Error(error) => Err(ConnectionError::Server(error)),
            other => Err(ConnectionError::UnexpectedResponse(other.kind())),
        }
    }

    /// Run `USE <keyspace>` on this connection
    pub async fn set_keyspace(&self, keyspace: &str) -> Result<(), ConnectionError> {
        let request = Request::Query {
            cql: format!("USE {keyspace}"),
            params: QueryParameters::with_consistency(Consistency::One),
        };
        let serialized = request.serialize(self.protocol_version(), self.compressor())?;
        let pending = self.write_request(serialized).await?;
        match self.await_response(pending).await? {
            Response::Result(ResultBody::SetKeyspace(_)) => {
                *self.shared.keyspace.lock() = Some(keyspace.to_string());
                debug!(connection = self.id(), keyspace, "Keyspace set");
                Ok(())
            }
            Response::Error(error) => Err(ConnectionError::Server(error)),
            other => Err(ConnectionError::UnexpectedResponse(other.kind())),
        }
    }

    /// Switch keyspace if the connection is not already on `keyspace`
    pub async fn ensure_keyspace(&self, keyspace: Option<&str>) -> Result<(), ConnectionError> {
        let Some(keyspace) = keyspace else {
            return Ok(());
        };
        if self.shared.keyspace.lock().as_deref() == Some(keyspace) {
            return Ok(());
        }
        self.set_keyspace(keyspace).await
    }

    /// Fail pending operations with [`ConnectionError::Closed`] and shut
    /// the socket down. The observer is not told.
    pub async fn close(&self) {
        self.shared.defunct(ConnectionError::Closed, false);
        // Writers release the lock as soon as they see the shutdown
        let half = self.shared.writer.lock().await.take();
        if let Some(mut half) = half
            && let Err(error) = half.shutdown().await
        {
            trace!(connection = self.id(), %error, "Socket shutdown failed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.defunct(ConnectionError::Closed, false);
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    mut strategy: Box<dyn BufferingStrategy>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut buf = Vec::new();

    let cause = loop {
        let hint = strategy.read_hint().max(1);
        buf.resize(hint, 0);
        let read = tokio::select! {
            read = reader.read(&mut buf[..hint]) => read,
            () = shutdown_signal(&mut shutdown) => break None,
        };
        let n = match read {
            Ok(0) => break Some(ConnectionError::Closed),
            Ok(n) => n,
            Err(error) => break Some(ConnectionError::from(error)),
        };
        shared.idle.disarm();

        let mut failure = None;
        for frame in strategy.process(&buf[..n]) {
            match frame {
                Ok(frame) => shared.dispatch(frame),
                Err(error) => {
                    failure = Some(ConnectionError::Protocol(error));
                    break;
                }
            }
        }
        if failure.is_some() {
            break failure;
        }
        if shared.streams.lock().in_flight() > 0 {
            shared.idle.arm();
        }

        if let Some(barrier) = strategy.drain_barrier() {
            tokio::select! {
                () = barrier.wait() => {}
                () = shutdown_signal(&mut shutdown) => break None,
            }
        }
    };

    if let Some(aborted) = strategy.close() {
        debug!(connection = shared.id, error = %aborted, "Partial frame discarded");
    }
    if let Some(cause) = cause {
        shared.defunct(cause, true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn shared_for(address: SocketAddr) -> Shared {
        Shared::new(1, address, Arc::new(ConnectionConfig::default()))
    }

    #[tokio::test]
    async fn test_connect_passes_through_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shared = shared_for(listener.local_addr().unwrap());
        assert_eq!(shared.state(), ConnectionState::Disconnected);

        let _socket = connect_socket(&shared).await.unwrap();
        assert_eq!(shared.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_refused_connect_stays_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let shared = shared_for(address);
        assert!(matches!(
            connect_socket(&shared).await,
            Err(ConnectionError::Io(_))
        ));
        assert_eq!(shared.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_defunct_is_terminal() {
        let shared = shared_for("127.0.0.1:9042".parse().unwrap());
        shared.set_state(ConnectionState::Startup);
        shared.defunct(ConnectionError::Closed, false);
        shared.set_state(ConnectionState::Ready);
        assert_eq!(shared.state(), ConnectionState::Defunct);
        assert!(matches!(shared.cause(), ConnectionError::Closed));
    }
}
