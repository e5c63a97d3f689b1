//! Error types for the driver

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cqlwire_frame::{FrameError, ServerError};
use thiserror::Error;

use crate::connection::ConnectionState;
use crate::pending::Abandoned;

/// Transport-level failures.
///
/// All of these mean "this connection or host is unusable right now". They
/// drive failover to the next host and only reach the caller inside
/// [`DriverError::NoHostAvailable`]. Cloneable so that one fault can complete
/// every operation pending on the connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("No response within idle timeout of {0:?}")]
    IdleTimeout(Duration),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("All stream ids are in use")]
    StreamsExhausted,

    #[error("Connection is {0:?}, not ready for requests")]
    NotReady(ConnectionState),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server answered STARTUP with an ERROR
    #[error("Startup rejected: {0}")]
    Startup(ServerError),

    #[error("Unexpected {0} response")]
    UnexpectedResponse(&'static str),

    /// Error returned by the server for a connection-scoped request such
    /// as `USE <keyspace>`
    #[error("{0}")]
    Server(ServerError),
}

impl ConnectionError {
    /// The handshake was refused, so retrying the same host will not help
    pub const fn is_authentication_error(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::Startup(_))
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl From<Abandoned> for ConnectionError {
    fn from(_: Abandoned) -> Self {
        Self::Closed
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("No contact points configured")]
    NoContactPoints,

    #[error("Invalid contact point '{0}'")]
    InvalidContactPoint(String),

    #[error("Compression requires buffered framing")]
    CompressionRequiresBuffering,

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

/// Errors surfaced to callers of the session
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("{0}")]
    Server(#[from] ServerError),

    /// Every candidate host failed. Carries the error recorded per host.
    #[error("No host available ({} tried)", .errors.len())]
    NoHostAvailable {
        errors: HashMap<SocketAddr, DriverError>,
    },

    /// Final error from the last host tried, with the failures recorded
    /// against the hosts tried before it
    #[error("{error}")]
    Query {
        error: Box<DriverError>,
        errors: HashMap<SocketAddr, DriverError>,
    },

    #[error("Unexpected {0} response")]
    UnexpectedResponse(&'static str),

    #[error("Codec error: {0}")]
    Codec(#[from] FrameError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session is shut down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Whether the error came from the transport rather than the server
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Server(e) => Some(e),
            Self::Query { error, .. } => error.as_server_error(),
            _ => None,
        }
    }

    /// Per-host failures gathered while the request moved between hosts
    pub fn host_errors(&self) -> Option<&HashMap<SocketAddr, DriverError>> {
        match self {
            Self::NoHostAvailable { errors } | Self::Query { errors, .. } => Some(errors),
            _ => None,
        }
    }
}

impl From<Abandoned> for DriverError {
    fn from(abandoned: Abandoned) -> Self {
        Self::Internal(abandoned.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
