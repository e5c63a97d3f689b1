//! # cqlwire-driver
//!
//! Connection engine for the Cassandra native protocol (v1 and v2).
//!
//! ## Architecture
//!
//! - [`Connection`]: one TCP socket multiplexing up to 128 concurrent
//!   requests by stream id, with a background read loop, an idle watchdog
//!   and a STARTUP/authentication handshake
//! - [`HostConnectionPool`]: per-host pool that grows under load and sheds
//!   idle connections back to its core size
//! - [`Session`]: resolves contact points, keeps a control connection for
//!   server events and runs each statement along a load-balancing plan,
//!   consulting the retry policy on timeouts and re-preparing unknown
//!   prepared statements
//! - [`BlockingSession`]: synchronous facade for callers outside a runtime
//!
//! Framing and body codecs live in [`cqlwire_frame`], re-exported here.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cqlwire_driver::{ClusterConfig, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::connect(ClusterConfig::new(["127.0.0.1"])).await?;
//!     let result = session.query("SELECT release_version FROM system.local").await?;
//!     println!("served by {:?}", result.info.queried_host);
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod blocking;
pub mod config;
pub mod connection;
pub mod error;
pub mod execution;
pub mod host;
pub mod pending;
pub mod policies;
pub mod pool;
pub mod session;
pub mod statement;

pub use auth::{AuthProvider, Authenticator, PlainTextAuthProvider};
pub use blocking::BlockingSession;
pub use config::{
    ClusterConfig, CompressionKind, Credentials, QueryOptions, ReconnectionOptions,
    SocketOptions,
};
pub use connection::{
    Connection, ConnectionConfig, ConnectionObserver, ConnectionState, EventHandler,
};
pub use error::{ConfigError, ConnectionError, DriverError, Result};
pub use execution::{ExecutionInfo, QueryResult};
pub use host::{Host, HostDistance, HostRegistry};
pub use pending::{Abandoned, Completer, PendingOperation, pending_operation};
pub use policies::{
    ConstantReconnectionPolicy, DefaultRetryPolicy, DowngradingConsistencyRetryPolicy,
    ExponentialReconnectionPolicy, FallthroughRetryPolicy, LoadBalancingPolicy,
    LoggingRetryPolicy, ReconnectionPolicy, RetryDecision, RetryPolicy, RoundRobinPolicy,
};
pub use pool::{DistancePooling, HostConnectionPool, PoolingOptions};
pub use session::{Policies, Session, SessionBuilder};
pub use statement::{PreparedStatement, Statement, StatementKind};

pub use cqlwire_frame;
pub use cqlwire_frame::{Consistency, Event, EventType, ProtocolVersion, ResultBody};
