//! Cluster configuration
//!
//! Every section has sensible defaults. [`ClusterConfig::from_env`] reads
//! `CQLWIRE_*` variables over the defaults, and two named profiles tune the
//! socket and pool settings for common workloads.

use std::fmt;
use std::time::Duration;

use cqlwire_frame::{BufferingMode, Consistency, ProtocolVersion};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pool::PoolingOptions;

/// Body compression negotiated with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    #[default]
    None,
    Lz4,
}

impl std::str::FromStr for CompressionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            other => Err(format!("unknown compression '{other}'")),
        }
    }
}

/// Socket level settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    pub connect_timeout: Duration,
    /// Abort a connection whose written requests see no bytes back for
    /// this long. `None` disables the timer.
    pub idle_timeout: Option<Duration>,
    pub tcp_nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(12)),
            tcp_nodelay: true,
        }
    }
}

/// Defaults applied to statements that do not set their own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub consistency: Consistency,
    /// Result page size for protocol v2. `None` fetches everything.
    pub page_size: Option<i32>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            consistency: Consistency::One,
            page_size: Some(5000),
        }
    }
}

/// Delays between reconnection attempts to a down host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectionOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
        }
    }
}

/// Username and password for PLAIN authentication
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a session needs to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// `host`, `host:port` or IP literals
    pub contact_points: Vec<String>,
    /// Port used for contact points without one and for discovered hosts
    pub port: u16,
    pub protocol_version: ProtocolVersion,
    pub cql_version: String,
    pub compression: CompressionKind,
    pub buffering: BufferingMode,
    pub pooling: PoolingOptions,
    pub socket: SocketOptions,
    pub query: QueryOptions,
    pub reconnection: ReconnectionOptions,
    pub keyspace: Option<String>,
    pub credentials: Option<Credentials>,
    /// Subscribe the control connection to topology, status and schema events
    pub register_events: bool,
    /// Seed for load-balancing offsets and reconnection jitter
    pub rng_seed: Option<u64>,
    pub local_datacenter: Option<String>,
    pub used_hosts_per_remote_dc: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            contact_points: Vec::new(),
            port: 9042,
            protocol_version: ProtocolVersion::V2,
            cql_version: "3.0.0".to_string(),
            compression: CompressionKind::None,
            buffering: BufferingMode::Streaming,
            pooling: PoolingOptions::default(),
            socket: SocketOptions::default(),
            query: QueryOptions::default(),
            reconnection: ReconnectionOptions::default(),
            keyspace: None,
            credentials: None,
            register_events: true,
            rng_seed: None,
            local_datacenter: None,
            used_hosts_per_remote_dc: 0,
        }
    }
}

fn env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl ClusterConfig {
    pub fn new(contact_points: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            contact_points: contact_points.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `CQLWIRE_*` environment variables.
    ///
    /// Unset or unparseable variables keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let socket = SocketOptions {
            connect_timeout: env::<u64>("CQLWIRE_CONNECT_TIMEOUT_MS")
                .map_or(defaults.socket.connect_timeout, Duration::from_millis),
            idle_timeout: match env::<u64>("CQLWIRE_IDLE_TIMEOUT_MS") {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.socket.idle_timeout,
            },
            tcp_nodelay: env("CQLWIRE_TCP_NODELAY").unwrap_or(defaults.socket.tcp_nodelay),
        };
        let query = QueryOptions {
            consistency: env("CQLWIRE_CONSISTENCY").unwrap_or(defaults.query.consistency),
            page_size: match env::<i32>("CQLWIRE_PAGE_SIZE") {
                Some(size) if size <= 0 => None,
                Some(size) => Some(size),
                None => defaults.query.page_size,
            },
        };
        let credentials = match (
            std::env::var("CQLWIRE_USERNAME").ok(),
            std::env::var("CQLWIRE_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        Self {
            contact_points: std::env::var("CQLWIRE_CONTACT_POINTS")
                .ok()
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.contact_points),
            port: env("CQLWIRE_PORT").unwrap_or(defaults.port),
            protocol_version: match env::<u8>("CQLWIRE_PROTOCOL_VERSION") {
                Some(1) => ProtocolVersion::V1,
                Some(2) => ProtocolVersion::V2,
                _ => defaults.protocol_version,
            },
            cql_version: std::env::var("CQLWIRE_CQL_VERSION").unwrap_or(defaults.cql_version),
            compression: env("CQLWIRE_COMPRESSION").unwrap_or(defaults.compression),
            buffering: env("CQLWIRE_BUFFERING").unwrap_or(defaults.buffering),
            pooling: defaults.pooling,
            socket,
            query,
            reconnection: defaults.reconnection,
            keyspace: std::env::var("CQLWIRE_KEYSPACE").ok(),
            credentials,
            register_events: env("CQLWIRE_REGISTER_EVENTS").unwrap_or(defaults.register_events),
            rng_seed: env("CQLWIRE_RNG_SEED"),
            local_datacenter: std::env::var("CQLWIRE_LOCAL_DC").ok(),
            used_hosts_per_remote_dc: env("CQLWIRE_USED_HOSTS_PER_REMOTE_DC")
                .unwrap_or(defaults.used_hosts_per_remote_dc),
        }
    }

    /// Named tuning profile: `default`, `low_latency` or `high_throughput`
    pub fn profile(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "low_latency" => Some(Self::low_latency()),
            "high_throughput" => Some(Self::high_throughput()),
            _ => None,
        }
    }

    /// Short timeouts, small pages, eager failover
    pub fn low_latency() -> Self {
        let mut config = Self::default();
        config.socket.connect_timeout = Duration::from_secs(1);
        config.socket.idle_timeout = Some(Duration::from_secs(2));
        config.query.page_size = Some(500);
        config.pooling.local.max_simultaneous_requests = 32;
        config.pooling.local.min_simultaneous_requests = 8;
        config.reconnection.base_delay = Duration::from_millis(250);
        config.reconnection.max_delay = Duration::from_secs(30);
        config
    }

    /// Larger pools and pages, compressed bodies
    pub fn high_throughput() -> Self {
        let mut config = Self::default();
        config.compression = CompressionKind::Lz4;
        config.buffering = BufferingMode::Buffered;
        config.socket.idle_timeout = Some(Duration::from_secs(30));
        config.query.page_size = Some(10_000);
        config.pooling.local.core_connections = 4;
        config.pooling.local.max_connections = 16;
        config.pooling.local.max_simultaneous_requests = 120;
        config
    }

    #[must_use]
    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.contact_points.is_empty() {
            return Err(ConfigError::NoContactPoints);
        }
        if let Some(point) = self.contact_points.iter().find(|p| p.trim().is_empty()) {
            return Err(ConfigError::InvalidContactPoint(point.clone()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.compression != CompressionKind::None && self.buffering != BufferingMode::Buffered {
            return Err(ConfigError::CompressionRequiresBuffering);
        }
        if self.socket.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "socket.connect_timeout",
                reason: "must be greater than 0".to_string(),
            });
        }
        if let Some(idle) = self.socket.idle_timeout
            && idle.is_zero()
        {
            return Err(ConfigError::InvalidValue {
                field: "socket.idle_timeout",
                reason: "must be greater than 0, or unset to disable".to_string(),
            });
        }
        if let Some(page_size) = self.query.page_size
            && page_size <= 0
        {
            return Err(ConfigError::InvalidValue {
                field: "query.page_size",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.reconnection.base_delay > self.reconnection.max_delay {
            return Err(ConfigError::InvalidValue {
                field: "reconnection.base_delay",
                reason: "exceeds reconnection.max_delay".to_string(),
            });
        }
        self.pooling
            .validate()
            .map_err(|reason| ConfigError::InvalidValue {
                field: "pooling",
                reason,
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.port, 9042);
        assert_eq!(config.protocol_version, ProtocolVersion::V2);
        assert_eq!(config.query.consistency, Consistency::One);
        assert!(config.register_events);
        assert_eq!(config.validate(), Err(ConfigError::NoContactPoints));
        assert!(ClusterConfig::new(["127.0.0.1"]).validate().is_ok());
    }

    #[test]
    fn test_compression_requires_buffering() {
        let mut config = ClusterConfig::new(["127.0.0.1"]);
        config.compression = CompressionKind::Lz4;
        assert_eq!(config.validate(), Err(ConfigError::CompressionRequiresBuffering));
        config.buffering = BufferingMode::Buffered;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_profiles_validate() {
        for name in ["default", "low_latency", "high_throughput"] {
            let mut config = ClusterConfig::profile(name).unwrap();
            config.contact_points.push("127.0.0.1".to_string());
            assert!(config.validate().is_ok(), "{name}");
        }
        assert!(ClusterConfig::profile("turbo").is_none());
    }

    #[test]
    fn test_invalid_pooling_reported() {
        let mut config = ClusterConfig::new(["127.0.0.1"]);
        config.pooling.local.core_connections = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "pooling", .. })
        ));
    }

    #[test]
    fn test_json_round_trip_with_partial_input() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{"contact_points": ["10.0.0.1"], "compression": "lz4", "buffering": "buffered",
                "query": {"consistency": "LOCAL_QUORUM"}}"#,
        )
        .unwrap();
        assert_eq!(config.compression, CompressionKind::Lz4);
        assert_eq!(config.query.consistency, Consistency::LocalQuorum);
        assert_eq!(config.query.page_size, Some(5000));
        assert_eq!(config.port, 9042);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ClusterConfig::new(["127.0.0.1"]).with_credentials("app", "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn test_compression_parse() {
        assert_eq!("LZ4".parse::<CompressionKind>(), Ok(CompressionKind::Lz4));
        assert!("snappy".parse::<CompressionKind>().is_err());
    }
}
