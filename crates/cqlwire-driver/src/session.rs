//! Session: the entry point for executing statements
//!
//! A session resolves its contact points into hosts, keeps one control
//! connection registered for server events, and lazily builds a connection
//! pool per host as requests are routed to it.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use cqlwire_frame::{Compressor, Event, EventType, Lz4Compressor, ResultBody, StatusChange, TopologyChange};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, PlainTextAuthProvider};
use crate::config::{ClusterConfig, CompressionKind};
use crate::connection::{Connection, ConnectionConfig, ConnectionObserver, EventHandler};
use crate::error::{ConfigError, ConnectionError, DriverError, Result};
use crate::execution::{self, QueryResult, Work};
use crate::host::{Host, HostDistance, HostRegistry};
use crate::policies::{
    DefaultRetryPolicy, ExponentialReconnectionPolicy, LoadBalancingPolicy, ReconnectionPolicy,
    RetryPolicy, RoundRobinPolicy,
};
use crate::pool::HostConnectionPool;
use crate::statement::{PreparedStatement, Statement};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Policies a session consults
#[derive(Debug, Clone)]
pub struct Policies {
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry: Arc<dyn RetryPolicy>,
    pub reconnection: Arc<dyn ReconnectionPolicy>,
}

impl Policies {
    /// Round robin (datacenter aware if configured), default retries and
    /// jittered exponential reconnection, all drawing from one generator
    /// seeded from `rng_seed` when set
    pub fn from_config(config: &ClusterConfig) -> Self {
        let seed = config.rng_seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut load_balancing = RoundRobinPolicy::new(&mut rng);
        if let Some(dc) = &config.local_datacenter {
            load_balancing = load_balancing.with_local_dc(dc, config.used_hosts_per_remote_dc);
        }
        let reconnection = ExponentialReconnectionPolicy::new(
            config.reconnection.base_delay,
            config.reconnection.max_delay,
        )
        .with_jitter(Arc::new(Mutex::new(rng)));

        Self {
            load_balancing: Arc::new(load_balancing),
            retry: Arc::new(DefaultRetryPolicy),
            reconnection: Arc::new(reconnection),
        }
    }
}

pub(crate) struct SessionInner {
    pub(crate) config: ClusterConfig,
    pub(crate) policies: Policies,
    pub(crate) hosts: Arc<HostRegistry>,
    connection_config: Arc<ConnectionConfig>,
    pools: DashMap<SocketAddr, Arc<HostConnectionPool>>,
    keyspace: RwLock<Option<String>>,
    prepared: DashMap<Bytes, Arc<PreparedStatement>>,
    control: tokio::sync::Mutex<Option<Connection>>,
    reconnecting_control: AtomicBool,
    events: broadcast::Sender<Event>,
    closed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn keyspace(&self) -> Option<String> {
        self.keyspace.read().clone()
    }

    /// Pool for `host`, created on first use
    pub(crate) fn pool(&self, host: &Arc<Host>, distance: HostDistance) -> Option<Arc<HostConnectionPool>> {
        if let Some(pool) = self.pools.get(&host.address()) {
            return Some(Arc::clone(pool.value()));
        }
        let options = self.config.pooling.for_distance(distance)?;
        let entry = self.pools.entry(host.address()).or_insert_with(|| {
            debug!(host = %host, ?distance, "Creating pool");
            Arc::new(HostConnectionPool::new(
                Arc::clone(host),
                distance,
                options,
                Arc::clone(&self.connection_config),
            ))
        });
        Some(Arc::clone(entry.value()))
    }

    pub(crate) fn prepared(&self, id: &Bytes) -> Option<Arc<PreparedStatement>> {
        self.prepared.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn cache_prepared(&self, prepared: Arc<PreparedStatement>) {
        self.prepared.insert(prepared.id().clone(), prepared);
    }

    fn host_address(&self, address: SocketAddr) -> SocketAddr {
        SocketAddr::new(address.ip(), self.config.port)
    }

    /// Hosts an event address refers to: the exact address if known,
    /// otherwise every host on that IP
    fn hosts_for(&self, address: SocketAddr) -> Vec<Arc<Host>> {
        match self.hosts.get(address) {
            Some(host) => vec![host],
            None => self.hosts.find_by_ip(address.ip()),
        }
    }

    fn remove_host(&self, address: SocketAddr) {
        for host in self.hosts_for(address) {
            self.hosts.remove(host.address());
            if let Some((_, pool)) = self.pools.remove(&host.address()) {
                tokio::spawn(async move { pool.shutdown().await });
            }
            info!(host = %host, "Host removed");
        }
    }

    fn on_event(&self, event: &Event) {
        match event {
            Event::StatusChange {
                change: StatusChange::Up,
                address,
            } => {
                let hosts = self.hosts_for(*address);
                if hosts.is_empty() {
                    self.hosts.add(self.host_address(*address));
                }
                for host in hosts {
                    host.bring_up();
                }
            }
            Event::StatusChange {
                change: StatusChange::Down,
                address,
            } => {
                for host in self.hosts_for(*address) {
                    host.set_down();
                }
            }
            Event::TopologyChange {
                change: TopologyChange::NewNode,
                address,
            } => {
                if !self.hosts_for(*address).is_empty() {
                    return;
                }
                let (host, added) = self.hosts.add(self.host_address(*address));
                if added {
                    info!(host = %host, "Host added");
                }
            }
            Event::TopologyChange {
                change: TopologyChange::RemovedNode,
                address,
            } => self.remove_host(*address),
            Event::TopologyChange {
                change: TopologyChange::MovedNode,
                ..
            }
            | Event::SchemaChange { .. } => {}
        }
    }
}

/// Applies control-connection events to the session
struct ClusterEventHandler {
    session: Weak<SessionInner>,
}

impl EventHandler for ClusterEventHandler {
    fn on_event(&self, event: Event) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.on_event(&event);
        // No subscribers is fine
        let _ = session.events.send(event);
    }
}

/// Marks a host down when one of its connections fails
struct HostFailureObserver {
    hosts: Weak<HostRegistry>,
}

impl ConnectionObserver for HostFailureObserver {
    fn on_defunct(&self, address: SocketAddr, error: &ConnectionError) {
        let Some(hosts) = self.hosts.upgrade() else {
            return;
        };
        if let Some(host) = hosts.get(address) {
            debug!(host = %host, %error, "Connection failure reported");
            host.set_down();
        }
    }
}

/// Handle to a connected session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Connect with policies derived from `config`
    pub async fn connect(config: ClusterConfig) -> Result<Self> {
        let policies = Policies::from_config(&config);
        Self::connect_with(config, policies, None).await
    }

    /// Connect with explicit policies and an optional auth provider
    /// overriding the configured credentials
    pub async fn connect_with(
        config: ClusterConfig,
        policies: Policies,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        let contact_points = resolve_contact_points(&config).await?;

        let hosts = Arc::new(HostRegistry::new(Arc::clone(&policies.reconnection)));
        for address in &contact_points {
            hosts.add(*address);
        }

        let auth = auth.or_else(|| {
            config.credentials.as_ref().map(|c| {
                Arc::new(PlainTextAuthProvider::new(&c.username, &c.password)) as Arc<dyn AuthProvider>
            })
        });
        let compressor: Option<Arc<dyn Compressor>> = match config.compression {
            CompressionKind::None => None,
            CompressionKind::Lz4 => Some(Arc::new(Lz4Compressor)),
        };
        let connection_config = Arc::new(ConnectionConfig {
            protocol_version: config.protocol_version,
            cql_version: config.cql_version.clone(),
            compressor,
            buffering: config.buffering,
            connect_timeout: config.socket.connect_timeout,
            idle_timeout: config.socket.idle_timeout,
            tcp_nodelay: config.socket.tcp_nodelay,
            auth,
            event_handler: None,
            observer: Some(Arc::new(HostFailureObserver {
                hosts: Arc::downgrade(&hosts),
            })),
        });

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(SessionInner {
            keyspace: RwLock::new(config.keyspace.clone()),
            config,
            policies,
            hosts,
            connection_config,
            pools: DashMap::new(),
            prepared: DashMap::new(),
            control: tokio::sync::Mutex::new(None),
            reconnecting_control: AtomicBool::new(false),
            events,
            closed: AtomicBool::new(false),
        });

        let control = open_control(&inner, &contact_points).await?;
        *inner.control.lock().await = Some(control);
        info!(hosts = inner.hosts.len(), "Session connected");
        Ok(Self { inner })
    }

    /// Run a statement, failing over across hosts as needed
    pub async fn execute(&self, statement: &Statement) -> Result<QueryResult> {
        self.check_open()?;
        self.maybe_reconnect_control();
        execution::execute(&self.inner, Work::Statement(statement)).await
    }

    pub async fn query(&self, cql: impl Into<String>) -> Result<QueryResult> {
        self.execute(&Statement::new(cql)).await
    }

    /// Prepare `cql` and cache it for transparent re-preparation
    pub async fn prepare(&self, cql: &str) -> Result<Arc<PreparedStatement>> {
        self.check_open()?;
        let result = execution::execute(&self.inner, Work::Prepare(cql)).await?;
        execution::prepared_from_result(&self.inner, cql, result.body)
    }

    /// Switch every connection of the session to `keyspace`
    pub async fn use_keyspace(&self, keyspace: &str) -> Result<()> {
        let result = self.query(format!("USE {keyspace}")).await?;
        match result.body {
            ResultBody::SetKeyspace(_) => {
                *self.inner.keyspace.write() = Some(keyspace.to_string());
                Ok(())
            }
            _ => Err(DriverError::UnexpectedResponse("RESULT")),
        }
    }

    pub fn keyspace(&self) -> Option<String> {
        self.inner.keyspace()
    }

    /// Server events seen by the control connection
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.inner.hosts.all()
    }

    /// Pool for the host at `address`, if one has been created
    pub fn pool(&self, address: SocketAddr) -> Option<Arc<HostConnectionPool>> {
        self.inner.pools.get(&address).map(|entry| Arc::clone(entry.value()))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Close the control connection and every pool
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(control) = self.inner.control.lock().await.take() {
            control.close().await;
        }
        let pools: Vec<_> = self
            .inner
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.pools.clear();
        for pool in pools {
            pool.shutdown().await;
        }
        info!("Session shut down");
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(DriverError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Replace a dead control connection in the background
    fn maybe_reconnect_control(&self) {
        if let Ok(control) = self.inner.control.try_lock()
            && control.as_ref().is_some_and(Connection::is_healthy)
        {
            return;
        }
        if self.inner.reconnecting_control.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut control = inner.control.lock().await;
            let healthy = control.as_ref().is_some_and(Connection::is_healthy);
            if !healthy && !inner.closed.load(Ordering::Acquire) {
                let candidates: Vec<_> = inner
                    .hosts
                    .all()
                    .iter()
                    .filter(|host| host.is_considered_up())
                    .map(|host| host.address())
                    .collect();
                match open_control(&inner, &candidates).await {
                    Ok(connection) => *control = Some(connection),
                    Err(error) => debug!(%error, "Control connection still down"),
                }
            }
            drop(control);
            inner.reconnecting_control.store(false, Ordering::Release);
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("hosts", &self.inner.hosts.len())
            .field("keyspace", &self.inner.keyspace())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Open the control connection on the first reachable candidate
async fn open_control(inner: &Arc<SessionInner>, candidates: &[SocketAddr]) -> Result<Connection> {
    let mut config = (*inner.connection_config).clone();
    config.event_handler = Some(Arc::new(ClusterEventHandler {
        session: Arc::downgrade(inner),
    }));
    let config = Arc::new(config);

    let mut errors = std::collections::HashMap::new();
    for &address in candidates {
        let opened = Connection::open(address, Arc::clone(&config), None).await;
        let connection = match opened {
            Ok(connection) => connection,
            Err(error) => {
                warn!(%address, %error, "Control connection failed");
                if let Some(host) = inner.hosts.get(address) {
                    host.set_down();
                }
                errors.insert(address, DriverError::from(error));
                continue;
            }
        };
        if inner.config.register_events
            && let Err(error) = connection.register(&EventType::ALL).await
        {
            warn!(%address, %error, "Event registration failed");
            errors.insert(address, DriverError::from(error));
            continue;
        }
        if let Some(host) = inner.hosts.get(address) {
            host.bring_up();
        }
        debug!(%address, "Control connection established");
        return Ok(connection);
    }
    Err(DriverError::NoHostAvailable { errors })
}

/// Resolve configured contact points, applying the default port
async fn resolve_contact_points(config: &ClusterConfig) -> Result<Vec<SocketAddr>> {
    let mut resolved = Vec::new();
    for point in &config.contact_points {
        let target = if let Ok(ip) = point.parse::<IpAddr>() {
            SocketAddr::new(ip, config.port).to_string()
        } else if point.parse::<SocketAddr>().is_ok() || has_port(point) {
            point.clone()
        } else {
            format!("{point}:{}", config.port)
        };
        match tokio::net::lookup_host(&target).await {
            Ok(addresses) => {
                for address in addresses {
                    if !resolved.contains(&address) {
                        resolved.push(address);
                    }
                }
            }
            Err(error) => warn!(contact_point = %point, %error, "Cannot resolve contact point"),
        }
    }
    if resolved.is_empty() {
        return Err(ConfigError::InvalidContactPoint(config.contact_points.join(",")).into());
    }
    Ok(resolved)
}

/// `host:port` with a numeric port, IPv6 literals excluded unless bracketed
fn has_port(point: &str) -> bool {
    match point.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.starts_with('['))
        }
        None => false,
    }
}

/// Builder for [`Session`]
#[derive(Default)]
pub struct SessionBuilder {
    config: ClusterConfig,
    load_balancing: Option<Arc<dyn LoadBalancingPolicy>>,
    retry: Option<Arc<dyn RetryPolicy>>,
    reconnection: Option<Arc<dyn ReconnectionPolicy>>,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl SessionBuilder {
    #[must_use]
    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn contact_point(mut self, point: impl Into<String>) -> Self {
        self.config.contact_points.push(point.into());
        self
    }

    #[must_use]
    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.config.keyspace = Some(keyspace.into());
        self
    }

    #[must_use]
    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.load_balancing = Some(policy);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.reconnection = Some(policy);
        self
    }

    #[must_use]
    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    pub async fn connect(self) -> Result<Session> {
        let defaults = Policies::from_config(&self.config);
        let policies = Policies {
            load_balancing: self.load_balancing.unwrap_or(defaults.load_balancing),
            retry: self.retry.unwrap_or(defaults.retry),
            reconnection: self.reconnection.unwrap_or(defaults.reconnection),
        };
        Session::connect_with(self.config, policies, self.auth).await
    }
}
