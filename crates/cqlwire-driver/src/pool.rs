//! Per-host connection pools
//!
//! A pool grows from its core size up to its max when every connection is
//! busy, and sheds lightly loaded connections back towards core. Shed
//! connections go to a trash list and are closed only once nothing is in
//! flight on them and nobody else holds them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ConnectionError;
use crate::host::{Host, HostDistance};

/// Pool sizing for one host distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistancePooling {
    pub core_connections: usize,
    pub max_connections: usize,
    /// Connections below this load are candidates for trashing
    pub min_simultaneous_requests: usize,
    /// Connections at or above this load count as busy
    pub max_simultaneous_requests: usize,
}

/// Pool sizing per host distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingOptions {
    pub local: DistancePooling,
    pub remote: DistancePooling,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self {
            local: DistancePooling {
                core_connections: 2,
                max_connections: 8,
                min_simultaneous_requests: 25,
                max_simultaneous_requests: 100,
            },
            remote: DistancePooling {
                core_connections: 1,
                max_connections: 2,
                min_simultaneous_requests: 25,
                max_simultaneous_requests: 100,
            },
        }
    }
}

impl PoolingOptions {
    /// Sizing for `distance`; ignored hosts get no pool
    pub fn for_distance(&self, distance: HostDistance) -> Option<DistancePooling> {
        match distance {
            HostDistance::Local => Some(self.local),
            HostDistance::Remote => Some(self.remote),
            HostDistance::Ignored => None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, pooling) in [("local", &self.local), ("remote", &self.remote)] {
            if pooling.max_connections == 0 {
                return Err(format!("{name} max_connections must be greater than 0"));
            }
            if pooling.core_connections > pooling.max_connections {
                return Err(format!("{name} core_connections exceeds max_connections"));
            }
            if pooling.max_simultaneous_requests == 0 {
                return Err(format!("{name} max_simultaneous_requests must be greater than 0"));
            }
            if pooling.min_simultaneous_requests > pooling.max_simultaneous_requests {
                return Err(format!(
                    "{name} min_simultaneous_requests exceeds max_simultaneous_requests"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    trash: Vec<Arc<Connection>>,
    closed: bool,
}

impl PoolState {
    /// Drop dead connections and close drained trash
    fn prune(&mut self) {
        self.connections.retain(|c| c.is_healthy());
        let mut kept = Vec::with_capacity(self.trash.len());
        for connection in self.trash.drain(..) {
            if !connection.is_healthy() {
                continue;
            }
            if connection.in_flight() == 0 && Arc::strong_count(&connection) == 1 {
                trace!(connection = connection.id(), "Closing drained trashed connection");
                tokio::spawn(async move { connection.close().await });
            } else {
                kept.push(connection);
            }
        }
        self.trash = kept;
    }

    fn least_loaded(&self) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .min_by_key(|c| c.in_flight())
            .map(Arc::clone)
    }
}

/// Connections to one host
#[derive(Debug)]
pub struct HostConnectionPool {
    host: Arc<Host>,
    distance: HostDistance,
    options: DistancePooling,
    config: Arc<ConnectionConfig>,
    state: Mutex<PoolState>,
}

impl HostConnectionPool {
    pub fn new(
        host: Arc<Host>,
        distance: HostDistance,
        options: DistancePooling,
        config: Arc<ConnectionConfig>,
    ) -> Self {
        Self {
            host,
            distance,
            options,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn distance(&self) -> HostDistance {
        self.distance
    }

    /// Pick a connection, opening one if all are busy and there is room.
    ///
    /// A failed open marks the host down when the pool has nothing else
    /// to offer; the caller moves on to the next host.
    pub async fn acquire(&self, keyspace: Option<&str>) -> Result<Arc<Connection>, ConnectionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        state.prune();

        let least = state.least_loaded();
        if let Some(connection) = &least
            && connection.in_flight() < self.options.max_simultaneous_requests
        {
            self.shed_idle(&mut state, connection);
            return Ok(Arc::clone(connection));
        }

        if state.connections.len() < self.options.max_connections {
            if let Some(position) = state.trash.iter().position(|c| c.is_healthy()) {
                let connection = state.trash.swap_remove(position);
                debug!(host = %self.host, connection = connection.id(), "Reusing trashed connection");
                state.connections.push(Arc::clone(&connection));
                return Ok(connection);
            }

            match self.open(keyspace).await {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    state.connections.push(Arc::clone(&connection));
                    debug!(
                        host = %self.host,
                        size = state.connections.len(),
                        "Pool grew"
                    );
                    return Ok(connection);
                }
                Err(error) => {
                    if state.connections.is_empty() {
                        self.host.set_down();
                    }
                    return Err(error);
                }
            }
        }

        least.ok_or(ConnectionError::Closed)
    }

    /// Move one lightly loaded connection to the trash while above core size
    fn shed_idle(&self, state: &mut PoolState, chosen: &Arc<Connection>) {
        if state.connections.len() <= self.options.core_connections {
            return;
        }
        let candidate = state.connections.iter().position(|c| {
            !Arc::ptr_eq(c, chosen) && c.in_flight() < self.options.min_simultaneous_requests
        });
        if let Some(position) = candidate {
            let connection = state.connections.swap_remove(position);
            debug!(host = %self.host, connection = connection.id(), "Trashing idle connection");
            state.trash.push(connection);
        }
    }

    /// Open a connection, trying up to `core_connections` times
    async fn open(&self, keyspace: Option<&str>) -> Result<Connection, ConnectionError> {
        let attempts = self.options.core_connections.max(1);
        let mut last_error = ConnectionError::Closed;
        for attempt in 1..=attempts {
            match Connection::open(self.host.address(), Arc::clone(&self.config), keyspace).await {
                Ok(connection) => {
                    self.host.bring_up();
                    return Ok(connection);
                }
                Err(error @ ConnectionError::Server(_)) => return Err(error),
                Err(error) if error.is_authentication_error() => return Err(error),
                Err(error) => {
                    debug!(host = %self.host, attempt, %error, "Connection attempt failed");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// Open connections up to core size. Returns how many are open.
    pub async fn warm_up(&self, keyspace: Option<&str>) -> Result<usize, ConnectionError> {
        let mut state = self.state.lock().await;
        state.prune();
        while state.connections.len() < self.options.core_connections {
            match Connection::open(self.host.address(), Arc::clone(&self.config), keyspace).await {
                Ok(connection) => {
                    self.host.bring_up();
                    state.connections.push(Arc::new(connection));
                }
                Err(error) => {
                    if state.connections.is_empty() {
                        self.host.set_down();
                        return Err(error);
                    }
                    break;
                }
            }
        }
        Ok(state.connections.len())
    }

    /// Close every connection and refuse further acquisitions
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        let mut connections = std::mem::take(&mut state.connections);
        connections.append(&mut state.trash);
        drop(state);
        for connection in connections {
            connection.close().await;
        }
        debug!(host = %self.host, "Pool shut down");
    }

    /// Live connections in service
    pub async fn open_connections(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn trashed_connections(&self) -> usize {
        self.state.lock().await.trash.len()
    }

    /// Requests in flight across the pool, trash included
    pub async fn in_flight(&self) -> usize {
        let state = self.state.lock().await;
        state
            .connections
            .iter()
            .chain(state.trash.iter())
            .map(|c| c.in_flight())
            .sum()
    }
}
