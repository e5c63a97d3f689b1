//! Cluster hosts and their up/down state

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::policies::{ReconnectionPolicy, ReconnectionSchedule};

/// How far a host is from the client, as judged by the load-balancing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostDistance {
    Local,
    Remote,
    /// Never queried
    Ignored,
}

#[derive(Debug, Default)]
struct Reconnection {
    schedule: Option<Box<dyn ReconnectionSchedule>>,
    next_attempt: Option<Instant>,
}

/// One node of the cluster
pub struct Host {
    address: SocketAddr,
    datacenter: RwLock<Option<String>>,
    rack: RwLock<Option<String>>,
    up: AtomicBool,
    reconnection: Mutex<Reconnection>,
    policy: Arc<dyn ReconnectionPolicy>,
}

impl Host {
    pub fn new(address: SocketAddr, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        Self {
            address,
            datacenter: RwLock::new(None),
            rack: RwLock::new(None),
            up: AtomicBool::new(true),
            reconnection: Mutex::new(Reconnection::default()),
            policy,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn datacenter(&self) -> Option<String> {
        self.datacenter.read().clone()
    }

    pub fn rack(&self) -> Option<String> {
        self.rack.read().clone()
    }

    pub fn set_location(&self, datacenter: Option<String>, rack: Option<String>) {
        *self.datacenter.write() = datacenter;
        *self.rack.write() = rack;
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Up, or down with its next reconnection attempt due
    pub fn is_considered_up(&self) -> bool {
        if self.is_up() {
            return true;
        }
        self.reconnection
            .lock()
            .next_attempt
            .is_some_and(|at| at <= Instant::now())
    }

    /// When the next reconnection attempt is allowed, if the host is down
    pub fn next_attempt(&self) -> Option<Instant> {
        if self.is_up() {
            return None;
        }
        self.reconnection.lock().next_attempt
    }

    /// Mark the host down and push its next attempt out along the schedule.
    /// Returns true if the host was up.
    pub fn set_down(&self) -> bool {
        let was_up = self.up.swap(false, Ordering::AcqRel);
        let mut reconnection = self.reconnection.lock();
        if was_up || reconnection.schedule.is_none() {
            reconnection.schedule = Some(self.policy.new_schedule());
        }
        let delay = reconnection
            .schedule
            .as_mut()
            .map(|schedule| schedule.next_delay())
            .unwrap_or_default();
        reconnection.next_attempt = Some(Instant::now() + delay);
        drop(reconnection);

        if was_up {
            info!(host = %self.address, "Host down");
        } else {
            debug!(host = %self.address, ?delay, "Reconnection attempt failed");
        }
        was_up
    }

    /// Mark the host up and reset its schedule. Returns true if it was down.
    pub fn bring_up(&self) -> bool {
        let was_down = !self.up.swap(true, Ordering::AcqRel);
        if was_down {
            *self.reconnection.lock() = Reconnection::default();
            info!(host = %self.address, "Host up");
        }
        was_down
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("datacenter", &*self.datacenter.read())
            .field("up", &self.is_up())
            .finish()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Every host the session knows about
#[derive(Debug)]
pub struct HostRegistry {
    hosts: DashMap<SocketAddr, Arc<Host>>,
    policy: Arc<dyn ReconnectionPolicy>,
}

impl HostRegistry {
    pub fn new(policy: Arc<dyn ReconnectionPolicy>) -> Self {
        Self {
            hosts: DashMap::new(),
            policy,
        }
    }

    /// Get or create the host at `address`. The flag is true if it was new.
    pub fn add(&self, address: SocketAddr) -> (Arc<Host>, bool) {
        let mut added = false;
        let entry = self.hosts.entry(address).or_insert_with(|| {
            added = true;
            Arc::new(Host::new(address, Arc::clone(&self.policy)))
        });
        let host = Arc::clone(entry.value());
        drop(entry);
        (host, added)
    }

    pub fn get(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.get(&address).map(|entry| Arc::clone(entry.value()))
    }

    /// Hosts whose address has the given IP, whatever the port
    pub fn find_by_ip(&self, ip: IpAddr) -> Vec<Arc<Host>> {
        let mut found: Vec<_> = self
            .hosts
            .iter()
            .filter(|entry| entry.key().ip() == ip)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        found.sort_by_key(|host| host.address());
        found
    }

    pub fn remove(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.remove(&address).map(|(_, host)| host)
    }

    /// Snapshot of all hosts, ordered by address
    pub fn all(&self) -> Vec<Arc<Host>> {
        let mut hosts: Vec<_> = self
            .hosts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        hosts.sort_by_key(|host| host.address());
        hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
