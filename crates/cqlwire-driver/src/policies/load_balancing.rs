//! Host selection

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::RngExt;
use rand::rngs::StdRng;

use crate::host::{Host, HostDistance};

/// Ordered, lazily evaluated candidate hosts for one request
pub type QueryPlan = Box<dyn Iterator<Item = Arc<Host>> + Send>;

/// Decides which hosts a request may use and in what order
pub trait LoadBalancingPolicy: Send + Sync + Debug {
    fn distance(&self, host: &Host) -> HostDistance;

    /// Plan over a snapshot of the known hosts. A new plan restarts the
    /// sequence.
    fn new_query_plan(&self, routing_key: Option<&[u8]>, hosts: Vec<Arc<Host>>) -> QueryPlan;
}

/// Round robin over all hosts, optionally keeping to one datacenter.
///
/// With a local datacenter set, its hosts come first and at most
/// `used_hosts_per_remote_dc` hosts of every other datacenter follow.
/// Hosts with no known datacenter count as local.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
    local_dc: Option<String>,
    used_hosts_per_remote_dc: usize,
}

impl RoundRobinPolicy {
    /// Start offset drawn from `rng` so that clients spread their first
    /// requests across the cluster
    pub fn new(rng: &mut StdRng) -> Self {
        Self {
            index: AtomicUsize::new(rng.random_range(0..1024)),
            local_dc: None,
            used_hosts_per_remote_dc: 0,
        }
    }

    #[must_use]
    pub fn with_local_dc(mut self, local_dc: impl Into<String>, used_hosts_per_remote_dc: usize) -> Self {
        self.local_dc = Some(local_dc.into());
        self.used_hosts_per_remote_dc = used_hosts_per_remote_dc;
        self
    }

    fn is_local(&self, host: &Host) -> bool {
        match (&self.local_dc, host.datacenter()) {
            (Some(local), Some(dc)) => *local == dc,
            _ => true,
        }
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn distance(&self, host: &Host) -> HostDistance {
        if self.is_local(host) {
            HostDistance::Local
        } else if self.used_hosts_per_remote_dc > 0 {
            HostDistance::Remote
        } else {
            HostDistance::Ignored
        }
    }

    fn new_query_plan(&self, _routing_key: Option<&[u8]>, hosts: Vec<Arc<Host>>) -> QueryPlan {
        let start = self.index.fetch_add(1, Ordering::Relaxed);
        let (local, remote): (Vec<_>, Vec<_>) = hosts.into_iter().partition(|h| self.is_local(h));

        let local_len = local.len();
        let local_plan =
            (0..local_len).map(move |i| Arc::clone(&local[start.wrapping_add(i) % local_len]));

        let remote_len = remote.len();
        let cap = self.used_hosts_per_remote_dc;
        let mut taken: HashMap<Option<String>, usize> = HashMap::new();
        let remote_plan = (0..remote_len)
            .map(move |i| Arc::clone(&remote[start.wrapping_add(i) % remote_len]))
            .filter(move |host| {
                let count = taken.entry(host.datacenter()).or_default();
                *count += 1;
                *count <= cap
            });

        Box::new(local_plan.chain(remote_plan))
    }
}
