//! Flow Classifier
//!
//! Determines which installed application emitted an outgoing packet.
//!
//! Ownership is a platform capability: the host knows which application
//! owns a local socket, the router does not. `SocketOwnerTable` is the
//! concrete mechanism: the platform registers every socket it sees as
//! (transport, local address, local port) -> application, and the
//! classifier looks up the source side of each egress packet.
//!
//! The table is an immutable snapshot swapped atomically on update, so
//! the egress loop never takes a lock to classify a packet.
//!
//! Only the first fragment of a datagram carries ports. Its owner is
//! remembered for a short while so the later fragments follow it.

use crate::config::AppId;
use crate::packet::{self, FlowTuple, FragmentKey, Transport};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How long later fragments may trail the first one
const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PENDING_DATAGRAMS: usize = 4096;

/// A packet whose owning application could not be determined
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("Not an IP packet (version {0})")]
    NotIp(u8),

    #[error("Truncated packet")]
    Truncated,

    #[error("No owner known for {0}")]
    UnknownOwner(FlowTuple),
}

/// Per-socket ownership lookup provided by the host platform
pub trait OwnershipLookup: Send + Sync {
    /// Application owning the local end of an outgoing flow, if known
    fn owner_of(&self, flow: &FlowTuple) -> Option<AppId>;
}

/// Local end of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    pub transport: Transport,
    pub addr: IpAddr,
    pub port: u16,
}

impl SocketKey {
    pub fn new(transport: Transport, addr: IpAddr, port: u16) -> Self {
        Self {
            transport,
            addr,
            port,
        }
    }

    fn unspecified(&self) -> Self {
        let addr = match self.addr {
            IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        Self { addr, ..*self }
    }
}

/// Connection-owner table populated by the platform
pub struct SocketOwnerTable {
    current: ArcSwap<HashMap<SocketKey, AppId>>,
    version: AtomicU64,
}

impl SocketOwnerTable {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Record that `app` owns the socket bound at `key`
    pub fn register(&self, key: SocketKey, app: AppId) {
        self.current.rcu(|map| {
            let mut next = HashMap::clone(map);
            next.insert(key, app.clone());
            next
        });
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Forget a closed socket
    pub fn unregister(&self, key: &SocketKey) {
        self.current.rcu(|map| {
            let mut next = HashMap::clone(map);
            next.remove(key);
            next
        });
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the whole table (periodic platform resync)
    pub fn replace(&self, entries: HashMap<SocketKey, AppId>) {
        self.current.store(Arc::new(entries));
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of updates applied so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }
}

impl Default for SocketOwnerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnershipLookup for SocketOwnerTable {
    fn owner_of(&self, flow: &FlowTuple) -> Option<AppId> {
        let key = SocketKey::new(flow.transport, flow.src, flow.src_port);
        let snapshot = self.current.load();

        // Sockets bound to the wildcard address match any source address
        snapshot
            .get(&key)
            .or_else(|| snapshot.get(&key.unspecified()))
            .cloned()
    }
}

/// Owners of fragmented datagrams, keyed by their first fragment
#[derive(Default)]
struct FragmentOwners {
    datagrams: DashMap<FragmentKey, (FlowTuple, AppId, Instant)>,
}

impl FragmentOwners {
    fn remember(&self, key: FragmentKey, flow: FlowTuple, app: AppId, now: Instant) {
        if self.datagrams.len() >= MAX_PENDING_DATAGRAMS {
            self.datagrams
                .retain(|_, (_, _, seen)| now.saturating_duration_since(*seen) < FRAGMENT_TIMEOUT);
            if self.datagrams.len() >= MAX_PENDING_DATAGRAMS {
                self.datagrams.clear();
            }
        }
        self.datagrams.insert(key, (flow, app, now));
    }

    fn owner(&self, key: &FragmentKey, now: Instant) -> Option<(FlowTuple, AppId)> {
        let entry = self.datagrams.get(key)?;
        let (flow, app, seen) = entry.value();
        (now.saturating_duration_since(*seen) < FRAGMENT_TIMEOUT).then(|| (*flow, app.clone()))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.datagrams.len()
    }
}

/// Classifies raw egress packets by owning application
#[derive(Clone)]
pub struct FlowClassifier {
    lookup: Arc<dyn OwnershipLookup>,
    fragments: Arc<FragmentOwners>,
}

impl FlowClassifier {
    pub fn new(lookup: Arc<dyn OwnershipLookup>) -> Self {
        Self {
            lookup,
            fragments: Arc::new(FragmentOwners::default()),
        }
    }

    /// Owning application of an egress packet. Later fragments of a
    /// datagram report the flow of its first fragment.
    pub fn classify(&self, packet: &[u8]) -> Result<(FlowTuple, AppId), ClassifyError> {
        self.classify_at(packet, Instant::now())
    }

    pub(crate) fn classify_at(
        &self,
        packet: &[u8],
        now: Instant,
    ) -> Result<(FlowTuple, AppId), ClassifyError> {
        let flow = packet::parse_flow(packet)?;
        let fragment = packet::fragment_of(packet);

        if let Some(later) = fragment.filter(|f| !f.first) {
            return self
                .fragments
                .owner(&later.key, now)
                .ok_or(ClassifyError::UnknownOwner(flow));
        }

        let app = self
            .lookup
            .owner_of(&flow)
            .ok_or(ClassifyError::UnknownOwner(flow))?;
        if let Some(first) = fragment {
            self.fragments.remember(first.key, flow, app.clone(), now);
        }
        Ok((flow, app))
    }
}
