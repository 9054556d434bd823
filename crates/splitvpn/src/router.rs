//! Packet Router
//!
//! The data plane. Egress: every packet read from the shared interface is
//! classified to an application, resolved to a tunnel and queued on that
//! tunnel's backend, or handed to the direct path, or dropped. Ingress:
//! packets a backend delivers are written back onto the interface as they
//! are.
//!
//! Neither direction ever waits on a tunnel: a full queue drops the newest
//! packet.

use crate::backend::{EnqueueError, PacketDelivery};
use crate::classifier::FlowClassifier;
use crate::config::{AppRule, NotReadyPolicy, RouterSettings, TunnelDefinition, TunnelId, UnroutedPolicy};
use crate::dns::DnsAggregator;
use crate::interface::{DirectPath, VirtualInterface};
use crate::manager::ConnectionManager;
use crate::packet::parse_flow;
use crate::routing::RoutingTable;
use crate::tracker::ConnectionTracker;
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Why an egress packet was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not routed and the policy (or a missing direct path) drops it
    Unrouted,
    /// The rule's tunnel has no live backend
    NoTunnel,
    NotReady,
    QueueFull,
}

/// Outcome of routing one egress packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Tunnel(TunnelId),
    Direct,
    Dropped(DropReason),
}

#[derive(Debug, Default)]
struct RouterCounters {
    forwarded: AtomicU64,
    direct: AtomicU64,
    dropped_unrouted: AtomicU64,
    dropped_no_tunnel: AtomicU64,
    dropped_not_ready: AtomicU64,
    dropped_queue_full: AtomicU64,
    unclassified: AtomicU64,
    inbound_delivered: AtomicU64,
    inbound_dropped: AtomicU64,
    dropped_cross_delivery: AtomicU64,
}

/// Router statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub forwarded: u64,
    pub direct: u64,
    pub dropped_unrouted: u64,
    pub dropped_no_tunnel: u64,
    pub dropped_not_ready: u64,
    pub dropped_queue_full: u64,
    /// Packets whose owning application could not be determined
    pub unclassified: u64,
    pub inbound_delivered: u64,
    /// Inbound packets lost to a full interface queue
    pub inbound_dropped: u64,
    /// Replies delivered by a tunnel other than the one their flow used
    pub dropped_cross_delivery: u64,
}

impl RouterCounters {
    fn snapshot(&self) -> RouterStats {
        RouterStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            direct: self.direct.load(Ordering::Relaxed),
            dropped_unrouted: self.dropped_unrouted.load(Ordering::Relaxed),
            dropped_no_tunnel: self.dropped_no_tunnel.load(Ordering::Relaxed),
            dropped_not_ready: self.dropped_not_ready.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            unclassified: self.unclassified.load(Ordering::Relaxed),
            inbound_delivered: self.inbound_delivered.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            dropped_cross_delivery: self.dropped_cross_delivery.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Shared router counters
#[derive(Debug, Clone, Default)]
pub struct RouterMetrics {
    counters: Arc<RouterCounters>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RouterStats {
        self.counters.snapshot()
    }
}

/// Ingress: where every backend hands its decrypted packets
pub struct IngressPath {
    tracker: Arc<ConnectionTracker>,
    writer: mpsc::Sender<Bytes>,
    metrics: RouterMetrics,
}

impl IngressPath {
    pub fn new(tracker: Arc<ConnectionTracker>, writer: mpsc::Sender<Bytes>, metrics: RouterMetrics) -> Self {
        Self {
            tracker,
            writer,
            metrics,
        }
    }
}

impl PacketDelivery for IngressPath {
    fn deliver(&self, from: &TunnelId, packet: Bytes) {
        let counters = &self.metrics.counters;

        // A reply must come back through the tunnel its flow went out on
        if let Ok(flow) = parse_flow(&packet) {
            if let Some(owner) = self.tracker.tunnel_for_reply(&flow) {
                if &owner != from {
                    debug!("[{}] dropping reply for flow owned by {}: {}", from, owner, flow);
                    bump(&counters.dropped_cross_delivery);
                    return;
                }
            }
        }

        match self.writer.try_send(packet) {
            Ok(()) => bump(&counters.inbound_delivered),
            Err(_) => {
                trace!("[{}] interface queue full, dropping inbound packet", from);
                bump(&counters.inbound_dropped);
            }
        }
    }
}

/// Egress: classify, resolve and dispatch
pub struct PacketRouter {
    classifier: FlowClassifier,
    routing: Arc<RoutingTable>,
    tracker: Arc<ConnectionTracker>,
    manager: Arc<ConnectionManager>,
    direct: Option<Arc<dyn DirectPath>>,
    unrouted_policy: UnroutedPolicy,
    not_ready_policy: NotReadyPolicy,
    metrics: RouterMetrics,
}

impl PacketRouter {
    pub fn new(
        settings: &RouterSettings,
        classifier: FlowClassifier,
        routing: Arc<RoutingTable>,
        manager: Arc<ConnectionManager>,
        direct: Option<Arc<dyn DirectPath>>,
        metrics: RouterMetrics,
    ) -> Self {
        Self {
            classifier,
            routing,
            tracker: manager.tracker().clone(),
            manager,
            direct,
            unrouted_policy: settings.unrouted_policy,
            not_ready_policy: settings.not_ready_policy,
            metrics,
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.metrics.snapshot()
    }

    /// Route one packet read from the interface
    pub fn route_packet(&self, packet: Bytes) -> Verdict {
        let counters = &self.metrics.counters;

        let (flow, app) = match self.classifier.classify(&packet) {
            Ok(classified) => classified,
            Err(e) => {
                trace!("Unclassified packet: {}", e);
                bump(&counters.unclassified);
                return self.unrouted(packet);
            }
        };

        let Some(route) = self.routing.route(&app) else {
            return self.unrouted(packet);
        };

        let Some(backend) = self.manager.backend(&route.tunnel) else {
            if route.fallback_to_direct {
                return self.direct(packet);
            }
            trace!("[{}] no live tunnel for {}", route.tunnel, app);
            bump(&counters.dropped_no_tunnel);
            return Verdict::Dropped(DropReason::NoTunnel);
        };

        if !backend.is_ready() {
            if route.fallback_to_direct {
                return self.direct(packet);
            }
            if self.not_ready_policy == NotReadyPolicy::Drop {
                trace!("[{}] not ready, dropping packet from {}", route.tunnel, app);
                bump(&counters.dropped_not_ready);
                return Verdict::Dropped(DropReason::NotReady);
            }
        }

        if let Some(previous) = self.tracker.record(flow, &app, &route.tunnel) {
            debug!("{} moved from {} to {}", app, previous, route.tunnel);
        }

        // The tunnel may have been torn down since the lookup
        if !self.manager.contains(&route.tunnel) {
            self.tracker.remove_if_tunnel(&flow, &route.tunnel);
            bump(&counters.dropped_no_tunnel);
            return Verdict::Dropped(DropReason::NoTunnel);
        }

        match backend.try_enqueue(packet) {
            Ok(()) => {
                bump(&counters.forwarded);
                Verdict::Tunnel(route.tunnel)
            }
            Err(EnqueueError::Full) => {
                trace!("[{}] send queue full, dropping packet", route.tunnel);
                bump(&counters.dropped_queue_full);
                Verdict::Dropped(DropReason::QueueFull)
            }
            Err(EnqueueError::Closed) => {
                self.tracker.remove_if_tunnel(&flow, &route.tunnel);
                bump(&counters.dropped_no_tunnel);
                Verdict::Dropped(DropReason::NoTunnel)
            }
        }
    }

    fn unrouted(&self, packet: Bytes) -> Verdict {
        match self.unrouted_policy {
            UnroutedPolicy::Direct => self.direct(packet),
            UnroutedPolicy::Drop => {
                bump(&self.metrics.counters.dropped_unrouted);
                Verdict::Dropped(DropReason::Unrouted)
            }
        }
    }

    fn direct(&self, packet: Bytes) -> Verdict {
        let forwarded = self.direct.as_ref().is_some_and(|direct| direct.forward(packet));
        if forwarded {
            bump(&self.metrics.counters.direct);
            Verdict::Direct
        } else {
            bump(&self.metrics.counters.dropped_unrouted);
            Verdict::Dropped(DropReason::Unrouted)
        }
    }

    /// Egress loop: runs until the interface reader closes
    pub async fn run(self: Arc<Self>, mut reader: mpsc::Receiver<Bytes>) {
        info!("Egress loop started");
        while let Some(packet) = reader.recv().await {
            self.route_packet(packet);
        }
        info!("Egress loop stopped ({:?})", self.stats());
    }
}

/// Follow rule and definition changes: swap the routing table, forget
/// remapped applications' flows, then connect and tear down tunnels to
/// match.
pub async fn follow_config(
    routing: Arc<RoutingTable>,
    manager: Arc<ConnectionManager>,
    mut rules: watch::Receiver<Vec<AppRule>>,
    mut definitions: watch::Receiver<Vec<TunnelDefinition>>,
) {
    let mut rules_changed = true;

    loop {
        if rules_changed {
            let current = rules.borrow_and_update().clone();
            let change = routing.replace(&current);
            if !change.remapped.is_empty() {
                let purged = manager.tracker().purge_apps(&change.remapped);
                info!("Rules changed: {} apps remapped, {} flows reset", change.remapped.len(), purged);
            }
        }
        let current = definitions.borrow_and_update().clone();
        manager.sync(&current).await;

        tokio::select! {
            changed = rules.changed() => {
                if changed.is_err() {
                    return;
                }
                rules_changed = true;
            }
            changed = definitions.changed() => {
                if changed.is_err() {
                    return;
                }
                rules_changed = false;
            }
        }
    }
}

/// Push the merged resolver list to the interface whenever it changes
pub async fn propagate_dns(dns: Arc<DnsAggregator>, interface: Arc<dyn VirtualInterface>) {
    let mut rx = dns.subscribe();
    let mut applied: Vec<IpAddr> = rx.borrow_and_update().clone();

    while rx.changed().await.is_ok() {
        let servers = rx.borrow_and_update().clone();
        if servers == applied {
            continue;
        }
        match interface.reconfigure_dns(servers.clone()).await {
            Ok(()) => applied = servers,
            Err(e) => warn!("Cannot apply DNS servers {:?}: {}", servers, e),
        }
    }
}

/// Evict idle flows from the tracker
pub async fn evict_idle_flows(tracker: Arc<ConnectionTracker>) {
    let period = (tracker.idle_timeout() / 4).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);

    loop {
        ticker.tick().await;
        let evicted = tracker.evict_idle(Instant::now());
        if evicted > 0 {
            debug!("Evicted {} idle flows", evicted);
        }
    }
}
