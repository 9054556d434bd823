//! Tunnel Connection Manager
//!
//! Owns every live `TunnelBackend` and its lifecycle.
//!
//! - A backend exists only for tunnels some rule references.
//! - All connect sequences for one tunnel id run under that id's lock, so
//!   concurrent (re)connects never produce a second backend.
//! - Each backend gets a supervisor task that publishes its DNS servers,
//!   reconnects it when a Ready session drops, and gives up after the
//!   retry budget or on a failure retrying cannot fix.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(settings, factory, routing, tracker, dns, delivery);
//! manager.connect_all(&definitions);
//!
//! if manager.is_ready_for_routing(&TunnelId::from("local-test_UK")) {
//!     // packets for apps routed there are forwarded
//! }
//!
//! manager.close_all().await;
//! ```

use crate::adapter::AdapterFactory;
use crate::backend::{PacketDelivery, TunnelBackend, TunnelState, TunnelStats, TunnelStatus};
use crate::config::{RouterSettings, TunnelDefinition, TunnelId};
use crate::dns::DnsAggregator;
use crate::error::TunnelFailure;
use crate::routing::RoutingTable;
use crate::tracker::ConnectionTracker;
use arc_swap::ArcSwap;
use rand::Rng;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type BackendMap = HashMap<TunnelId, Arc<TunnelBackend>>;

/// Tunnels that were given up on, kept for error reporting and retry
#[derive(Debug, Clone)]
struct FailedTunnel {
    definition: TunnelDefinition,
    failure: TunnelFailure,
}

/// Tunnel Connection Manager
pub struct ConnectionManager {
    settings: RouterSettings,
    factory: Arc<dyn AdapterFactory>,
    routing: Arc<RoutingTable>,
    tracker: Arc<ConnectionTracker>,
    dns: Arc<DnsAggregator>,
    delivery: Arc<dyn PacketDelivery>,
    /// Live backends, swapped as a whole on every change
    backends: ArcSwap<BackendMap>,
    /// Per-tunnel connect serialization
    locks: Mutex<HashMap<TunnelId, Arc<tokio::sync::Mutex<()>>>>,
    /// Tunnels with a reconnect in flight
    reconnecting: Mutex<HashSet<TunnelId>>,
    failed: Mutex<HashMap<TunnelId, FailedTunnel>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        settings: RouterSettings,
        factory: Arc<dyn AdapterFactory>,
        routing: Arc<RoutingTable>,
        tracker: Arc<ConnectionTracker>,
        dns: Arc<DnsAggregator>,
        delivery: Arc<dyn PacketDelivery>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            factory,
            routing,
            tracker,
            dns,
            delivery,
            backends: ArcSwap::from_pointee(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            reconnecting: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Queries (never block)
    // ------------------------------------------------------------------

    pub fn backend(&self, id: &TunnelId) -> Option<Arc<TunnelBackend>> {
        self.backends.load().get(id).cloned()
    }

    pub fn contains(&self, id: &TunnelId) -> bool {
        self.backends.load().contains_key(id)
    }

    pub fn tunnel_ids(&self) -> Vec<TunnelId> {
        let mut ids: Vec<TunnelId> = self.backends.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_connected(&self, id: &TunnelId) -> bool {
        self.backend(id).is_some_and(|b| b.is_connected())
    }

    pub fn is_ready_for_routing(&self, id: &TunnelId) -> bool {
        self.backend(id).is_some_and(|b| b.is_ready())
    }

    pub fn status(&self, id: &TunnelId) -> Option<TunnelStatus> {
        self.backend(id).map(|b| b.status())
    }

    /// Last failure of a live tunnel, or the one it was given up on
    pub fn last_error(&self, id: &TunnelId) -> Option<TunnelFailure> {
        self.backend(id).and_then(|b| b.last_error()).or_else(|| {
            self.failed
                .lock()
                .ok()
                .and_then(|f| f.get(id).map(|t| t.failure.clone()))
        })
    }

    pub fn stats(&self) -> HashMap<TunnelId, TunnelStats> {
        self.backends
            .load()
            .iter()
            .map(|(id, b)| (id.clone(), b.stats()))
            .collect()
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn dns(&self) -> &Arc<DnsAggregator> {
        &self.dns
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Instantiate a backend for every definition some rule references.
    ///
    /// Idempotent: a tunnel whose backend already runs the same definition
    /// (or that was given up on with that definition) is left alone. A
    /// changed definition replaces the old backend.
    pub fn connect_all(self: &Arc<Self>, definitions: &[TunnelDefinition]) {
        let referenced = self.routing.referenced_tunnels();

        for definition in definitions {
            let id = definition.id();
            if referenced.contains(&id) {
                self.ensure(definition.clone());
            }
        }

        for id in &referenced {
            if !definitions.iter().any(|d| &d.id() == id) {
                warn!("[{}] referenced by a rule but not defined", id);
            }
        }
    }

    /// Bring the running set in line with the definitions and rules:
    /// connect what is referenced, close what no longer is.
    pub async fn sync(self: &Arc<Self>, definitions: &[TunnelDefinition]) {
        self.connect_all(definitions);

        let referenced = self.routing.referenced_tunnels();
        let defined: BTreeSet<TunnelId> = definitions.iter().map(|d| d.id()).collect();

        for id in self.tunnel_ids() {
            if !referenced.contains(&id) || !defined.contains(&id) {
                info!("[{}] no longer needed, closing", id);
                self.close_tunnel(&id).await;
            }
        }

        if let Ok(mut failed) = self.failed.lock() {
            failed.retain(|id, _| referenced.contains(id) && defined.contains(id));
        }
    }

    /// Tear down one tunnel. Others are unaffected.
    pub async fn close_tunnel(&self, id: &TunnelId) -> bool {
        let mut removed = None;
        self.backends.rcu(|map| {
            let mut map = BackendMap::clone(map);
            removed = map.remove(id);
            map
        });
        if let Ok(mut failed) = self.failed.lock() {
            failed.remove(id);
        }

        let Some(backend) = removed else {
            return false;
        };

        let purged = self.tracker.purge_tunnel(id);
        self.dns.remove(id);
        debug!("[{}] closing, {} tracked flows purged", id, purged);

        if tokio::time::timeout(self.settings.close_timeout(), backend.close())
            .await
            .is_err()
        {
            backend.force_close();
        }
        true
    }

    /// Tear down every tunnel.
    ///
    /// Bounded by `close_timeout`: backends still not closed by then are
    /// forced closed. Once this returns the tracker is empty and every
    /// backend is Closed.
    pub async fn close_all(&self) {
        self.shut_down.store(true, Ordering::SeqCst);

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        let backends = self.backends.swap(Arc::new(HashMap::new()));
        self.tracker.clear();
        self.dns.clear();
        if let Ok(mut failed) = self.failed.lock() {
            failed.clear();
        }

        if backends.is_empty() {
            return;
        }
        info!("Closing {} tunnels", backends.len());

        let mut closing = tokio::task::JoinSet::new();
        for backend in backends.values() {
            let backend = backend.clone();
            closing.spawn(async move { backend.close().await });
        }

        let drained = tokio::time::timeout(self.settings.close_timeout(), async {
            while closing.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Tunnels did not close within {:?}, forcing", self.settings.close_timeout());
            closing.abort_all();
        }
        for backend in backends.values() {
            if !backend.is_closed() {
                backend.force_close();
            }
        }
        self.tracker.clear();
    }

    /// Best-effort reconnection of every live tunnel, for network changes.
    ///
    /// Safe to call repeatedly: a tunnel already reconnecting or still
    /// connecting is skipped. Tunnels given up on after transient failures
    /// get another chance.
    pub fn reconnect_all(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::Relaxed) {
            return;
        }

        for backend in self.backends.load().values() {
            let state = backend.state();
            if matches!(state, TunnelState::Closed | TunnelState::Disconnecting) || state.is_connecting() {
                continue;
            }

            let id = backend.id().clone();
            let fresh = self
                .reconnecting
                .lock()
                .map(|mut set| set.insert(id.clone()))
                .unwrap_or(false);
            if !fresh {
                debug!("[{}] reconnect already in flight", id);
                continue;
            }

            let manager = self.clone();
            let backend = backend.clone();
            self.spawn(async move {
                manager.reconnect_one(&backend).await;
                if let Ok(mut set) = manager.reconnecting.lock() {
                    set.remove(&id);
                }
            });
        }

        let retry: Vec<TunnelDefinition> = match self.failed.lock() {
            Ok(mut failed) => {
                let ids: Vec<TunnelId> = failed
                    .iter()
                    .filter(|(_, t)| t.failure.is_retryable())
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.iter()
                    .filter_map(|id| failed.remove(id))
                    .map(|t| t.definition)
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for definition in retry {
            info!("[{}] retrying after network change", definition.id());
            self.ensure(definition);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(tokio::spawn(future));
        }
    }

    fn lock_for(&self, id: &TunnelId) -> Arc<tokio::sync::Mutex<()>> {
        match self.locks.lock() {
            Ok(mut locks) => locks.entry(id.clone()).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Whether `definition` is already served, by a live backend or a
    /// recorded failure
    fn is_current(&self, definition: &TunnelDefinition) -> bool {
        let id = definition.id();
        if let Some(backend) = self.backend(&id) {
            return backend.definition() == definition && !backend.is_closed();
        }
        self.failed
            .lock()
            .map(|f| f.get(&id).is_some_and(|t| &t.definition == definition))
            .unwrap_or(false)
    }

    fn ensure(self: &Arc<Self>, definition: TunnelDefinition) {
        if self.shut_down.load(Ordering::Relaxed) || self.is_current(&definition) {
            return;
        }
        let manager = self.clone();
        self.spawn(async move { manager.establish(definition).await });
    }

    async fn establish(self: Arc<Self>, definition: TunnelDefinition) {
        let id = definition.id();
        let lock = self.lock_for(&id);
        let guard = lock.lock().await;

        if self.shut_down.load(Ordering::Relaxed) || self.is_current(&definition) {
            return;
        }

        if self.contains(&id) {
            info!("[{}] definition changed, replacing tunnel", id);
            self.close_tunnel(&id).await;
        }

        let adapter = match self.factory.create(&definition, &self.settings) {
            Ok(adapter) => adapter,
            Err(failure) => {
                error!("[{}] cannot create tunnel: {}", id, failure);
                if let Ok(mut failed) = self.failed.lock() {
                    failed.insert(id, FailedTunnel { definition, failure });
                }
                return;
            }
        };

        let backend = TunnelBackend::spawn(definition, adapter, &self.settings, self.delivery.clone());
        self.backends.rcu(|map| {
            let mut map = BackendMap::clone(map);
            map.insert(id.clone(), backend.clone());
            map
        });

        // close_all may have swapped the map out after the check above
        if self.shut_down.load(Ordering::SeqCst) {
            debug!("[{}] shutting down, discarding new tunnel", id);
            self.backends.rcu(|map| {
                let mut map = BackendMap::clone(map);
                if map.get(&id).is_some_and(|b| Arc::ptr_eq(b, &backend)) {
                    map.remove(&id);
                }
                map
            });
            backend.force_close();
            return;
        }

        if let Ok(mut failed) = self.failed.lock() {
            failed.remove(&id);
        }
        drop(guard);

        self.supervise(backend).await;
    }

    /// Connect the backend, then follow its status until it closes
    async fn supervise(&self, backend: Arc<TunnelBackend>) {
        let id = backend.id().clone();
        let mut status = backend.subscribe();

        if let Err(failure) = self.connect_serialized(&backend).await {
            self.give_up(&backend, failure).await;
            return;
        }

        loop {
            let (state, servers) = {
                let current = status.borrow_and_update();
                (current.state.clone(), current.dns_servers.clone())
            };

            match state {
                TunnelState::Ready => {
                    self.dns.update(&id, servers);
                }
                TunnelState::Closed => {
                    self.dns.remove(&id);
                    return;
                }
                TunnelState::Failed(failure) => {
                    self.dns.remove(&id);
                    if !failure.is_retryable() {
                        self.give_up(&backend, failure).await;
                        return;
                    }
                    warn!("[{}] session lost ({}), reconnecting", id, failure);
                    if let Err(failure) = self.connect_serialized(&backend).await {
                        self.give_up(&backend, failure).await;
                        return;
                    }
                    continue;
                }
                _ => {
                    self.dns.remove(&id);
                }
            }

            if status.changed().await.is_err() {
                return;
            }
        }
    }

    async fn connect_serialized(&self, backend: &TunnelBackend) -> Result<(), TunnelFailure> {
        let lock = self.lock_for(backend.id());
        let _guard = lock.lock().await;

        if backend.is_ready() {
            return Ok(());
        }
        if backend.is_closed() {
            return Err(TunnelFailure::transient("tunnel closed"));
        }
        self.connect_with_retry(backend).await
    }

    /// Connect attempts with exponential backoff. Failures that retrying
    /// cannot fix end the loop at once.
    async fn connect_with_retry(&self, backend: &TunnelBackend) -> Result<(), TunnelFailure> {
        let max = self.settings.max_connect_attempts.max(1);
        let mut attempt = 1;

        loop {
            let failure = match backend.connect_once(attempt, self.settings.connect_timeout()).await {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

            if backend.is_closed() {
                return Err(failure);
            }
            if !failure.is_retryable() {
                error!("[{}] {} (not retrying)", backend.id(), failure);
                return Err(failure);
            }
            if attempt >= max {
                error!("[{}] giving up after {} attempts: {}", backend.id(), attempt, failure);
                return Err(failure);
            }

            let delay = self.settings.backoff_for(attempt);
            let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
            let delay = delay + Duration::from_millis(jitter);
            warn!(
                "[{}] attempt {} failed ({}), retrying in {:?}",
                backend.id(),
                attempt,
                failure,
                delay
            );
            tokio::time::sleep(delay).await;

            if backend.is_closed() {
                return Err(failure);
            }
            attempt += 1;
        }
    }

    async fn reconnect_one(&self, backend: &TunnelBackend) {
        let lock = self.lock_for(backend.id());
        let _guard = lock.lock().await;

        if backend.is_closed() {
            return;
        }
        info!("[{}] reconnecting", backend.id());

        match backend.soft_reconnect(self.settings.connect_timeout()).await {
            Some(Ok(())) => return,
            Some(Err(failure)) => {
                debug!("[{}] soft reconnect failed: {}", backend.id(), failure);
            }
            None => {}
        }

        backend.reset().await;
        if let Err(failure) = self.connect_with_retry(backend).await {
            warn!("[{}] reconnect failed: {}", backend.id(), failure);
        }
    }

    /// Remove a backend that cannot be brought back, keeping its failure
    async fn give_up(&self, backend: &Arc<TunnelBackend>, failure: TunnelFailure) {
        let id = backend.id().clone();

        let mut removed = false;
        self.backends.rcu(|map| {
            let mut map = BackendMap::clone(map);
            removed = map.get(&id).is_some_and(|b| Arc::ptr_eq(b, backend));
            if removed {
                map.remove(&id);
            }
            map
        });
        if !removed {
            return;
        }

        if let Ok(mut failed) = self.failed.lock() {
            failed.insert(
                id.clone(),
                FailedTunnel {
                    definition: backend.definition().clone(),
                    failure,
                },
            );
        }
        self.tracker.purge_tunnel(&id);
        self.dns.remove(&id);

        if tokio::time::timeout(self.settings.close_timeout(), backend.close())
            .await
            .is_err()
        {
            backend.force_close();
        }
    }
}
