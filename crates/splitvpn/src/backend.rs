//! Tunnel Backend
//!
//! One running instance per active tunnel. Wraps a protocol adapter and
//! owns the tunnel's state machine, its bounded send queue and the worker
//! that carries its inbound packets back to the router.
//!
//! # State machine
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> ConnectedNoIp -> IpAssigned -> Ready
//!                                                                         |
//!                                          Closed <- Disconnecting <------+
//! Failed(reason) is reachable from every non-terminal state.
//! ```
//!
//! The connected phase is derived from three independent facts (session
//! up, address assigned, DNS received or waived), so adapters may report
//! them in any order.

use crate::adapter::{AdapterLink, TunnelAdapter};
use crate::config::{NotReadyPolicy, RouterSettings, TunnelDefinition, TunnelId};
use crate::error::TunnelFailure;
use bytes::Bytes;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Tunnel lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    /// Credentials or keys being exchanged
    Authenticating,
    /// Session up, no address yet
    ConnectedNoIp,
    /// Address assigned, waiting for DNS
    IpAssigned,
    /// Connected, addressed and DNS configured (or waived)
    Ready,
    Disconnecting,
    Closed,
    Failed(TunnelFailure),
}

impl TunnelState {
    pub fn is_ready(&self) -> bool {
        matches!(self, TunnelState::Ready)
    }

    /// Session established (whether or not fully configured)
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            TunnelState::ConnectedNoIp | TunnelState::IpAssigned | TunnelState::Ready
        )
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, TunnelState::Connecting | TunnelState::Authenticating)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed(_))
    }

    /// States in which adapter events are applied
    fn is_active(&self) -> bool {
        self.is_connecting() || self.is_connected()
    }

    pub fn failure(&self) -> Option<&TunnelFailure> {
        match self {
            TunnelState::Failed(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Idle => write!(f, "idle"),
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Authenticating => write!(f, "authenticating"),
            TunnelState::ConnectedNoIp => write!(f, "connected (no ip)"),
            TunnelState::IpAssigned => write!(f, "connected (ip assigned)"),
            TunnelState::Ready => write!(f, "ready"),
            TunnelState::Disconnecting => write!(f, "disconnecting"),
            TunnelState::Closed => write!(f, "closed"),
            TunnelState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Address negotiated for the tunnel's local end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelAddress {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl fmt::Display for TunnelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Observable status of one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub address: Option<TunnelAddress>,
    pub dns_servers: Vec<IpAddr>,
    pub dns_waived: bool,
    pub mtu: Option<u16>,
    pub last_error: Option<TunnelFailure>,
    /// Connect attempt number (1-based) of the current session
    pub attempt: u32,
    session_up: bool,
    authenticating: bool,
    dns_required: bool,
    generation: u64,
}

impl TunnelStatus {
    fn new(dns_required: bool) -> Self {
        Self {
            state: TunnelState::Idle,
            address: None,
            dns_servers: Vec::new(),
            dns_waived: !dns_required,
            mtu: None,
            last_error: None,
            attempt: 0,
            session_up: false,
            authenticating: false,
            dns_required,
            generation: 0,
        }
    }

    pub fn is_ready_for_routing(&self) -> bool {
        self.state.is_ready()
    }

    fn reset_session(&mut self) {
        self.address = None;
        self.dns_servers.clear();
        self.dns_waived = !self.dns_required;
        self.mtu = None;
        self.session_up = false;
        self.authenticating = false;
    }

    fn recompute(&mut self) {
        if !self.state.is_active() {
            return;
        }

        self.state = if !self.session_up {
            if self.authenticating {
                TunnelState::Authenticating
            } else {
                TunnelState::Connecting
            }
        } else if self.address.is_none() {
            TunnelState::ConnectedNoIp
        } else if self.dns_servers.is_empty() && !self.dns_waived {
            TunnelState::IpAssigned
        } else {
            TunnelState::Ready
        };
    }
}

/// Signals an adapter raises about its session.
///
/// Bound to one connect attempt: once the backend moves on (closed, or a
/// newer attempt started) events from an older sink are ignored.
#[derive(Clone)]
pub struct EventSink {
    tunnel: TunnelId,
    status: Arc<watch::Sender<TunnelStatus>>,
    generation: u64,
}

impl EventSink {
    fn apply(&self, event: &str, update: impl FnOnce(&mut TunnelStatus)) {
        let generation = self.generation;
        let tunnel = &self.tunnel;

        self.status.send_if_modified(|status| {
            if status.generation != generation || !status.state.is_active() {
                trace!("[{}] ignoring stale {} event", tunnel, event);
                return false;
            }

            let before = status.clone();
            update(status);
            status.recompute();

            if status.state != before.state {
                debug!("[{}] {} -> {}", tunnel, before.state, status.state);
            }
            *status != before
        });
    }

    pub fn authenticating(&self) {
        self.apply("authenticating", |s| s.authenticating = true);
    }

    pub fn connected(&self) {
        self.apply("connected", |s| s.session_up = true);
    }

    pub fn ip_assigned(&self, address: TunnelAddress) {
        info!("[{}] address assigned: {}", self.tunnel, address);
        self.apply("ip_assigned", |s| s.address = Some(address));
    }

    pub fn dns_servers(&self, servers: Vec<IpAddr>) {
        if servers.is_empty() {
            return;
        }
        info!("[{}] DNS servers: {:?}", self.tunnel, servers);
        self.apply("dns_servers", |s| s.dns_servers = servers);
    }

    /// The provider does not supply DNS; readiness does not wait for it
    pub fn dns_waived(&self) {
        self.apply("dns_waived", |s| s.dns_waived = true);
    }

    pub fn mtu(&self, mtu: u16) {
        self.apply("mtu", |s| s.mtu = Some(mtu));
    }

    pub fn error(&self, failure: TunnelFailure) {
        warn!("[{}] {}", self.tunnel, failure);
        self.apply("error", |s| {
            s.last_error = Some(failure.clone());
            s.state = TunnelState::Failed(failure);
        });
    }

    /// Session ended by the remote side or the engine
    pub fn closed(&self) {
        self.apply("closed", |s| {
            let failure = TunnelFailure::transient("session closed by remote");
            s.last_error = Some(failure.clone());
            s.state = TunnelState::Failed(failure);
        });
    }
}

/// Where a backend's inbound packets go
pub trait PacketDelivery: Send + Sync {
    fn deliver(&self, from: &TunnelId, packet: Bytes);
}

/// Why a packet could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("Send queue full")]
    Full,

    #[error("Tunnel closed")]
    Closed,
}

#[derive(Debug, Default)]
struct TunnelCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    dropped: AtomicU64,
}

/// Tunnel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Packets discarded by the send worker (not ready, adapter refused)
    pub dropped: u64,
}

impl TunnelStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts), dropped: {}",
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.packets_sent,
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.packets_received,
            self.dropped
        )
    }
}

/// A running tunnel
pub struct TunnelBackend {
    id: TunnelId,
    definition: TunnelDefinition,
    adapter: Arc<dyn TunnelAdapter>,
    status: Arc<watch::Sender<TunnelStatus>>,
    send_tx: mpsc::Sender<Bytes>,
    inbound_tx: mpsc::Sender<Bytes>,
    counters: Arc<TunnelCounters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelBackend {
    /// Create the backend and start its send and receive workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        definition: TunnelDefinition,
        adapter: Arc<dyn TunnelAdapter>,
        settings: &RouterSettings,
        delivery: Arc<dyn PacketDelivery>,
    ) -> Arc<Self> {
        let id = definition.id();
        let (status_tx, _) = watch::channel(TunnelStatus::new(definition.require_dns));
        let status = Arc::new(status_tx);
        let (send_tx, send_rx) = mpsc::channel(settings.tunnel_queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.tunnel_queue_capacity);
        let counters = Arc::new(TunnelCounters::default());

        let sender = tokio::spawn(run_send_worker(
            id.clone(),
            adapter.clone(),
            status.subscribe(),
            send_rx,
            settings.not_ready_policy,
            counters.clone(),
        ));
        let receiver = tokio::spawn(run_receive_worker(
            id.clone(),
            inbound_rx,
            delivery,
            counters.clone(),
        ));

        debug!("[{}] backend created ({})", id, adapter.kind());

        Arc::new(Self {
            id,
            definition,
            adapter,
            status,
            send_tx,
            inbound_tx,
            counters,
            workers: Mutex::new(vec![sender, receiver]),
        })
    }

    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    pub fn definition(&self) -> &TunnelDefinition {
        &self.definition
    }

    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> TunnelState {
        self.status.borrow().state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state.is_connected()
    }

    pub fn is_ready(&self) -> bool {
        self.status.borrow().state.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.status.borrow().state, TunnelState::Closed)
    }

    pub fn last_error(&self) -> Option<TunnelFailure> {
        self.status
            .borrow()
            .last_error
            .clone()
            .or_else(|| self.adapter.last_error())
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Queue a packet for the tunnel without waiting
    pub fn try_enqueue(&self, packet: Bytes) -> Result<(), EnqueueError> {
        self.send_tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Start a new session generation. Returns `None` once closed.
    fn begin_attempt(&self, attempt: u32) -> Option<u64> {
        let mut generation = None;
        self.status.send_modify(|s| {
            if matches!(s.state, TunnelState::Closed | TunnelState::Disconnecting) {
                return;
            }
            s.generation += 1;
            s.attempt = attempt;
            s.reset_session();
            s.state = TunnelState::Connecting;
            generation = Some(s.generation);
        });
        generation
    }

    fn fail(&self, generation: u64, failure: TunnelFailure) {
        self.status.send_if_modified(|s| {
            if s.generation != generation || s.state.is_terminal() {
                return false;
            }
            s.last_error = Some(failure.clone());
            s.state = TunnelState::Failed(failure);
            true
        });
    }

    /// Run one connect attempt to completion: Ready, Failed or timed out.
    pub async fn connect_once(&self, attempt: u32, deadline: Duration) -> Result<(), TunnelFailure> {
        let Some(generation) = self.begin_attempt(attempt) else {
            return Err(TunnelFailure::transient("tunnel closed"));
        };
        info!("[{}] connecting (attempt {})", self.id, attempt);

        let link = AdapterLink {
            tunnel: self.id.clone(),
            events: EventSink {
                tunnel: self.id.clone(),
                status: self.status.clone(),
                generation,
            },
            inbound: self.inbound_tx.clone(),
        };
        let rx = self.status.subscribe();

        let outcome = tokio::time::timeout(deadline, async {
            self.adapter.connect(link).await?;
            wait_settled(rx, generation).await
        })
        .await;

        let failure = match outcome {
            Ok(Ok(())) => {
                info!("[{}] ready for routing", self.id);
                return Ok(());
            }
            Ok(Err(failure)) => failure,
            Err(_) => TunnelFailure::timeout(format!(
                "not ready within {}s",
                deadline.as_secs()
            )),
        };

        self.fail(generation, failure.clone());
        self.adapter.disconnect().await;
        Err(failure)
    }

    /// Ask the adapter to restart its session in place. Returns `None` when
    /// the adapter cannot, in which case the caller reconnects from scratch.
    pub async fn soft_reconnect(&self, deadline: Duration) -> Option<Result<(), TunnelFailure>> {
        let generation = {
            let status = self.status.borrow();
            if !status.state.is_active() {
                return None;
            }
            status.generation
        };

        if !self.adapter.reconnect().await {
            return None;
        }

        // Only a restart the adapter accepted takes the tunnel out of Ready
        self.status.send_modify(|s| {
            if s.generation == generation && s.state.is_active() {
                s.reset_session();
                s.state = TunnelState::Connecting;
            }
        });

        let waited =
            tokio::time::timeout(deadline, wait_settled(self.status.subscribe(), generation)).await;

        let result = match waited {
            Ok(result) => result,
            Err(_) => Err(TunnelFailure::timeout("soft reconnect timed out")),
        };
        if let Err(ref failure) = result {
            self.fail(generation, failure.clone());
        }
        Some(result)
    }

    /// Tear down the current session but keep the backend for another attempt
    pub async fn reset(&self) {
        self.adapter.disconnect().await;
        self.status.send_modify(|s| {
            if !matches!(s.state, TunnelState::Closed | TunnelState::Disconnecting) {
                s.generation += 1;
                s.reset_session();
                s.state = TunnelState::Idle;
            }
        });
    }

    /// Graceful close: disconnect the adapter and stop the workers
    pub async fn close(&self) {
        let already_closing = {
            let mut closing = false;
            self.status.send_modify(|s| {
                closing = matches!(s.state, TunnelState::Closed | TunnelState::Disconnecting);
                if !closing {
                    s.state = TunnelState::Disconnecting;
                }
            });
            closing
        };
        if already_closing {
            return;
        }

        info!("[{}] disconnecting", self.id);
        self.adapter.disconnect().await;
        self.mark_closed();
    }

    /// Abandon the backend without waiting on the adapter
    pub fn force_close(&self) {
        warn!("[{}] forcing closed", self.id);
        self.adapter.abort();
        self.mark_closed();
    }

    fn mark_closed(&self) {
        self.status.send_modify(|s| {
            s.generation += 1;
            s.reset_session();
            s.state = TunnelState::Closed;
        });

        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
        debug!("[{}] closed ({})", self.id, self.stats().format());
    }
}

impl Drop for TunnelBackend {
    fn drop(&mut self) {
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
    }
}

/// Wait until the given session generation is Ready, failed or superseded
async fn wait_settled(
    mut rx: watch::Receiver<TunnelStatus>,
    generation: u64,
) -> Result<(), TunnelFailure> {
    let status = rx
        .wait_for(|s| s.generation != generation || s.state.is_ready() || s.state.is_terminal())
        .await
        .map_err(|_| TunnelFailure::transient("status channel closed"))?;

    if status.generation == generation && status.state.is_ready() {
        Ok(())
    } else if let Some(failure) = status.state.failure() {
        Err(failure.clone())
    } else {
        Err(TunnelFailure::transient("connect attempt superseded"))
    }
}

async fn run_send_worker(
    id: TunnelId,
    adapter: Arc<dyn TunnelAdapter>,
    mut status: watch::Receiver<TunnelStatus>,
    mut queue: mpsc::Receiver<Bytes>,
    policy: NotReadyPolicy,
    counters: Arc<TunnelCounters>,
) {
    while let Some(packet) = queue.recv().await {
        let ready_now = status.borrow().state.is_ready();

        if !ready_now {
            let ready = match policy {
                NotReadyPolicy::Drop => false,
                NotReadyPolicy::Queue => match status
                    .wait_for(|s| s.state.is_ready() || s.state.is_terminal())
                    .await
                {
                    Ok(s) => s.state.is_ready(),
                    Err(_) => false,
                },
            };
            if !ready {
                trace!("[{}] dropping packet, tunnel not ready", id);
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        let len = packet.len() as u64;
        match adapter.send(packet) {
            Ok(()) => {
                counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
            }
            Err(e) => {
                trace!("[{}] adapter refused packet: {}", id, e);
                counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn run_receive_worker(
    id: TunnelId,
    mut inbound: mpsc::Receiver<Bytes>,
    delivery: Arc<dyn PacketDelivery>,
    counters: Arc<TunnelCounters>,
) {
    while let Some(packet) = inbound.recv().await {
        counters.packets_received.fetch_add(1, Ordering::Relaxed);
        counters.bytes_received.fetch_add(packet.len() as u64, Ordering::Relaxed);
        delivery.deliver(&id, packet);
    }
}
