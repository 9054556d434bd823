//! Virtual Interface Owner
//!
//! The platform creates the single TUN-like interface the OS sees. The
//! router opens it once per session, reads the packets applications write
//! into it and writes tunnel replies back. Nothing else touches it.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Virtual interface errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceError {
    #[error("Interface already open")]
    AlreadyOpen,

    #[error("Interface not open")]
    NotOpen,

    #[error("Interface unavailable: {0}")]
    Unavailable(String),
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Parameters the interface is opened with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSettings {
    pub address: (IpAddr, u8),
    pub routes: Vec<(IpAddr, u8)>,
    pub dns_servers: Vec<IpAddr>,
    pub mtu: u16,
    /// Bound of each direction's packet queue
    pub queue_capacity: usize,
}

impl InterfaceSettings {
    /// Route everything through the interface
    pub fn new(address: (IpAddr, u8), dns_servers: Vec<IpAddr>, mtu: u16) -> Self {
        Self {
            address,
            routes: vec![(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)],
            dns_servers,
            mtu,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Read and write handles of an open interface
pub struct InterfaceIo {
    /// Packets applications wrote into the interface
    pub reader: mpsc::Receiver<Bytes>,
    /// Packets to hand back to the OS stack
    pub writer: mpsc::Sender<Bytes>,
}

#[async_trait]
pub trait VirtualInterface: Send + Sync {
    async fn open(&self, settings: InterfaceSettings) -> Result<InterfaceIo, InterfaceError>;

    /// Replace the resolver list of the open interface
    async fn reconfigure_dns(&self, servers: Vec<IpAddr>) -> Result<(), InterfaceError>;

    async fn close(&self);
}

/// Path for traffic that bypasses every tunnel
pub trait DirectPath: Send + Sync {
    /// Forward a packet untouched. Returns false if it was dropped.
    fn forward(&self, packet: Bytes) -> bool;
}

/// `DirectPath` backed by a bounded queue
pub struct ChannelDirectPath {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelDirectPath {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl DirectPath for ChannelDirectPath {
    fn forward(&self, packet: Bytes) -> bool {
        self.tx.try_send(packet).is_ok()
    }
}

/// The OS side of a `MemoryInterface`
pub struct HostEnd {
    apps: mpsc::Sender<Bytes>,
    stack: mpsc::Receiver<Bytes>,
}

impl HostEnd {
    /// Write a packet as an application would
    pub async fn send(&self, packet: Bytes) -> bool {
        self.apps.send(packet).await.is_ok()
    }

    /// Write without waiting. Returns false when the interface queue is full.
    pub fn try_send(&self, packet: Bytes) -> bool {
        self.apps.try_send(packet).is_ok()
    }

    /// Next packet the router handed back to the stack
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.stack.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.stack.try_recv().ok()
    }
}

#[derive(Default)]
struct MemoryState {
    settings: Option<InterfaceSettings>,
    host: Option<HostEnd>,
    dns_history: Vec<Vec<IpAddr>>,
    opens: u32,
}

/// In-process interface for embedding hosts and tests
#[derive(Default)]
pub struct MemoryInterface {
    state: Mutex<MemoryState>,
    fail_open: AtomicBool,
}

impl MemoryInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `open` fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Relaxed);
    }

    /// Take the OS side of the current session
    pub fn take_host(&self) -> Option<HostEnd> {
        self.state.lock().ok().and_then(|mut s| s.host.take())
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().map(|s| s.settings.is_some()).unwrap_or(false)
    }

    pub fn settings(&self) -> Option<InterfaceSettings> {
        self.state.lock().ok().and_then(|s| s.settings.clone())
    }

    /// Resolver lists applied since the interface was created
    pub fn dns_history(&self) -> Vec<Vec<IpAddr>> {
        self.state.lock().map(|s| s.dns_history.clone()).unwrap_or_default()
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().map(|s| s.opens).unwrap_or(0)
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    async fn open(&self, settings: InterfaceSettings) -> Result<InterfaceIo, InterfaceError> {
        if self.fail_open.load(Ordering::Relaxed) {
            return Err(InterfaceError::Unavailable("open refused".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| InterfaceError::Unavailable("state poisoned".into()))?;
        if state.settings.is_some() {
            return Err(InterfaceError::AlreadyOpen);
        }

        let (apps, reader) = mpsc::channel(settings.queue_capacity.max(1));
        let (writer, stack) = mpsc::channel(settings.queue_capacity.max(1));

        info!(
            "Interface open: {}/{} mtu {} dns {:?}",
            settings.address.0, settings.address.1, settings.mtu, settings.dns_servers
        );
        state.dns_history.push(settings.dns_servers.clone());
        state.settings = Some(settings);
        state.host = Some(HostEnd { apps, stack });
        state.opens += 1;

        Ok(InterfaceIo { reader, writer })
    }

    async fn reconfigure_dns(&self, servers: Vec<IpAddr>) -> Result<(), InterfaceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| InterfaceError::Unavailable("state poisoned".into()))?;
        let settings = state.settings.as_mut().ok_or(InterfaceError::NotOpen)?;

        debug!("Interface DNS -> {:?}", servers);
        settings.dns_servers = servers.clone();
        state.dns_history.push(servers);
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.settings.take().is_some() {
                info!("Interface closed");
            }
            state.host = None;
        }
    }
}
