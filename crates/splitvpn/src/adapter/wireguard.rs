//! WireGuard-style adapter
//!
//! Pure userspace: the Noise handshake and transport encryption run in
//! `boringtun`, datagrams go over a tokio UDP socket, and plaintext
//! packets move straight between the router and the tunnel. No interface
//! of its own is needed.
//!
//! Address and DNS come from the profile's `[Interface]` section rather
//! than from the server.

use super::{AdapterLink, SendError, TunnelAdapter};
use crate::backend::{EventSink, TunnelAddress};
use crate::config::{RouterSettings, TunnelDefinition, TunnelId, parse_cidr};
use crate::error::TunnelFailure;
use crate::keys::{KeyError, PresharedKey, PrivateKey, PublicKey};
use crate::protocol::ProtocolKind;
use async_trait::async_trait;
use boringtun::noise::errors::WireGuardError;
use boringtun::noise::{Tunn, TunnResult};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Timer tick for handshake retransmission and keepalives
const TIMER_TICK: Duration = Duration::from_millis(250);

/// Largest datagram we expect on the wire
const MAX_DATAGRAM: usize = 65_535;

/// Handshake messages are 148 bytes; data adds 32 bytes of overhead
const WG_OVERHEAD: usize = 148;

/// Profile parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("Missing {0}")]
    MissingField(&'static str),

    #[error("Invalid {field}: {source}")]
    InvalidKey {
        field: &'static str,
        source: KeyError,
    },

    #[error("Invalid {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("Unknown section [{0}]")]
    UnknownSection(String),
}

/// Parsed WireGuard-style profile
#[derive(Debug, Clone)]
pub struct WireGuardProfile {
    pub private_key: PrivateKey,
    pub addresses: Vec<TunnelAddress>,
    pub dns: Vec<IpAddr>,
    pub mtu: Option<u16>,
    pub peer_public_key: PublicKey,
    pub preshared_key: Option<PresharedKey>,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<(IpAddr, u8)>,
    pub persistent_keepalive: Option<u16>,
}

#[derive(PartialEq)]
enum Section {
    None,
    Interface,
    Peer,
}

impl WireGuardProfile {
    pub fn parse(text: &str) -> Result<Self, ProfileError> {
        let mut section = Section::None;
        let mut private_key = None;
        let mut addresses = Vec::new();
        let mut dns = Vec::new();
        let mut mtu = None;
        let mut peer_public_key = None;
        let mut preshared_key = None;
        let mut endpoint = None;
        let mut allowed_ips = Vec::new();
        let mut persistent_keepalive = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = match name.trim().to_ascii_lowercase().as_str() {
                    "interface" => Section::Interface,
                    "peer" if peer_public_key.is_none() => Section::Peer,
                    "peer" => {
                        debug!("Ignoring additional [Peer] section");
                        Section::None
                    }
                    other => return Err(ProfileError::UnknownSection(other.to_string())),
                };
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match (&section, key.as_str()) {
                (Section::Interface, "privatekey") => {
                    private_key = Some(PrivateKey::from_base64(value).map_err(|source| {
                        ProfileError::InvalidKey {
                            field: "PrivateKey",
                            source,
                        }
                    })?);
                }
                (Section::Interface, "address") => {
                    for item in list(value) {
                        let (addr, prefix) = parse_cidr(item)
                            .or_else(|| item.parse::<IpAddr>().ok().map(|a| (a, host_prefix(a))))
                            .ok_or_else(|| invalid("Address", item))?;
                        addresses.push(TunnelAddress { addr, prefix });
                    }
                }
                (Section::Interface, "dns") => {
                    // Search domains may be mixed into the DNS list
                    dns.extend(list(value).filter_map(|s| s.parse::<IpAddr>().ok()));
                }
                (Section::Interface, "mtu") => {
                    mtu = Some(value.parse().map_err(|_| invalid("MTU", value))?);
                }
                (Section::Peer, "publickey") => {
                    peer_public_key = Some(PublicKey::from_base64(value).map_err(|source| {
                        ProfileError::InvalidKey {
                            field: "PublicKey",
                            source,
                        }
                    })?);
                }
                (Section::Peer, "presharedkey") => {
                    preshared_key = Some(PresharedKey::from_base64(value).map_err(|source| {
                        ProfileError::InvalidKey {
                            field: "PresharedKey",
                            source,
                        }
                    })?);
                }
                (Section::Peer, "endpoint") => endpoint = Some(value.to_string()),
                (Section::Peer, "allowedips") => {
                    for item in list(value) {
                        allowed_ips.push(parse_cidr(item).ok_or_else(|| invalid("AllowedIPs", item))?);
                    }
                }
                (Section::Peer, "persistentkeepalive") => {
                    let secs: u16 = value.parse().map_err(|_| invalid("PersistentKeepalive", value))?;
                    persistent_keepalive = (secs > 0).then_some(secs);
                }
                _ => trace!("Ignoring profile key {}", key),
            }
        }

        Ok(Self {
            private_key: private_key.ok_or(ProfileError::MissingField("PrivateKey"))?,
            addresses,
            dns,
            mtu,
            peer_public_key: peer_public_key.ok_or(ProfileError::MissingField("[Peer] PublicKey"))?,
            preshared_key,
            endpoint,
            allowed_ips,
            persistent_keepalive,
        })
    }

    /// Address announced to the router: the first IPv4 one if any
    pub fn primary_address(&self) -> Option<TunnelAddress> {
        self.addresses
            .iter()
            .find(|a| a.addr.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }

    /// Whether the peer may send packets from `src`
    pub fn allows_source(&self, src: IpAddr) -> bool {
        self.allowed_ips.is_empty()
            || self
                .allowed_ips
                .iter()
                .any(|(net, prefix)| cidr_contains(*net, *prefix, src))
    }
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn invalid(field: &'static str, value: &str) -> ProfileError {
    ProfileError::InvalidValue {
        field,
        value: value.to_string(),
    }
}

fn host_prefix(addr: IpAddr) -> u8 {
    if addr.is_ipv4() { 32 } else { 128 }
}

fn cidr_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - prefix.min(32) as u32).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - prefix.min(128) as u32).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

fn source_of(packet: &[u8]) -> Option<IpAddr> {
    crate::packet::parse_flow(packet).ok().map(|f| f.src)
}

struct Session {
    socket: Arc<UdpSocket>,
    tunn: Arc<Mutex<Tunn>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Adapter for WireGuard-style profiles
pub struct WireGuardAdapter {
    tunnel: TunnelId,
    profile: Arc<WireGuardProfile>,
    endpoint: String,
    handshake_timeout: Duration,
    session: Mutex<Option<Session>>,
    connected: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<TunnelFailure>>>,
}

impl WireGuardAdapter {
    pub fn new(definition: &TunnelDefinition, settings: &RouterSettings) -> Result<Self, TunnelFailure> {
        let profile = WireGuardProfile::parse(&definition.config)
            .map_err(|e| TunnelFailure::configuration(format!("{}: {}", definition.id(), e)))?;

        if profile.primary_address().is_none() {
            return Err(TunnelFailure::configuration(format!(
                "{}: profile has no [Interface] Address",
                definition.id()
            )));
        }

        let endpoint = profile
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("{}:{}", definition.host, definition.port));

        Ok(Self {
            tunnel: definition.id(),
            profile: Arc::new(profile),
            endpoint,
            handshake_timeout: settings.handshake_timeout(),
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
        })
    }

    pub fn profile(&self) -> &WireGuardProfile {
        &self.profile
    }

    fn take_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|mut s| s.take())
    }

    fn record_error(&self, failure: &TunnelFailure) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(failure.clone());
        }
    }

    async fn open_socket(&self) -> Result<(UdpSocket, SocketAddr), TunnelFailure> {
        let peer = tokio::net::lookup_host(&self.endpoint)
            .await
            .map_err(|e| TunnelFailure::transient(format!("resolve {}: {}", self.endpoint, e)))?
            .next()
            .ok_or_else(|| TunnelFailure::transient(format!("{} did not resolve", self.endpoint)))?;

        let bind: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| TunnelFailure::configuration("bind address"))?
        } else {
            "[::]:0".parse().map_err(|_| TunnelFailure::configuration("bind address"))?
        };

        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| TunnelFailure::transient(format!("bind: {}", e)))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| TunnelFailure::transient(format!("connect {}: {}", peer, e)))?;

        Ok((socket, peer))
    }
}

#[async_trait]
impl TunnelAdapter for WireGuardAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::WireGuardLike
    }

    async fn connect(&self, link: AdapterLink) -> Result<(), TunnelFailure> {
        if let Some(old) = self.take_session() {
            stop_session(old);
        }
        self.connected.store(false, Ordering::Relaxed);

        let (socket, peer) = self
            .open_socket()
            .await
            .inspect_err(|failure| self.record_error(failure))?;
        let socket = Arc::new(socket);

        let tunn = Tunn::new(
            self.profile.private_key.to_secret(),
            self.profile.peer_public_key.as_key(),
            self.profile.preshared_key.as_ref().map(|k| k.to_bytes()),
            self.profile.persistent_keepalive,
            rand::random::<u32>() >> 8,
            None,
        );
        let tunn = Arc::new(Mutex::new(tunn));

        info!("[{}] WireGuard handshake with {}", self.tunnel, peer);
        link.events.authenticating();
        send_handshake(&self.tunnel, &tunn, &socket, false)
            .inspect_err(|failure| self.record_error(failure))?;

        let announced = Arc::new(AtomicBool::new(false));
        let worker = SessionWorker {
            tunnel: self.tunnel.clone(),
            profile: self.profile.clone(),
            socket: socket.clone(),
            tunn: tunn.clone(),
            events: link.events,
            announced,
            connected: self.connected.clone(),
            last_error: self.last_error.clone(),
        };

        let reader = tokio::spawn(worker.clone().run_reader(link.inbound));
        let timers = tokio::spawn(worker.run_timers(self.handshake_timeout));

        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(Session {
                socket,
                tunn,
                tasks: vec![reader, timers],
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(session) = self.take_session() {
            info!("[{}] closing WireGuard session", self.tunnel);
            stop_session(session);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn send(&self, packet: Bytes) -> Result<(), SendError> {
        let (socket, tunn) = {
            let session = self.session.lock().map_err(|_| SendError::NotConnected)?;
            let session = session.as_ref().ok_or(SendError::NotConnected)?;
            (session.socket.clone(), session.tunn.clone())
        };

        let mut buf = vec![0u8; packet.len() + WG_OVERHEAD];
        let mut tunn = tunn.lock().map_err(|_| SendError::NotConnected)?;

        match tunn.encapsulate(&packet, &mut buf) {
            TunnResult::WriteToNetwork(datagram) => socket.try_send(datagram).map(|_| ()).map_err(|e| {
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    SendError::QueueFull
                } else {
                    SendError::Transport(e.to_string())
                }
            }),
            // Queued inside the engine until the handshake completes
            TunnResult::Done => Ok(()),
            TunnResult::Err(e) => Err(SendError::Transport(format!("{:?}", e))),
            _ => Ok(()),
        }
    }

    fn last_error(&self) -> Option<TunnelFailure> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn abort(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(session) = self.take_session() {
            stop_session(session);
        }
    }
}

fn stop_session(session: Session) {
    for task in session.tasks {
        task.abort();
    }
}

fn send_handshake(
    tunnel: &TunnelId,
    tunn: &Mutex<Tunn>,
    socket: &UdpSocket,
    force: bool,
) -> Result<(), TunnelFailure> {
    let mut buf = vec![0u8; WG_OVERHEAD];
    let mut tunn = tunn
        .lock()
        .map_err(|_| TunnelFailure::transient("tunnel state poisoned"))?;

    match tunn.format_handshake_initiation(&mut buf, force) {
        TunnResult::WriteToNetwork(init) => {
            socket
                .try_send(init)
                .map_err(|e| TunnelFailure::transient(format!("send handshake: {}", e)))?;
            debug!("[{}] handshake initiation sent", tunnel);
            Ok(())
        }
        TunnResult::Err(e) => Err(TunnelFailure::transient(format!("handshake: {:?}", e))),
        _ => Ok(()),
    }
}

#[derive(Clone)]
struct SessionWorker {
    tunnel: TunnelId,
    profile: Arc<WireGuardProfile>,
    socket: Arc<UdpSocket>,
    tunn: Arc<Mutex<Tunn>>,
    events: EventSink,
    announced: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<TunnelFailure>>>,
}

impl SessionWorker {
    fn fail(&self, failure: TunnelFailure) {
        self.connected.store(false, Ordering::Relaxed);
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(failure.clone());
        }
        self.events.error(failure);
    }

    /// First completed handshake: report the statically configured session
    fn announce(&self) {
        if self.announced.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("[{}] WireGuard handshake complete", self.tunnel);
        self.connected.store(true, Ordering::Relaxed);
        self.events.connected();
        if let Some(mtu) = self.profile.mtu {
            self.events.mtu(mtu);
        }
        if let Some(address) = self.profile.primary_address() {
            self.events.ip_assigned(address);
        }
        if self.profile.dns.is_empty() {
            self.events.dns_waived();
        } else {
            self.events.dns_servers(self.profile.dns.clone());
        }
    }

    async fn run_reader(self, inbound: tokio::sync::mpsc::Sender<Bytes>) {
        let mut datagram = vec![0u8; MAX_DATAGRAM];
        let mut out = vec![0u8; MAX_DATAGRAM];

        loop {
            let n = match self.socket.recv(&mut datagram).await {
                Ok(n) => n,
                Err(e) => {
                    self.fail(TunnelFailure::transient(format!("socket: {}", e)));
                    return;
                }
            };

            let handshake_done = {
                let Ok(mut tunn) = self.tunn.lock() else {
                    return;
                };

                let mut result = tunn.decapsulate(None, &datagram[..n], &mut out);
                loop {
                    match result {
                        TunnResult::WriteToNetwork(reply) => {
                            if let Err(e) = self.socket.try_send(reply) {
                                trace!("[{}] dropped outgoing datagram: {}", self.tunnel, e);
                            }
                            // Flush packets queued behind the handshake
                            result = tunn.decapsulate(None, &[], &mut out);
                        }
                        TunnResult::WriteToTunnelV4(packet, _) | TunnResult::WriteToTunnelV6(packet, _) => {
                            let allowed = source_of(packet).is_some_and(|src| self.profile.allows_source(src));
                            if !allowed {
                                trace!("[{}] dropping packet from disallowed source", self.tunnel);
                            } else if inbound.try_send(Bytes::copy_from_slice(packet)).is_err() {
                                trace!("[{}] inbound queue full, dropping packet", self.tunnel);
                            }
                            break;
                        }
                        TunnResult::Err(e) => {
                            debug!("[{}] decapsulate error: {:?}", self.tunnel, e);
                            break;
                        }
                        TunnResult::Done => break,
                    }
                }

                tunn.stats().0.is_some()
            };

            if handshake_done {
                self.announce();
            }
        }
    }

    async fn run_timers(self, handshake_timeout: Duration) {
        let mut ticker = tokio::time::interval(TIMER_TICK);
        let mut out = vec![0u8; MAX_DATAGRAM];
        let mut last_initiation = Instant::now();

        loop {
            ticker.tick().await;

            let expired = {
                let Ok(mut tunn) = self.tunn.lock() else {
                    return;
                };
                match tunn.update_timers(&mut out) {
                    TunnResult::WriteToNetwork(datagram) => {
                        let _ = self.socket.try_send(datagram);
                        false
                    }
                    TunnResult::Err(WireGuardError::ConnectionExpired) => true,
                    TunnResult::Err(e) => {
                        trace!("[{}] timer error: {:?}", self.tunnel, e);
                        false
                    }
                    _ => false,
                }
            };

            if expired {
                warn!("[{}] WireGuard session expired", self.tunnel);
                self.fail(TunnelFailure::transient("session expired"));
                return;
            }

            if !self.announced.load(Ordering::Relaxed) && last_initiation.elapsed() >= handshake_timeout {
                debug!("[{}] no handshake response, retrying", self.tunnel);
                last_initiation = Instant::now();
                if let Err(failure) = send_handshake(&self.tunnel, &self.tunn, &self.socket, true) {
                    self.fail(failure);
                    return;
                }
            }
        }
    }
}
