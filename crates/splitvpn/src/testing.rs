//! Test fixtures shared across modules

use crate::adapter::openvpn::EngineControl;
use crate::adapter::{
    AdapterFactory, AdapterLink, EngineEvent, EngineSession, OpenVpnEngine, SendError, TunnelAdapter,
};
use crate::backend::{EventSink, PacketDelivery, TunnelAddress};
use crate::config::{Credentials, RouterSettings, TunnelDefinition, TunnelId};
use crate::error::TunnelFailure;
use crate::keys::{PrivateKey, PublicKey};
use crate::packet::{IPPROTO_TCP, IPPROTO_UDP};
use crate::protocol::ProtocolKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

fn checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]) as u32)
        .sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn transport_header(proto: u8, sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
    let mut l4 = Vec::new();
    match proto {
        IPPROTO_UDP => {
            l4.extend_from_slice(&sport.to_be_bytes());
            l4.extend_from_slice(&dport.to_be_bytes());
            l4.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
            l4.extend_from_slice(&[0, 0]);
        }
        IPPROTO_TCP => {
            l4.extend_from_slice(&sport.to_be_bytes());
            l4.extend_from_slice(&dport.to_be_bytes());
            l4.extend_from_slice(&[0; 8]);
            l4.extend_from_slice(&[0x50, 0x18, 0xFF, 0xFF, 0, 0, 0, 0]);
        }
        _ => {}
    }
    l4
}

/// Well-formed IPv4 packet (IHL 5) carrying `payload`
pub fn ipv4_packet(proto: u8, src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
    let l4 = transport_header(proto, sport, dport, payload.len());
    let total = 20 + l4.len() + payload.len();

    let mut pkt = vec![0u8; 20];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = proto;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    let sum = checksum(&pkt);
    pkt[10..12].copy_from_slice(&sum.to_be_bytes());

    pkt.extend_from_slice(&l4);
    pkt.extend_from_slice(payload);
    pkt
}

pub fn ipv6_udp_packet(src: Ipv6Addr, sport: u16, dst: Ipv6Addr, dport: u16) -> Vec<u8> {
    let l4 = transport_header(IPPROTO_UDP, sport, dport, 0);

    let mut pkt = vec![0u8; 40];
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&(l4.len() as u16).to_be_bytes());
    pkt[6] = IPPROTO_UDP;
    pkt[7] = 64;
    pkt[8..24].copy_from_slice(&src.octets());
    pkt[24..40].copy_from_slice(&dst.octets());
    pkt.extend_from_slice(&l4);
    pkt
}

/// Insert one extension header after the fixed IPv6 header. The first
/// byte of `header` is overwritten with the chained next-header value.
pub fn ipv6_with_extension(packet: &[u8], kind: u8, header: &[u8]) -> Vec<u8> {
    let mut pkt = packet[..40].to_vec();
    let payload = u16::from_be_bytes([pkt[4], pkt[5]]) + header.len() as u16;
    pkt[4..6].copy_from_slice(&payload.to_be_bytes());
    pkt[6] = kind;

    let mut extension = header.to_vec();
    extension[0] = packet[6];
    pkt.extend_from_slice(&extension);
    pkt.extend_from_slice(&packet[40..]);
    pkt
}

/// The reply a remote peer would send for an IPv4 TCP/UDP packet
pub fn reply_to(packet: &[u8]) -> Vec<u8> {
    let mut reply = packet.to_vec();
    if reply.len() < 24 || reply[0] >> 4 != 4 {
        return reply;
    }
    let (src, dst) = (packet[12..16].to_vec(), packet[16..20].to_vec());
    reply[12..16].copy_from_slice(&dst);
    reply[16..20].copy_from_slice(&src);
    if matches!(packet[9], IPPROTO_TCP | IPPROTO_UDP) {
        reply[20..22].copy_from_slice(&packet[22..24]);
        reply[22..24].copy_from_slice(&packet[20..22]);
    }
    reply
}

/// Poll `condition` until it holds; panics after 30 s
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

pub fn wg_profile_text(private: &PrivateKey, peer: &PublicKey, endpoint: Option<&str>) -> String {
    let mut text = format!(
        "[Interface]\n\
         PrivateKey = {}\n\
         Address = 10.66.0.2/32\n\
         DNS = 10.66.0.1\n\
         MTU = 1420\n\
         \n\
         [Peer]\n\
         PublicKey = {}\n\
         AllowedIPs = 0.0.0.0/0\n\
         PersistentKeepalive = 25\n",
        private.to_base64(),
        peer
    );
    if let Some(endpoint) = endpoint {
        text.push_str(&format!("Endpoint = {}\n", endpoint));
    }
    text
}

pub fn wg_definition(provider: &str, region: &str) -> TunnelDefinition {
    let text = wg_profile_text(
        &PrivateKey::generate(),
        &PrivateKey::generate().public_key(),
        Some("127.0.0.1:51820"),
    );
    TunnelDefinition::new(provider, region, "127.0.0.1", 51820, text)
}

pub fn openvpn_definition(provider: &str, region: &str) -> TunnelDefinition {
    let host = format!("{}.{}.example.net", region.to_lowercase(), provider);
    TunnelDefinition::new(
        provider,
        region,
        host.clone(),
        1194,
        format!("client\ndev tun\nproto udp\nremote {} 1194\nauth-user-pass\n", host),
    )
    .with_credentials(Credentials::new("user", "secret"))
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Records every delivered packet
pub struct RecordingDelivery {
    tx: mpsc::UnboundedSender<(TunnelId, Bytes)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(TunnelId, Bytes)>>,
}

impl RecordingDelivery {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub async fn next(&self) -> (TunnelId, Bytes) {
        self.rx.lock().await.recv().await.expect("delivery channel closed")
    }
}

impl PacketDelivery for RecordingDelivery {
    fn deliver(&self, from: &TunnelId, packet: Bytes) {
        let _ = self.tx.send((from.clone(), packet));
    }
}

// ---------------------------------------------------------------------------
// Mock adapter
// ---------------------------------------------------------------------------

/// How a `MockAdapter` session behaves
#[derive(Debug, Clone)]
pub enum MockScript {
    /// Connected, addressed, optionally with DNS
    Ready { dns: bool },
    /// Session up with an address but DNS never arrives
    NoDns,
    /// Launches but never reports anything
    Hang,
    /// `connect` itself fails
    Fail(TunnelFailure),
    /// The first `n` connects fail, later ones become ready
    FailTimes(u32, TunnelFailure),
}

impl MockScript {
    pub fn ready() -> Self {
        MockScript::Ready { dns: true }
    }
}

pub struct MockAdapter {
    script: MockScript,
    echo: AtomicBool,
    stuck_disconnect: AtomicBool,
    connected: AtomicBool,
    connects: AtomicU32,
    disconnects: AtomicU32,
    aborts: AtomicU32,
    link: Mutex<Option<(EventSink, mpsc::Sender<Bytes>)>>,
    sent: Mutex<Vec<Bytes>>,
    last_error: Mutex<Option<TunnelFailure>>,
}

impl MockAdapter {
    pub fn new(script: MockScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            echo: AtomicBool::new(false),
            stuck_disconnect: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            aborts: AtomicU32::new(0),
            link: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
        })
    }

    /// Answer every sent packet with its reply
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::Relaxed);
    }

    /// Make `disconnect` wait forever, like a server that never acknowledges
    pub fn set_stuck_disconnect(&self, stuck: bool) {
        self.stuck_disconnect.store(stuck, Ordering::Relaxed);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u32 {
        self.aborts.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub async fn wait_sent(&self, n: usize) -> Vec<Bytes> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let sent = self.sent();
                if sent.len() >= n {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("packets were not sent in time")
    }

    /// Inject a packet as if it arrived from the remote end
    pub fn inject(&self, packet: Bytes) {
        if let Some((_, inbound)) = self.link.lock().unwrap().as_ref() {
            let _ = inbound.try_send(packet);
        }
    }

    /// Simulate the server dropping the session
    pub fn drop_session(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some((events, _)) = self.link.lock().unwrap().as_ref() {
            events.closed();
        }
    }

    /// Finish a session that was launched with `MockScript::Hang`
    pub fn announce_ready(&self) {
        if let Some((events, _)) = self.link.lock().unwrap().as_ref() {
            Self::announce(events, true);
        }
    }

    fn announce(events: &EventSink, dns: bool) {
        events.authenticating();
        events.connected();
        events.ip_assigned(TunnelAddress {
            addr: IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)),
            prefix: 24,
        });
        if dns {
            events.dns_servers(vec![IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1))]);
        } else {
            events.dns_waived();
        }
    }
}

#[async_trait]
impl TunnelAdapter for MockAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::WireGuardLike
    }

    async fn connect(&self, link: AdapterLink) -> Result<(), TunnelFailure> {
        let attempt = self.connects.fetch_add(1, Ordering::Relaxed) + 1;
        *self.link.lock().unwrap() = Some((link.events.clone(), link.inbound.clone()));

        let fail = |failure: &TunnelFailure| -> Result<(), TunnelFailure> {
            *self.last_error.lock().unwrap() = Some(failure.clone());
            Err(failure.clone())
        };

        match &self.script {
            MockScript::Ready { dns } => Self::announce(&link.events, *dns),
            MockScript::NoDns => {
                link.events.connected();
                link.events.ip_assigned(TunnelAddress {
                    addr: IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)),
                    prefix: 24,
                });
            }
            MockScript::Hang => {}
            MockScript::Fail(failure) => return fail(failure),
            MockScript::FailTimes(n, failure) if attempt <= *n => return fail(failure),
            MockScript::FailTimes(..) => Self::announce(&link.events, true),
        }
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.stuck_disconnect.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        self.connected.store(false, Ordering::Relaxed);
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        *self.link.lock().unwrap() = None;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn send(&self, packet: Bytes) -> Result<(), SendError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(SendError::NotConnected);
        }
        if self.echo.load(Ordering::Relaxed) {
            self.inject(Bytes::from(reply_to(&packet)));
        }
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    fn last_error(&self) -> Option<TunnelFailure> {
        self.last_error.lock().unwrap().clone()
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        *self.link.lock().unwrap() = None;
    }
}

/// Builds `MockAdapter`s by tunnel id and keeps hold of them
#[derive(Default)]
pub struct MockFactory {
    scripts: Mutex<HashMap<TunnelId, MockScript>>,
    created: Mutex<Vec<(TunnelId, Arc<MockAdapter>)>>,
    echo: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every adapter built from now on echoes replies
    pub fn echoing() -> Arc<Self> {
        let factory = Self::default();
        factory.echo.store(true, Ordering::Relaxed);
        Arc::new(factory)
    }

    pub fn script(&self, tunnel: &str, script: MockScript) {
        self.scripts.lock().unwrap().insert(TunnelId::from(tunnel), script);
    }

    /// Most recently built adapter for the tunnel
    pub fn adapter(&self, tunnel: &str) -> Option<Arc<MockAdapter>> {
        let id = TunnelId::from(tunnel);
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| *t == id)
            .map(|(_, a)| a.clone())
    }

    pub fn created(&self, tunnel: &str) -> usize {
        let id = TunnelId::from(tunnel);
        self.created.lock().unwrap().iter().filter(|(t, _)| *t == id).count()
    }
}

impl AdapterFactory for MockFactory {
    fn create(
        &self,
        definition: &TunnelDefinition,
        _settings: &RouterSettings,
    ) -> Result<Arc<dyn TunnelAdapter>, TunnelFailure> {
        let id = definition.id();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(MockScript::ready);

        let adapter = MockAdapter::new(script);
        adapter.set_echo(self.echo.load(Ordering::Relaxed));
        self.created.lock().unwrap().push((id, adapter.clone()));
        Ok(adapter)
    }
}

// ---------------------------------------------------------------------------
// Scripted OpenVPN engine
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum EngineMode {
    Ready,
    AuthFailure,
    Echo,
}

pub struct ScriptedEngine {
    mode: EngineMode,
    profiles: Mutex<Vec<String>>,
    /// (headroom, tailroom) of every packet the engine received
    framing: Arc<Mutex<Vec<(usize, usize)>>>,
}

struct ScriptedControl {
    task: tokio::task::JoinHandle<()>,
}

impl EngineControl for ScriptedControl {
    fn stop(&self) {
        self.task.abort();
    }
}

impl ScriptedEngine {
    fn with_mode(mode: EngineMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            profiles: Mutex::new(Vec::new()),
            framing: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn ready() -> Arc<Self> {
        Self::with_mode(EngineMode::Ready)
    }

    pub fn auth_failure() -> Arc<Self> {
        Self::with_mode(EngineMode::AuthFailure)
    }

    /// Ready, and loops every packet straight back
    pub fn echo() -> Arc<Self> {
        Self::with_mode(EngineMode::Echo)
    }

    pub fn last_profile(&self) -> Option<String> {
        self.profiles.lock().unwrap().last().cloned()
    }

    pub fn framing(&self) -> Vec<(usize, usize)> {
        self.framing.lock().unwrap().clone()
    }
}

#[async_trait]
impl OpenVpnEngine for ScriptedEngine {
    async fn start(&self, session: EngineSession) -> Result<Box<dyn EngineControl>, TunnelFailure> {
        self.profiles.lock().unwrap().push(session.profile.clone());
        let mode = self.mode;
        let framing = self.framing.clone();

        let task = tokio::spawn(async move {
            let EngineSession { events, mut device, .. } = session;
            let _ = events.send(EngineEvent::Authenticating).await;

            if let EngineMode::AuthFailure = mode {
                let _ = events.send(EngineEvent::AuthFailed("AUTH_FAILED".into())).await;
                return;
            }

            let _ = events.send(EngineEvent::Connected).await;
            let _ = events
                .send(EngineEvent::PushedOptions(
                    "ifconfig 10.8.0.2 255.255.255.0,dhcp-option DNS 10.8.0.1".into(),
                ))
                .await;

            while let Some(packet) = device.recv().await {
                framing.lock().unwrap().push((packet.headroom(), packet.tailroom()));
                if let EngineMode::Echo = mode {
                    let _ = device.send(packet).await;
                }
            }
        });

        Ok(Box::new(ScriptedControl { task }))
    }
}
