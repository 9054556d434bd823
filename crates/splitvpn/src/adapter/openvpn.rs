//! OpenVPN-style adapter
//!
//! Wraps an external OpenVPN engine. The engine expects to own a TUN
//! device, so it is handed one end of an in-process packet pipe as its
//! device while the adapter keeps the other end and moves packets between
//! the pipe and the router. The engine is the only code that crosses the
//! FFI boundary; it lives behind `OpenVpnEngine`.
//!
//! Address, DNS and MTU are learned from the server's pushed options.

use super::{AdapterLink, SendError, TunnelAdapter};
use crate::backend::{EventSink, TunnelAddress};
use crate::config::{Credentials, RouterSettings, TunnelDefinition, TunnelId};
use crate::error::TunnelFailure;
use crate::pipe::{PipeSender, packet_pipe};
use crate::protocol::ProtocolKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Directives the engine rejects
const UNSUPPORTED_DIRECTIVES: &[&str] = &["ping-timer-rem", "remote-random", "fast-io"];

/// Prefix used when a pushed netmask is missing or not contiguous
const DEFAULT_PREFIX: u8 = 24;

/// Event queue depth between the engine and the adapter
const ENGINE_EVENT_CAPACITY: usize = 64;

/// Lifecycle events reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Credentials submitted, waiting for the server's verdict
    Authenticating,
    Connected,
    /// Raw pushed option list (`PUSH_REPLY` body, comma or newline separated)
    PushedOptions(String),
    AuthFailed(String),
    Error(String),
    /// The engine is restarting its session in place
    Reconnecting,
    Disconnected,
}

/// Everything the engine needs to run one client session
pub struct EngineSession {
    pub tunnel: TunnelId,
    /// Profile after preparation
    pub profile: String,
    pub credentials: Credentials,
    /// The engine's "TUN device"
    pub device: crate::pipe::PipeEnd,
    pub events: mpsc::Sender<EngineEvent>,
    pub connect_timeout: Duration,
}

/// Control over a running engine session
pub trait EngineControl: Send + Sync {
    fn stop(&self);

    /// Soft restart of the session; false when unsupported
    fn reconnect(&self) -> bool {
        false
    }
}

/// An OpenVPN client engine
#[async_trait]
pub trait OpenVpnEngine: Send + Sync {
    /// Launch a session. Progress is reported on `session.events`.
    async fn start(&self, session: EngineSession) -> Result<Box<dyn EngineControl>, TunnelFailure>;
}

/// Options pushed by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushedOptions {
    pub address: Option<TunnelAddress>,
    pub dns: Vec<IpAddr>,
    pub mtu: Option<u16>,
}

/// Parse the server's pushed option list
pub fn parse_pushed_options(text: &str) -> PushedOptions {
    let mut options = PushedOptions::default();
    let mut v6_address = None;

    for item in text.split([',', '\n']) {
        let mut parts = item.split_whitespace();
        match parts.next() {
            Some("ifconfig") => {
                let addr = parts.next().and_then(|a| a.parse::<Ipv4Addr>().ok());
                let mask = parts.next().and_then(|m| m.parse::<Ipv4Addr>().ok());
                if let Some(addr) = addr {
                    let prefix = mask.and_then(netmask_prefix).unwrap_or(DEFAULT_PREFIX);
                    options.address = Some(TunnelAddress {
                        addr: IpAddr::V4(addr),
                        prefix,
                    });
                }
            }
            Some("ifconfig-ipv6") => {
                v6_address = parts
                    .next()
                    .and_then(crate::config::parse_cidr)
                    .map(|(addr, prefix)| TunnelAddress { addr, prefix });
            }
            Some("dhcp-option") => {
                if parts.next() == Some("DNS") {
                    if let Some(server) = parts.next().and_then(|s| s.parse::<IpAddr>().ok()) {
                        if !options.dns.contains(&server) {
                            options.dns.push(server);
                        }
                    }
                }
            }
            Some("tun-mtu") => {
                options.mtu = parts.next().and_then(|m| m.parse().ok());
            }
            _ => {}
        }
    }

    if options.address.is_none() {
        options.address = v6_address;
    }
    options
}

/// Prefix length of a contiguous netmask
fn netmask_prefix(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) == 0 {
        Some(ones as u8)
    } else {
        None
    }
}

fn directive(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.starts_with('#') || line.starts_with(';') {
        return None;
    }
    line.split_whitespace().next()
}

/// Rewrite a provider profile into something the engine accepts
pub fn prepare_profile(text: &str, host: &str, port: u16) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut has_auth_user_pass = false;
    let mut has_remote = false;

    for line in text.lines() {
        match directive(line) {
            Some(d) if UNSUPPORTED_DIRECTIVES.contains(&d) => {
                debug!("Removing unsupported directive: {}", d);
            }
            // Credentials are supplied directly, never from a file
            Some("auth-user-pass") => {
                if !has_auth_user_pass {
                    lines.push("auth-user-pass".to_string());
                    has_auth_user_pass = true;
                }
            }
            Some(d) => {
                if d == "remote" {
                    has_remote = true;
                }
                lines.push(line.to_string());
            }
            None => lines.push(line.to_string()),
        }
    }

    if !has_auth_user_pass {
        lines.push("auth-user-pass".to_string());
    }

    if !lines.iter().any(|l| directive(l) == Some("client-cert-not-required")) {
        match lines.iter().position(|l| directive(l) == Some("auth")) {
            Some(pos) => lines.insert(pos, "client-cert-not-required".to_string()),
            None => lines.push("client-cert-not-required".to_string()),
        }
    }

    if !has_remote {
        lines.push(format!("remote {} {}", host, port));
    }

    let mut profile = lines.join("\n");
    profile.push('\n');
    profile
}

struct Session {
    control: Box<dyn EngineControl>,
    device: PipeSender,
    tasks: Vec<JoinHandle<()>>,
}

/// Adapter for OpenVPN-style profiles
pub struct OpenVpnAdapter {
    tunnel: TunnelId,
    profile: String,
    credentials: Credentials,
    engine: Arc<dyn OpenVpnEngine>,
    connect_timeout: Duration,
    pipe_capacity: usize,
    session: Mutex<Option<Session>>,
    connected: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<TunnelFailure>>>,
}

impl OpenVpnAdapter {
    pub fn new(
        definition: &TunnelDefinition,
        engine: Arc<dyn OpenVpnEngine>,
        settings: &RouterSettings,
    ) -> Result<Self, TunnelFailure> {
        let credentials = match &definition.credentials {
            Some(c) if !c.is_empty() => c.clone(),
            _ => {
                return Err(TunnelFailure::configuration(format!(
                    "{} requires a username and password",
                    definition.id()
                )));
            }
        };

        Ok(Self {
            tunnel: definition.id(),
            profile: prepare_profile(&definition.config, &definition.host, definition.port),
            credentials,
            engine,
            connect_timeout: settings.connect_timeout(),
            pipe_capacity: settings.tunnel_queue_capacity,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
        })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    fn take_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|mut s| s.take())
    }

    fn record_error(last_error: &Mutex<Option<TunnelFailure>>, failure: &TunnelFailure) {
        if let Ok(mut slot) = last_error.lock() {
            *slot = Some(failure.clone());
        }
    }
}

#[async_trait]
impl TunnelAdapter for OpenVpnAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::OpenVpnLike
    }

    async fn connect(&self, link: AdapterLink) -> Result<(), TunnelFailure> {
        if let Some(old) = self.take_session() {
            stop_session(old);
        }
        self.connected.store(false, Ordering::Relaxed);

        let (router_end, engine_end) = packet_pipe(self.pipe_capacity);
        let (events_tx, events_rx) = mpsc::channel(ENGINE_EVENT_CAPACITY);

        info!("[{}] starting OpenVPN engine", self.tunnel);
        link.events.authenticating();

        let control = self
            .engine
            .start(EngineSession {
                tunnel: self.tunnel.clone(),
                profile: self.profile.clone(),
                credentials: self.credentials.clone(),
                device: engine_end,
                events: events_tx,
                connect_timeout: self.connect_timeout,
            })
            .await
            .inspect_err(|failure| Self::record_error(&self.last_error, failure))?;

        let (device, mut from_engine) = router_end.split();

        let inbound = link.inbound.clone();
        let tunnel = self.tunnel.clone();
        let reader = tokio::spawn(async move {
            while let Some(packet) = from_engine.recv().await {
                if inbound.try_send(packet.freeze()).is_err() {
                    trace!("[{}] inbound queue full, dropping packet", tunnel);
                }
            }
        });

        let pump = tokio::spawn(pump_events(
            self.tunnel.clone(),
            events_rx,
            link.events,
            self.connected.clone(),
            self.last_error.clone(),
        ));

        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(Session {
                control,
                device,
                tasks: vec![reader, pump],
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(session) = self.take_session() {
            info!("[{}] stopping OpenVPN engine", self.tunnel);
            stop_session(session);
        }
    }

    async fn reconnect(&self) -> bool {
        let restarted = self
            .session
            .lock()
            .map(|s| s.as_ref().is_some_and(|s| s.control.reconnect()))
            .unwrap_or(false);

        if restarted {
            info!("[{}] soft reconnect requested", self.tunnel);
            self.connected.store(false, Ordering::Relaxed);
        }
        restarted
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn send(&self, packet: Bytes) -> Result<(), SendError> {
        let session = self.session.lock().map_err(|_| SendError::NotConnected)?;
        let session = session.as_ref().ok_or(SendError::NotConnected)?;

        // Engine-bound packets carry headroom for its encapsulation
        session.device.try_send_packet(&packet).map_err(|e| match e {
            crate::pipe::PipeError::Full => SendError::QueueFull,
            _ => SendError::NotConnected,
        })
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
    session.control.stop();
    for task in session.tasks {
        task.abort();
    }
}

async fn pump_events(
    tunnel: TunnelId,
    mut events: mpsc::Receiver<EngineEvent>,
    sink: EventSink,
    connected: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<TunnelFailure>>>,
) {
    while let Some(event) = events.recv().await {
        debug!("[{}] engine event: {:?}", tunnel, event);

        match event {
            EngineEvent::Authenticating => sink.authenticating(),
            EngineEvent::Connected => {
                connected.store(true, Ordering::Relaxed);
                sink.connected();
            }
            EngineEvent::PushedOptions(text) => {
                let options = parse_pushed_options(&text);
                if let Some(mtu) = options.mtu {
                    sink.mtu(mtu);
                }
                if let Some(address) = options.address {
                    sink.ip_assigned(address);
                } else {
                    warn!("[{}] server pushed no ifconfig", tunnel);
                }
                // A complete push without DNS means the provider does not supply any
                if options.dns.is_empty() {
                    sink.dns_waived();
                } else {
                    sink.dns_servers(options.dns);
                }
            }
            EngineEvent::AuthFailed(message) => {
                let failure = TunnelFailure::authentication(message);
                OpenVpnAdapter::record_error(&last_error, &failure);
                connected.store(false, Ordering::Relaxed);
                sink.error(failure);
            }
            EngineEvent::Error(message) => {
                let failure = TunnelFailure::from_engine_message(message);
                OpenVpnAdapter::record_error(&last_error, &failure);
                connected.store(false, Ordering::Relaxed);
                sink.error(failure);
            }
            EngineEvent::Reconnecting => {
                connected.store(false, Ordering::Relaxed);
            }
            EngineEvent::Disconnected => {
                connected.store(false, Ordering::Relaxed);
                sink.closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TunnelBackend;
    use crate::error::FailureKind;
    use crate::pipe::{PIPE_HEADROOM, PIPE_TAILROOM};
    use crate::testing::{RecordingDelivery, ScriptedEngine, openvpn_definition};

    #[test]
    fn test_prepare_profile_rewrites_directives() {
        let profile = "client\n\
                       dev tun\n\
                       remote uk.example.net 1194\n\
                       remote-random\n\
                       ping-timer-rem\n\
                       fast-io\n\
                       auth-user-pass /etc/openvpn/creds.txt\n\
                       auth SHA512\n";
        let prepared = prepare_profile(profile, "ignored", 1);

        assert!(!prepared.contains("remote-random"));
        assert!(!prepared.contains("ping-timer-rem"));
        assert!(!prepared.contains("fast-io"));
        assert!(prepared.contains("\nauth-user-pass\n"));
        assert!(!prepared.contains("creds.txt"));
        assert!(prepared.contains("client-cert-not-required\nauth SHA512"));
        assert!(!prepared.contains("remote ignored 1"));
    }

    #[test]
    fn test_prepare_profile_appends_missing() {
        let prepared = prepare_profile("client\ndev tun\n", "fr.example.net", 443);
        let lines: Vec<&str> = prepared.lines().collect();

        assert!(lines.contains(&"auth-user-pass"));
        assert!(lines.contains(&"client-cert-not-required"));
        assert_eq!(lines.last(), Some(&"remote fr.example.net 443"));
    }

    #[test]
    fn test_prepare_profile_keeps_comments() {
        let prepared = prepare_profile("# fast-io is slow\nclient\n", "h", 1);
        assert!(prepared.starts_with("# fast-io is slow\n"));
    }

    #[test]
    fn test_parse_pushed_options() {
        let options = parse_pushed_options(
            "route-gateway 10.8.0.1,topology subnet,ping 10,dhcp-option DNS 10.8.0.1,\
             dhcp-option DNS 8.8.8.8,dhcp-option DNS 10.8.0.1,ifconfig 10.8.0.2 255.255.0.0,tun-mtu 1400",
        );

        assert_eq!(
            options.address,
            Some(TunnelAddress {
                addr: IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)),
                prefix: 16
            })
        );
        assert_eq!(options.dns.len(), 2);
        assert_eq!(options.mtu, Some(1400));
    }

    #[test]
    fn test_pushed_net30_defaults_prefix() {
        let options = parse_pushed_options("ifconfig 10.8.0.6 10.8.0.5");
        assert_eq!(options.address.unwrap().prefix, DEFAULT_PREFIX);
        assert!(options.dns.is_empty());
    }

    #[test]
    fn test_netmask_prefix() {
        assert_eq!(netmask_prefix(Ipv4Addr::new(255, 255, 255, 0)), Some(24));
        assert_eq!(netmask_prefix(Ipv4Addr::new(255, 255, 255, 255)), Some(32));
        assert_eq!(netmask_prefix(Ipv4Addr::new(0, 0, 0, 0)), Some(0));
        assert_eq!(netmask_prefix(Ipv4Addr::new(255, 0, 255, 0)), None);
    }

    #[test]
    fn test_credentials_required() {
        let mut def = openvpn_definition("p", "FR");
        def.credentials = None;
        let err = OpenVpnAdapter::new(&def, ScriptedEngine::ready(), &RouterSettings::default())
            .err()
            .unwrap();
        assert_eq!(err.kind, FailureKind::Configuration);
    }

    #[tokio::test]
    async fn test_engine_events_drive_readiness() {
        let engine = ScriptedEngine::ready();
        let adapter = Arc::new(
            OpenVpnAdapter::new(&openvpn_definition("p", "FR"), engine.clone(), &RouterSettings::default()).unwrap(),
        );
        let backend = TunnelBackend::spawn(
            openvpn_definition("p", "FR"),
            adapter.clone(),
            &RouterSettings::default(),
            RecordingDelivery::new(),
        );

        backend.connect_once(1, Duration::from_secs(5)).await.unwrap();
        let status = backend.status();
        assert_eq!(status.address.unwrap().to_string(), "10.8.0.2/24");
        assert_eq!(status.dns_servers, vec![IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1))]);
        assert!(adapter.is_connected());
        assert!(engine.last_profile().unwrap().contains("client-cert-not-required"));
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_transient() {
        let engine = ScriptedEngine::auth_failure();
        let adapter = Arc::new(
            OpenVpnAdapter::new(&openvpn_definition("p", "FR"), engine, &RouterSettings::default()).unwrap(),
        );
        let backend = TunnelBackend::spawn(
            openvpn_definition("p", "FR"),
            adapter.clone(),
            &RouterSettings::default(),
            RecordingDelivery::new(),
        );

        let err = backend.connect_once(1, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Authentication);
        assert_eq!(adapter.last_error().map(|e| e.kind), Some(FailureKind::Authentication));
    }

    #[tokio::test]
    async fn test_packets_cross_the_pipe() {
        let engine = ScriptedEngine::echo();
        let adapter = Arc::new(
            OpenVpnAdapter::new(&openvpn_definition("p", "FR"), engine.clone(), &RouterSettings::default()).unwrap(),
        );
        let delivery = RecordingDelivery::new();
        let backend = TunnelBackend::spawn(
            openvpn_definition("p", "FR"),
            adapter.clone(),
            &RouterSettings::default(),
            delivery.clone(),
        );
        backend.connect_once(1, Duration::from_secs(5)).await.unwrap();

        adapter.send(Bytes::from_static(b"ping")).unwrap();
        let (from, packet) = delivery.next().await;
        assert_eq!(from, TunnelId::from("p_FR"));
        assert_eq!(packet, Bytes::from_static(b"ping"));

        // The engine got the packet with room to encapsulate in place
        assert_eq!(engine.framing(), vec![(PIPE_HEADROOM, PIPE_TAILROOM)]);
    }
}
