//! Router Configuration
//!
//! Tunnel definitions, per-application rules and router tunables.
//!
//! # Profile file
//!
//! ```toml
//! [settings]
//! connect_timeout_secs = 30
//! unrouted_policy = "direct"
//!
//! [[tunnels]]
//! provider = "local-test"
//! region = "UK"
//! host = "uk.example.net"
//! port = 51820
//! config = """
//! [Interface]
//! ...
//! """
//!
//! [[rules]]
//! app = "pkg.x"
//! tunnel = "local-test_UK"
//! ```

use crate::protocol::{self, ProtocolKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Tunnel identifier, `{provider}_{region}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(String);

impl TunnelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id of a provider template instantiated for a region
    pub fn derive(provider: &str, region: &str) -> Self {
        Self(format!("{}_{}", provider, region))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TunnelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Installed application identity (package name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Username/password pair for credential-based providers
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() || self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// A remote endpoint the user can route applications through.
///
/// Immutable; an edit replaces the whole definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDefinition {
    /// Provider template id
    pub provider: String,
    /// Region code (e.g. "UK")
    pub region: String,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Raw protocol profile (OpenVPN-style or WireGuard-style text)
    pub config: String,
    /// Credentials for providers that authenticate by password
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// When false the tunnel is ready without any DNS servers
    #[serde(default = "default_true")]
    pub require_dns: bool,
}

fn default_true() -> bool {
    true
}

impl TunnelDefinition {
    pub fn new(
        provider: impl Into<String>,
        region: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        config: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            region: region.into(),
            host: host.into(),
            port,
            config: config.into(),
            credentials: None,
            require_dns: true,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn without_dns(mut self) -> Self {
        self.require_dns = false;
        self
    }

    pub fn id(&self) -> TunnelId {
        TunnelId::derive(&self.provider, &self.region)
    }

    pub fn protocol(&self) -> ProtocolKind {
        protocol::detect_protocol(&self.config)
    }
}

/// Maps one application to at most one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRule {
    pub app: AppId,
    /// `None` means the application is not routed (direct)
    #[serde(default)]
    pub tunnel: Option<TunnelId>,
    /// Pass traffic direct while the tunnel is not ready instead of dropping it
    #[serde(default)]
    pub fallback_to_direct: bool,
}

impl AppRule {
    pub fn route(app: impl Into<AppId>, tunnel: impl Into<TunnelId>) -> Self {
        Self {
            app: app.into(),
            tunnel: Some(tunnel.into()),
            fallback_to_direct: false,
        }
    }

    pub fn direct(app: impl Into<AppId>) -> Self {
        Self {
            app: app.into(),
            tunnel: None,
            fallback_to_direct: false,
        }
    }

    pub fn with_fallback(mut self) -> Self {
        self.fallback_to_direct = true;
        self
    }
}

/// What happens to packets no AppRule claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnroutedPolicy {
    /// Hand the packet to the direct path untouched
    #[default]
    Direct,
    /// Discard the packet
    Drop,
}

/// What happens to packets whose tunnel is not ready yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotReadyPolicy {
    /// Discard the packet
    #[default]
    Drop,
    /// Hold it in the tunnel's bounded send queue until the tunnel is ready
    Queue,
}

/// Router tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Deadline for a single connect attempt
    pub connect_timeout_secs: u64,
    /// Deadline for a WireGuard handshake response
    pub handshake_timeout_secs: u64,
    /// Connect attempts per tunnel before giving up
    pub max_connect_attempts: u32,
    /// First retry delay
    pub backoff_initial_ms: u64,
    /// Retry delay ceiling
    pub backoff_max_ms: u64,
    /// Hard upper bound for tearing everything down
    pub close_timeout_ms: u64,
    /// Packets buffered per tunnel send queue
    pub tunnel_queue_capacity: usize,
    /// Packets buffered between the router and the virtual interface
    pub interface_queue_capacity: usize,
    /// Tracker entries idle for longer than this are evicted
    pub flow_idle_timeout_secs: u64,
    pub unrouted_policy: UnroutedPolicy,
    pub not_ready_policy: NotReadyPolicy,
    /// Virtual interface address (CIDR)
    pub interface_address: String,
    pub interface_mtu: u16,
    /// DNS servers announced until a tunnel reports its own
    pub fallback_dns: Vec<IpAddr>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            handshake_timeout_secs: 5,
            max_connect_attempts: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30_000,
            close_timeout_ms: 5000,
            tunnel_queue_capacity: 512,
            interface_queue_capacity: 1024,
            flow_idle_timeout_secs: 120,
            unrouted_policy: UnroutedPolicy::Direct,
            not_ready_policy: NotReadyPolicy::Drop,
            interface_address: "10.111.0.1/24".to_string(),
            interface_mtu: 1500,
            fallback_dns: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
            ],
        }
    }
}

impl RouterSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn flow_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_idle_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the ceiling
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_initial().saturating_mul(1u32 << shift);
        delay.min(self.backoff_max())
    }

    /// Parsed virtual interface address
    pub fn interface_cidr(&self) -> Result<(IpAddr, u8), ConfigError> {
        parse_cidr(&self.interface_address)
            .ok_or_else(|| ConfigError::InvalidSetting(format!(
                "interface_address '{}' is not CIDR",
                self.interface_address
            )))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::InvalidSetting(
                "max_connect_attempts must be at least 1".into(),
            ));
        }
        if self.tunnel_queue_capacity == 0 || self.interface_queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting(
                "queue capacities must be non-zero".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "connect_timeout_secs must be non-zero".into(),
            ));
        }
        self.interface_cidr()?;
        Ok(())
    }
}

/// Parse CIDR notation (e.g., "10.8.0.2/24")
pub(crate) fn parse_cidr(cidr: &str) -> Option<(IpAddr, u8)> {
    let (ip, prefix) = cidr.trim().split_once('/')?;
    let ip: IpAddr = ip.trim().parse().ok()?;
    let prefix: u8 = prefix.trim().parse().ok()?;

    let max = if ip.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return None;
    }
    Some((ip, prefix))
}

/// A complete profile file: settings, tunnels and rules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileFile {
    #[serde(default)]
    pub settings: RouterSettings,
    #[serde(default)]
    pub tunnels: Vec<TunnelDefinition>,
    #[serde(default)]
    pub rules: Vec<AppRule>,
}

impl ProfileFile {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn find_tunnel(&self, id: &TunnelId) -> Option<&TunnelDefinition> {
        self.tunnels.iter().find(|t| &t.id() == id)
    }

    /// Check ids are unique, every rule targets a known tunnel and every
    /// tunnel profile has a recognizable protocol.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;

        let mut seen = HashSet::new();
        for tunnel in &self.tunnels {
            let id = tunnel.id();
            if tunnel.protocol() == ProtocolKind::Unrecognized {
                return Err(ConfigError::UnrecognizedProtocol(id));
            }
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateTunnel(id));
            }
        }

        let mut apps = HashSet::new();
        for rule in &self.rules {
            if !apps.insert(rule.app.clone()) {
                return Err(ConfigError::DuplicateRule(rule.app.clone()));
            }
            if let Some(ref tunnel) = rule.tunnel {
                if !seen.contains(tunnel) {
                    return Err(ConfigError::UnknownTunnel {
                        app: rule.app.clone(),
                        tunnel: tunnel.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported profile format (expected .toml or .json)")]
    UnsupportedFormat,

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Duplicate tunnel id: {0}")]
    DuplicateTunnel(TunnelId),

    #[error("More than one rule for app {0}")]
    DuplicateRule(AppId),

    #[error("Rule for {app} targets unknown tunnel {tunnel}")]
    UnknownTunnel { app: AppId, tunnel: TunnelId },

    #[error("Tunnel {0} has an unrecognized profile format")]
    UnrecognizedProtocol(TunnelId),
}
