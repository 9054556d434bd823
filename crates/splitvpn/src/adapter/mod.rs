//! Protocol adapters
//!
//! Every tunnel protocol is driven through `TunnelAdapter`. The backend
//! owns the state machine; an adapter only moves packets and reports what
//! its session is doing through the `EventSink` handed to `connect`.

pub mod openvpn;
pub mod wireguard;

use crate::backend::EventSink;
use crate::config::{RouterSettings, TunnelDefinition, TunnelId};
use crate::error::TunnelFailure;
use crate::protocol::ProtocolKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use openvpn::{EngineEvent, EngineSession, OpenVpnAdapter, OpenVpnEngine};
pub use wireguard::{WireGuardAdapter, WireGuardProfile};

/// Everything an adapter needs for one session
pub struct AdapterLink {
    pub tunnel: TunnelId,
    /// Lifecycle signals
    pub events: EventSink,
    /// Decrypted inbound packets; `try_send` only, full means drop
    pub inbound: mpsc::Sender<Bytes>,
}

/// Why an adapter refused an outbound packet
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Tunnel not connected")]
    NotConnected,

    #[error("Transport queue full")]
    QueueFull,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Uniform control and data interface over one tunnel protocol
#[async_trait]
pub trait TunnelAdapter: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Start a session. Returns once the session has been launched; progress
    /// towards Ready is reported through `link.events`.
    async fn connect(&self, link: AdapterLink) -> Result<(), TunnelFailure>;

    /// Stop the session and release its resources
    async fn disconnect(&self);

    /// Restart the session in place, keeping the current link.
    /// Returns false when the protocol has no such notion.
    async fn reconnect(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool;

    /// Hand one plaintext IP packet to the tunnel. Never blocks.
    fn send(&self, packet: Bytes) -> Result<(), SendError>;

    fn last_error(&self) -> Option<TunnelFailure>;

    /// Drop every task the adapter runs without waiting for a clean shutdown
    fn abort(&self) {}
}

/// Builds the adapter for a tunnel definition
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        definition: &TunnelDefinition,
        settings: &RouterSettings,
    ) -> Result<Arc<dyn TunnelAdapter>, TunnelFailure>;
}

/// Dispatches on the detected protocol of the profile text
#[derive(Clone, Default)]
pub struct DefaultAdapterFactory {
    openvpn_engine: Option<Arc<dyn OpenVpnEngine>>,
}

impl DefaultAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable OpenVPN-style profiles, driven by the given engine
    pub fn with_openvpn_engine(mut self, engine: Arc<dyn OpenVpnEngine>) -> Self {
        self.openvpn_engine = Some(engine);
        self
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(
        &self,
        definition: &TunnelDefinition,
        settings: &RouterSettings,
    ) -> Result<Arc<dyn TunnelAdapter>, TunnelFailure> {
        match definition.protocol() {
            ProtocolKind::WireGuardLike => {
                let adapter = WireGuardAdapter::new(definition, settings)?;
                Ok(Arc::new(adapter))
            }
            ProtocolKind::OpenVpnLike => {
                let engine = self.openvpn_engine.clone().ok_or_else(|| {
                    TunnelFailure::configuration("no OpenVPN engine available")
                })?;
                let adapter = OpenVpnAdapter::new(definition, engine, settings)?;
                Ok(Arc::new(adapter))
            }
            ProtocolKind::Unrecognized => Err(TunnelFailure::configuration(format!(
                "unrecognized profile format for {}",
                definition.id()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::testing::{ScriptedEngine, openvpn_definition, wg_definition};

    #[test]
    fn test_factory_rejects_unknown_format() {
        let def = TunnelDefinition::new("p", "UK", "h", 1, "not a profile");
        let err = DefaultAdapterFactory::new()
            .create(&def, &RouterSettings::default())
            .err()
            .unwrap();
        assert_eq!(err.kind, FailureKind::Configuration);
    }

    #[test]
    fn test_factory_needs_engine_for_openvpn() {
        let def = openvpn_definition("p", "FR");
        let factory = DefaultAdapterFactory::new();
        let err = factory.create(&def, &RouterSettings::default()).err().unwrap();
        assert_eq!(err.kind, FailureKind::Configuration);

        let factory = factory.with_openvpn_engine(ScriptedEngine::ready());
        let adapter = factory.create(&def, &RouterSettings::default()).ok().unwrap();
        assert_eq!(adapter.kind(), ProtocolKind::OpenVpnLike);
    }

    #[test]
    fn test_factory_builds_wireguard() {
        let def = wg_definition("p", "UK");
        let adapter = DefaultAdapterFactory::new()
            .create(&def, &RouterSettings::default())
            .ok()
            .unwrap();
        assert_eq!(adapter.kind(), ProtocolKind::WireGuardLike);
        assert!(!adapter.is_connected());
    }
}
