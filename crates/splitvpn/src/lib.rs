//! splitvpn - Per-Application Multi-Tunnel VPN Router
//!
//! Keeps several VPN tunnels alive at once and steers each application's
//! traffic into the tunnel its rule names, all through one shared virtual
//! interface.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         VpnService                               │
//! │                                                                  │
//! │  interface ──▶ PacketRouter ──▶ TunnelBackend (UK) ──▶ adapter ─▶ UDP
//! │   reader        │  classify        TunnelBackend (FR) ──▶ adapter ─▶ engine
//! │                 │  rule                 │                        │
//! │                 ▼                       ▼ inbound                │
//! │           ConnectionTracker ◀──── IngressPath ──▶ interface writer
//! │                                                                  │
//! │  ConfigStore ──▶ RoutingTable + ConnectionManager (connect/close)│
//! │  tunnel DNS  ──▶ DnsAggregator ──▶ interface resolvers           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Per-app routing**: socket owner -> application -> tunnel
//! - **Overlapping subnets**: replies follow the tunnel their flow left on
//! - **Two protocols**: userspace WireGuard and an external OpenVPN engine
//! - **Readiness gating**: no traffic before a tunnel has address and DNS
//! - **Resilience**: bounded backoff retries, reconnect on network change

pub mod adapter;
pub mod backend;
pub mod classifier;
pub mod config;
pub mod dns;
pub mod error;
pub mod interface;
pub mod keys;
pub mod manager;
pub mod packet;
pub mod pipe;
pub mod protocol;
pub mod router;
pub mod routing;
pub mod service;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use adapter::{AdapterFactory, DefaultAdapterFactory, TunnelAdapter};
pub use backend::{TunnelAddress, TunnelState, TunnelStats, TunnelStatus};
pub use classifier::{OwnershipLookup, SocketKey, SocketOwnerTable};
pub use config::{
    AppId, AppRule, Credentials, NotReadyPolicy, ProfileFile, RouterSettings, TunnelDefinition,
    TunnelId, UnroutedPolicy,
};
pub use error::{FailureKind, RouterError, RouterResult, TunnelFailure};
pub use interface::{DirectPath, InterfaceSettings, MemoryInterface, VirtualInterface};
pub use keys::{PresharedKey, PrivateKey, PublicKey};
pub use protocol::{ProtocolKind, detect_protocol};
pub use router::{DropReason, RouterStats, Verdict};
pub use service::{ServiceStats, VpnService, VpnServiceBuilder};
pub use store::{ConfigStore, MemoryStore};
