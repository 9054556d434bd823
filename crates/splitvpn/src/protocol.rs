//! Protocol detection
//!
//! Tunnel profiles arrive as raw text. The first significant line decides
//! which adapter drives the tunnel.

use std::fmt;

/// Tunnel protocol family of a raw profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// `client` / `remote` directive profile, driven by an external engine
    OpenVpnLike,
    /// `[Interface]` section profile, driven in userspace
    WireGuardLike,
    Unrecognized,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::OpenVpnLike => write!(f, "openvpn"),
            ProtocolKind::WireGuardLike => write!(f, "wireguard"),
            ProtocolKind::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// Classify a raw profile by its first non-blank, non-comment line
pub fn detect_protocol(text: &str) -> ProtocolKind {
    let first = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'));

    let Some(line) = first else {
        return ProtocolKind::Unrecognized;
    };

    if line.eq_ignore_ascii_case("[interface]") {
        return ProtocolKind::WireGuardLike;
    }

    match line.split_whitespace().next() {
        Some("client") | Some("remote") => ProtocolKind::OpenVpnLike,
        _ => ProtocolKind::Unrecognized,
    }
}
