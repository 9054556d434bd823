//! WireGuard Key Material
//!
//! Parses the base64 keys found in WireGuard-style profiles and converts
//! them into the x25519 types the userspace engine expects.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use boringtun::x25519;
use rand::rngs::OsRng;
use std::fmt;

fn decode_32(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;

    bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidLength(bytes.len()))
}

/// Interface private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: x25519::StaticSecret,
}

impl PrivateKey {
    pub fn generate() -> Self {
        Self {
            secret: x25519::StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: x25519::StaticSecret::from(bytes),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_32(s).map(Self::from_bytes)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: x25519::PublicKey::from(&self.secret),
        }
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    pub(crate) fn to_secret(&self) -> x25519::StaticSecret {
        self.secret.clone()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Peer public key (Curve25519)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    key: x25519::PublicKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: x25519::PublicKey::from(bytes),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_32(s).map(Self::from_bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub(crate) fn as_key(&self) -> x25519::PublicKey {
        self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Optional symmetric key mixed into the handshake
#[derive(Clone, PartialEq, Eq)]
pub struct PresharedKey([u8; 32]);

impl PresharedKey {
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_32(s).map(Self)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PresharedKey([redacted])")
    }
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length {0} (expected 32 bytes)")]
    InvalidLength(usize),
}
