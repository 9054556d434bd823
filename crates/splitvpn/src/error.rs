//! Error types shared across the router
//!
//! Per-tunnel failures are values (`TunnelFailure`) that land in a
//! backend's status; they never unwind through the packet router.
//! `RouterError` is reserved for the control surface.

use crate::config::ConfigError;
use crate::interface::InterfaceError;
use std::fmt;
use thiserror::Error;

/// Result type for control-surface operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Class of a tunnel failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Malformed definition or unrecognized protocol. Never retried.
    Configuration,
    /// Credentials rejected by the provider. Never retried.
    Authentication,
    /// Unreachable, reset or dropped transport. Retried with backoff.
    TransientNetwork,
    /// Connect attempt exceeded its deadline. Retried with backoff.
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Configuration => "configuration error",
            FailureKind::Authentication => "authentication error",
            FailureKind::TransientNetwork => "network error",
            FailureKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// A failure reported by (or about) a single tunnel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TunnelFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TunnelFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Configuration, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Authentication, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientNetwork, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Whether another connect attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::TransientNetwork | FailureKind::Timeout
        )
    }

    /// Classify a free-form engine error message.
    ///
    /// Engines report rejected credentials in prose; anything mentioning
    /// credentials is an authentication failure, the rest is transient.
    pub fn from_engine_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let is_auth = ["auth", "credential", "password", "username"]
            .iter()
            .any(|needle| lower.contains(needle));

        if is_auth {
            Self::authentication(message)
        } else {
            Self::transient(message)
        }
    }
}

/// Control-surface errors
#[derive(Debug, Error)]
pub enum RouterError {
    /// A query reached the connection manager before `start()` ever ran
    #[error("Connection manager queried before initialization")]
    NotInitialized,

    /// The shared virtual interface could not be opened; fatal to the router
    #[error("Failed to open virtual interface: {0}")]
    InterfaceOpen(#[from] InterfaceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
