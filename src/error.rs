//! Error types for call setup and signalling.

use crate::peer::state::CallState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the call error type.
pub type Result<T> = std::result::Result<T, CallError>;

/// Errors reported to the action that started a call step.
#[derive(Debug, Error)]
pub enum CallError {
    /// Media devices were denied or unavailable
    #[error("media permission error: {0}")]
    Permission(String),

    /// The supplied session id has no record (or no offer yet)
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The transport rejected a description or candidate
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Signalling store unreachable, write rejected or malformed id
    #[error("signalling channel error: {0}")]
    Channel(String),

    /// The link dropped and did not come back within the grace period
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Action invoked while it is not available in the current state
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: CallState,
    },

    /// The call was hung up while this action was still running
    #[error("call was hung up")]
    Closed,
}

/// Discriminant of [`CallError`], carried by `CallState::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permission,
    SessionNotFound,
    Negotiation,
    Channel,
    ConnectionLost,
    InvalidState,
    Closed,
}

impl CallError {
    pub fn permission(msg: impl std::fmt::Display) -> Self {
        Self::Permission(msg.to_string())
    }

    pub fn session_not_found(msg: impl std::fmt::Display) -> Self {
        Self::SessionNotFound(msg.to_string())
    }

    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    pub fn channel(msg: impl std::fmt::Display) -> Self {
        Self::Channel(msg.to_string())
    }

    pub fn connection_lost(msg: impl std::fmt::Display) -> Self {
        Self::ConnectionLost(msg.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Permission(_) => ErrorKind::Permission,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::Negotiation(_) => ErrorKind::Negotiation,
            Self::Channel(_) => ErrorKind::Channel,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Closed => ErrorKind::Closed,
        }
    }
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        Self::Negotiation(e.to_string())
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Permission => "permission",
            Self::SessionNotFound => "session-not-found",
            Self::Negotiation => "negotiation",
            Self::Channel => "channel",
            Self::ConnectionLost => "connection-lost",
            Self::InvalidState => "invalid-state",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
