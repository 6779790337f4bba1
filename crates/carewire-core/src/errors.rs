//! Error hierarchy for the realtime subsystem.
//!
//! - [`RealtimeError`]: top-level enum covering transport, protocol, auth and
//!   bulk-fetch failures
//! - [`ProtocolError`]: a single inbound frame could not be interpreted
//! - [`ErrorCategory`]: coarse classification used for retry decisions
//!
//! Only [`RealtimeError::Auth`] is fatal to a connection. Transport failures
//! are retried with backoff, protocol errors drop one frame, and bulk-fetch
//! failures leave the affected collection in a degraded state.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::EntityKind;

/// Coarse error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection drop, refused connection, heartbeat or handshake timeout.
    Transport,
    /// Malformed or unknown message.
    Protocol,
    /// Identity rejected by the server.
    Auth,
    /// Initial collection fetch failed.
    BulkFetch,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Protocol => write!(f, "protocol"),
            Self::Auth => write!(f, "auth"),
            Self::BulkFetch => write!(f, "bulk_fetch"),
        }
    }
}

/// Top-level error type for the realtime subsystem.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The connection could not be established or was lost.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable description.
        message: String,
    },

    /// An inbound frame could not be interpreted.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// The server rejected the identity.
    #[error("authentication rejected: {message}")]
    Auth {
        /// Reason reported by the server, if any.
        message: String,
    },

    /// A bulk collection fetch failed.
    #[error("bulk fetch of {kind} failed: {message}")]
    BulkFetch {
        /// Collection being fetched.
        kind: EntityKind,
        /// Human-readable description.
        message: String,
        /// Whether the request timed out.
        timed_out: bool,
    },
}

impl RealtimeError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an auth error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a bulk-fetch error.
    pub fn bulk_fetch(kind: EntityKind, message: impl Into<String>) -> Self {
        Self::BulkFetch {
            kind,
            message: message.into(),
            timed_out: false,
        }
    }

    /// Error category for classification.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport { .. } => ErrorCategory::Transport,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Auth { .. } => ErrorCategory::Auth,
            Self::BulkFetch { .. } => ErrorCategory::BulkFetch,
        }
    }

    /// Whether the operation that produced this error may be retried.
    ///
    /// Transport errors are retried automatically; bulk fetches are retried
    /// by the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::BulkFetch { .. })
    }

    /// Whether this error ends the session for the current identity.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// A single inbound frame could not be interpreted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(String),

    /// The frame had no string `type` field.
    #[error("frame has no message type")]
    MissingKind,

    /// The message type is not one this client understands.
    #[error("unknown message type `{0}`")]
    UnknownKind(String),

    /// The message type is known but the payload does not match it.
    #[error("malformed `{kind}` payload: {message}")]
    Malformed {
        /// Message type.
        kind: String,
        /// Decoder error.
        message: String,
    },
}

/// Result type for realtime operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
