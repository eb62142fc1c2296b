//! Error types for rdpwire-client.

use std::{fmt, io};

use rdpwire_proto::Error as ProtoError;

// ─── ClientError ──────────────────────────────────────────────────────────────

/// The error type returned from [`crate::Client`] operations.
#[derive(Debug)]
pub enum ClientError {
    /// The session or security layer failed (see [`ProtoError`]).
    Proto(ProtoError),
    /// The configuration cannot be used to connect.
    Config(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proto(e)  => write!(f, "{e}"),
            Self::Config(s) => write!(f, "invalid configuration: {s}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Proto(e) => Some(e),
            Self::Config(_) => None,
        }
    }
}

impl From<ProtoError> for ClientError {
    fn from(e: ProtoError) -> Self { Self::Proto(e) }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self { Self::Proto(ProtoError::from(e)) }
}

impl ClientError {
    /// Received bytes were structurally impossible; the connection cannot
    /// continue.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Proto(e) if e.is_protocol_violation())
    }

    /// Hex dump attached to a protocol violation, if any.
    pub fn dump(&self) -> Option<&str> {
        match self {
            Self::Proto(ProtoError::Protocol { dump, .. }) => dump.as_deref(),
            _ => None,
        }
    }

    /// The peer or the network ended the connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Proto(ProtoError::Disconnected { .. } | ProtoError::Transport(_)))
    }

    /// The server ended the session on purpose with a disconnect ultimatum.
    pub fn is_server_disconnect(&self) -> bool {
        matches!(self, Self::Proto(ProtoError::Disconnected { .. }))
    }
}
