//! The protocol-stack error type.

use std::fmt;

/// Errors surfaced by the session and security layers.
///
/// [`Error::Protocol`] is the single funnel for structurally impossible
/// input: once it is raised the stream position can no longer be trusted
/// and the connection must be abandoned.
#[derive(Debug)]
pub enum Error {
    /// Received bytes contradict their declared length or documented range.
    Protocol {
        /// What was being decoded.
        context: String,
        /// Hex dump of the offending buffer, if one was available.
        dump:    Option<String>,
    },
    /// A handshake step did not receive the exact reply it requires.
    Handshake(&'static str),
    /// The underlying transport failed, closed, or timed out.
    Transport(Box<dyn std::error::Error + Send + Sync>),
    /// The peer sent a disconnect-provider ultimatum.
    Disconnected { reason: u8 },
}

impl Error {
    /// Build a protocol violation without buffer context.
    pub fn protocol(context: impl Into<String>) -> Self {
        Self::Protocol { context: context.into(), dump: None }
    }

    /// Build a protocol violation with a hex dump of `data`.
    pub fn protocol_with(context: impl Into<String>, data: &[u8]) -> Self {
        Self::Protocol { context: context.into(), dump: Some(hexdump(data)) }
    }

    /// Wrap a transport-level failure.
    pub fn transport<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self::Transport(Box::new(e))
    }

    /// True for errors that make the byte stream unusable.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { context, .. } => write!(f, "protocol violation: {context}"),
            Self::Handshake(step)          => write!(f, "handshake failed: {step}"),
            Self::Transport(e)             => write!(f, "transport: {e}"),
            Self::Disconnected { reason }  => write!(f, "disconnected by peer (reason {reason})"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self { Self::Transport(Box::new(e)) }
}

impl From<rdpwire_crypto::rsa::RsaError> for Error {
    fn from(e: rdpwire_crypto::rsa::RsaError) -> Self { Self::protocol(format!("server public key: {e}")) }
}

/// Specialized `Result` for the protocol stack.
pub type Result<T> = std::result::Result<T, Error>;

/// Classic 16-bytes-per-line hex dump.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4);
    for (i, line) in data.chunks(16).enumerate() {
        out.push_str(&format!("{:04x} ", i * 16));
        for b in line {
            out.push_str(&format!("{b:02x} "));
        }
        for _ in line.len()..16 {
            out.push_str("   ");
        }
        for &b in line {
            out.push(if b.is_ascii_graphic() { b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}
