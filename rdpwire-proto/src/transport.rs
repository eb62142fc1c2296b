//! Pluggable transport layer.
//!
//! Implement [`Transport`] over TCP (TPKT + X.224), a test harness, or any
//! other byte stream to get the MCS and security layers for free.

use crate::cursor::ByteCursor;

/// Requested/selected protocol: standard RDP security.
pub const PROTOCOL_RDP: u32 = 0x0000_0000;
/// Requested/selected protocol: TLS.
pub const PROTOCOL_SSL: u32 = 0x0000_0001;
/// Requested/selected protocol: CredSSP over TLS.
pub const PROTOCOL_HYBRID: u32 = 0x0000_0002;

/// Where and how to connect.
#[derive(Clone, Debug, Default)]
pub struct ConnectTarget {
    pub host:      String,
    pub port:      u16,
    /// Sent as the `mstshash` routing cookie, if non-empty.
    pub username:  String,
    /// Load-balance cookie from a prior redirect; replaces the username
    /// cookie when present.
    pub lb_cookie: Option<Vec<u8>>,
    /// `PROTOCOL_*` bits to request during negotiation.
    pub requested_protocols: u32,
}

/// One received unit as delivered by the transport.
#[derive(Debug)]
pub enum Frame {
    /// An X.224 data payload: one MCS PDU.
    SlowPath(ByteCursor),
    /// A fast-path output PDU. `header` is the first byte (action,
    /// number of events, and flags in the top two bits); the cursor starts
    /// right after the length field.
    FastPath { header: u8, data: ByteCursor },
}

/// A connection-oriented, full-duplex transport.
///
/// Implementations are expected to handle their own buffering and block
/// until a complete frame is available.
pub trait Transport {
    /// The error type returned by read/write operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish the connection and negotiate the security protocol.
    ///
    /// Returns the protocol selected by the server (`PROTOCOL_*`).
    fn connect(&mut self, target: &ConnectTarget) -> Result<u32, Self::Error>;

    /// Send one MCS PDU.
    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receive the next frame. `None` when the caller's deadline passed
    /// without data.
    fn recv(&mut self) -> Result<Option<Frame>, Self::Error>;

    /// Close the connection. Idempotent.
    fn disconnect(&mut self);

    /// Local address of the connection, reported to the server at logon.
    fn local_addr(&self) -> Option<std::net::IpAddr> {
        None
    }
}
