//! RDP client protocol plumbing below the application layer.
//!
//! This crate handles:
//! * [`ByteCursor`]: bounds-checked encode/decode buffer with layer marks
//! * MCS (T.125) domain connect, user attach, channel joins and send-data
//!   framing
//! * GCC client/server data blocks and server certificate parsing
//! * Standard RDP security: key exchange, MAC + RC4, key updates,
//!   licensing/redirect/virtual-channel demultiplexing
//!
//! It is transport-agnostic: bring your own TPKT/X.224 stream by
//! implementing [`Transport`].

#![deny(unsafe_code)]

pub mod cert;
pub mod cursor;
pub mod error;
pub mod gcc;
pub mod licence;
pub mod mcs;
pub mod sec;
pub mod transport;

pub use cursor::{ByteCursor, Mark};
pub use error::{Error, Result};
pub use gcc::{ClientData, ServerData};
pub use licence::{LicenceOutcome, Licensing};
pub use mcs::{Channel, GLOBAL_CHANNEL, Mcs, McsState};
pub use sec::{ChannelDispatch, SecPdu, Security};
pub use transport::{ConnectTarget, Frame, Transport};
