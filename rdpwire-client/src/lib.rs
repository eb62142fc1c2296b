//! # rdpwire-client
//!
//! The RDP client application layer on top of [`rdpwire_proto`].
//!
//! ## Features
//! - Client info (RDP 4 and 5 forms) with auto-reconnect cookies
//! - Capability exchange and the demand-active/confirm-active handshake,
//!   including the RDP 4 downgrade
//! - Slow-path and fast-path updates: bitmaps, palettes, pointers and
//!   drawing-order batches handed to pluggable collaborators
//! - Server redirection (standard and enhanced) with one-call reconnect
//! - Input events
//! - A blocking TPKT/X.224 [`TcpTransport`]
//!
//! Rendering, drawing-order decoding, bitmap caching and bulk
//! decompression are behind the traits in [`collaborators`]; the defaults
//! do nothing, which is enough for a headless session.

#![deny(unsafe_code)]

mod client;
mod errors;

pub mod caps;
pub mod collaborators;
pub mod config;
pub mod fastpath;
pub mod info;
pub mod input;
pub mod pdu;
pub mod redirect;
pub mod state;
pub mod tcp;
pub mod updates;

pub use client::Client;
pub use collaborators::{Decompressor, Display, OrderHandler, PersistentCache};
pub use config::{ChannelConfig, Config};
pub use errors::ClientError;
pub use input::InputEvent;
pub use state::{ConnectionState, LoopExit, PendingRedirect, Phase, RdpVersion};
pub use tcp::TcpTransport;
