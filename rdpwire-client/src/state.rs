//! Per-connection application state.
//!
//! One [`ConnectionState`] lives inside a [`crate::Client`]; it is reset
//! when a redirect starts a fresh connection and dropped with the client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Protocol revision in effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RdpVersion {
    V4,
    V5,
}

/// Application-layer phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    AwaitingDemandActive,
    Active,
    Deactivated,
    Terminated,
}

/// Auto-reconnect cookie from an extended logon-info PDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectCookie {
    pub logon_id: u32,
    pub random:   [u8; 16],
}

/// A server redirect waiting to be followed.
///
/// Only the fields whose flag was present are `Some`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingRedirect {
    pub session_id: u32,
    pub flags:      u32,
    /// Target address, replaced by the target FQDN when one is sent.
    pub server:     Option<String>,
    pub lb_info:    Option<Vec<u8>>,
    pub username:   Option<String>,
    pub domain:     Option<String>,
    /// Password or opaque cookie for the new server.
    pub cookie:     Option<Vec<u8>>,
}

/// Why [`crate::Client::main_loop`] returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// The exit flag was raised.
    Requested,
    /// The server asked for a redirect; see [`crate::Client::pending_redirect`].
    Redirect,
}

/// Mutable state of one connection.
#[derive(Debug)]
pub struct ConnectionState {
    pub phase:            Phase,
    pub version:          RdpVersion,
    pub share_id:         u32,
    pub width:            u16,
    pub height:           u16,
    pub bpp:              u16,
    pub redirect:         Option<PendingRedirect>,
    pub reconnect_cookie: Option<ReconnectCookie>,
    /// Last `SET_ERROR_INFO` code.
    pub error_info:       u32,
    pub session_id:       u32,
    /// Pending fast-path fragments.
    pub(crate) fragments: Vec<u8>,
    password:             Vec<u8>,
    exit:                 Arc<AtomicBool>,
}

impl ConnectionState {
    pub fn new(version: RdpVersion, width: u16, height: u16, bpp: u16) -> Self {
        Self {
            phase:            Phase::AwaitingDemandActive,
            version,
            share_id:         0,
            width,
            height,
            bpp,
            redirect:         None,
            reconnect_cookie: None,
            error_info:       0,
            session_id:       0,
            fragments:        Vec::new(),
            password:         Vec::new(),
            exit:             Arc::new(AtomicBool::new(false)),
        }
    }

    /// Prepare for the next connection. The reconnect cookie and the exit
    /// flag survive; everything negotiated does not.
    pub fn reset(&mut self, version: RdpVersion, width: u16, height: u16, bpp: u16) {
        let cookie = self.reconnect_cookie.take();
        let exit = Arc::clone(&self.exit);
        self.scrub_password();
        *self = Self::new(version, width, height, bpp);
        self.reconnect_cookie = cookie;
        self.exit = exit;
    }

    /// A handle that stops the main loop when set.
    pub fn exit_flag(&self) -> Arc<AtomicBool> { Arc::clone(&self.exit) }

    pub fn exit_requested(&self) -> bool { self.exit.load(Ordering::Relaxed) }

    pub(crate) fn hold_password(&mut self, password: &[u8]) {
        self.scrub_password();
        self.password = password.to_vec();
    }

    pub fn holds_password(&self) -> bool { !self.password.is_empty() }

    pub(crate) fn password(&self) -> &[u8] { &self.password }

    /// Overwrite and drop any credential kept for the logon.
    pub fn scrub_password(&mut self) {
        if self.password.is_empty() {
            return;
        }
        self.password.fill(0);
        std::hint::black_box(&self.password);
        self.password = Vec::new();
    }

    /// Forget everything about the session but keep the exit flag.
    pub fn terminate(&mut self) {
        self.phase = Phase::Terminated;
        self.scrub_password();
    }

    pub fn downgrade(&mut self) {
        if self.version != RdpVersion::V4 {
            tracing::info!("server has no extra general flags, falling back to RDP 4");
            self.version = RdpVersion::V4;
        }
    }
}
