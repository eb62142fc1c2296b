//! Connection configuration.

use std::time::Duration;

use rdpwire_proto::ClientData;
use rdpwire_proto::transport::{ConnectTarget, PROTOCOL_RDP};

use crate::errors::ClientError;
use crate::state::PendingRedirect;

/// A static virtual channel to register before connecting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name:    String,
    pub options: u32,
}

/// Everything needed to open (and re-open) a session.
#[derive(Clone, Debug)]
pub struct Config {
    pub server:            String,
    pub port:              u16,
    pub username:          String,
    pub domain:            String,
    pub password:          String,
    /// Shell to start instead of the desktop.
    pub program:           String,
    pub directory:         String,
    /// Client name announced to the server.
    pub hostname:          String,
    /// Address reported in the extended client info when the transport
    /// cannot tell its own.
    pub client_address:    String,
    pub width:             u16,
    pub height:            u16,
    pub bpp:               u16,
    pub keyboard_layout:   u32,
    pub encryption:        bool,
    /// Announce RDP 5 and send the extended client info.
    pub rdp5:              bool,
    /// Enumerate the persistent bitmap cache to the server.
    pub bitmap_cache_persist: bool,
    /// Advertise drawing-order support.
    pub orders:            bool,
    /// `PERF_*` flags sent in the extended client info.
    pub performance_flags: u32,
    pub channels:          Vec<ChannelConfig>,
    pub connect_timeout:   Duration,
    /// Receive wait before the main loop polls its exit flag again.
    pub recv_timeout:      Duration,
    /// Reconnect to the target of a server redirect instead of ending the
    /// session. Read by the session driver.
    pub follow_redirects:  bool,

    // Filled from a redirect.
    pub lb_info:           Option<Vec<u8>>,
    pub password_cookie:   Option<Vec<u8>>,
    pub redirect_session:  Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server:               String::new(),
            port:                 3389,
            username:             String::new(),
            domain:               String::new(),
            password:             String::new(),
            program:              String::new(),
            directory:            String::new(),
            hostname:             "rdpwire".to_owned(),
            client_address:       "0.0.0.0".to_owned(),
            width:                1024,
            height:               768,
            bpp:                  16,
            keyboard_layout:      0x409,
            encryption:           true,
            rdp5:                 true,
            bitmap_cache_persist: false,
            orders:               false,
            performance_flags:    0x0000_0007,
            channels:             Vec::new(),
            connect_timeout:      Duration::from_secs(10),
            recv_timeout:         Duration::from_millis(500),
            follow_redirects:     true,
            lb_info:              None,
            password_cookie:      None,
            redirect_session:     None,
        }
    }
}

impl Config {
    /// Reject settings no server would accept.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.server.is_empty() {
            return Err(ClientError::Config("no server given".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ClientError::Config(format!("geometry {}x{}", self.width, self.height)));
        }
        if !matches!(self.bpp, 8 | 15 | 16 | 24 | 32) {
            return Err(ClientError::Config(format!("colour depth {}", self.bpp)));
        }
        if self.channels.len() > 30 {
            return Err(ClientError::Config(format!("{} static channels (max 30)", self.channels.len())));
        }
        Ok(())
    }

    pub fn connect_target(&self) -> ConnectTarget {
        ConnectTarget {
            host:                self.server.clone(),
            port:                self.port,
            username:            self.username.clone(),
            lb_cookie:           self.lb_info.clone(),
            requested_protocols: PROTOCOL_RDP,
        }
    }

    pub fn client_data(&self) -> ClientData {
        ClientData {
            rdp5:              self.rdp5,
            width:             self.width,
            height:            self.height,
            bpp:               self.bpp,
            keyboard_layout:   self.keyboard_layout,
            hostname:          self.hostname.clone(),
            encryption:        self.encryption,
            selected_protocol: PROTOCOL_RDP,
            redirect_session:  self.redirect_session,
        }
    }

    /// Point this configuration at a redirect target.
    pub fn apply_redirect(&mut self, r: &PendingRedirect) {
        if let Some(server) = &r.server {
            self.server = server.clone();
        }
        if let Some(user) = &r.username {
            self.username = user.clone();
        }
        if let Some(domain) = &r.domain {
            self.domain = domain.clone();
        }
        self.lb_info = r.lb_info.clone();
        self.password_cookie = r.cookie.clone();
        self.redirect_session = Some(r.session_id);
    }
}
