//! [`Client`]: the application layer driving one RDP session.

use std::time::Instant;

use rdpwire_proto::gcc::RDP_VERSION_4;
use rdpwire_proto::mcs::USER_CHANNEL_BASE;
use rdpwire_proto::sec::flags;
use rdpwire_proto::{
    ByteCursor, ChannelDispatch, Error as ProtoError, Licensing, Mark, SecPdu, Security, Transport,
};

use crate::caps::{self, CLIENT_CAPSET_COUNT, ClientCaps};
use crate::collaborators::{
    Decompressor, Display, Headless, IgnoreOrders, NoDecompression, NoPersistentCache, OrderHandler,
    PersistentCache, expand_into_cursor,
};
use crate::config::Config;
use crate::errors::ClientError;
use crate::fastpath;
use crate::info::{self, ClientInfo, Secret};
use crate::input::{InputEvent, write_input_pdu, EVENT_LEN};
use crate::pdu::*;
use crate::redirect;
use crate::state::{ConnectionState, LoopExit, PendingRedirect, Phase, RdpVersion, ReconnectCookie};
use crate::updates;

/// Share-control source descriptor in the confirm-active PDU.
const SOURCE_DESCRIPTOR: &[u8] = b"MSTSC\0";
/// Originator id in the confirm-active PDU.
const ORIGINATOR_ID: u16 = 0x03ea;
/// Target user of the synchronise PDU.
const SYNC_TARGET_USER: u16 = 1002;

const PERSISTENT_KEYS_PER_PDU: usize = 169;
const PERSIST_FIRST: u32 = 0x01;
const PERSIST_LAST:  u32 = 0x02;

// logon info
const INFOTYPE_LOGON:          u32 = 0;
const INFOTYPE_LOGON_LONG:     u32 = 1;
const INFOTYPE_LOGON_PLAINNOTIFY: u32 = 2;
const INFOTYPE_LOGON_EXTENDED: u32 = 3;
const LOGON_EX_AUTORECONNECTCOOKIE: u32 = 0x1;
const LOGON_EX_LOGONERRORS:         u32 = 0x2;

// ─── Client ───────────────────────────────────────────────────────────────────

/// One RDP client connection over transport `T`.
///
/// ```rust,no_run
/// # use rdpwire_client::{Client, Config, LoopExit, TcpTransport};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let cfg = Config { server: "10.0.0.5".into(), username: "alice".into(), ..Default::default() };
/// let transport = TcpTransport::new(cfg.connect_timeout, cfg.recv_timeout);
/// let mut client = Client::new(transport, cfg)?;
/// client.connect()?;
/// match client.main_loop()? {
///     LoopExit::Requested => client.disconnect(),
///     LoopExit::Redirect  => { client.reset_for_redirect(); client.connect()?; }
/// }
/// # Ok(()) }
/// ```
pub struct Client<T: Transport> {
    sec:          Security<T>,
    config:       Config,
    state:        ConnectionState,
    display:      Box<dyn Display>,
    orders:       Box<dyn OrderHandler>,
    cache:        Box<dyn PersistentCache>,
    decompressor: Box<dyn Decompressor>,
    /// Lock-key state sent with the input synchronise event.
    lock_keys:    u16,
}

impl<T: Transport> Client<T> {
    /// Validate `config` and prepare a client. Nothing is sent yet.
    ///
    /// The password moves out of `config` into the connection state, where
    /// it is scrubbed once the server starts sending data.
    pub fn new(transport: T, mut config: Config) -> Result<Self, ClientError> {
        config.validate()?;
        let version = if config.rdp5 { RdpVersion::V5 } else { RdpVersion::V4 };
        let mut state = ConnectionState::new(version, config.width, config.height, config.bpp);
        let password = std::mem::take(&mut config.password);
        let mut encoded = info::encode_password(&password);
        state.hold_password(&encoded);
        encoded.fill(0);
        let mut raw = password.into_bytes();
        raw.fill(0);

        Ok(Self {
            sec: Security::new(transport),
            config,
            state,
            display: Box::new(Headless),
            orders: Box::new(IgnoreOrders),
            cache: Box::new(NoPersistentCache),
            decompressor: Box::new(NoDecompression),
            lock_keys: 0,
        })
    }

    pub fn with_display(mut self, display: Box<dyn Display>) -> Self {
        self.display = display;
        self
    }

    pub fn with_orders(mut self, orders: Box<dyn OrderHandler>) -> Self {
        self.orders = orders;
        self
    }

    pub fn with_persistent_cache(mut self, cache: Box<dyn PersistentCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_decompressor(mut self, decompressor: Box<dyn Decompressor>) -> Self {
        self.decompressor = decompressor;
        self
    }

    pub fn with_licensing(mut self, licensing: Box<dyn Licensing>) -> Self {
        self.sec = self.sec.with_licensing(licensing);
        self
    }

    pub fn with_channels(mut self, channels: Box<dyn ChannelDispatch>) -> Self {
        self.sec = self.sec.with_channels(channels);
        self
    }

    pub fn config(&self) -> &Config { &self.config }
    pub fn state(&self) -> &ConnectionState { &self.state }
    pub fn security(&self) -> &Security<T> { &self.sec }

    /// A handle that makes [`Client::main_loop`] return
    /// [`LoopExit::Requested`] when set.
    pub fn exit_flag(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> { self.state.exit_flag() }

    /// The redirect that ended the last [`Client::main_loop`], if any.
    pub fn pending_redirect(&self) -> Option<&PendingRedirect> { self.state.redirect.as_ref() }

    /// Lock keys (`input::*_LOCK`) reported during activation.
    pub fn set_lock_keys(&mut self, toggles: u16) { self.lock_keys = toggles; }

    // ── connect ──────────────────────────────────────────────────────────────

    /// Connect, log on and wait for the server to activate the session
    /// (or to redirect it elsewhere).
    pub fn connect(&mut self) -> Result<(), ClientError> {
        if self.sec.mcs().channels().is_empty() {
            for ch in &self.config.channels {
                self.sec.mcs_mut().register_channel(&ch.name, ch.options)?;
            }
        }

        tracing::info!("connecting to {}:{}", self.config.server, self.config.port);
        let server = self.sec.connect(&self.config.connect_target(), &self.config.client_data())?;
        if server.rdp_version == Some(RDP_VERSION_4) {
            self.state.downgrade();
        }
        self.send_logon_info()?;

        let deadline = Instant::now() + self.config.connect_timeout;
        while self.state.phase != Phase::Active && self.state.redirect.is_none() {
            if self.state.exit_requested() {
                return Ok(());
            }
            if Instant::now() > deadline {
                self.sec.disconnect();
                return Err(ProtoError::Handshake("demand active").into());
            }
            if let Err(e) = self.receive_once() {
                self.state.terminate();
                return Err(e);
            }
        }
        if self.state.phase == Phase::Active {
            tracing::info!("session active (share id {:#x})", self.state.share_id);
        }
        Ok(())
    }

    fn send_logon_info(&mut self) -> Result<(), ClientError> {
        let reconnect = self
            .state
            .reconnect_cookie
            .as_ref()
            .map(|c| info::reconnect_verifier(c, self.sec.client_random()));
        let mut password = self.state.password().to_vec();
        let secret = match &self.config.password_cookie {
            Some(cookie) => Secret::RedirectCookie(cookie),
            None => Secret::Password(&password),
        };
        let client_address = self
            .sec
            .mcs()
            .transport()
            .local_addr()
            .map_or_else(|| self.config.client_address.clone(), |ip| ip.to_string());
        let info = ClientInfo {
            extended:          self.state.version >= RdpVersion::V5,
            domain:            &self.config.domain,
            username:          &self.config.username,
            password:          secret,
            program:           &self.config.program,
            directory:         &self.config.directory,
            client_address:    &client_address,
            performance_flags: self.config.performance_flags,
            reconnect,
        };
        let sec_flags = flags::INFO_PKT | self.sec.data_flags();
        let mut s = self.sec.init(sec_flags, info.len());
        info.write(&mut s);
        password.fill(0);
        self.sec.send(s, sec_flags)?;
        Ok(())
    }

    // ── main loop ────────────────────────────────────────────────────────────

    /// Process server traffic until the exit flag is raised or the server
    /// redirects the session.
    pub fn main_loop(&mut self) -> Result<LoopExit, ClientError> {
        loop {
            if self.state.exit_requested() {
                return Ok(LoopExit::Requested);
            }
            if let Err(e) = self.receive_once() {
                self.state.terminate();
                return Err(e);
            }
            if self.state.redirect.is_some() {
                return Ok(LoopExit::Redirect);
            }
        }
    }

    /// Send input events.
    pub fn send_input(&mut self, events: &[InputEvent]) -> Result<(), ClientError> {
        let mut s = self.init_data(4 + events.len() * EVENT_LEN);
        write_input_pdu(&mut s, events, event_time());
        self.send_data(s, DATA_INPUT)
    }

    /// Close the connection.
    pub fn disconnect(&mut self) {
        self.sec.disconnect();
        self.state.terminate();
    }

    /// Point the configuration at the pending redirect and reset every
    /// layer, ready for another [`Client::connect`]. Returns the redirect
    /// that was applied.
    pub fn reset_for_redirect(&mut self) -> Option<PendingRedirect> {
        let redirect = self.state.redirect.take()?;
        self.config.apply_redirect(&redirect);
        self.sec.reset();
        let version = if self.config.rdp5 { RdpVersion::V5 } else { RdpVersion::V4 };
        self.state.reset(version, self.config.width, self.config.height, self.config.bpp);
        Some(redirect)
    }

    fn receive_once(&mut self) -> Result<(), ClientError> {
        match self.sec.recv()? {
            None => Ok(()),
            Some(SecPdu::FastPath { mut data, .. }) => {
                let decoded = fastpath::decode_fastpath(&mut data, &mut self.state, self.decompressor.as_mut())?;
                for update in decoded {
                    updates::apply(update, self.display.as_mut(), self.orders.as_mut())?;
                }
                Ok(())
            }
            Some(SecPdu::Slow(mut s)) => {
                while !s.at_end() && self.state.redirect.is_none() {
                    let pdu = next_share_pdu(&mut s)?;
                    self.process_share_pdu(pdu)?;
                }
                Ok(())
            }
        }
    }

    fn process_share_pdu(&mut self, pdu: SharePdu) -> Result<(), ClientError> {
        let SharePdu { pdu_type, source, mut body } = pdu;
        match pdu_type {
            0 => tracing::trace!("keep-alive"),
            PDU_DEMAND_ACTIVE => self.process_demand_active(&mut body)?,
            PDU_DEACTIVATE => {
                tracing::debug!("deactivate all");
                self.state.phase = Phase::Deactivated;
            }
            PDU_REDIRECT | PDU_ENHANCED_REDIRECT => {
                let r = redirect::decode_redirect(&mut body, source, pdu_type == PDU_ENHANCED_REDIRECT)?;
                self.state.redirect = Some(r);
            }
            PDU_DATA => self.process_data_pdu(&mut body)?,
            other => tracing::debug!("unhandled share-control PDU type {other}"),
        }
        Ok(())
    }

    // ── activation ───────────────────────────────────────────────────────────

    fn process_demand_active(&mut self, s: &mut ByteCursor) -> Result<(), ClientError> {
        self.state.share_id = s.read_u32_le()?;
        let source_len = usize::from(s.read_u16_le()?);
        let caps_len = usize::from(s.read_u16_le()?);
        s.skip(source_len)?;
        let server = caps::parse_server_caps(s, caps_len)?;
        tracing::debug!("demand active, share id {:#x}", self.state.share_id);

        if server.downgrade {
            self.state.downgrade();
        }
        if let Some((width, height, bpp)) = server.desktop {
            if bpp != self.state.bpp {
                tracing::warn!("server colour depth {bpp} differs from requested {}", self.state.bpp);
            }
            if (width, height, bpp) != (self.state.width, self.state.height, self.state.bpp) {
                self.state.width = width;
                self.state.height = height;
                self.state.bpp = bpp;
                self.display.resize(width, height, bpp);
            }
        }

        self.send_confirm_active()?;
        self.send_synchronise()?;
        self.send_control(CTRL_COOPERATE)?;
        self.send_control(CTRL_REQUEST_CONTROL)?;
        // synchronise, cooperate, granted control
        self.discard_pdus(3)?;

        self.send_input(&[InputEvent::Sync { toggles: self.lock_keys }])?;
        if self.state.version >= RdpVersion::V5 {
            self.send_persistent_keys()?;
            self.send_fonts(3)?;
        } else {
            self.send_fonts(1)?;
            self.send_fonts(2)?;
        }
        self.state.phase = Phase::Active;
        Ok(())
    }

    /// Receive and drop `count` share PDUs; anything after them in the same
    /// payload is processed normally.
    fn discard_pdus(&mut self, mut count: usize) -> Result<(), ClientError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        while count > 0 {
            if Instant::now() > deadline {
                return Err(ProtoError::Handshake("activation replies").into());
            }
            let mut s = match self.sec.recv()? {
                Some(SecPdu::Slow(s)) => s,
                Some(SecPdu::FastPath { .. }) => {
                    tracing::debug!("fast-path output during activation ignored");
                    continue;
                }
                None if self.state.exit_requested() => return Ok(()),
                None => continue,
            };
            while !s.at_end() {
                let pdu = next_share_pdu(&mut s)?;
                if count > 0 {
                    tracing::trace!("activation: discarding PDU type {}", pdu.pdu_type);
                    count -= 1;
                } else {
                    self.process_share_pdu(pdu)?;
                }
            }
        }
        Ok(())
    }

    fn source_id(&self) -> u16 {
        USER_CHANNEL_BASE + self.sec.mcs().user_id()
    }

    fn send_confirm_active(&mut self) -> Result<(), ClientError> {
        let caps = ClientCaps {
            version:          self.state.version,
            width:            self.state.width,
            height:           self.state.height,
            bpp:              self.state.bpp,
            keyboard_layout:  self.config.keyboard_layout,
            orders:           self.config.orders,
            persistent_cache: self.config.bitmap_cache_persist,
        };
        let combined = 4 + caps.len();
        let length = SHARE_CONTROL_LEN + 4 + 2 + 2 + 2 + SOURCE_DESCRIPTOR.len() + combined + 4;

        let sec_flags = self.sec.data_flags();
        let mut s = self.sec.init(sec_flags, length);
        write_share_control(&mut s, length, PDU_CONFIRM_ACTIVE, self.source_id());
        s.write_u32_le(self.state.share_id);
        s.write_u16_le(ORIGINATOR_ID);
        s.write_u16_le(SOURCE_DESCRIPTOR.len() as u16);
        s.write_u16_le(combined as u16);
        s.write_bytes(SOURCE_DESCRIPTOR);
        s.write_u16_le(CLIENT_CAPSET_COUNT);
        s.write_u16_le(0);
        caps.write(&mut s);
        s.write_u32_le(0); // session id
        self.sec.send(s, sec_flags)?;
        Ok(())
    }

    fn send_synchronise(&mut self) -> Result<(), ClientError> {
        let mut s = self.init_data(4);
        s.write_u16_le(1); // SYNCMSGTYPE_SYNC
        s.write_u16_le(SYNC_TARGET_USER);
        self.send_data(s, DATA_SYNCHRONISE)
    }

    fn send_control(&mut self, action: u16) -> Result<(), ClientError> {
        let mut s = self.init_data(8);
        s.write_u16_le(action);
        s.write_u16_le(0); // grant id
        s.write_u32_le(0); // control id
        self.send_data(s, DATA_CONTROL)
    }

    fn send_fonts(&mut self, seq: u16) -> Result<(), ClientError> {
        let mut s = self.init_data(8);
        s.write_u16_le(0);    // number of fonts
        s.write_u16_le(0);    // total
        s.write_u16_le(seq);  // list flags
        s.write_u16_le(0x32); // entry size
        self.send_data(s, DATA_FONT_LIST)
    }

    /// Offer the persistent bitmap cache keys, [`PERSISTENT_KEYS_PER_PDU`]
    /// per PDU.
    fn send_persistent_keys(&mut self) -> Result<(), ClientError> {
        if !self.config.bitmap_cache_persist {
            return Ok(());
        }
        let keys = self.cache.enumerate(2);
        let total = keys.len();
        for (page, chunk) in keys.chunks(PERSISTENT_KEYS_PER_PDU).enumerate() {
            let offset = page * PERSISTENT_KEYS_PER_PDU;
            let mut list_flags = 0;
            if offset == 0 {
                list_flags |= PERSIST_FIRST;
            }
            if total - offset <= PERSISTENT_KEYS_PER_PDU {
                list_flags |= PERSIST_LAST;
            }
            let mut s = self.init_data(24 + chunk.len() * 8);
            s.write_u32_le(0);
            s.write_u16_le(chunk.len() as u16);
            s.write_zeros(8);
            s.write_u16_le(total as u16);
            s.write_u32_le(0);
            s.write_u32_le(list_flags);
            for key in chunk {
                s.write_bytes(key);
            }
            self.send_data(s, DATA_PERSISTENT_KEY_LIST)?;
        }
        tracing::debug!("offered {total} persistent bitmap keys");
        Ok(())
    }

    // ── data PDUs ────────────────────────────────────────────────────────────

    fn process_data_pdu(&mut self, body: &mut ByteCursor) -> Result<(), ClientError> {
        self.state.scrub_password();
        let header = ShareDataHeader::read(body)?;

        let mut s = if header.compression & PACKET_COMPRESSED != 0 {
            let len = usize::from(header.compressed_len)
                .checked_sub(SHARE_DATA_LEN)
                .ok_or_else(|| body.protocol_error(format!("compressed length {}", header.compressed_len)))?;
            let data = body.read_vec(len)?;
            expand_into_cursor(self.decompressor.as_mut(), &data, header.compression)?
        } else {
            std::mem::take(body)
        };

        match header.data_type {
            DATA_UPDATE => {
                if let Some(update) = updates::decode_update_pdu(&mut s)? {
                    updates::apply(update, self.display.as_mut(), self.orders.as_mut())?;
                }
            }
            DATA_POINTER => {
                if let Some(update) = updates::decode_pointer_pdu(&mut s)? {
                    updates::apply(update, self.display.as_mut(), self.orders.as_mut())?;
                }
            }
            DATA_BELL => self.display.bell(),
            DATA_LOGON => self.process_logon_info(&mut s)?,
            DATA_SET_ERROR_INFO => {
                let code = s.read_u32_le()?;
                if code != 0 {
                    tracing::warn!("server error info {code:#x}");
                }
                self.state.error_info = code;
            }
            DATA_AUTORECONNECT_STATUS => {
                tracing::warn!("automatic reconnect rejected by server");
                self.state.reconnect_cookie = None;
            }
            DATA_CONTROL | DATA_SYNCHRONISE | DATA_FONT_MAP | DATA_KEYBOARD_INDICATORS
            | DATA_CLIENT_WINDOW_STATUS => {
                tracing::trace!("data PDU {} ignored", header.data_type);
            }
            other => tracing::debug!("unhandled data PDU type {other}"),
        }
        Ok(())
    }

    fn process_logon_info(&mut self, s: &mut ByteCursor) -> Result<(), ClientError> {
        match s.read_u32_le()? {
            INFOTYPE_LOGON => {
                s.skip(4 + 52 + 4 + 512)?; // domain and user name
                self.state.session_id = s.read_u32_le()?;
                tracing::info!("logged on (session {})", self.state.session_id);
            }
            INFOTYPE_LOGON_LONG => {
                s.skip(2 + 4)?; // version, size
                self.state.session_id = s.read_u32_le()?;
                tracing::info!("logged on (session {})", self.state.session_id);
            }
            INFOTYPE_LOGON_PLAINNOTIFY => tracing::info!("logged on"),
            INFOTYPE_LOGON_EXTENDED => {
                s.skip(2)?; // length
                let fields = s.read_u32_le()?;
                if fields & LOGON_EX_AUTORECONNECTCOOKIE != 0 {
                    s.skip(4)?; // field data length
                    let len = s.read_u32_le()?;
                    if len as usize != info::ARC_COOKIE_LEN {
                        tracing::warn!("auto-reconnect cookie of length {len} ignored");
                        return Ok(());
                    }
                    let version = s.read_u32_le()?;
                    if version != 1 {
                        tracing::warn!("auto-reconnect cookie version {version} ignored");
                        return Ok(());
                    }
                    let logon_id = s.read_u32_le()?;
                    let random = s.read_array::<16>()?;
                    tracing::debug!("auto-reconnect cookie for logon {logon_id}");
                    self.state.reconnect_cookie = Some(ReconnectCookie { logon_id, random });
                }
                if fields & LOGON_EX_LOGONERRORS != 0 {
                    s.skip(4)?;
                    let kind = s.read_u32_le()?;
                    let data = s.read_u32_le()?;
                    tracing::info!("logon error notification {kind:#x} ({data:#x})");
                }
            }
            other => tracing::debug!("unknown logon info type {other}"),
        }
        Ok(())
    }

    // ── send helpers ─────────────────────────────────────────────────────────

    /// A cursor with room for the share headers and `len` body bytes.
    fn init_data(&self, len: usize) -> ByteCursor {
        let mut s = self.sec.init(self.sec.data_flags(), SHARE_DATA_LEN + len);
        s.set_mark(Mark::Application);
        s.write_zeros(SHARE_DATA_LEN);
        s
    }

    /// Backfill the share headers and send a data PDU.
    fn send_data(&mut self, mut s: ByteCursor, data_type: u8) -> Result<(), ClientError> {
        let end = s.position();
        let length = end - s.mark(Mark::Application);
        s.recall(Mark::Application);
        write_share_control(&mut s, length, PDU_DATA, self.source_id());
        s.write_u32_le(self.state.share_id);
        s.write_u8(0); // pad
        s.write_u8(1); // stream id
        s.write_u16_le((length - 14) as u16);
        s.write_u8(data_type);
        s.write_u8(0); // compression type
        s.write_u16_le(0); // compressed length
        s.seek(end);
        self.sec.send(s, self.sec.data_flags())?;
        Ok(())
    }
}

fn event_time() -> u32 {
    chrono::Utc::now().timestamp() as u32
}
