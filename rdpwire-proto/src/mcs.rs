//! MCS (T.125) session layer: domain connect, user attachment, channel
//! joins, and send/receive framing over a [`Transport`].
//!
//! # Flow
//!
//! ```text
//! Idle ─connect_start→ DomainConnecting ─connect-initial/response→ DomainConnected
//!   ─erect-domain, attach-user→ UserAttaching ─attach-confirm→ UserAttached
//!   ─join(user), join(global), join(static…)→ Ready ─disconnect→ Disconnected
//! ```

use crate::cursor::{ByteCursor, Mark};
use crate::error::{Error, Result};
use crate::transport::{ConnectTarget, Frame, Transport};

// ─── Constants ───────────────────────────────────────────────────────────────

const CONNECT_INITIAL:  u16 = 0x7f65;
const CONNECT_RESPONSE: u16 = 0x7f66;

/// Largest payload the two-byte PER length of a send-data request holds.
const MAX_SEND_DATA: usize = 0x7fff;

const BER_TAG_BOOLEAN:       u8 = 1;
const BER_TAG_INTEGER:       u8 = 2;
const BER_TAG_OCTET_STRING:  u8 = 4;
const BER_TAG_RESULT:        u8 = 10;
const BER_TAG_DOMAIN_PARAMS: u8 = 0x30;

const EDRQ: u8 = 1;  // erect domain request
const DPUM: u8 = 8;  // disconnect provider ultimatum
const AURQ: u8 = 10; // attach user request
const AUCF: u8 = 11; // attach user confirm
const CJRQ: u8 = 14; // channel join request
const CJCF: u8 = 15; // channel join confirm
const SDRQ: u8 = 25; // send data request
const SDIN: u8 = 26; // send data indication

/// Length of the send-data-request header written by [`Mcs::send`].
pub const SEND_HEADER_LEN: usize = 8;

/// Channel ids of joined users start here.
pub const USER_CHANNEL_BASE: u16 = 1001;
/// The broadcast channel carrying all core RDP traffic.
pub const GLOBAL_CHANNEL: u16 = 1003;

/// `rn-user-requested` disconnect reason.
pub const REASON_USER_REQUESTED: u8 = 3;

/// Channel option bits announced in the client network data.
pub mod options {
    pub const INITIALIZED:   u32 = 0x8000_0000;
    pub const ENCRYPT_RDP:   u32 = 0x4000_0000;
    pub const COMPRESS_RDP:  u32 = 0x0080_0000;
    pub const SHOW_PROTOCOL: u32 = 0x0020_0000;
}

// ─── DomainParams ────────────────────────────────────────────────────────────

/// One `DomainParameters` proposal of a connect-initial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainParams {
    pub max_channels: u16,
    pub max_users:    u16,
    pub max_tokens:   u16,
    pub max_pdu_size: u16,
}

impl DomainParams {
    pub const TARGET:  Self = Self { max_channels: 34,     max_users: 2,      max_tokens: 0,      max_pdu_size: 0xffff };
    pub const MINIMUM: Self = Self { max_channels: 1,      max_users: 1,      max_tokens: 1,      max_pdu_size: 0x420 };
    pub const MAXIMUM: Self = Self { max_channels: 0xffff, max_users: 0xfc17, max_tokens: 0xffff, max_pdu_size: 0xffff };

    const ENCODED_LEN: usize = 2 + 8 * 4;

    fn write(&self, s: &mut ByteCursor) {
        ber_write_header(s, u16::from(BER_TAG_DOMAIN_PARAMS), 32);
        for v in [self.max_channels, self.max_users, self.max_tokens, 1, 0, 1, self.max_pdu_size, 2] {
            ber_write_integer(s, v);
        }
    }
}

// ─── BER helpers ─────────────────────────────────────────────────────────────

fn ber_header_len(tag: u16, len: usize) -> usize {
    let t = if tag > 0xff { 2 } else { 1 };
    let l = if len >= 0x80 { 3 } else { 1 };
    t + l
}

fn ber_write_header(s: &mut ByteCursor, tag: u16, len: usize) {
    if tag > 0xff {
        s.write_u16_be(tag);
    } else {
        s.write_u8(tag as u8);
    }
    if len >= 0x80 {
        s.write_u8(0x82);
        s.write_u16_be(len as u16);
    } else {
        s.write_u8(len as u8);
    }
}

fn ber_write_integer(s: &mut ByteCursor, v: u16) {
    ber_write_header(s, u16::from(BER_TAG_INTEGER), 2);
    s.write_u16_be(v);
}

/// Parse a BER tag + length, returning the length.
pub(crate) fn ber_read_header(s: &mut ByteCursor, tag: u16) -> Result<usize> {
    let got = if tag > 0xff { s.read_u16_be()? } else { u16::from(s.read_u8()?) };
    if got != tag {
        return Err(s.protocol_error(format!("expected BER tag {tag:#x}, got {got:#x}")));
    }
    let first = s.read_u8()?;
    if first & 0x80 == 0 {
        return Ok(usize::from(first));
    }
    let n = first & 0x7f;
    if n > 4 {
        return Err(s.protocol_error(format!("BER length of {n} bytes")));
    }
    let mut len = 0usize;
    for _ in 0..n {
        len = (len << 8) | usize::from(s.read_u8()?);
    }
    Ok(len)
}

// ─── Channel ─────────────────────────────────────────────────────────────────

/// A static virtual channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    pub id:      u16,
    /// At most 7 ASCII characters; NUL-padded to 8 on the wire.
    pub name:    String,
    pub options: u32,
}

impl Channel {
    /// The 8-byte wire name.
    pub fn wire_name(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        for (d, b) in out.iter_mut().zip(self.name.bytes().take(7)) {
            *d = b;
        }
        out
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Session-layer state (client role).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum McsState {
    Idle,
    DomainConnecting,
    DomainConnected,
    UserAttaching,
    UserAttached,
    /// Waiting for the join confirm of the channel at this position in
    /// [`Mcs::join_order`].
    ChannelJoining(usize),
    Ready,
    Disconnected,
}

/// What one receive produced.
#[derive(Debug)]
pub enum Received {
    /// Send-data indication payload and its channel id.
    Channel { channel: u16, data: ByteCursor },
    /// Fast-path output, untouched.
    FastPath { header: u8, data: ByteCursor },
}

// ─── Mcs ─────────────────────────────────────────────────────────────────────

/// The MCS layer bound to one transport.
pub struct Mcs<T: Transport> {
    transport: T,
    user_id:   u16,
    channels:  Vec<Channel>,
    state:     McsState,
}

impl<T: Transport> Mcs<T> {
    pub fn new(transport: T) -> Self {
        Self { transport, user_id: 0, channels: Vec::new(), state: McsState::Idle }
    }

    pub fn state(&self) -> McsState { self.state }
    pub fn user_id(&self) -> u16 { self.user_id }
    pub fn channels(&self) -> &[Channel] { &self.channels }
    pub fn transport(&self) -> &T { &self.transport }
    pub fn transport_mut(&mut self) -> &mut T { &mut self.transport }

    /// Register a static channel. Only allowed before connecting; ids are
    /// assigned in registration order after the global channel.
    pub fn register_channel(&mut self, name: &str, options: u32) -> Result<u16> {
        if self.state != McsState::Idle {
            return Err(Error::Handshake("channels must be registered before connecting"));
        }
        let id = GLOBAL_CHANNEL + 1 + self.channels.len() as u16;
        self.channels.push(Channel { id, name: name.to_owned(), options });
        Ok(id)
    }

    /// Channel ids in join order: user channel, global, then static.
    pub fn join_order(&self) -> Vec<u16> {
        let mut ids = vec![USER_CHANNEL_BASE + self.user_id, GLOBAL_CHANNEL];
        ids.extend(self.channels.iter().map(|c| c.id));
        ids
    }

    /// Establish the transport; returns the selected protocol.
    pub fn connect_start(&mut self, target: &ConnectTarget) -> Result<u32> {
        self.state = McsState::DomainConnecting;
        match self.transport.connect(target) {
            Ok(selected) => Ok(selected),
            Err(e) => {
                self.state = McsState::Idle;
                Err(Error::transport(e))
            }
        }
    }

    /// Run connect-initial through the last channel join.
    ///
    /// Returns the user data of the connect-response (the server GCC
    /// conference-create response). Any failure closes the transport.
    pub fn connect_finalize(&mut self, user_data: &[u8]) -> Result<ByteCursor> {
        let res = self.do_connect_finalize(user_data);
        if res.is_err() {
            self.transport.disconnect();
            self.state = McsState::Disconnected;
        }
        res
    }

    fn do_connect_finalize(&mut self, user_data: &[u8]) -> Result<ByteCursor> {
        self.send_connect_initial(user_data)?;
        let response = self.recv_connect_response()?;
        self.state = McsState::DomainConnected;

        self.send_erect_domain()?;
        self.send_attach_user()?;
        self.state = McsState::UserAttaching;
        self.recv_attach_confirm()?;
        self.state = McsState::UserAttached;

        for (i, channel) in self.join_order().into_iter().enumerate() {
            self.state = McsState::ChannelJoining(i);
            self.send_channel_join(channel)?;
            self.recv_channel_join_confirm(channel)?;
        }
        self.state = McsState::Ready;
        log::info!("MCS ready: user {} joined {} channels", self.user_id, 2 + self.channels.len());
        Ok(response)
    }

    fn send_connect_initial(&mut self, user_data: &[u8]) -> Result<()> {
        let octet = |len: usize| ber_header_len(u16::from(BER_TAG_OCTET_STRING), len) + len;
        let body = octet(1) + octet(1) + 3 + 3 * DomainParams::ENCODED_LEN + octet(user_data.len());
        let mut s = ByteCursor::with_capacity(ber_header_len(CONNECT_INITIAL, body) + body);

        ber_write_header(&mut s, CONNECT_INITIAL, body);
        ber_write_header(&mut s, u16::from(BER_TAG_OCTET_STRING), 1);
        s.write_u8(1); // calling domain
        ber_write_header(&mut s, u16::from(BER_TAG_OCTET_STRING), 1);
        s.write_u8(1); // called domain
        ber_write_header(&mut s, u16::from(BER_TAG_BOOLEAN), 1);
        s.write_u8(0xff); // upward
        DomainParams::TARGET.write(&mut s);
        DomainParams::MINIMUM.write(&mut s);
        DomainParams::MAXIMUM.write(&mut s);
        ber_write_header(&mut s, u16::from(BER_TAG_OCTET_STRING), user_data.len());
        s.write_bytes(user_data);
        s.mark_end();
        self.send_raw(&s)
    }

    fn recv_connect_response(&mut self) -> Result<ByteCursor> {
        let mut s = self.recv_slow_path("connect-response")?;
        ber_read_header(&mut s, CONNECT_RESPONSE)?;
        let len = ber_read_header(&mut s, u16::from(BER_TAG_RESULT))?;
        if len != 1 {
            return Err(s.protocol_error("connect-response result length"));
        }
        let result = s.read_u8()?;
        if result != 0 {
            log::error!("MCS connect-response result {result}");
            return Err(Error::Handshake("connect-response refused"));
        }
        let len = ber_read_header(&mut s, u16::from(BER_TAG_INTEGER))?;
        s.skip(len)?; // connect id
        let len = ber_read_header(&mut s, u16::from(BER_TAG_DOMAIN_PARAMS))?;
        s.skip(len)?;
        let len = ber_read_header(&mut s, u16::from(BER_TAG_OCTET_STRING))?;
        s.limit(len)?;
        let user_data = s.read_vec(len)?;
        Ok(ByteCursor::from_vec(user_data))
    }

    fn send_erect_domain(&mut self) -> Result<()> {
        let mut s = ByteCursor::with_capacity(5);
        s.write_u8(EDRQ << 2);
        s.write_u16_be(0); // sub height
        s.write_u16_be(0); // sub interval
        self.send_raw(&s)
    }

    fn send_attach_user(&mut self) -> Result<()> {
        let mut s = ByteCursor::with_capacity(1);
        s.write_u8(AURQ << 2);
        self.send_raw(&s)
    }

    fn recv_attach_confirm(&mut self) -> Result<()> {
        let mut s = self.recv_slow_path("attach-user-confirm")?;
        let opcode = s.read_u8()?;
        if opcode >> 2 != AUCF {
            log::error!("expected attach-user-confirm, got opcode {}", opcode >> 2);
            return Err(Error::Handshake("attach-user-confirm"));
        }
        if s.read_u8()? != 0 {
            return Err(Error::Handshake("attach-user refused"));
        }
        if opcode & 2 != 0 {
            self.user_id = s.read_u16_be()?;
        }
        Ok(())
    }

    fn send_channel_join(&mut self, channel: u16) -> Result<()> {
        let mut s = ByteCursor::with_capacity(5);
        s.write_u8(CJRQ << 2);
        s.write_u16_be(self.user_id);
        s.write_u16_be(channel);
        self.send_raw(&s)
    }

    fn recv_channel_join_confirm(&mut self, channel: u16) -> Result<()> {
        let mut s = self.recv_slow_path("channel-join-confirm")?;
        let opcode = s.read_u8()?;
        if opcode >> 2 != CJCF {
            log::error!("expected channel-join-confirm for {channel}, got opcode {}", opcode >> 2);
            return Err(Error::Handshake("channel-join-confirm"));
        }
        if s.read_u8()? != 0 {
            log::error!("join of channel {channel} refused");
            return Err(Error::Handshake("channel join refused"));
        }
        s.skip(4)?; // user id, requested channel id
        if opcode & 2 != 0 {
            s.skip(2)?; // joined channel id
        }
        Ok(())
    }

    // ── data ─────────────────────────────────────────────────────────────────

    /// A writing cursor with the send-data header reserved at
    /// [`Mark::Session`] and room for `len` bytes of payload.
    pub fn init(&self, len: usize) -> ByteCursor {
        let mut s = ByteCursor::with_capacity(SEND_HEADER_LEN + len);
        s.set_mark(Mark::Session);
        s.write_zeros(SEND_HEADER_LEN);
        s
    }

    /// Backpatch the send-data header and hand the PDU to the transport.
    ///
    /// The cursor's position marks the end of the payload.
    pub fn send(&mut self, mut s: ByteCursor, channel: u16) -> Result<()> {
        s.mark_end();
        let hdr = s.mark(Mark::Session);
        let len = s.end() - hdr - SEND_HEADER_LEN;
        if len > MAX_SEND_DATA {
            return Err(Error::protocol(format!("send-data payload of {len} bytes exceeds {MAX_SEND_DATA}")));
        }
        s.recall(Mark::Session);
        s.write_u8(SDRQ << 2);
        s.write_u16_be(self.user_id);
        s.write_u16_be(channel);
        s.write_u8(0x70); // high priority, begin + end segment
        s.write_u16_be(0x8000 | len as u16);
        s.seek(hdr);
        self.transport.send(s.rest()).map_err(Error::transport)
    }

    /// Receive one PDU.
    ///
    /// `Ok(None)` means "nothing usable this round": a timeout or an
    /// unexpected opcode. A disconnect ultimatum is reported as
    /// [`Error::Disconnected`].
    pub fn recv(&mut self) -> Result<Option<Received>> {
        let frame = match self.transport.recv().map_err(Error::transport)? {
            Some(f) => f,
            None => return Ok(None),
        };
        let mut s = match frame {
            Frame::FastPath { header, data } => return Ok(Some(Received::FastPath { header, data })),
            Frame::SlowPath(s) => s,
        };
        let opcode = s.read_u8()?;
        let app = opcode >> 2;
        if app != SDIN {
            if app == DPUM {
                let reason = ((opcode & 1) << 1) | (s.read_u8().unwrap_or(0) >> 7);
                log::info!("disconnect provider ultimatum, reason {reason}");
                self.state = McsState::Disconnected;
                return Err(Error::Disconnected { reason });
            }
            log::warn!("expected send-data indication, got MCS opcode {app}");
            return Ok(None);
        }
        s.skip(2)?; // initiator
        let channel = s.read_u16_be()?;
        s.skip(1)?; // flags
        let first = s.read_u8()?;
        let len = if first & 0x80 != 0 {
            (usize::from(first & 0x7f) << 8) | usize::from(s.read_u8()?)
        } else {
            usize::from(first)
        };
        if len > s.remaining() {
            return Err(s.protocol_error(format!("send-data length {len} exceeds frame")));
        }
        s.limit(len)?;
        Ok(Some(Received::Channel { channel, data: s }))
    }

    /// Send a disconnect-provider ultimatum and close the transport.
    pub fn disconnect(&mut self, reason: u8) {
        if matches!(self.state, McsState::Idle | McsState::Disconnected) {
            self.transport.disconnect();
            self.state = McsState::Disconnected;
            return;
        }
        let mut s = ByteCursor::with_capacity(2);
        s.write_u8((DPUM << 2) | (reason >> 1));
        s.write_u8((reason & 1) << 7);
        if let Err(e) = self.send_raw(&s) {
            log::debug!("ultimatum not sent: {e}");
        }
        self.transport.disconnect();
        self.state = McsState::Disconnected;
    }

    /// Forget the user id and connection state for a fresh attempt.
    /// The channel registry is kept.
    pub fn reset(&mut self) {
        self.transport.disconnect();
        self.user_id = 0;
        self.state = McsState::Idle;
    }

    fn send_raw(&mut self, s: &ByteCursor) -> Result<()> {
        self.transport.send(&s.data()[..s.position()]).map_err(Error::transport)
    }

    fn recv_slow_path(&mut self, step: &'static str) -> Result<ByteCursor> {
        match self.transport.recv().map_err(Error::transport)? {
            Some(Frame::SlowPath(s)) => Ok(s),
            Some(Frame::FastPath { .. }) => {
                log::error!("fast-path frame while waiting for {step}");
                Err(Error::Handshake(step))
            }
            None => Err(Error::Handshake(step)),
        }
    }
}

/// Decode a send-data request as written by [`Mcs::send`]:
/// `(user id, channel id, payload)`.
pub fn decode_send_data(s: &mut ByteCursor) -> Result<(u16, u16, Vec<u8>)> {
    let opcode = s.read_u8()?;
    if opcode >> 2 != SDRQ {
        return Err(s.protocol_error(format!("expected send-data request, got {}", opcode >> 2)));
    }
    let user = s.read_u16_be()?;
    let channel = s.read_u16_be()?;
    s.skip(1)?;
    let len = usize::from(s.read_u16_be()? & 0x7fff);
    Ok((user, channel, s.read_vec(len)?))
}
