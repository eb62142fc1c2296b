//! Standard RDP security layer: key exchange, MAC + RC4 protection of
//! outgoing PDUs, and demultiplexing of licensing, redirection and
//! virtual-channel traffic on receive.

use rdpwire_crypto::{KeyState, SIGNATURE_LEN, SessionKeys, client_random, rsa};

use crate::cursor::{ByteCursor, Mark};
use crate::error::{Error, Result};
use crate::gcc::{ClientData, ServerCrypto, ServerData};
use crate::licence::{Licensing, ValidClientOnly};
use crate::mcs::{GLOBAL_CHANNEL, Mcs, REASON_USER_REQUESTED, Received};
use crate::transport::{ConnectTarget, PROTOCOL_RDP, Transport};

/// Security header flags.
pub mod flags {
    pub const EXCHANGE_PKT:    u32 = 0x0001;
    pub const ENCRYPT:         u32 = 0x0008;
    pub const RESET_SEQNO:     u32 = 0x0010;
    pub const IGNORE_SEQNO:    u32 = 0x0020;
    pub const INFO_PKT:        u32 = 0x0040;
    pub const LICENSE_PKT:     u32 = 0x0080;
    pub const REDIRECTION_PKT: u32 = 0x0400;
}

/// Fast-path output header: `FASTPATH_OUTPUT_ENCRYPTED` in the two-bit
/// flags field.
const FASTPATH_OUTPUT_ENCRYPTED: u8 = 0x2;

/// Exchange-packet trailing padding.
const EXCHANGE_PADDING: usize = 8;

// ─── Collaborators ───────────────────────────────────────────────────────────

/// Receives payloads for static virtual channels other than the global one.
pub trait ChannelDispatch {
    fn deliver(&mut self, channel: u16, data: ByteCursor);
}

/// Drops every virtual-channel payload.
#[derive(Debug, Default)]
pub struct DiscardChannels;

impl ChannelDispatch for DiscardChannels {
    fn deliver(&mut self, channel: u16, data: ByteCursor) {
        log::debug!("dropping {} bytes on channel {channel}", data.remaining());
    }
}

/// What the security layer hands up to the application layer.
#[derive(Debug)]
pub enum SecPdu {
    /// A decrypted global-channel PDU, positioned at its share-control
    /// header.
    Slow(ByteCursor),
    /// A decrypted fast-path output PDU.
    FastPath { header: u8, data: ByteCursor },
}

// ─── Security ────────────────────────────────────────────────────────────────

/// The security layer on top of an [`Mcs`] session.
pub struct Security<T: Transport> {
    mcs:                Mcs<T>,
    keys:               Option<KeyState>,
    licence_issued:     bool,
    server_rdp_version: Option<u32>,
    client_random:      [u8; 32],
    licensing:          Box<dyn Licensing>,
    channels:           Box<dyn ChannelDispatch>,
}

impl<T: Transport> Security<T> {
    pub fn new(transport: T) -> Self {
        Self {
            mcs:                Mcs::new(transport),
            keys:               None,
            licence_issued:     false,
            server_rdp_version: None,
            client_random:      [0; 32],
            licensing:          Box::new(ValidClientOnly),
            channels:           Box::new(DiscardChannels),
        }
    }

    pub fn with_licensing(mut self, licensing: Box<dyn Licensing>) -> Self {
        self.licensing = licensing;
        self
    }

    pub fn with_channels(mut self, channels: Box<dyn ChannelDispatch>) -> Self {
        self.channels = channels;
        self
    }

    pub fn mcs(&self) -> &Mcs<T> { &self.mcs }
    pub fn mcs_mut(&mut self) -> &mut Mcs<T> { &mut self.mcs }
    /// Whether outgoing data PDUs are signed and encrypted.
    pub fn encrypting(&self) -> bool { self.keys.is_some() }
    pub fn licence_issued(&self) -> bool { self.licence_issued }
    pub fn server_rdp_version(&self) -> Option<u32> { self.server_rdp_version }
    /// The random sent in the exchange packet (all zero before).
    pub fn client_random(&self) -> &[u8; 32] { &self.client_random }
    pub fn keys(&self) -> Option<&KeyState> { self.keys.as_ref() }

    /// `flags::ENCRYPT` when the session is encrypted, else 0.
    pub fn data_flags(&self) -> u32 {
        if self.encrypting() { flags::ENCRYPT } else { 0 }
    }

    // ── connect ──────────────────────────────────────────────────────────────

    /// Bring up transport, MCS and (if the server chose it) encryption.
    pub fn connect(&mut self, target: &ConnectTarget, client: &ClientData) -> Result<ServerData> {
        let selected = self.mcs.connect_start(target)?;
        let client = ClientData { selected_protocol: selected, ..client.clone() };
        let user_data = client.encode(self.mcs.channels());
        let mut response = self.mcs.connect_finalize(&user_data)?;

        let res = self.finish_connect(&mut response, &client);
        if res.is_err() {
            self.mcs.disconnect(REASON_USER_REQUESTED);
        }
        res
    }

    fn finish_connect(&mut self, response: &mut ByteCursor, client: &ClientData) -> Result<ServerData> {
        let server = ServerData::parse(response)?;
        self.server_rdp_version = server.rdp_version;
        match &server.crypto {
            Some(crypto) if client.encryption && client.selected_protocol == PROTOCOL_RDP => {
                self.establish_keys_with(crypto, client_random())?;
            }
            Some(_) => log::info!("server offered standard security; not used"),
            None if client.encryption => log::warn!("encryption requested but server chose none"),
            None => {}
        }
        Ok(server)
    }

    /// Send the encrypted client random and derive the session keys.
    pub(crate) fn establish_keys_with(&mut self, crypto: &ServerCrypto, random: [u8; 32]) -> Result<()> {
        let modulus_len = crypto.public_key.modulus_len();
        let encrypted = rsa::encrypt_le(&random, &crypto.public_key, modulus_len)?;
        let length = encrypted.len() + EXCHANGE_PADDING;

        let mut s = self.init(flags::EXCHANGE_PKT, 4 + length);
        s.write_u32_le(length as u32);
        s.write_bytes(&encrypted);
        s.write_zeros(EXCHANGE_PADDING);
        self.send(s, flags::EXCHANGE_PKT)?;

        self.client_random = random;
        let keys = SessionKeys::derive(&random, &crypto.server_random, crypto.strength);
        log::info!("standard security established ({:?})", crypto.strength);
        self.keys = Some(KeyState::new(keys));
        Ok(())
    }

    // ── send ─────────────────────────────────────────────────────────────────

    fn header_len(&self, flags: u32) -> usize {
        if flags & flags::ENCRYPT != 0 {
            4 + SIGNATURE_LEN
        } else if !self.licence_issued || flags != 0 {
            4
        } else {
            0
        }
    }

    /// A writing cursor with the security header reserved at
    /// [`Mark::Security`] and room for `len` payload bytes.
    pub fn init(&self, flags: u32, len: usize) -> ByteCursor {
        let hdr = self.header_len(flags);
        let mut s = self.mcs.init(hdr + len);
        s.set_mark(Mark::Security);
        s.write_zeros(hdr);
        s
    }

    /// Send on the global channel.
    pub fn send(&mut self, s: ByteCursor, flags: u32) -> Result<()> {
        self.send_to_channel(s, flags, GLOBAL_CHANNEL)
    }

    /// Fill the security header, sign and encrypt if requested, and hand the
    /// PDU to MCS. The cursor's position marks the end of the payload.
    pub fn send_to_channel(&mut self, mut s: ByteCursor, flags: u32, channel: u16) -> Result<()> {
        s.mark_end();
        let hdr = self.header_len(flags);
        if hdr > 0 {
            let body = s.mark(Mark::Security) + hdr;
            s.recall(Mark::Security);
            s.write_u32_le(flags);
            if flags & flags::ENCRYPT != 0 {
                let keys = self.keys.as_mut().ok_or(Error::Handshake("encryption keys not established"))?;
                let signature = keys.sign(&s.data()[body..]);
                s.write_bytes(&signature);
                keys.encrypt(s.span_mut(body));
            }
            s.seek(s.end());
        }
        self.mcs.send(s, channel)
    }

    // ── receive ──────────────────────────────────────────────────────────────

    /// Receive the next PDU meant for the application layer.
    ///
    /// Licensing and virtual-channel PDUs are consumed here. `Ok(None)`
    /// passes on MCS's "nothing this round".
    pub fn recv(&mut self) -> Result<Option<SecPdu>> {
        loop {
            let (channel, mut s) = match self.mcs.recv()? {
                None => return Ok(None),
                Some(Received::FastPath { header, mut data }) => {
                    if (header >> 6) & FASTPATH_OUTPUT_ENCRYPTED != 0 {
                        data.skip(SIGNATURE_LEN)?;
                        let keys = self.keys.as_mut()
                            .ok_or_else(|| data.protocol_error("encrypted fast-path on plain session"))?;
                        keys.decrypt(data.rest_mut());
                    }
                    return Ok(Some(SecPdu::FastPath { header, data }));
                }
                Some(Received::Channel { channel, data }) => (channel, data),
            };

            if self.keys.is_some() || !self.licence_issued {
                let sec_flags = u32::from(s.read_u16_le()?);
                s.skip(2)?; // flags hi
                match self.keys.as_mut() {
                    Some(keys) => {
                        if sec_flags & flags::ENCRYPT != 0 {
                            s.skip(SIGNATURE_LEN)?;
                            keys.decrypt(s.rest_mut());
                        }
                        if sec_flags & flags::LICENSE_PKT != 0 {
                            self.process_licence(&mut s)?;
                            continue;
                        }
                        if sec_flags & flags::REDIRECTION_PKT != 0 {
                            s.skip(SIGNATURE_LEN)?;
                            keys.decrypt(s.rest_mut());
                            swap_redirect_header(s.rest_mut());
                        }
                    }
                    None => {
                        if sec_flags & flags::LICENSE_PKT != 0 {
                            self.process_licence(&mut s)?;
                            continue;
                        }
                        s.seek(s.position() - 4);
                    }
                }
            }

            if channel != GLOBAL_CHANNEL {
                self.channels.deliver(channel, s);
                continue;
            }
            return Ok(Some(SecPdu::Slow(s)));
        }
    }

    fn process_licence(&mut self, s: &mut ByteCursor) -> Result<()> {
        let outcome = self.licensing.process(s)?;
        if let Some(reply) = outcome.reply {
            let mut out = self.init(flags::LICENSE_PKT, reply.len());
            out.write_bytes(&reply);
            self.send(out, flags::LICENSE_PKT)?;
        }
        if outcome.completed && !self.licence_issued {
            log::debug!("licensing completed");
            self.licence_issued = true;
        }
        Ok(())
    }

    // ── teardown ─────────────────────────────────────────────────────────────

    pub fn disconnect(&mut self) {
        self.mcs.disconnect(REASON_USER_REQUESTED);
    }

    /// Drop keys and licensing state for a fresh connection (redirect).
    pub fn reset(&mut self) {
        self.keys = None;
        self.licence_issued = false;
        self.server_rdp_version = None;
        self.client_random = [0; 32];
        self.mcs.reset();
    }
}

/// Servers send the standard-security redirection PDU with its type and
/// length fields swapped: `00 04 XX YY` on the wire becomes `XX YY 04 00`,
/// the usual share-control `length, type` layout with type 4.
pub(crate) fn swap_redirect_header(buf: &mut [u8]) {
    if buf.len() >= 4 && buf[0] == 0 && buf[1] == 4 {
        buf.swap(0, 2);
        buf.swap(1, 3);
        buf.swap(2, 3);
    }
}
