//! GCC conference-create request/response: the client data blocks carried
//! in the MCS connect-initial and the server blocks that come back.

use rdpwire_crypto::{Strength, rsa};

use crate::cert::parse_server_certificate;
use crate::cursor::{ByteCursor, utf16_len};
use crate::error::Result;
use crate::mcs::Channel;

// ─── Tags ────────────────────────────────────────────────────────────────────

const CS_CORE:     u16 = 0xc001;
const CS_SECURITY: u16 = 0xc002;
const CS_NET:      u16 = 0xc003;
const CS_CLUSTER:  u16 = 0xc004;

const SC_CORE:     u16 = 0x0c01;
const SC_SECURITY: u16 = 0x0c02;
const SC_NET:      u16 = 0x0c03;

/// `RDP_VERSION_4`: the oldest protocol revision.
pub const RDP_VERSION_4: u32 = 0x0008_0001;
/// `RDP_VERSION_5_PLUS`.
pub const RDP_VERSION_5: u32 = 0x0008_0004;

const CORE_LEN:     usize = 216;
const SECURITY_LEN: usize = 12;
const CLUSTER_LEN:  usize = 12;
const GCC_HEADER_LEN: usize = 23;

const RNS_UD_COLOR_8BPP: u16 = 0xca01;
const RNS_UD_SAS_DEL:    u16 = 0xaa03;
const RNS_UD_CS_SUPPORT_ERRINFO_PDU: u16 = 0x0001;

const REDIRECTION_SUPPORTED:         u32 = 0x0000_0001;
const REDIRECTED_SESSIONID_VALID:    u32 = 0x0000_0002;
const REDIRECTION_VERSION4:          u32 = 0x03;

// ─── ClientData ──────────────────────────────────────────────────────────────

/// Everything the client announces in its conference-create request.
#[derive(Clone, Debug)]
pub struct ClientData {
    pub rdp5:              bool,
    pub width:             u16,
    pub height:            u16,
    pub bpp:               u16,
    pub keyboard_layout:   u32,
    /// At most 15 characters are sent.
    pub hostname:          String,
    pub encryption:        bool,
    pub selected_protocol: u32,
    /// Session id from a redirect, announced in the cluster block.
    pub redirect_session:  Option<u32>,
}

impl Default for ClientData {
    fn default() -> Self {
        Self {
            rdp5:              true,
            width:             1024,
            height:            768,
            bpp:               16,
            keyboard_layout:   0x409,
            hostname:          "rdpwire".to_owned(),
            encryption:        true,
            selected_protocol: 0,
            redirect_session:  None,
        }
    }
}

impl ClientData {
    /// Encode the full user-data blob (T.124 header + client blocks).
    pub fn encode(&self, channels: &[Channel]) -> Vec<u8> {
        let net_len = if channels.is_empty() { 0 } else { 8 + 12 * channels.len() };
        let cluster_len = if self.redirect_session.is_some() { CLUSTER_LEN } else { 0 };
        let blocks = CORE_LEN + SECURITY_LEN + net_len + cluster_len;
        let length = blocks + 14;

        let mut s = ByteCursor::with_capacity(GCC_HEADER_LEN + blocks);
        // T.124 ConferenceCreateRequest, PER-encoded
        s.write_u16_be(5);
        s.write_u16_be(0x14);
        s.write_u8(0x7c);
        s.write_u16_be(1);
        s.write_u16_be(0x8000 | length as u16);
        s.write_u16_be(8);
        s.write_u16_be(16);
        s.write_u8(0);
        s.write_u16_le(0xc001);
        s.write_u8(0);
        s.write_bytes(b"Duca"); // h221 non-standard key
        s.write_u16_be(0x8000 | blocks as u16);

        self.write_core(&mut s);
        self.write_security(&mut s);
        if !channels.is_empty() {
            s.write_u16_le(CS_NET);
            s.write_u16_le(net_len as u16);
            s.write_u32_le(channels.len() as u32);
            for c in channels {
                s.write_bytes(&c.wire_name());
                s.write_u32_le(c.options);
            }
        }
        if let Some(session) = self.redirect_session {
            s.write_u16_le(CS_CLUSTER);
            s.write_u16_le(CLUSTER_LEN as u16);
            s.write_u32_le(REDIRECTION_SUPPORTED | REDIRECTED_SESSIONID_VALID | (REDIRECTION_VERSION4 << 2));
            s.write_u32_le(session);
        }
        s.into_vec()
    }

    fn write_core(&self, s: &mut ByteCursor) {
        s.write_u16_le(CS_CORE);
        s.write_u16_le(CORE_LEN as u16);
        s.write_u32_le(if self.rdp5 { RDP_VERSION_5 } else { RDP_VERSION_4 });
        s.write_u16_le(self.width);
        s.write_u16_le(self.height);
        s.write_u16_le(RNS_UD_COLOR_8BPP);
        s.write_u16_le(RNS_UD_SAS_DEL);
        s.write_u32_le(self.keyboard_layout);
        s.write_u32_le(2600); // client build

        let name: String = self.hostname.chars().take(15).collect();
        let n = s.write_utf16(&name);
        s.write_zeros(32 - n);

        s.write_u32_le(4);  // keyboard type: IBM enhanced
        s.write_u32_le(0);  // keyboard sub type
        s.write_u32_le(12); // function keys
        s.write_zeros(64);  // IME file name
        s.write_u16_le(RNS_UD_COLOR_8BPP);
        s.write_u16_le(1);  // client product id
        s.write_u32_le(0);  // serial number
        s.write_u16_le(self.bpp);
        s.write_u16_le(0x0007); // 24, 16, 15 bpp supported
        s.write_u16_le(RNS_UD_CS_SUPPORT_ERRINFO_PDU);
        s.write_zeros(64);  // dig product id
        s.write_u8(0);      // connection type
        s.write_u8(0);
        s.write_u32_le(self.selected_protocol);
        debug_assert!(utf16_len(&name) <= 30);
    }

    fn write_security(&self, s: &mut ByteCursor) {
        s.write_u16_le(CS_SECURITY);
        s.write_u16_le(SECURITY_LEN as u16);
        let methods = if self.encryption {
            Strength::Bits40.method() | Strength::Bits128.method() | Strength::Bits56.method()
        } else {
            0
        };
        s.write_u32_le(methods);
        s.write_u32_le(0); // ext encryption methods
    }
}

// ─── ServerData ──────────────────────────────────────────────────────────────

/// Server security parameters from the `SC_SECURITY` block.
#[derive(Clone, Debug)]
pub struct ServerCrypto {
    pub strength:      Strength,
    pub level:         u32,
    pub server_random: [u8; 32],
    pub public_key:    rsa::Key,
}

/// The parsed server blocks of the conference-create response.
#[derive(Clone, Debug, Default)]
pub struct ServerData {
    /// `SC_CORE` version, if the block was present.
    pub rdp_version:   Option<u32>,
    /// `None` when the server chose no encryption.
    pub crypto:        Option<ServerCrypto>,
    pub channel_count: u16,
}

impl ServerData {
    /// Parse the connect-response user data.
    pub fn parse(s: &mut ByteCursor) -> Result<Self> {
        s.skip(21)?; // T.124 ConferenceCreateResponse header
        let len = s.read_u8()?;
        if len & 0x80 != 0 {
            s.skip(1)?;
        }

        let mut out = ServerData::default();
        while s.remaining() >= 4 {
            let tag = s.read_u16_le()?;
            let len = usize::from(s.read_u16_le()?);
            if len <= 4 {
                break;
            }
            let body = len - 4;
            if !s.bytes_available(body) {
                return Err(s.protocol_error(format!("server block {tag:#06x} of {len} bytes truncated")));
            }
            let next = s.position() + body;
            match tag {
                SC_CORE => {
                    let version = s.read_u32_le()?;
                    log::debug!("server RDP version {version:#010x}");
                    out.rdp_version = Some(version);
                }
                SC_SECURITY => out.crypto = parse_server_security(s)?,
                SC_NET => {
                    s.skip(2)?; // MCS channel id
                    out.channel_count = s.read_u16_le()?;
                }
                other => log::warn!("unhandled server data block {other:#06x}"),
            }
            s.seek(next);
        }
        Ok(out)
    }
}

fn parse_server_security(s: &mut ByteCursor) -> Result<Option<ServerCrypto>> {
    let method = s.read_u32_le()?;
    let level = s.read_u32_le()?;
    if method == 0 || level == 0 {
        log::info!("server selected no encryption");
        return Ok(None);
    }
    let strength = Strength::from_method(method)
        .ok_or_else(|| s.protocol_error(format!("unsupported encryption method {method:#x}")))?;
    let random_len = s.read_u32_le()? as usize;
    let cert_len = s.read_u32_le()? as usize;
    if random_len != 32 {
        return Err(s.protocol_error(format!("server random of {random_len} bytes")));
    }
    let server_random = s.read_array::<32>()?;
    let mut cert = ByteCursor::from_vec(s.read_vec(cert_len)?);
    let public_key = parse_server_certificate(&mut cert)?;
    Ok(Some(ServerCrypto { strength, level, server_random, public_key }))
}
