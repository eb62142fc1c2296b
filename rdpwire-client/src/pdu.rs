//! Share-control / share-data PDU numbering and header framing.

use rdpwire_proto::{ByteCursor, Result};

// ─── Share-control PDU types ──────────────────────────────────────────────────

pub const PDU_DEMAND_ACTIVE:     u16 = 1;
pub const PDU_CONFIRM_ACTIVE:    u16 = 3;
pub const PDU_REDIRECT:          u16 = 4;
pub const PDU_DEACTIVATE:        u16 = 6;
pub const PDU_DATA:              u16 = 7;
pub const PDU_ENHANCED_REDIRECT: u16 = 10;

/// Protocol version nibble ORed into the PDU type.
pub const PDU_VERSION: u16 = 0x10;

pub const SHARE_CONTROL_LEN: usize = 6;
pub const SHARE_DATA_LEN:    usize = 18;

/// A lone length of 0x8000 is an 8-byte keep-alive, not a PDU.
pub const KEEPALIVE_LEN: u16 = 0x8000;

// ─── Share-data PDU types ─────────────────────────────────────────────────────

pub const DATA_UPDATE:              u8 = 2;
pub const DATA_CONTROL:             u8 = 20;
pub const DATA_POINTER:             u8 = 27;
pub const DATA_INPUT:               u8 = 28;
pub const DATA_SYNCHRONISE:         u8 = 31;
pub const DATA_BELL:                u8 = 34;
pub const DATA_CLIENT_WINDOW_STATUS: u8 = 35;
pub const DATA_LOGON:               u8 = 38;
pub const DATA_FONT_LIST:           u8 = 39;
pub const DATA_FONT_MAP:            u8 = 40;
pub const DATA_KEYBOARD_INDICATORS: u8 = 41;
pub const DATA_PERSISTENT_KEY_LIST: u8 = 43;
pub const DATA_SET_ERROR_INFO:      u8 = 47;
pub const DATA_AUTORECONNECT_STATUS: u8 = 50;

// ─── Update types ─────────────────────────────────────────────────────────────

pub const UPDATE_ORDERS:      u16 = 0;
pub const UPDATE_BITMAP:      u16 = 1;
pub const UPDATE_PALETTE:     u16 = 2;
pub const UPDATE_SYNCHRONIZE: u16 = 3;

// ─── Control ──────────────────────────────────────────────────────────────────

pub const CTRL_REQUEST_CONTROL: u16 = 1;
pub const CTRL_GRANT_CONTROL:   u16 = 2;
pub const CTRL_DETACH:          u16 = 3;
pub const CTRL_COOPERATE:       u16 = 4;

/// Bulk compression flag in the share-data header.
pub const PACKET_COMPRESSED: u8 = 0x20;

// ─── Framing ──────────────────────────────────────────────────────────────────

/// One share-control PDU cut out of a received security payload.
#[derive(Debug)]
pub struct SharePdu {
    /// Low nibble of the type field; 0 for keep-alives.
    pub pdu_type: u16,
    pub source:   u16,
    /// The PDU body after the share-control header.
    pub body:     ByteCursor,
}

/// Split the next share-control PDU off `s`.
///
/// Several PDUs may share one security payload; `s` is left at the start
/// of the next one.
pub fn next_share_pdu(s: &mut ByteCursor) -> Result<SharePdu> {
    let start = s.position();
    let length = s.read_u16_le()?;
    if length == KEEPALIVE_LEN {
        let skip = s.remaining().min(6);
        s.skip(skip)?;
        return Ok(SharePdu { pdu_type: 0, source: 0, body: ByteCursor::default() });
    }
    let length = usize::from(length);
    if length < SHARE_CONTROL_LEN || !s.bytes_available(length - 2) {
        s.seek(start);
        return Err(s.protocol_error(format!("share-control length {length}")));
    }
    let pdu_type = s.read_u16_le()? & 0xf;
    let source = s.read_u16_le()?;
    let body = ByteCursor::from_vec(s.read_vec(length - SHARE_CONTROL_LEN)?);
    Ok(SharePdu { pdu_type, source, body })
}

/// Parsed share-data header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShareDataHeader {
    pub share_id:          u32,
    pub uncompressed_len:  u16,
    pub data_type:         u8,
    pub compression:       u8,
    pub compressed_len:    u16,
}

impl ShareDataHeader {
    /// Read the header that follows the share-control header of a data PDU.
    pub fn read(s: &mut ByteCursor) -> Result<Self> {
        let share_id = s.read_u32_le()?;
        s.skip(2)?; // pad, stream id
        let uncompressed_len = s.read_u16_le()?;
        let data_type = s.read_u8()?;
        let compression = s.read_u8()?;
        let compressed_len = s.read_u16_le()?;
        Ok(Self { share_id, uncompressed_len, data_type, compression, compressed_len })
    }
}

/// Write a share-control header at the cursor.
pub fn write_share_control(s: &mut ByteCursor, length: usize, pdu_type: u16, source: u16) {
    s.write_u16_le(length as u16);
    s.write_u16_le(pdu_type | PDU_VERSION);
    s.write_u16_le(source);
}
