//! The client info (logon) PDU.

use chrono::{Local, Offset};
use rdpwire_proto::ByteCursor;
use rdpwire_proto::cursor::utf16_len;

use crate::state::ReconnectCookie;

// ─── Info flags ───────────────────────────────────────────────────────────────

pub const INFO_MOUSE:             u32 = 0x0000_0001;
pub const INFO_DISABLECTRLALTDEL: u32 = 0x0000_0002;
pub const INFO_AUTOLOGON:         u32 = 0x0000_0008;
pub const INFO_UNICODE:           u32 = 0x0000_0010;
pub const INFO_MAXIMIZESHELL:     u32 = 0x0000_0020;
pub const INFO_ENABLEWINDOWSKEY:  u32 = 0x0000_0100;
pub const INFO_LOGONERRORS:       u32 = 0x0001_0000;

const AF_INET: u16 = 2;
const CLIENT_DIR: &str = "C:\\WINNT\\System32\\mstscax.dll";
const TIMEZONE_LEN: usize = 172;
const TIMEZONE_NAME_LEN: usize = 64;

/// Size of the auto-reconnect cookie echoed back to the server.
pub const ARC_COOKIE_LEN: usize = 28;

/// What goes into the password field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Secret<'a> {
    /// UTF-16LE password; the terminator is added on the wire.
    Password(&'a [u8]),
    /// Opaque cookie from a redirect, sent verbatim. It carries its own
    /// two-byte terminator, which `cbPassword` does not count.
    RedirectCookie(&'a [u8]),
}

impl Secret<'_> {
    fn is_empty(&self) -> bool {
        match self {
            Self::Password(p) | Self::RedirectCookie(p) => p.is_empty(),
        }
    }

    /// The `cbPassword` value.
    fn declared_len(&self) -> usize {
        match self {
            Self::Password(p) => p.len(),
            Self::RedirectCookie(c) => c.len().saturating_sub(2),
        }
    }

    /// Bytes the field occupies, terminator included.
    fn wire_len(&self) -> usize {
        match self {
            Self::Password(p) => p.len() + 2,
            Self::RedirectCookie(c) => c.len(),
        }
    }
}

/// The strings and options that go into the client info PDU.
#[derive(Debug)]
pub struct ClientInfo<'a> {
    /// Send the extended (RDP 5) form.
    pub extended:          bool,
    pub domain:            &'a str,
    pub username:          &'a str,
    pub password:          Secret<'a>,
    pub program:           &'a str,
    pub directory:         &'a str,
    pub client_address:    &'a str,
    pub performance_flags: u32,
    pub reconnect:         Option<[u8; ARC_COOKIE_LEN]>,
}

impl ClientInfo<'_> {
    pub fn flags(&self) -> u32 {
        let mut flags = INFO_MOUSE | INFO_DISABLECTRLALTDEL | INFO_UNICODE | INFO_MAXIMIZESHELL;
        if !self.password.is_empty() {
            flags |= INFO_AUTOLOGON;
        }
        if self.extended {
            flags |= INFO_ENABLEWINDOWSKEY | INFO_LOGONERRORS;
        }
        flags
    }

    /// Encoded length of the PDU body.
    pub fn len(&self) -> usize {
        let strings = utf16_len(self.domain) + utf16_len(self.username) + self.password.wire_len()
            + utf16_len(self.program) + utf16_len(self.directory);
        let basic = 18 + strings + 8;
        if !self.extended {
            return basic;
        }
        let cookie = self.reconnect.map_or(0, |_| ARC_COOKIE_LEN);
        basic
            + 4 + utf16_len(self.client_address) + 2
            + 2 + utf16_len(CLIENT_DIR) + 2
            + TIMEZONE_LEN
            + 4 + 4 + 2 + cookie
    }

    pub fn write(&self, s: &mut ByteCursor) {
        s.write_u32_le(0); // code page
        s.write_u32_le(self.flags());
        s.write_u16_le(utf16_len(self.domain) as u16);
        s.write_u16_le(utf16_len(self.username) as u16);
        s.write_u16_le(self.password.declared_len() as u16);
        s.write_u16_le(utf16_len(self.program) as u16);
        s.write_u16_le(utf16_len(self.directory) as u16);
        write_terminated(s, self.domain);
        write_terminated(s, self.username);
        match self.password {
            Secret::Password(p) => {
                s.write_bytes(p);
                s.write_u16_le(0);
            }
            Secret::RedirectCookie(c) => s.write_bytes(c),
        }
        write_terminated(s, self.program);
        write_terminated(s, self.directory);
        if !self.extended {
            return;
        }

        s.write_u16_le(AF_INET);
        s.write_u16_le((utf16_len(self.client_address) + 2) as u16);
        write_terminated(s, self.client_address);
        s.write_u16_le((utf16_len(CLIENT_DIR) + 2) as u16);
        write_terminated(s, CLIENT_DIR);
        write_timezone(s);
        s.write_u32_le(0); // client session id
        s.write_u32_le(self.performance_flags);
        match &self.reconnect {
            Some(cookie) => {
                s.write_u16_le(ARC_COOKIE_LEN as u16);
                s.write_bytes(cookie);
            }
            None => s.write_u16_le(0),
        }
    }
}

fn write_terminated(s: &mut ByteCursor, text: &str) {
    s.write_utf16(text);
    s.write_u16_le(0);
}

/// `TS_TIME_ZONE_INFORMATION` for the local offset, without DST rules.
fn write_timezone(s: &mut ByteCursor) {
    let offset = Local::now().offset().fix();
    let bias = -offset.local_minus_utc() / 60;
    let name = format!("UTC{offset}");
    let start = s.position();

    s.write_u32_le(bias as u32);
    write_fixed_utf16(s, &name, TIMEZONE_NAME_LEN);
    s.write_zeros(16); // standard date
    s.write_u32_le(0); // standard bias
    write_fixed_utf16(s, &name, TIMEZONE_NAME_LEN);
    s.write_zeros(16); // daylight date
    s.write_u32_le(0); // daylight bias
    debug_assert_eq!(s.position() - start, TIMEZONE_LEN);
}

/// `text` in a zero-padded field of `len` bytes, truncated to keep a NUL.
fn write_fixed_utf16(s: &mut ByteCursor, text: &str, len: usize) {
    let start = s.position();
    for unit in text.encode_utf16().take(len / 2 - 1) {
        s.write_u16_le(unit);
    }
    s.write_zeros(len - (s.position() - start));
}

/// The client's half of auto-reconnect: the logon id and an HMAC-MD5 of
/// the current client random under the server's reconnect random.
pub fn reconnect_verifier(cookie: &ReconnectCookie, client_random: &[u8; 32]) -> [u8; ARC_COOKIE_LEN] {
    let verifier = rdpwire_crypto::hmac_md5(&cookie.random, client_random);
    let mut out = [0u8; ARC_COOKIE_LEN];
    out[0..4].copy_from_slice(&(ARC_COOKIE_LEN as u32).to_le_bytes());
    out[4..8].copy_from_slice(&1u32.to_le_bytes()); // version
    out[8..12].copy_from_slice(&cookie.logon_id.to_le_bytes());
    out[12..].copy_from_slice(&verifier);
    out
}

/// A password as UTF-16LE, without terminator.
pub fn encode_password(password: &str) -> Vec<u8> {
    password.encode_utf16().flat_map(u16::to_le_bytes).collect()
}
