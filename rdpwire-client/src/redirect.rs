//! Server redirection packets.

use rdpwire_proto::{ByteCursor, Result};

use crate::state::PendingRedirect;

// ─── Redirection flags ────────────────────────────────────────────────────────

pub const LB_TARGET_NET_ADDRESS:   u32 = 0x0000_0001;
pub const LB_LOAD_BALANCE_INFO:    u32 = 0x0000_0002;
pub const LB_USERNAME:             u32 = 0x0000_0004;
pub const LB_DOMAIN:               u32 = 0x0000_0008;
pub const LB_PASSWORD:             u32 = 0x0000_0010;
pub const LB_DONTSTOREUSERNAME:    u32 = 0x0000_0020;
pub const LB_SMARTCARD_LOGON:      u32 = 0x0000_0040;
pub const LB_NOREDIRECT:           u32 = 0x0000_0080;
pub const LB_TARGET_FQDN:          u32 = 0x0000_0100;
pub const LB_TARGET_NETBIOS_NAME:  u32 = 0x0000_0200;
pub const LB_TARGET_NET_ADDRESSES: u32 = 0x0000_0800;
pub const LB_CLIENT_TSV_URL:       u32 = 0x0000_1000;
pub const LB_SERVER_TSV_CAPABLE:   u32 = 0x0000_2000;
pub const LB_PASSWORD_IS_PK_ENCRYPTED: u32 = 0x0000_4000;
pub const LB_REDIRECTION_GUID:         u32 = 0x0000_8000;
pub const LB_TARGET_CERTIFICATE:       u32 = 0x0001_0000;

const REDIRECTION_IDENTIFIER: u16 = 0x0400;

/// Parse a redirection body that follows the share-control header.
///
/// For the standard form the session id straddles the header: its low
/// half arrived where a share-control source id normally sits.
pub fn decode_redirect(s: &mut ByteCursor, source: u16, enhanced: bool) -> Result<PendingRedirect> {
    let high = s.read_u16_le()?;
    let session_id = if enhanced {
        let identifier = s.read_u16_le()?;
        if identifier != REDIRECTION_IDENTIFIER {
            return Err(s.protocol_error(format!("redirection identifier {identifier:#06x}")));
        }
        s.skip(2)?; // length
        s.read_u32_le()?
    } else {
        u32::from(source) | (u32::from(high) << 16)
    };

    let flags = s.read_u32_le()?;
    let mut r = PendingRedirect { session_id, flags, ..Default::default() };

    if flags & LB_TARGET_NET_ADDRESS != 0 {
        r.server = Some(read_string(s)?);
    }
    if flags & LB_LOAD_BALANCE_INFO != 0 {
        r.lb_info = Some(read_blob(s)?);
    }
    if flags & LB_USERNAME != 0 {
        r.username = Some(read_string(s)?);
    }
    if flags & LB_DOMAIN != 0 {
        r.domain = Some(read_string(s)?);
    }
    if flags & LB_PASSWORD != 0 {
        r.cookie = Some(read_blob(s)?);
    }
    if flags & LB_TARGET_FQDN != 0 {
        let fqdn = read_string(s)?;
        tracing::debug!("redirect target FQDN {fqdn}");
        r.server = Some(fqdn);
    }
    // Remaining length-prefixed fields, in wire order.
    for (flag, what) in [
        (LB_TARGET_NETBIOS_NAME, "NetBIOS name"),
        (LB_CLIENT_TSV_URL, "TSV URL"),
        (LB_REDIRECTION_GUID, "redirection GUID"),
        (LB_TARGET_CERTIFICATE, "target certificate"),
        (LB_TARGET_NET_ADDRESSES, "target address list"),
    ] {
        if flags & flag != 0 {
            let skipped = read_blob(s)?;
            tracing::debug!("ignoring redirect {what} ({} bytes)", skipped.len());
        }
    }
    for (flag, what) in [
        (LB_DONTSTOREUSERNAME, "don't store username"),
        (LB_SMARTCARD_LOGON, "smartcard logon"),
        (LB_NOREDIRECT, "no redirect"),
        (LB_SERVER_TSV_CAPABLE, "server TSV capable"),
        (LB_PASSWORD_IS_PK_ENCRYPTED, "password is PK-encrypted"),
    ] {
        if flags & flag != 0 {
            tracing::debug!("redirect flag: {what}");
        }
    }

    tracing::info!(
        "server redirect to {} (session {session_id:#x}, flags {flags:#x})",
        r.server.as_deref().unwrap_or("<same server>")
    );
    Ok(r)
}

fn read_blob(s: &mut ByteCursor) -> Result<Vec<u8>> {
    let len = s.read_u32_le()? as usize;
    s.read_vec(len)
}

fn read_string(s: &mut ByteCursor) -> Result<String> {
    let len = s.read_u32_le()? as usize;
    s.read_utf16(len)
}
