//! Fast-path output: compact update framing with optional fragmentation.

use rdpwire_proto::{ByteCursor, Result};

use crate::collaborators::{Decompressor, SystemPointer, expand_into_cursor};
use crate::state::ConnectionState;
use crate::updates::{self, PointerUpdate, Update};

// ─── Update codes ─────────────────────────────────────────────────────────────

const FP_ORDERS:      u8 = 0x0;
const FP_BITMAP:      u8 = 0x1;
const FP_PALETTE:     u8 = 0x2;
const FP_SYNCHRONIZE: u8 = 0x3;
const FP_PTR_NULL:    u8 = 0x5;
const FP_PTR_DEFAULT: u8 = 0x6;
const FP_PTR_POSITION: u8 = 0x8;
const FP_COLOR:       u8 = 0x9;
const FP_CACHED:      u8 = 0xa;
const FP_POINTER:     u8 = 0xb;

// fragmentation
const FRAG_SINGLE: u8 = 0;
const FRAG_FIRST:  u8 = 2;
const FRAG_NEXT:   u8 = 3;

const FP_COMPRESSION_USED: u8 = 0x2;

/// Largest reassembled update; matches the advertised multifragment size.
pub const MAX_REASSEMBLED: usize = 65535;

/// Decode every update in one fast-path output PDU.
///
/// Fragments are buffered in `state` until their last piece arrives, so a
/// PDU may yield nothing.
pub fn decode_fastpath(
    s: &mut ByteCursor,
    state: &mut ConnectionState,
    decompressor: &mut dyn Decompressor,
) -> Result<Vec<Update>> {
    let mut out = Vec::new();
    while !s.at_end() {
        let header = s.read_u8()?;
        let code = header & 0x0f;
        let fragmentation = (header >> 4) & 0x3;
        let compression = if (header >> 6) & FP_COMPRESSION_USED != 0 { s.read_u8()? } else { 0 };
        let size = usize::from(s.read_u16_le()?);
        let raw = s.read_vec(size)?;

        let body = if compression & crate::pdu::PACKET_COMPRESSED != 0 {
            expand_into_cursor(decompressor, &raw, compression)?
        } else {
            ByteCursor::from_vec(raw)
        };

        let complete = match fragmentation {
            FRAG_SINGLE => body,
            FRAG_FIRST => {
                state.fragments.clear();
                append_fragment(&mut state.fragments, &body)?;
                continue;
            }
            // FRAG_NEXT or FRAG_LAST
            _ => {
                if state.fragments.is_empty() {
                    return Err(body.protocol_error(format!("fast-path fragment {fragmentation} without a first")));
                }
                append_fragment(&mut state.fragments, &body)?;
                if fragmentation == FRAG_NEXT {
                    continue;
                }
                ByteCursor::from_vec(std::mem::take(&mut state.fragments))
            }
        };

        if let Some(update) = decode_update(code, complete)? {
            out.push(update);
        }
    }
    Ok(out)
}

fn append_fragment(buf: &mut Vec<u8>, body: &ByteCursor) -> Result<()> {
    if buf.len() + body.remaining() > MAX_REASSEMBLED {
        return Err(body.protocol_error(format!(
            "reassembled fast-path update exceeds {MAX_REASSEMBLED} bytes"
        )));
    }
    buf.extend_from_slice(body.rest());
    Ok(())
}

fn decode_update(code: u8, mut s: ByteCursor) -> Result<Option<Update>> {
    let update = match code {
        FP_ORDERS => {
            let count = s.read_u16_le()?;
            let data = s.read_vec(s.remaining())?;
            Update::Orders { count, data: ByteCursor::from_vec(data) }
        }
        FP_BITMAP => {
            s.skip(2)?; // update type
            Update::Bitmaps(updates::decode_bitmaps(&mut s)?)
        }
        FP_PALETTE => {
            s.skip(2)?;
            Update::Palette(updates::decode_palette(&mut s)?)
        }
        FP_SYNCHRONIZE => Update::Synchronize,
        FP_PTR_NULL => Update::Pointer(PointerUpdate::System(SystemPointer::Hidden)),
        FP_PTR_DEFAULT => Update::Pointer(PointerUpdate::System(SystemPointer::Default)),
        FP_PTR_POSITION => {
            let x = s.read_u16_le()?;
            let y = s.read_u16_le()?;
            Update::Pointer(PointerUpdate::Move { x, y })
        }
        FP_COLOR => Update::Pointer(PointerUpdate::Shape(updates::decode_pointer_shape(&mut s, 24)?)),
        FP_CACHED => Update::Pointer(PointerUpdate::Cached(s.read_u16_le()?)),
        FP_POINTER => {
            let xor_bpp = s.read_u16_le()?;
            Update::Pointer(PointerUpdate::Shape(updates::decode_pointer_shape(&mut s, xor_bpp)?))
        }
        other => {
            tracing::debug!("unhandled fast-path update code {other:#x}");
            return Ok(None);
        }
    };
    Ok(Some(update))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoDecompression;
    use crate::state::RdpVersion;

    fn frame(parts: &[(u8, &[u8])]) -> ByteCursor {
        let mut v = Vec::new();
        for (header, body) in parts {
            v.push(*header);
            v.extend_from_slice(&(body.len() as u16).to_le_bytes());
            v.extend_from_slice(body);
        }
        ByteCursor::from_vec(v)
    }

    fn state() -> ConnectionState {
        ConnectionState::new(RdpVersion::V5, 800, 600, 16)
    }

    #[test]
    fn several_updates_in_one_pdu() {
        let mut s = frame(&[
            (FP_SYNCHRONIZE, &[]),
            (FP_PTR_POSITION, &[5, 0, 6, 0]),
            (FP_PTR_NULL, &[]),
        ]);
        let out = decode_fastpath(&mut s, &mut state(), &mut NoDecompression).unwrap();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[1], Update::Pointer(PointerUpdate::Move { x: 5, y: 6 })));
        assert!(matches!(out[2], Update::Pointer(PointerUpdate::System(SystemPointer::Hidden))));
    }

    #[test]
    fn fragments_reassemble_across_pdus() {
        let mut st = state();
        let first = FP_PTR_POSITION | (FRAG_FIRST << 4);
        let last = FP_PTR_POSITION | (1 << 4);
        let mut s = frame(&[(first, &[1, 0])]);
        assert!(decode_fastpath(&mut s, &mut st, &mut NoDecompression).unwrap().is_empty());
        let mut s = frame(&[(last, &[2, 0])]);
        let out = decode_fastpath(&mut s, &mut st, &mut NoDecompression).unwrap();
        assert!(matches!(out[0], Update::Pointer(PointerUpdate::Move { x: 1, y: 2 })));
        assert!(st.fragments.is_empty());
    }

    #[test]
    fn orphan_fragment_is_violation() {
        let mut s = frame(&[(FP_ORDERS | (FRAG_NEXT << 4), &[0, 0])]);
        let err = decode_fastpath(&mut s, &mut state(), &mut NoDecompression).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn compressed_update_without_decompressor_fails() {
        let mut s = ByteCursor::from_vec(vec![0x80 | FP_SYNCHRONIZE, 0x21, 1, 0, 0xff]);
        assert!(decode_fastpath(&mut s, &mut state(), &mut NoDecompression).is_err());
    }
}
