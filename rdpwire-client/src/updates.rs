//! Screen, palette and pointer updates.
//!
//! Both the slow-path update/pointer PDUs and the fast-path output codes
//! decode into [`Update`], which [`apply`] hands to the collaborators.

use rdpwire_proto::{ByteCursor, Result};

use crate::collaborators::{BitmapUpdate, Display, OrderHandler, PointerShape, Rgb, SystemPointer};
use crate::pdu::{UPDATE_BITMAP, UPDATE_ORDERS, UPDATE_PALETTE, UPDATE_SYNCHRONIZE};

// ─── Pointer message types ────────────────────────────────────────────────────

const PTR_MSG_SYSTEM: u16 = 1;
const PTR_MSG_MOVE:   u16 = 3;
const PTR_MSG_COLOR:  u16 = 6;
const PTR_MSG_CACHED: u16 = 7;
const PTR_MSG_NEW:    u16 = 8;

const SYSPTR_NULL:    u32 = 0;
const SYSPTR_DEFAULT: u32 = 0x7f00;

const BITMAP_COMPRESSION:        u16 = 0x0001;
const NO_BITMAP_COMPRESSION_HDR: u16 = 0x0400;

const MAX_PALETTE: u16 = 256;

// ─── Decoded updates ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum PointerUpdate {
    Move { x: u16, y: u16 },
    Shape(PointerShape),
    Cached(u16),
    System(SystemPointer),
}

#[derive(Debug)]
pub enum Update {
    /// A drawing-order batch, still encoded.
    Orders { count: u16, data: ByteCursor },
    Bitmaps(Vec<BitmapUpdate>),
    Palette(Vec<Rgb>),
    Synchronize,
    Pointer(PointerUpdate),
}

/// Hand a decoded update to the display and order collaborators.
pub fn apply(update: Update, display: &mut dyn Display, orders: &mut dyn OrderHandler) -> Result<()> {
    match update {
        Update::Orders { count, mut data } => {
            display.begin_update();
            let res = orders.process(&mut data, count);
            display.end_update();
            res?;
        }
        Update::Bitmaps(rects) => {
            display.begin_update();
            for rect in rects {
                display.paint_bitmap(rect);
            }
            display.end_update();
        }
        Update::Palette(colours) => display.set_palette(&colours),
        Update::Synchronize => {}
        Update::Pointer(PointerUpdate::Move { x, y }) => display.move_pointer(x, y),
        Update::Pointer(PointerUpdate::Shape(shape)) => display.set_pointer(shape),
        Update::Pointer(PointerUpdate::Cached(index)) => display.use_cached_pointer(index),
        Update::Pointer(PointerUpdate::System(p)) => display.set_system_pointer(p),
    }
    Ok(())
}

// ─── Slow path ────────────────────────────────────────────────────────────────

/// Decode the body of an update data PDU. `None` for update types this
/// client does not handle.
pub fn decode_update_pdu(s: &mut ByteCursor) -> Result<Option<Update>> {
    let update_type = s.read_u16_le()?;
    let update = match update_type {
        UPDATE_ORDERS => {
            s.skip(2)?;
            let count = s.read_u16_le()?;
            s.skip(2)?;
            let data = s.read_vec(s.remaining())?;
            Update::Orders { count, data: ByteCursor::from_vec(data) }
        }
        UPDATE_BITMAP => Update::Bitmaps(decode_bitmaps(s)?),
        UPDATE_PALETTE => Update::Palette(decode_palette(s)?),
        UPDATE_SYNCHRONIZE => Update::Synchronize,
        other => {
            tracing::debug!("unhandled update type {other}");
            return Ok(None);
        }
    };
    Ok(Some(update))
}

/// Decode the body of a pointer data PDU.
pub fn decode_pointer_pdu(s: &mut ByteCursor) -> Result<Option<Update>> {
    let message_type = s.read_u16_le()?;
    s.skip(2)?;
    let pointer = match message_type {
        PTR_MSG_MOVE => {
            let x = s.read_u16_le()?;
            let y = s.read_u16_le()?;
            PointerUpdate::Move { x, y }
        }
        PTR_MSG_COLOR => PointerUpdate::Shape(decode_pointer_shape(s, 24)?),
        PTR_MSG_NEW => {
            let xor_bpp = s.read_u16_le()?;
            PointerUpdate::Shape(decode_pointer_shape(s, xor_bpp)?)
        }
        PTR_MSG_CACHED => PointerUpdate::Cached(s.read_u16_le()?),
        PTR_MSG_SYSTEM => match decode_system_pointer(s.read_u32_le()?) {
            Some(p) => PointerUpdate::System(p),
            None => return Ok(None),
        },
        other => {
            tracing::debug!("unhandled pointer message {other}");
            return Ok(None);
        }
    };
    Ok(Some(Update::Pointer(pointer)))
}

pub(crate) fn decode_system_pointer(kind: u32) -> Option<SystemPointer> {
    match kind {
        SYSPTR_NULL => Some(SystemPointer::Hidden),
        SYSPTR_DEFAULT => Some(SystemPointer::Default),
        other => {
            tracing::warn!("unknown system pointer {other:#x}");
            None
        }
    }
}

// ─── Shared bodies ────────────────────────────────────────────────────────────

/// A `TS_UPDATE_BITMAP_DATA` body: rectangle count then rectangles.
pub fn decode_bitmaps(s: &mut ByteCursor) -> Result<Vec<BitmapUpdate>> {
    let count = s.read_u16_le()?;
    let mut out = Vec::with_capacity(usize::from(count).min(64));
    for _ in 0..count {
        out.push(decode_bitmap_rect(s)?);
    }
    Ok(out)
}

fn decode_bitmap_rect(s: &mut ByteCursor) -> Result<BitmapUpdate> {
    let left = s.read_u16_le()?;
    let top = s.read_u16_le()?;
    let right = s.read_u16_le()?;
    let bottom = s.read_u16_le()?;
    let width = s.read_u16_le()?;
    let height = s.read_u16_le()?;
    let bpp = s.read_u16_le()?;
    let compress = s.read_u16_le()?;
    let bufsize = s.read_u16_le()?;

    let (Some(cx), Some(cy)) = (
        right.checked_sub(left).and_then(|d| d.checked_add(1)),
        bottom.checked_sub(top).and_then(|d| d.checked_add(1)),
    ) else {
        return Err(s.protocol_error(format!(
            "bitmap bounds ({left},{top})-({right},{bottom}) are inverted"
        )));
    };

    let bytes_pp = usize::from(bpp.div_ceil(8));
    if bytes_pp == 0 || width == 0 || height == 0 {
        return Err(s.protocol_error(format!("bitmap {width}x{height} at {bpp} bpp")));
    }
    let row = usize::from(width) * bytes_pp;
    let size = row
        .checked_mul(usize::from(height))
        .filter(|&n| n <= u32::MAX as usize)
        .ok_or_else(|| s.protocol_error(format!("bitmap {width}x{height} at {bpp} bpp overflows")))?;

    if compress & BITMAP_COMPRESSION == 0 {
        if !s.bytes_available(size) {
            return Err(s.protocol_error(format!(
                "uncompressed bitmap needs {size} bytes, {} remain",
                s.remaining()
            )));
        }
        // Rows arrive bottom-up.
        let mut data = vec![0u8; size];
        for y in (0..usize::from(height)).rev() {
            data[y * row..(y + 1) * row].copy_from_slice(s.read_bytes(row)?);
        }
        return Ok(BitmapUpdate { left, top, cx, cy, width, height, bpp, compressed: false, data });
    }

    let size = if compress & NO_BITMAP_COMPRESSION_HDR != 0 {
        bufsize
    } else {
        s.skip(2)?; // pad
        let size = s.read_u16_le()?;
        s.skip(4)?; // row size, final size
        size
    };
    let data = s.read_vec(usize::from(size))?;
    Ok(BitmapUpdate { left, top, cx, cy, width, height, bpp, compressed: true, data })
}

/// A palette body after its leading pad or update type.
pub fn decode_palette(s: &mut ByteCursor) -> Result<Vec<Rgb>> {
    s.skip(2)?;
    let count = s.read_u16_le()?;
    s.skip(2)?;
    if count > MAX_PALETTE {
        return Err(s.protocol_error(format!("palette of {count} colours")));
    }
    let mut colours = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let [red, green, blue] = s.read_array()?;
        colours.push(Rgb { red, green, blue });
    }
    Ok(colours)
}

/// The colour-pointer body shared by the colour and new-pointer messages.
pub fn decode_pointer_shape(s: &mut ByteCursor, xor_bpp: u16) -> Result<PointerShape> {
    let cache_index = s.read_u16_le()?;
    let x = s.read_u16_le()?;
    let y = s.read_u16_le()?;
    let width = s.read_u16_le()?;
    let height = s.read_u16_le()?;
    let mask_len = s.read_u16_le()?;
    let data_len = s.read_u16_le()?;
    let xor_data = s.read_vec(usize::from(data_len))?;
    let and_mask = s.read_vec(usize::from(mask_len))?;
    if width != 32 || height != 32 {
        tracing::debug!("pointer {cache_index} is {width}x{height}");
    }
    Ok(PointerShape {
        cache_index,
        x: x.min(width.saturating_sub(1)),
        y: y.min(height.saturating_sub(1)),
        width,
        height,
        xor_bpp,
        and_mask,
        xor_data,
    })
}
