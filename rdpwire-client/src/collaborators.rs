//! Interfaces to everything outside the protocol core: the display surface,
//! drawing-order decoding, the persistent bitmap cache and bulk
//! decompression.
//!
//! Each trait has a do-nothing implementation so a headless client works
//! out of the box.

use rdpwire_proto::{ByteCursor, Result};

// ─── Display ──────────────────────────────────────────────────────────────────

/// One palette entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rgb {
    pub red:   u8,
    pub green: u8,
    pub blue:  u8,
}

/// A screen-update rectangle and its pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitmapUpdate {
    pub left:       u16,
    pub top:        u16,
    /// Visible size, from the inclusive right/bottom bounds.
    pub cx:         u16,
    pub cy:         u16,
    /// Size of the pixel data.
    pub width:      u16,
    pub height:     u16,
    pub bpp:        u16,
    /// Uncompressed rows are already top-down. Compressed data is the raw
    /// interleaved-RLE stream.
    pub compressed: bool,
    pub data:       Vec<u8>,
}

/// A pointer shape to cache and show.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointerShape {
    pub cache_index: u16,
    /// Hot spot, clamped into the bitmap.
    pub x:           u16,
    pub y:           u16,
    pub width:       u16,
    pub height:      u16,
    pub xor_bpp:     u16,
    pub and_mask:    Vec<u8>,
    pub xor_data:    Vec<u8>,
}

/// The built-in pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemPointer {
    Hidden,
    Default,
}

/// Rendering and pointer surface.
pub trait Display {
    fn resize(&mut self, _width: u16, _height: u16, _bpp: u16) {}
    fn begin_update(&mut self) {}
    fn end_update(&mut self) {}
    fn paint_bitmap(&mut self, _update: BitmapUpdate) {}
    fn set_palette(&mut self, _colours: &[Rgb]) {}
    /// Cache and show a new pointer.
    fn set_pointer(&mut self, _shape: PointerShape) {}
    /// Show a previously cached pointer.
    fn use_cached_pointer(&mut self, _cache_index: u16) {}
    fn set_system_pointer(&mut self, _pointer: SystemPointer) {}
    fn move_pointer(&mut self, _x: u16, _y: u16) {}
    fn bell(&mut self) {}
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct Headless;

impl Display for Headless {}

// ─── Orders ───────────────────────────────────────────────────────────────────

/// Decodes drawing-order batches.
pub trait OrderHandler {
    /// Consume `count` orders from `s`.
    fn process(&mut self, s: &mut ByteCursor, count: u16) -> Result<()>;
}

/// Skips order batches. Only valid while order support is not advertised.
#[derive(Debug, Default)]
pub struct IgnoreOrders;

impl OrderHandler for IgnoreOrders {
    fn process(&mut self, s: &mut ByteCursor, count: u16) -> Result<()> {
        tracing::debug!("ignoring {count} drawing orders ({} bytes)", s.remaining());
        s.seek(s.end());
        Ok(())
    }
}

// ─── Persistent cache ─────────────────────────────────────────────────────────

/// Bitmap keys persisted across sessions.
pub trait PersistentCache {
    /// All 8-byte keys stored for cache `level`.
    fn enumerate(&mut self, level: u8) -> Vec<[u8; 8]>;
}

/// A cache with nothing in it.
#[derive(Debug, Default)]
pub struct NoPersistentCache;

impl PersistentCache for NoPersistentCache {
    fn enumerate(&mut self, _level: u8) -> Vec<[u8; 8]> { Vec::new() }
}

// ─── Decompression ────────────────────────────────────────────────────────────

/// Bulk (MPPC-style) decompressor with a rolling history buffer.
pub trait Decompressor {
    /// Expand `data` compressed with `flags` into the history, returning
    /// where the output landed as `(offset, length)`.
    fn expand(&mut self, data: &[u8], flags: u8) -> Result<(usize, usize)>;
    fn history(&self) -> &[u8];
}

/// Rejects compressed input; pairs with a client that never advertises
/// bulk compression.
#[derive(Debug, Default)]
pub struct NoDecompression;

impl Decompressor for NoDecompression {
    fn expand(&mut self, data: &[u8], flags: u8) -> Result<(usize, usize)> {
        Err(rdpwire_proto::Error::protocol_with(
            format!("compressed data (flags {flags:#04x}) but compression was not negotiated"),
            data,
        ))
    }
    fn history(&self) -> &[u8] { &[] }
}

/// Copy the expanded bytes out of the history into a fresh cursor.
pub(crate) fn expand_into_cursor(
    decompressor: &mut dyn Decompressor,
    data: &[u8],
    flags: u8,
) -> Result<ByteCursor> {
    let (offset, len) = decompressor.expand(data, flags)?;
    let history = decompressor.history();
    let out = history
        .get(offset..offset.saturating_add(len))
        .ok_or_else(|| rdpwire_proto::Error::protocol(format!(
            "decompressor returned {offset}+{len} outside its {}-byte history",
            history.len()
        )))?;
    Ok(ByteCursor::from_vec(out.to_vec()))
}
