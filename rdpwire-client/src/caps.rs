//! Capability sets: the client's confirm-active list and the bits of the
//! server's demand-active list that change client behaviour.

use rdpwire_proto::{ByteCursor, Result};

use crate::state::RdpVersion;

// ─── Capability set types ─────────────────────────────────────────────────────

const CAPSET_GENERAL:        u16 = 1;
const CAPSET_BITMAP:         u16 = 2;
const CAPSET_ORDER:          u16 = 3;
const CAPSET_BITMAPCACHE:    u16 = 4;
const CAPSET_CONTROL:        u16 = 5;
const CAPSET_ACTIVATION:     u16 = 7;
const CAPSET_POINTER:        u16 = 8;
const CAPSET_SHARE:          u16 = 9;
const CAPSET_COLORCACHE:     u16 = 10;
const CAPSET_SOUND:          u16 = 12;
const CAPSET_INPUT:          u16 = 13;
const CAPSET_FONT:           u16 = 14;
const CAPSET_BRUSH:          u16 = 15;
const CAPSET_GLYPHCACHE:     u16 = 16;
const CAPSET_BITMAPCACHE_REV2: u16 = 19;
const CAPSET_MULTIFRAGMENTUPDATE: u16 = 26;
const CAPSET_LARGE_POINTER:  u16 = 27;

const LEN_GENERAL:     usize = 24;
const LEN_BITMAP:      usize = 28;
const LEN_ORDER:       usize = 88;
const LEN_BMPCACHE:    usize = 40;
const LEN_BMPCACHE2:   usize = 40;
const LEN_COLCACHE:    usize = 8;
const LEN_ACTIVATE:    usize = 12;
const LEN_CONTROL:     usize = 12;
const LEN_SHARE:       usize = 8;
const LEN_BRUSHCACHE:  usize = 8;
const LEN_INPUT:       usize = 88;
const LEN_SOUND:       usize = 8;
const LEN_FONT:        usize = 8;
const LEN_GLYPHCACHE:  usize = 52;
const LEN_MULTIFRAG:   usize = 8;
const LEN_LARGE_POINTER: usize = 6;

/// Number of capability sets in the confirm-active PDU.
pub const CLIENT_CAPSET_COUNT: u16 = 15;

// general extra flags
const FASTPATH_OUTPUT_SUPPORTED:  u16 = 0x0001;
const LONG_CREDENTIALS_SUPPORTED: u16 = 0x0004;
const AUTORECONNECT_SUPPORTED:    u16 = 0x0008;
const NO_BITMAP_COMPRESSION_HDR:  u16 = 0x0400;

// order flags
const NEGOTIATEORDERSUPPORT:   u16 = 0x0002;
const ZEROBOUNDSDELTASSUPPORT: u16 = 0x0008;
const COLORINDEXSUPPORT:       u16 = 0x0020;

const BMPCACHE2_C0_CELLS:    u32 = 0x78;
const BMPCACHE2_C1_CELLS:    u32 = 0x78;
const BMPCACHE2_C2_CELLS:    u32 = 0x150;
const BMPCACHE2_NUM_PSTCELLS: u32 = 0x9f6;
const BMPCACHE2_FLAG_PERSIST: u32 = 1 << 31;

const INPUT_FLAG_SCANCODES: u16 = 0x0001;
const INPUT_FLAG_MOUSEX:    u16 = 0x0004;

/// Drawing orders advertised when order support is on: dstblt, patblt,
/// scrblt, memblt, triblt, line, rect, desksave, polyline, polygon,
/// ellipse and glyph index.
const SUPPORTED_ORDERS: [usize; 14] = [0, 1, 2, 3, 4, 8, 9, 10, 11, 20, 22, 24, 25, 27];

// ─── Client side ──────────────────────────────────────────────────────────────

/// What the client announces.
#[derive(Clone, Debug)]
pub struct ClientCaps {
    pub version:          RdpVersion,
    pub width:            u16,
    pub height:           u16,
    pub bpp:              u16,
    pub keyboard_layout:  u32,
    pub orders:           bool,
    pub persistent_cache: bool,
}

impl ClientCaps {
    /// Byte length of the combined capability sets.
    pub fn len(&self) -> usize {
        let cache = if self.version >= RdpVersion::V5 { LEN_BMPCACHE2 } else { LEN_BMPCACHE };
        LEN_GENERAL + LEN_BITMAP + LEN_ORDER + cache + LEN_COLCACHE + LEN_ACTIVATE
            + LEN_CONTROL + LEN_SHARE + LEN_BRUSHCACHE + LEN_INPUT + LEN_SOUND + LEN_FONT
            + LEN_GLYPHCACHE + LEN_MULTIFRAG + LEN_LARGE_POINTER
    }

    /// Write every capability set in confirm-active order.
    pub fn write(&self, s: &mut ByteCursor) {
        self.general(s);
        self.bitmap(s);
        self.order(s);
        if self.version >= RdpVersion::V5 {
            self.bitmap_cache_rev2(s);
        } else {
            self.bitmap_cache(s);
        }
        header(s, CAPSET_COLORCACHE, LEN_COLCACHE);
        s.write_u16_le(6); // cache size
        s.write_u16_le(0);

        header(s, CAPSET_ACTIVATION, LEN_ACTIVATE);
        s.write_zeros(8);

        header(s, CAPSET_CONTROL, LEN_CONTROL);
        s.write_u16_le(0); // control flags
        s.write_u16_le(0); // remote detach
        s.write_u16_le(2); // control interest: never
        s.write_u16_le(2); // detach interest: never

        header(s, CAPSET_SHARE, LEN_SHARE);
        s.write_zeros(4);

        header(s, CAPSET_BRUSH, LEN_BRUSHCACHE);
        s.write_u32_le(1); // BRUSH_COLOR_8x8

        self.input(s);

        header(s, CAPSET_SOUND, LEN_SOUND);
        s.write_u16_le(1); // SOUND_BEEPS_FLAG
        s.write_u16_le(0);

        header(s, CAPSET_FONT, LEN_FONT);
        s.write_u16_le(1); // FONTSUPPORT_FONTLIST
        s.write_u16_le(0);

        glyph_cache(s);

        header(s, CAPSET_MULTIFRAGMENTUPDATE, LEN_MULTIFRAG);
        s.write_u32_le(65535);

        header(s, CAPSET_LARGE_POINTER, LEN_LARGE_POINTER);
        s.write_u16_le(1); // LARGE_POINTER_FLAG_96x96
    }

    fn general(&self, s: &mut ByteCursor) {
        header(s, CAPSET_GENERAL, LEN_GENERAL);
        s.write_u16_le(1);     // OS major: Windows
        s.write_u16_le(3);     // OS minor: NT
        s.write_u16_le(0x200); // protocol version
        s.write_u16_le(0);
        s.write_u16_le(0);     // compression types
        let extra = if self.version >= RdpVersion::V5 {
            FASTPATH_OUTPUT_SUPPORTED | LONG_CREDENTIALS_SUPPORTED | AUTORECONNECT_SUPPORTED
                | NO_BITMAP_COMPRESSION_HDR
        } else {
            0
        };
        s.write_u16_le(extra);
        s.write_u16_le(0);     // update capability
        s.write_u16_le(0);     // remote unshare
        s.write_u16_le(0);     // compression level
        s.write_u8(0);         // refresh rect
        s.write_u8(0);         // suppress output
    }

    fn bitmap(&self, s: &mut ByteCursor) {
        header(s, CAPSET_BITMAP, LEN_BITMAP);
        s.write_u16_le(self.bpp);
        s.write_u16_le(1); // receive 1 bpp
        s.write_u16_le(1); // receive 4 bpp
        s.write_u16_le(1); // receive 8 bpp
        s.write_u16_le(self.width);
        s.write_u16_le(self.height);
        s.write_u16_le(0);
        s.write_u16_le(1); // desktop resize
        s.write_u16_le(1); // bitmap compression
        s.write_u8(0);     // high colour flags
        s.write_u8(0);     // drawing flags
        s.write_u16_le(1); // multiple rectangles
        s.write_u16_le(0);
    }

    fn order(&self, s: &mut ByteCursor) {
        let mut support = [0u8; 32];
        if self.orders {
            for i in SUPPORTED_ORDERS {
                support[i] = 1;
            }
        }
        header(s, CAPSET_ORDER, LEN_ORDER);
        s.write_zeros(16); // terminal descriptor
        s.write_zeros(4);
        s.write_u16_le(1);  // desktop save x granularity
        s.write_u16_le(20); // desktop save y granularity
        s.write_u16_le(0);
        s.write_u16_le(1);  // max order level
        s.write_u16_le(0x147); // number of fonts
        s.write_u16_le(NEGOTIATEORDERSUPPORT | ZEROBOUNDSDELTASSUPPORT | COLORINDEXSUPPORT);
        s.write_bytes(&support);
        s.write_u16_le(0x6a1); // text flags
        s.write_u16_le(0);     // order support ex flags
        s.write_zeros(4);
        s.write_u32_le(0x38400); // desktop save size
        s.write_zeros(4);
        s.write_u16_le(0x4e4); // ANSI code page
        s.write_u16_le(0);
    }

    fn bitmap_cache(&self, s: &mut ByteCursor) {
        let bytes_pp = self.bpp.div_ceil(8);
        header(s, CAPSET_BITMAPCACHE, LEN_BMPCACHE);
        s.write_zeros(24);
        for (entries, cell) in [(0x258, 0x100), (0x12c, 0x400), (0x106, 0x1000)] {
            s.write_u16_le(entries);
            s.write_u16_le(cell * bytes_pp);
        }
    }

    fn bitmap_cache_rev2(&self, s: &mut ByteCursor) {
        header(s, CAPSET_BITMAPCACHE_REV2, LEN_BMPCACHE2);
        s.write_u16_le(if self.persistent_cache { 2 } else { 0 }); // PERSISTENT_KEYS_EXPECTED
        s.write_u16_be(3); // number of caches
        s.write_u32_le(BMPCACHE2_C0_CELLS);
        s.write_u32_le(BMPCACHE2_C1_CELLS);
        if self.persistent_cache {
            s.write_u32_le(BMPCACHE2_NUM_PSTCELLS | BMPCACHE2_FLAG_PERSIST);
        } else {
            s.write_u32_le(BMPCACHE2_C2_CELLS);
        }
        s.write_zeros(20);
    }

    fn input(&self, s: &mut ByteCursor) {
        header(s, CAPSET_INPUT, LEN_INPUT);
        s.write_u16_le(INPUT_FLAG_SCANCODES | INPUT_FLAG_MOUSEX);
        s.write_u16_le(0);
        s.write_u32_le(self.keyboard_layout);
        s.write_u32_le(4);  // keyboard type
        s.write_u32_le(0);  // sub type
        s.write_u32_le(12); // function keys
        s.write_zeros(64);  // IME file name
    }
}

fn header(s: &mut ByteCursor, kind: u16, len: usize) {
    s.write_u16_le(kind);
    s.write_u16_le(len as u16);
}

fn glyph_cache(s: &mut ByteCursor) {
    header(s, CAPSET_GLYPHCACHE, LEN_GLYPHCACHE);
    for (entries, cell) in [
        (254, 4), (254, 4), (254, 8), (254, 8), (254, 16),
        (254, 32), (254, 64), (254, 128), (254, 256), (64, 2048),
    ] {
        s.write_u16_le(entries);
        s.write_u16_le(cell);
    }
    s.write_u32_le(0x0100_0100); // fragment cache
    s.write_u16_le(0x0002);      // GLYPH_SUPPORT_PARTIAL
    s.write_u16_le(0);
}

// ─── Server side ──────────────────────────────────────────────────────────────

/// What the server's capability sets changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerCaps {
    /// The general set carried no extra flags: RDP 4 server.
    pub downgrade: bool,
    /// Desktop size and depth from the bitmap set.
    pub desktop:   Option<(u16, u16, u16)>,
}

/// Walk the server's combined capability sets.
pub fn parse_server_caps(s: &mut ByteCursor, combined_len: usize) -> Result<ServerCaps> {
    if !s.bytes_available(combined_len) {
        return Err(s.protocol_error(format!("capability sets of {combined_len} bytes truncated")));
    }
    let end = s.position() + combined_len;
    let count = s.read_u16_le()?;
    s.skip(2)?;

    let mut caps = ServerCaps::default();
    for _ in 0..count {
        if s.position() + 4 > end {
            break;
        }
        let kind = s.read_u16_le()?;
        let len = usize::from(s.read_u16_le()?);
        if len < 4 || s.position() + len - 4 > end {
            return Err(s.protocol_error(format!("capability set {kind} of length {len}")));
        }
        let next = s.position() + len - 4;
        match kind {
            CAPSET_GENERAL => {
                s.skip(10)?;
                caps.downgrade = s.read_u16_le()? == 0;
            }
            CAPSET_BITMAP => {
                let bpp = s.read_u16_le()?;
                s.skip(6)?;
                let width = s.read_u16_le()?;
                let height = s.read_u16_le()?;
                caps.desktop = Some((width, height, bpp));
            }
            CAPSET_ORDER | CAPSET_POINTER | CAPSET_SHARE | CAPSET_COLORCACHE | CAPSET_INPUT
            | CAPSET_FONT | CAPSET_ACTIVATION | CAPSET_CONTROL | CAPSET_GLYPHCACHE
            | CAPSET_BRUSH | CAPSET_MULTIFRAGMENTUPDATE | CAPSET_LARGE_POINTER => {}
            other => tracing::debug!("unhandled server capability set {other}"),
        }
        s.seek(next);
    }
    s.seek(end);
    Ok(caps)
}
