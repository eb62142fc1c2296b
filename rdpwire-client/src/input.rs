//! Slow-path input events.

use rdpwire_proto::ByteCursor;

const INPUT_EVENT_SYNC:     u16 = 0x0000;
const INPUT_EVENT_SCANCODE: u16 = 0x0004;
const INPUT_EVENT_MOUSE:    u16 = 0x8001;

/// Bytes per event on the wire.
pub const EVENT_LEN: usize = 12;

// keyboard flags
pub const KBD_FLAG_EXTENDED: u16 = 0x0100;
pub const KBD_FLAG_DOWN:     u16 = 0x4000;
pub const KBD_FLAG_RELEASE:  u16 = 0x8000;

// mouse flags
pub const MOUSE_FLAG_MOVE:    u16 = 0x0800;
pub const MOUSE_FLAG_BUTTON1: u16 = 0x1000;
pub const MOUSE_FLAG_BUTTON2: u16 = 0x2000;
pub const MOUSE_FLAG_BUTTON3: u16 = 0x4000;
pub const MOUSE_FLAG_DOWN:    u16 = 0x8000;

// lock keys for `InputEvent::Sync`
pub const SCROLL_LOCK: u16 = 0x0001;
pub const NUM_LOCK:    u16 = 0x0002;
pub const CAPS_LOCK:   u16 = 0x0004;
pub const KANA_LOCK:   u16 = 0x0008;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputEvent {
    /// Lock-key state (`*_LOCK` bits).
    Sync { toggles: u16 },
    Scancode { flags: u16, code: u16 },
    Mouse { flags: u16, x: u16, y: u16 },
}

impl InputEvent {
    /// Append one `TS_INPUT_EVENT` with event time `time`.
    pub fn write(&self, s: &mut ByteCursor, time: u32) {
        let (kind, flags, p1, p2) = match *self {
            Self::Sync { toggles }       => (INPUT_EVENT_SYNC, 0, toggles, 0),
            Self::Scancode { flags, code } => (INPUT_EVENT_SCANCODE, flags, code, 0),
            Self::Mouse { flags, x, y }  => (INPUT_EVENT_MOUSE, flags, x, y),
        };
        s.write_u32_le(time);
        s.write_u16_le(kind);
        s.write_u16_le(flags);
        s.write_u16_le(p1);
        s.write_u16_le(p2);
    }
}

/// Write the input PDU body: count, pad and the events.
pub fn write_input_pdu(s: &mut ByteCursor, events: &[InputEvent], time: u32) {
    s.write_u16_le(events.len() as u16);
    s.write_u16_le(0);
    for event in events {
        event.write(s, time);
    }
}
