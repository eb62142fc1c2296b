//! [`ByteCursor`]: the bounds-checked buffer every layer encodes into and
//! decodes from.
//!
//! Invariant: `0 ≤ pos ≤ end ≤ capacity`.
//!
//! Reads are bounded by `end` (network-derived) and fail with a protocol
//! violation. Writes are bounded by `capacity` (chosen by the writer) and
//! overrunning it is a programming error, so it panics.

use crate::error::{Error, Result};

// ─── Mark ────────────────────────────────────────────────────────────────────

/// Named offsets used to reserve a layer header and backpatch it once the
/// body is complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mark {
    Transport,
    Session,
    Security,
    Application,
    Channel,
}

impl Mark {
    fn index(self) -> usize {
        match self {
            Self::Transport   => 0,
            Self::Session     => 1,
            Self::Security    => 2,
            Self::Application => 3,
            Self::Channel     => 4,
        }
    }
}

// ─── ByteCursor ──────────────────────────────────────────────────────────────

/// A growable byte buffer with a read/write position and an end-of-data
/// marker.
///
/// Marks are plain indices, so they stay valid across
/// [`ByteCursor::ensure_capacity`]. Borrowed slices returned by the read
/// methods cannot outlive the next mutation.
#[derive(Clone, Debug, Default)]
pub struct ByteCursor {
    buf:   Vec<u8>,
    pos:   usize,
    end:   usize,
    marks: [usize; 5],
}

impl ByteCursor {
    /// A zero-filled writing cursor of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: vec![0; capacity], pos: 0, end: capacity, marks: [0; 5] }
    }

    /// Take ownership of received bytes for reading.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        let end = buf.len();
        Self { buf, pos: 0, end, marks: [0; 5] }
    }

    /// Grow to at least `capacity` bytes. Marks and position are kept.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.buf.len() {
            self.buf.resize(capacity, 0);
        }
    }

    /// Rewind position and end to the start, keeping the allocation.
    pub fn reset(&mut self) {
        self.buf.fill(0);
        self.pos = 0;
        self.end = self.buf.len();
        self.marks = [0; 5];
    }

    pub fn capacity(&self) -> usize { self.buf.len() }
    pub fn position(&self) -> usize { self.pos }
    pub fn end(&self) -> usize { self.end }

    /// Bytes between position and end.
    pub fn remaining(&self) -> usize { self.end - self.pos }

    /// Whether `n` more bytes can be read.
    pub fn bytes_available(&self, n: usize) -> bool { n <= self.remaining() }

    pub fn at_end(&self) -> bool { self.pos == self.end }

    /// Move the position. Seeking past `end` is a programming error.
    pub fn seek(&mut self, pos: usize) {
        assert!(pos <= self.end, "ByteCursor::seek({pos}) past end {}", self.end);
        self.pos = pos;
    }

    /// Truncate the valid data at the current position.
    pub fn mark_end(&mut self) {
        self.end = self.pos;
    }

    /// Shrink `end` to `pos + len`, e.g. after reading a declared length.
    pub fn limit(&mut self, len: usize) -> Result<()> {
        self.check_read(len, "declared length")?;
        self.end = self.pos + len;
        Ok(())
    }

    pub fn set_mark(&mut self, mark: Mark) {
        self.marks[mark.index()] = self.pos;
    }

    pub fn mark(&self, mark: Mark) -> usize {
        self.marks[mark.index()]
    }

    /// Seek back to a previously set mark.
    pub fn recall(&mut self, mark: Mark) {
        let at = self.mark(mark);
        self.seek(at);
    }

    /// All valid bytes, `0..end`.
    pub fn data(&self) -> &[u8] { &self.buf[..self.end] }

    /// Unread bytes, `pos..end`.
    pub fn rest(&self) -> &[u8] { &self.buf[self.pos..self.end] }

    /// Unread bytes, mutably (in-place decryption).
    pub fn rest_mut(&mut self) -> &mut [u8] { &mut self.buf[self.pos..self.end] }

    /// Valid bytes from `from` to `end`, mutably.
    pub fn span_mut(&mut self, from: usize) -> &mut [u8] { &mut self.buf[from..self.end] }

    /// Drop the cursor, returning the valid bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.truncate(self.end);
        self.buf
    }

    /// A protocol violation carrying a dump of this buffer.
    pub fn protocol_error(&self, context: impl Into<String>) -> Error {
        Error::protocol_with(context, self.data())
    }

    // ── bounds ───────────────────────────────────────────────────────────────

    fn check_read(&self, n: usize, what: &str) -> Result<()> {
        if n > self.remaining() {
            return Err(self.protocol_error(format!(
                "{what}: need {n} bytes at offset {}, only {} remain",
                self.pos,
                self.remaining(),
            )));
        }
        Ok(())
    }

    fn check_write(&mut self, n: usize) {
        if n > self.buf.len() - self.pos {
            panic!(
                "ByteCursor overflow: writing {n} bytes at {} with capacity {}",
                self.pos,
                self.buf.len(),
            );
        }
        if self.pos + n > self.end {
            self.end = self.pos + n;
        }
    }

    // ── reads ────────────────────────────────────────────────────────────────

    /// Borrow the next `n` bytes and advance past them.
    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        self.check_read(n, "read")?;
        let at = self.pos;
        self.pos += n;
        Ok(&self.buf[at..at + n])
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.read_bytes(n)?.to_vec())
    }

    /// Advance without reading.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.check_read(n, "skip")?;
        self.pos += n;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> { Ok(self.read_array::<1>()?[0]) }
    pub fn read_u16_le(&mut self) -> Result<u16> { Ok(u16::from_le_bytes(self.read_array()?)) }
    pub fn read_u16_be(&mut self) -> Result<u16> { Ok(u16::from_be_bytes(self.read_array()?)) }
    pub fn read_u32_le(&mut self) -> Result<u32> { Ok(u32::from_le_bytes(self.read_array()?)) }
    pub fn read_u32_be(&mut self) -> Result<u32> { Ok(u32::from_be_bytes(self.read_array()?)) }
    pub fn read_u64_le(&mut self) -> Result<u64> { Ok(u64::from_le_bytes(self.read_array()?)) }
    pub fn read_u64_be(&mut self) -> Result<u64> { Ok(u64::from_be_bytes(self.read_array()?)) }

    /// Read a UTF-16LE string of `len` bytes, dropping any trailing NULs.
    pub fn read_utf16(&mut self, len: usize) -> Result<String> {
        let raw = self.read_bytes(len)?;
        let units: Vec<u16> = raw.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        let s = String::from_utf16_lossy(&units);
        Ok(s.trim_end_matches('\0').to_owned())
    }

    // ── writes ───────────────────────────────────────────────────────────────

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.check_write(data.len());
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    /// Write `n` zero bytes (also used to reserve header space).
    pub fn write_zeros(&mut self, n: usize) {
        self.check_write(n);
        self.buf[self.pos..self.pos + n].fill(0);
        self.pos += n;
    }

    pub fn write_u8(&mut self, v: u8) { self.write_bytes(&[v]) }
    pub fn write_u16_le(&mut self, v: u16) { self.write_bytes(&v.to_le_bytes()) }
    pub fn write_u16_be(&mut self, v: u16) { self.write_bytes(&v.to_be_bytes()) }
    pub fn write_u32_le(&mut self, v: u32) { self.write_bytes(&v.to_le_bytes()) }
    pub fn write_u32_be(&mut self, v: u32) { self.write_bytes(&v.to_be_bytes()) }
    pub fn write_u64_le(&mut self, v: u64) { self.write_bytes(&v.to_le_bytes()) }
    pub fn write_u64_be(&mut self, v: u64) { self.write_bytes(&v.to_be_bytes()) }

    /// Write `s` as UTF-16LE without a terminator; returns the byte length.
    pub fn write_utf16(&mut self, s: &str) -> usize {
        let start = self.pos;
        for unit in s.encode_utf16() {
            self.write_u16_le(unit);
        }
        self.pos - start
    }
}

/// Byte length of `s` encoded as UTF-16LE.
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_capacity_write_succeeds() {
        for n in [0usize, 1, 7, 64] {
            let mut s = ByteCursor::with_capacity(n);
            s.write_bytes(&vec![0xAB; n]);
            assert_eq!(s.position(), n);
        }
    }

    #[test]
    #[should_panic(expected = "ByteCursor overflow")]
    fn write_past_capacity_panics() {
        let mut s = ByteCursor::with_capacity(3);
        s.write_u32_le(1);
    }

    #[test]
    fn read_past_end_is_protocol_violation() {
        for n in [1usize, 2, 9] {
            let mut s = ByteCursor::from_vec(vec![0; n - 1]);
            let err = s.read_bytes(n).unwrap_err();
            assert!(err.is_protocol_violation());
            assert_eq!(s.position(), 0, "failed read must not advance");
        }
    }

    #[test]
    fn reading_exactly_remaining_lands_at_end() {
        let mut s = ByteCursor::from_vec(vec![1, 2, 3, 4, 5]);
        s.skip(1).unwrap();
        assert_eq!(s.read_bytes(4).unwrap(), &[2, 3, 4, 5]);
        assert!(s.at_end());
        assert!(s.read_u8().is_err());
    }

    #[test]
    fn endianness() {
        let mut s = ByteCursor::with_capacity(12);
        s.write_u16_be(0x0102);
        s.write_u16_le(0x0102);
        s.write_u64_le(0x0807_0605_0403_0201);
        s.mark_end();
        assert_eq!(s.data(), &[1, 2, 2, 1, 1, 2, 3, 4, 5, 6, 7, 8]);
        s.seek(0);
        assert_eq!(s.read_u16_be().unwrap(), 0x0102);
        assert_eq!(s.read_u16_le().unwrap(), 0x0102);
        assert_eq!(s.read_u64_le().unwrap(), 0x0807_0605_0403_0201);
    }

    #[test]
    fn marks_backpatch_header() {
        let mut s = ByteCursor::with_capacity(16);
        s.set_mark(Mark::Session);
        s.write_zeros(2);
        s.write_bytes(b"body");
        s.mark_end();
        let len = (s.end() - s.mark(Mark::Session) - 2) as u16;
        s.recall(Mark::Session);
        s.write_u16_le(len);
        assert_eq!(s.data(), &[4, 0, b'b', b'o', b'd', b'y']);
    }

    #[test]
    fn marks_survive_growth() {
        let mut s = ByteCursor::with_capacity(4);
        s.write_zeros(2);
        s.set_mark(Mark::Security);
        s.ensure_capacity(1024);
        assert_eq!(s.mark(Mark::Security), 2);
        assert_eq!(s.capacity(), 1024);
        s.write_bytes(&[9; 100]);
    }

    #[test]
    fn limit_rejects_overlong_declared_length() {
        let mut s = ByteCursor::from_vec(vec![0; 8]);
        assert!(s.limit(9).is_err());
        s.limit(4).unwrap();
        assert_eq!(s.remaining(), 4);
    }

    #[test]
    fn reset_rewinds() {
        let mut s = ByteCursor::with_capacity(8);
        s.write_u32_le(7);
        s.reset();
        assert_eq!(s.position(), 0);
        assert_eq!(s.capacity(), 8);
        assert_eq!(s.read_u32_le().unwrap(), 0);
    }

    #[test]
    fn utf16_roundtrip() {
        let mut s = ByteCursor::with_capacity(32);
        let n = s.write_utf16("user");
        s.write_u16_le(0);
        s.mark_end();
        s.seek(0);
        assert_eq!(n, utf16_len("user"));
        assert_eq!(s.read_utf16(n + 2).unwrap(), "user");
    }
}
