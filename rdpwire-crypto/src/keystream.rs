//! RC4 keystream.
//!
//! Standard security keys it with 8-byte (40/56-bit) or 16-byte (128-bit)
//! session keys and runs one keystream per direction for the whole
//! connection, so the state is kept between calls.

/// An RC4 keystream.
#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i:     u8,
    j:     u8,
}

impl Rc4 {
    /// Key a fresh keystream. `key` must be 1 to 256 bytes long.
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty() && key.len() <= 256, "unsupported rc4 key length {}", key.len());
        let mut state = [0u8; 256];
        for (n, slot) in state.iter_mut().enumerate() {
            *slot = n as u8;
        }
        let mut j = 0u8;
        for n in 0..256 {
            j = j.wrapping_add(state[n]).wrapping_add(key[n % key.len()]);
            state.swap(n, usize::from(j));
        }
        Self { state, i: 0, j: 0 }
    }

    /// XOR the next `data.len()` keystream bytes into `data`.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[usize::from(self.i)]);
            self.state.swap(usize::from(self.i), usize::from(self.j));
            let k = self.state[usize::from(self.i)].wrapping_add(self.state[usize::from(self.j)]);
            *byte ^= self.state[usize::from(k)];
        }
    }
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rc4(..)")
    }
}
