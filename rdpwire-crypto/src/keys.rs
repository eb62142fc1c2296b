//! Standard-security key schedule: master secret, session keys, MAC
//! signatures and the periodic key update.

use crate::keystream::Rc4;
use crate::{md5, sha1};

/// Packets one direction may protect before its key is refreshed.
pub const KEY_UPDATE_INTERVAL: u32 = 4096;

/// Length of the MAC carried in every encrypted security header.
pub const SIGNATURE_LEN: usize = 8;

const PAD_54: [u8; 40] = [0x36; 40];
const PAD_92: [u8; 48] = [0x5c; 48];

/// Bytes written over the head of a reduced-strength key.
const SALT_40: [u8; 3] = [0xd1, 0x26, 0x9e];

// ─── Strength ────────────────────────────────────────────────────────────────

/// Negotiated encryption method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strength {
    /// `ENCRYPTION_METHOD_40BIT`: 8-byte keys, 5 bytes of entropy.
    Bits40,
    /// `ENCRYPTION_METHOD_56BIT`: 8-byte keys, 7 bytes of entropy.
    Bits56,
    /// `ENCRYPTION_METHOD_128BIT`: full 16-byte keys.
    Bits128,
}

impl Strength {
    /// Map the server's `encryptionMethod` field. `None` for FIPS or unknown.
    pub fn from_method(method: u32) -> Option<Self> {
        match method {
            0x01 => Some(Self::Bits40),
            0x02 => Some(Self::Bits128),
            0x08 => Some(Self::Bits56),
            _ => None,
        }
    }

    /// The wire value of this method.
    pub fn method(self) -> u32 {
        match self {
            Self::Bits40 => 0x01,
            Self::Bits128 => 0x02,
            Self::Bits56 => 0x08,
        }
    }

    /// Nominal RC4 key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Bits128 => 16,
            _ => 8,
        }
    }
}

/// Overwrite the head of `key` with the fixed salt for reduced strengths.
///
/// The nominal key length does not change.
pub fn reduce_strength(key: &mut [u8], strength: Strength) {
    match strength {
        Strength::Bits40 => key[..3].copy_from_slice(&SALT_40),
        Strength::Bits56 => key[0] = SALT_40[0],
        Strength::Bits128 => {}
    }
}

// ─── Salted hashes ───────────────────────────────────────────────────────────

/// `SaltedHash` × 3: for block `i` the salt is the letter `salt + i`
/// repeated `i + 1` times.
pub fn hash_48(input: &[u8; 48], random1: &[u8; 32], random2: &[u8; 32], salt: u8) -> [u8; 48] {
    let mut out = [0u8; 48];
    for i in 0..3u8 {
        let pad = vec![salt + i; usize::from(i) + 1];
        let sha = sha1!(&pad, input, random1, random2);
        let md = md5!(input, sha);
        let at = usize::from(i) * 16;
        out[at..at + 16].copy_from_slice(&md);
    }
    out
}

/// `FinalHash`: MD5 of a 16-byte key block and both randoms.
pub fn hash_16(input: &[u8], random1: &[u8; 32], random2: &[u8; 32]) -> [u8; 16] {
    md5!(input, random1, random2)
}

// ─── SessionKeys ─────────────────────────────────────────────────────────────

/// The three keys derived once per connection from the exchanged randoms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKeys {
    /// MAC key.
    pub sign:     [u8; 16],
    /// Client→server RC4 key.
    pub encrypt:  [u8; 16],
    /// Server→client RC4 key.
    pub decrypt:  [u8; 16],
    pub strength: Strength,
}

impl SessionKeys {
    /// Derive the session keys.
    ///
    /// ```text
    /// pre_master = client_random[..24] || server_random[..24]
    /// master     = hash_48(pre_master, client, server, 'A')
    /// key_block  = hash_48(master,     client, server, 'X')
    /// sign       = key_block[0..16]
    /// decrypt    = hash_16(key_block[16..32], client, server)
    /// encrypt    = hash_16(key_block[32..48], client, server)
    /// ```
    pub fn derive(client_random: &[u8; 32], server_random: &[u8; 32], strength: Strength) -> Self {
        let mut pre_master = [0u8; 48];
        pre_master[..24].copy_from_slice(&client_random[..24]);
        pre_master[24..].copy_from_slice(&server_random[..24]);

        let master = hash_48(&pre_master, client_random, server_random, b'A');
        let key_block = hash_48(&master, client_random, server_random, b'X');

        let mut sign = [0u8; 16];
        sign.copy_from_slice(&key_block[..16]);
        let mut decrypt = hash_16(&key_block[16..32], client_random, server_random);
        let mut encrypt = hash_16(&key_block[32..48], client_random, server_random);

        reduce_strength(&mut sign, strength);
        reduce_strength(&mut decrypt, strength);
        reduce_strength(&mut encrypt, strength);

        Self { sign, encrypt, decrypt, strength }
    }
}

// ─── MAC + key update ────────────────────────────────────────────────────────

/// The 8-byte MAC over `data`:
///
/// ```text
/// sha = SHA1(key || pad54 || len_le32(data) || data)
/// mac = MD5(key || pad92 || sha)[..8]
/// ```
pub fn signature(sign_key: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let len = (data.len() as u32).to_le_bytes();
    let sha = sha1!(sign_key, PAD_54, len, data);
    let md = md5!(sign_key, PAD_92, sha);
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(&md[..SIGNATURE_LEN]);
    out
}

/// Derive the next key for one direction.
///
/// The temporary key `MD5(update || pad92 || SHA1(update || pad54 || current))`
/// is RC4-encrypted under itself, then reduced again for weak strengths.
pub fn next_key(update_key: &[u8], current: &[u8], strength: Strength) -> [u8; 16] {
    let len = strength.key_len();
    let sha = sha1!(&update_key[..len], PAD_54, &current[..len]);
    let md = md5!(&update_key[..len], PAD_92, sha);

    let mut key = [0u8; 16];
    key[..len].copy_from_slice(&md[..len]);
    Rc4::new(&md[..len]).apply(&mut key[..len]);
    reduce_strength(&mut key[..len], strength);
    key
}

// ─── CipherState ─────────────────────────────────────────────────────────────

/// One direction's keystream plus its usage counter.
#[derive(Debug)]
pub struct CipherState {
    key:        [u8; 16],
    update_key: [u8; 16],
    strength:   Strength,
    rc4:        Rc4,
    use_count:  u32,
}

impl CipherState {
    /// Start a direction with `key`, which also becomes its update key.
    pub fn new(key: [u8; 16], strength: Strength) -> Self {
        let rc4 = Rc4::new(&key[..strength.key_len()]);
        Self { key, update_key: key, strength, rc4, use_count: 0 }
    }

    /// Encrypt or decrypt `data` in place, refreshing the key first when
    /// the counter has reached [`KEY_UPDATE_INTERVAL`].
    pub fn apply(&mut self, data: &mut [u8]) {
        if self.use_count == KEY_UPDATE_INTERVAL {
            self.update();
        }
        self.rc4.apply(data);
        self.use_count += 1;
    }

    fn update(&mut self) {
        self.key = next_key(&self.update_key, &self.key, self.strength);
        self.rc4 = Rc4::new(&self.key[..self.strength.key_len()]);
        self.use_count = 0;
        log::debug!("rc4 key updated ({:?})", self.strength);
    }

    /// Packets protected with the current key.
    pub fn use_count(&self) -> u32 { self.use_count }

    /// The current key (nominal length).
    pub fn key(&self) -> &[u8] { &self.key[..self.strength.key_len()] }
}

// ─── KeyState ────────────────────────────────────────────────────────────────

/// All per-connection key material for standard security.
#[derive(Debug)]
pub struct KeyState {
    sign_key: [u8; 16],
    strength: Strength,
    encrypt:  CipherState,
    decrypt:  CipherState,
}

impl KeyState {
    /// Key both directions from freshly derived session keys.
    pub fn new(keys: SessionKeys) -> Self {
        Self {
            sign_key: keys.sign,
            strength: keys.strength,
            encrypt:  CipherState::new(keys.encrypt, keys.strength),
            decrypt:  CipherState::new(keys.decrypt, keys.strength),
        }
    }

    /// Negotiated strength.
    pub fn strength(&self) -> Strength { self.strength }

    /// MAC over plaintext `data` with the sign key.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        signature(&self.sign_key[..self.strength.key_len()], data)
    }

    /// Encrypt client→server bytes in place.
    pub fn encrypt(&mut self, data: &mut [u8]) { self.encrypt.apply(data) }

    /// Decrypt server→client bytes in place.
    pub fn decrypt(&mut self, data: &mut [u8]) { self.decrypt.apply(data) }

    /// Client→server direction state.
    pub fn encrypt_state(&self) -> &CipherState { &self.encrypt }

    /// Server→client direction state.
    pub fn decrypt_state(&self) -> &CipherState { &self.decrypt }
}
