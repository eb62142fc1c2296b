//! Cryptographic primitives for RDP standard security.
//!
//! Provides:
//! - SHA-1 / MD5 hash macros
//! - RC4 keystreams with 8- or 16-byte keys
//! - Raw RSA over little-endian numbers (client random exchange)
//! - The session key schedule, MAC signatures and 4096-packet key updates
//! - HMAC-MD5 for the auto-reconnect security verifier

#![deny(unsafe_code)]

mod keys;
mod keystream;
pub mod rsa;
mod sha;

pub use keys::{
    CipherState, KEY_UPDATE_INTERVAL, KeyState, SIGNATURE_LEN, SessionKeys, Strength,
    hash_16, hash_48, next_key, reduce_strength, signature,
};
pub use keystream::Rc4;

use hmac::{Hmac, Mac};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

/// HMAC-MD5 of `data` under `key`.
pub fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Fill a fresh 32-byte client random.
pub fn client_random() -> [u8; 32] {
    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    rnd
}
