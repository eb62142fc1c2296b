//! Raw (unpadded) RSA as used by the standard-security key exchange.
//!
//! RDP transmits every big number little-endian, so the key material and
//! the ciphertext are converted at this boundary and nowhere else.

use std::fmt;

use num_bigint::BigUint;
use num_traits::Zero;

/// Errors from building or using an RSA [`Key`].
#[derive(Clone, Debug, PartialEq)]
pub enum RsaError {
    /// Modulus is zero or shorter than the value being encrypted.
    ModulusTooSmall { modulus_len: usize, data_len: usize },
    /// Exponent is zero.
    ZeroExponent,
}

impl fmt::Display for RsaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModulusTooSmall { modulus_len, data_len }
                => write!(f, "modulus of {modulus_len} bytes cannot hold {data_len} bytes"),
            Self::ZeroExponent => write!(f, "public exponent is zero"),
        }
    }
}

impl std::error::Error for RsaError {}

/// An RSA public key (n, e) plus the modulus width on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Key {
    n:           BigUint,
    e:           BigUint,
    modulus_len: usize,
}

impl Key {
    /// Build from little-endian modulus and exponent bytes, as found in a
    /// proprietary server certificate.
    pub fn from_le(modulus: &[u8], exponent: &[u8]) -> Result<Self, RsaError> {
        Self::build(BigUint::from_bytes_le(modulus), BigUint::from_bytes_le(exponent))
    }

    /// Build from big-endian modulus and exponent bytes, as found in an
    /// X.509 `RSAPublicKey`.
    pub fn from_be(modulus: &[u8], exponent: &[u8]) -> Result<Self, RsaError> {
        Self::build(BigUint::from_bytes_be(modulus), BigUint::from_bytes_be(exponent))
    }

    fn build(n: BigUint, e: BigUint) -> Result<Self, RsaError> {
        if e.is_zero() {
            return Err(RsaError::ZeroExponent);
        }
        if n.is_zero() {
            return Err(RsaError::ModulusTooSmall { modulus_len: 0, data_len: 0 });
        }
        // Wire copies carry zero padding (DER sign byte, 8 trailing bytes in
        // proprietary blobs); the significant width is what matters.
        let modulus_len = n.bits().div_ceil(8) as usize;
        Ok(Self { n, e, modulus_len })
    }

    /// Modulus length in bytes (leading zeros stripped).
    pub fn modulus_len(&self) -> usize { self.modulus_len }
}

/// Encrypt a little-endian value, returning the little-endian ciphertext
/// zero-padded to `pad_to` bytes (at least the modulus length).
pub fn encrypt_le(data: &[u8], key: &Key, pad_to: usize) -> Result<Vec<u8>, RsaError> {
    if data.len() > key.modulus_len {
        return Err(RsaError::ModulusTooSmall { modulus_len: key.modulus_len, data_len: data.len() });
    }
    let m = BigUint::from_bytes_le(data);
    let c = m.modpow(&key.e, &key.n);
    let mut out = c.to_bytes_le();
    out.resize(pad_to.max(key.modulus_len), 0);
    Ok(out)
}
