//! Server public-key extraction: the proprietary certificate blob and the
//! last certificate of an X.509 chain.
//!
//! Only the RSA modulus and exponent are extracted. Chain trust is not
//! evaluated here.

use rdpwire_crypto::rsa;

use crate::cursor::ByteCursor;
use crate::error::{Error, Result};

const CERT_CHAIN_VERSION_1: u32 = 1;
const CERT_CHAIN_VERSION_2: u32 = 2;

const BB_RSA_KEY_BLOB:       u16 = 0x0006;
const BB_RSA_SIGNATURE_BLOB: u16 = 0x0008;

/// "RSA1" little-endian.
const RSA_MAGIC: u32 = 0x3141_5352;
const PADDING_LEN: usize = 8;
const MAX_MODULUS_LEN: usize = 256;
const MIN_MODULUS_LEN: usize = 64;

/// Parse a server certificate (`dwVersion` first) into its RSA key.
pub fn parse_server_certificate(s: &mut ByteCursor) -> Result<rsa::Key> {
    let version = s.read_u32_le()?;
    match version & 0x7fff_ffff {
        CERT_CHAIN_VERSION_1 => parse_proprietary(s),
        CERT_CHAIN_VERSION_2 => parse_x509_chain(s),
        v => Err(s.protocol_error(format!("unknown certificate chain version {v}"))),
    }
}

fn parse_proprietary(s: &mut ByteCursor) -> Result<rsa::Key> {
    s.skip(8)?; // signature / key algorithm ids
    let mut key = None;
    while s.remaining() >= 4 {
        let tag = s.read_u16_le()?;
        let len = usize::from(s.read_u16_le()?);
        if !s.bytes_available(len) {
            return Err(s.protocol_error(format!("certificate blob {tag:#06x} truncated")));
        }
        let next = s.position() + len;
        match tag {
            BB_RSA_KEY_BLOB => key = Some(parse_public_key(s)?),
            BB_RSA_SIGNATURE_BLOB => log::debug!("skipping {len}-byte proprietary key signature"),
            other => log::debug!("unhandled certificate blob {other:#06x}"),
        }
        s.seek(next);
    }
    key.ok_or_else(|| s.protocol_error("proprietary certificate without public key"))
}

fn parse_public_key(s: &mut ByteCursor) -> Result<rsa::Key> {
    let magic = s.read_u32_le()?;
    if magic != RSA_MAGIC {
        return Err(s.protocol_error(format!("bad RSA magic {magic:#010x}")));
    }
    let key_len = s.read_u32_le()? as usize;
    let modulus_len = key_len.saturating_sub(PADDING_LEN);
    if !(MIN_MODULUS_LEN..=MAX_MODULUS_LEN).contains(&modulus_len) {
        return Err(s.protocol_error(format!("RSA modulus of {modulus_len} bytes")));
    }
    s.skip(8)?; // bit length, data length
    let exponent = s.read_array::<4>()?;
    let modulus = s.read_vec(modulus_len)?;
    s.skip(PADDING_LEN)?;
    Ok(rsa::Key::from_le(&modulus, &exponent)?)
}

fn parse_x509_chain(s: &mut ByteCursor) -> Result<rsa::Key> {
    let count = s.read_u32_le()?;
    if count < 2 {
        return Err(s.protocol_error(format!("X.509 chain of {count} certificates")));
    }
    let mut last = Vec::new();
    for _ in 0..count {
        let len = s.read_u32_le()? as usize;
        last = s.read_vec(len)?;
    }
    let (n, e) = x509_rsa_public_key(&last)
        .ok_or_else(|| Error::protocol_with("no RSA key in server certificate", &last))?;
    Ok(rsa::Key::from_be(n, e)?)
}

// ─── DER walk ────────────────────────────────────────────────────────────────

/// One DER TLV: `(tag, contents, rest)`.
fn der_next(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, buf) = buf.split_first()?;
    let (&first, mut buf) = buf.split_first()?;
    let len = if first & 0x80 == 0 {
        usize::from(first)
    } else {
        let n = usize::from(first & 0x7f);
        if n == 0 || n > 4 || buf.len() < n {
            return None;
        }
        let len = buf[..n].iter().fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        buf = &buf[n..];
        len
    };
    if buf.len() < len {
        return None;
    }
    Some((tag, &buf[..len], &buf[len..]))
}

fn der_expect(buf: &[u8], tag: u8) -> Option<(&[u8], &[u8])> {
    let (t, body, rest) = der_next(buf)?;
    (t == tag).then_some((body, rest))
}

/// Find `(modulus, exponent)` (big-endian) in a DER certificate.
pub fn x509_rsa_public_key(der: &[u8]) -> Option<(&[u8], &[u8])> {
    const SEQUENCE: u8 = 0x30;
    const INTEGER: u8 = 0x02;
    const BIT_STRING: u8 = 0x03;
    const VERSION: u8 = 0xa0;

    let (cert, _) = der_expect(der, SEQUENCE)?;
    let (tbs, _) = der_expect(cert, SEQUENCE)?;
    let mut rest = tbs;
    if rest.first() == Some(&VERSION) {
        rest = der_next(rest)?.2;
    }
    // serial, signature, issuer, validity, subject
    for _ in 0..5 {
        rest = der_next(rest)?.2;
    }
    let (spki, _) = der_expect(rest, SEQUENCE)?;
    let (_, spki) = der_expect(spki, SEQUENCE)?; // algorithm
    let (bits, _) = der_expect(spki, BIT_STRING)?;
    let (_unused, key) = bits.split_first()?;
    let (rsa_key, _) = der_expect(key, SEQUENCE)?;
    let (n, rest) = der_expect(rsa_key, INTEGER)?;
    let (e, _) = der_expect(rest, INTEGER)?;
    Some((n, e))
}
