//! TLV (key, length, value) parameter list codec used by configuration
//! commands and push-state messages (spec §3, §4.1).
//!
//! ```text
//! key_count(2) reserved(2) [ key(2) value_length(2) value(value_length) ]*
//! ```

use crate::error::TlvError;

/// A single TLV entry to pack, or a borrowed view of one after parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param<'a> {
    pub key: u16,
    pub value: &'a [u8],
}

/// Packs an ordered list of parameters into a TLV byte string.
#[must_use]
pub fn pack(params: &[Param<'_>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + params.iter().map(|p| 4 + p.value.len()).sum::<usize>());
    buf.extend_from_slice(&(params.len() as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    for p in params {
        buf.extend_from_slice(&p.key.to_le_bytes());
        buf.extend_from_slice(&(p.value.len() as u16).to_le_bytes());
        buf.extend_from_slice(p.value);
    }
    buf
}

/// Iterator over the `(key, value)` entries of a TLV byte string.
///
/// Built eagerly by [`parse`] rather than lazily, since a short read must be
/// detected and surfaced before any entry is handed to the caller (a
/// malformed payload is "fatal for that payload", per spec §4.1 — it must
/// not partially succeed).
pub fn parse(bytes: &[u8]) -> Result<Vec<Param<'_>>, TlvError> {
    if bytes.len() < 4 {
        return Err(TlvError::Truncated);
    }
    let key_count = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    let mut offset = 4;
    let mut out = Vec::with_capacity(key_count);

    for _ in 0..key_count {
        if bytes.len() < offset + 4 {
            return Err(TlvError::Truncated);
        }
        let key = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        let value_len = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
        offset += 4;

        if bytes.len() < offset + value_len {
            return Err(TlvError::ShortRead);
        }
        out.push(Param {
            key,
            value: &bytes[offset..offset + value_len],
        });
        offset += value_len;
    }

    Ok(out)
}
