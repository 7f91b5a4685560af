//! Binary save file framing.
//!
//! ```text
//! [magic:4 "WSAV"][major:1][minor:1][timestamp:8 LE unix ms]
//! [desc_len:varint][description:UTF-8][entity_count:varint]
//! [payload ...]
//! [checksum:32]  SHA-256 over every preceding byte
//! ```
//!
//! The header is everything before the payload and can be parsed on its own,
//! which is what slot listing does.

use worldsave_common::FormatVersion;

use crate::error::FormatError;
use crate::integrity;

pub const MAGIC: [u8; 4] = *b"WSAV";
pub const CHECKSUM_LEN: usize = 32;
/// Longest description stored in a header, in bytes.
pub const MAX_DESCRIPTION_LEN: usize = 1024;
/// Upper bound on the header size, for metadata-only reads.
pub const MAX_HEADER_LEN: usize = 4 + 2 + 8 + 10 + MAX_DESCRIPTION_LEN + 10;

/// Metadata readable without decoding the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveHeader {
    pub version: FormatVersion,
    pub saved_at_ms: i64,
    pub description: String,
    pub entity_count: u64,
}

impl SaveHeader {
    pub fn new(
        version: FormatVersion,
        saved_at_ms: i64,
        description: &str,
        entity_count: u64,
    ) -> Self {
        Self {
            version,
            saved_at_ms,
            description: truncate_utf8(description, MAX_DESCRIPTION_LEN).to_string(),
            entity_count,
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.push(self.version.major);
        out.push(self.version.minor);
        out.extend_from_slice(&self.saved_at_ms.to_le_bytes());
        let desc = truncate_utf8(&self.description, MAX_DESCRIPTION_LEN);
        write_varint(out, desc.len() as u64);
        out.extend_from_slice(desc.as_bytes());
        write_varint(out, self.entity_count);
    }

    /// Parse a header from the start of `bytes`; returns it with its length.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), FormatError> {
        let mut r = Reader { bytes, pos: 0 };
        let magic: [u8; 4] = r
            .take(4, "magic")?
            .try_into()
            .map_err(|_| FormatError::Truncated("magic"))?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let version = r.take(2, "version")?;
        let version = FormatVersion::new(version[0], version[1]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(r.take(8, "timestamp")?);
        let desc_len = r.varint("description length")?;
        if desc_len > MAX_DESCRIPTION_LEN as u64 {
            return Err(FormatError::BadVarint("description length"));
        }
        let description = std::str::from_utf8(r.take(desc_len as usize, "description")?)
            .map_err(|_| FormatError::BadDescription)?
            .to_string();
        let entity_count = r.varint("entity count")?;
        Ok((
            Self {
                version,
                saved_at_ms: i64::from_le_bytes(ts),
                description,
                entity_count,
            },
            r.pos,
        ))
    }
}

/// A save file split into its parts; borrowed from the raw bytes.
#[derive(Debug)]
pub struct SaveFile<'a> {
    pub header: SaveHeader,
    pub payload: &'a [u8],
    /// Header and payload: the bytes the checksum covers.
    pub signed: &'a [u8],
    pub checksum: [u8; CHECKSUM_LEN],
}

impl SaveFile<'_> {
    /// Whether the trailing checksum matches the signed bytes.
    pub fn checksum_ok(&self) -> bool {
        integrity::verify(self.signed, &self.checksum)
    }
}

/// Frame a payload: header, payload, trailing checksum.
pub fn assemble(header: &SaveHeader, payload: &[u8]) -> (Vec<u8>, [u8; CHECKSUM_LEN]) {
    let mut out = Vec::with_capacity(MAX_HEADER_LEN + payload.len() + CHECKSUM_LEN);
    header.write_to(&mut out);
    out.extend_from_slice(payload);
    let digest = integrity::checksum(&out);
    out.extend_from_slice(&digest);
    (out, digest)
}

/// Split raw file bytes. Does not verify the checksum.
pub fn split(bytes: &[u8]) -> Result<SaveFile<'_>, FormatError> {
    if bytes.len() < MAGIC.len() + CHECKSUM_LEN {
        return Err(FormatError::TooShort(bytes.len()));
    }
    let (signed, tail) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let (header, header_len) = SaveHeader::parse(signed)?;
    let mut checksum = [0u8; CHECKSUM_LEN];
    checksum.copy_from_slice(tail);
    Ok(SaveFile {
        header,
        payload: &signed[header_len..],
        signed,
        checksum,
    })
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(n).ok_or(FormatError::Truncated(what))?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(FormatError::Truncated(what))?;
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self, what: &'static str) -> Result<u64, FormatError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.take(1, what)?[0];
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(FormatError::BadVarint(what))
    }
}
