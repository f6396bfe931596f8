//! Git object framing: hashing, loose and packed encodings
//!
//! Loose framing is `zlib("<type> <len>\0" + content)` and is used for
//! standalone object files. Packed framing is a variable-length size/type
//! header followed by `zlib(content)` and is only found inside packfiles.
//!
//! Packed header layout (first byte):
//! ```text
//!  bit 7     bits 6-4     bits 3-0
//!  [more]    [type]       [size 0..4]
//! ```
//! Each following byte contributes 7 more size bits, low bits first, with
//! bit 7 as the continuation flag.

use crate::error::{Error, Result};
use crate::oid::{IncrementalHasher, Oid};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use smallvec::SmallVec;
use std::io::{Read, Write};

/// Pack type code for an offset delta
pub const OFS_DELTA: u8 = 6;
/// Pack type code for a reference delta
pub const REF_DELTA: u8 = 7;

/// Upper bound on a declared object size we are willing to inflate
const MAX_OBJECT_SIZE: u64 = 1 << 40;

/// Kind of a Git object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    /// Name used in the loose header and hash prefix
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }

    /// Parse a type name
    pub fn from_name(name: &[u8]) -> Result<Self> {
        match name {
            b"commit" => Ok(ObjectKind::Commit),
            b"tree" => Ok(ObjectKind::Tree),
            b"blob" => Ok(ObjectKind::Blob),
            b"tag" => Ok(ObjectKind::Tag),
            other => Err(Error::UnknownTypeName(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// 3-bit type code used in packed headers
    pub fn pack_code(self) -> u8 {
        match self {
            ObjectKind::Commit => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Blob => 3,
            ObjectKind::Tag => 4,
        }
    }

    /// Map a packed type code back to a kind
    ///
    /// Delta codes are reported as `UnsupportedDelta` rather than unknown.
    pub fn from_pack_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(ObjectKind::Commit),
            2 => Ok(ObjectKind::Tree),
            3 => Ok(ObjectKind::Blob),
            4 => Ok(ObjectKind::Tag),
            OFS_DELTA | REF_DELTA => Err(Error::UnsupportedDelta(code)),
            other => Err(Error::UnknownObjectType(other)),
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn loose_header(kind: ObjectKind, len: usize) -> Vec<u8> {
    format!("{} {}\0", kind.name(), len).into_bytes()
}

/// Compute the Git object id: `SHA1("<type> <len>\0" + content)`
pub fn hash_object(kind: ObjectKind, content: &[u8]) -> Oid {
    let mut hasher = IncrementalHasher::new();
    hasher.update(&loose_header(kind, content.len()));
    hasher.update(content);
    hasher.finalize()
}

/// Encode an object in loose framing
pub fn encode_loose(kind: ObjectKind, content: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut z = ZlibEncoder::new(Vec::new(), Compression::new(level));
    z.write_all(&loose_header(kind, content.len()))?;
    z.write_all(content)?;
    Ok(z.finish()?)
}

/// Decode a loose object file
pub fn decode_loose(bytes: &[u8]) -> Result<(ObjectKind, Vec<u8>)> {
    let mut raw = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut raw)
        .map_err(|e| Error::corrupt("loose object", format!("zlib: {e}")))?;

    let nul = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::corrupt("loose object", "missing header terminator"))?;
    let header = &raw[..nul];
    let space = header
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| Error::corrupt("loose object", "malformed header"))?;
    let kind = ObjectKind::from_name(&header[..space])?;
    let len: usize = std::str::from_utf8(&header[space + 1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::corrupt("loose object", "bad length field"))?;

    let content = raw.split_off(nul + 1);
    if content.len() != len {
        return Err(Error::corrupt(
            "loose object",
            format!("length {} does not match header {}", content.len(), len),
        ));
    }
    Ok((kind, content))
}

/// Encode a packed-object size/type header
pub fn encode_packed_header(code: u8, size: u64) -> SmallVec<[u8; 10]> {
    let mut out = SmallVec::new();
    let mut sz = size;
    let mut byte = ((sz & 0x0f) as u8) | ((code & 0x07) << 4);
    sz >>= 4;
    loop {
        if sz != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if sz == 0 {
            break;
        }
        byte = (sz & 0x7f) as u8;
        sz >>= 7;
    }
    out
}

/// Decode a packed-object header, returning `(type_code, size, header_len)`
pub fn decode_packed_header(bytes: &[u8]) -> Result<(u8, u64, usize)> {
    let first = *bytes
        .first()
        .ok_or_else(|| Error::corrupt("packed object", "empty header"))?;
    let code = (first >> 4) & 0x07;
    let mut size = (first & 0x0f) as u64;
    let mut shift = 4u32;
    let mut pos = 1usize;
    let mut byte = first;
    while byte & 0x80 != 0 {
        byte = *bytes
            .get(pos)
            .ok_or_else(|| Error::corrupt("packed object", "truncated size header"))?;
        if shift > 57 {
            return Err(Error::corrupt("packed object", "size header overflow"));
        }
        size |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
        pos += 1;
    }
    Ok((code, size, pos))
}

/// Encode an object in packed framing (header + zlib body)
pub fn encode_packed(kind: ObjectKind, content: &[u8], level: u32) -> Result<Vec<u8>> {
    let header = encode_packed_header(kind.pack_code(), content.len() as u64);
    let mut out = Vec::with_capacity(header.len() + content.len() / 2 + 16);
    out.extend_from_slice(&header);
    let mut z = ZlibEncoder::new(out, Compression::new(level));
    z.write_all(content)?;
    Ok(z.finish()?)
}

/// Inflate exactly `size` bytes of zlib data from the front of `bytes`
pub fn inflate_exact(bytes: &[u8], size: u64) -> Result<Vec<u8>> {
    if size > MAX_OBJECT_SIZE {
        return Err(Error::corrupt("packed object", format!("size {size} too large")));
    }
    let mut out = Vec::with_capacity(size as usize);
    ZlibDecoder::new(bytes)
        .take(size + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::corrupt("packed object", format!("zlib: {e}")))?;
    if out.len() as u64 != size {
        return Err(Error::corrupt(
            "packed object",
            format!("inflated {} bytes, header says {}", out.len(), size),
        ));
    }
    Ok(out)
}

/// Decode a non-delta object in packed framing
pub fn decode_packed(bytes: &[u8]) -> Result<(ObjectKind, Vec<u8>)> {
    let (code, size, header_len) = decode_packed_header(bytes)?;
    let kind = ObjectKind::from_pack_code(code)?;
    let content = inflate_exact(&bytes[header_len..], size)?;
    Ok((kind, content))
}
