//! SHA-1 object ids for content-addressed storage

use crate::error::{Error, Result};
use sha1::{Digest, Sha1};

/// Length of a raw SHA-1 digest in bytes
pub const OID_LEN: usize = 20;

/// A Git object id (raw 20-byte SHA-1 digest)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct Oid([u8; OID_LEN]);

impl Oid {
    /// All-zero id: "not yet hashed"
    pub const EMPTY: Oid = Oid([0u8; OID_LEN]);

    /// All-`0x01` id: hash deliberately skipped
    pub const FAKE: Oid = Oid([1u8; OID_LEN]);

    /// Create an Oid from bytes
    pub const fn from_bytes(bytes: [u8; OID_LEN]) -> Self {
        Self(bytes)
    }

    /// Create an Oid from a slice, which must be exactly 20 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; OID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidOid(format!("{} bytes", bytes.len())))?;
        Ok(Self(raw))
    }

    /// Get the id as a byte slice
    pub fn as_bytes(&self) -> &[u8; OID_LEN] {
        &self.0
    }

    /// Convert to lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 40-character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != OID_LEN * 2 {
            return Err(Error::InvalidOid(s.to_string()));
        }
        let mut bytes = [0u8; OID_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidOid(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// First four bytes as a big-endian integer
    #[inline]
    pub fn first_word(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Top `bits` bits of the id (0..=32)
    #[inline]
    pub fn extract_bits(&self, bits: u32) -> u32 {
        extract_bits(&self.0, bits)
    }
}

/// Top `bits` bits of a raw digest, read as a big-endian word
#[inline]
pub fn extract_bits(raw: &[u8], bits: u32) -> u32 {
    debug_assert!(bits <= 32);
    if bits == 0 {
        return 0;
    }
    let word = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    word >> (32 - bits)
}

impl std::fmt::Debug for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Oid::from_hex(s)
    }
}

impl AsRef<[u8]> for Oid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Plain SHA-1 of a byte string (no object header)
pub fn sha1_bytes(data: &[u8]) -> Oid {
    let digest = Sha1::digest(data);
    Oid(digest.into())
}

/// Incremental SHA-1 for digests built across multiple writes
#[derive(Clone, Default)]
pub struct IncrementalHasher {
    inner: Sha1,
}

impl IncrementalHasher {
    /// Create a new incremental hasher
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    /// Update the digest with more data
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and return the digest
    pub fn finalize(self) -> Oid {
        Oid(self.inner.finalize().into())
    }
}

impl std::io::Write for IncrementalHasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
