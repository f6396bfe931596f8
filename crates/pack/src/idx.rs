//! Pack index (`.idx`) v2 reader and writer
//!
//! # Layout
//! ```text
//! +----------------+
//! | Magic (4B)     |  0xff 't' 'O' 'c'
//! | Version (4B)   |  big-endian 2
//! +----------------+
//! | Fanout (1024B) |  256 * u32 cumulative counts by first byte
//! +----------------+
//! | OID table      |  N * 20 bytes, ascending
//! | CRC table      |  N * u32, CRC32 of each raw packed entry
//! | Offset table   |  N * u32 (MSB set: index into large offsets)
//! | Large offsets  |  M * u64
//! +----------------+
//! | Pack checksum  |  20 bytes
//! | Idx checksum   |  20 bytes
//! +----------------+
//! ```
//! All integers are big-endian.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use cairn_core::oid::{IncrementalHasher, OID_LEN};
use cairn_core::Oid;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
pub const IDX_VERSION: u32 = 2;
const HEADER_SIZE: usize = 8;
const FANOUT_ENTRIES: usize = 256;
const FANOUT_SIZE: usize = FANOUT_ENTRIES * 4;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// Where an object lives: the `.idx` naming its pack, and the byte offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub idx: PathBuf,
    pub offset: u64,
}

/// Operations shared by plain pack indexes and multi-pack indexes
pub trait PackIndexLike {
    /// Path of the index file itself
    fn path(&self) -> &Path;

    /// Number of objects covered
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn exists(&self, oid: &Oid) -> bool;

    /// Resolve an object to its pack index and offset
    fn find(&self, oid: &Oid) -> Result<Option<ObjectLocation>>;

    /// All object ids, ascending
    fn iter(&self) -> Box<dyn Iterator<Item = Oid> + '_>;

    /// Basenames of the `.idx` files this index speaks for
    fn idxnames(&self) -> Vec<String>;
}

/// One object's row in a pack index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxEntry {
    pub oid: Oid,
    pub crc: u32,
    pub offset: u64,
}

/// Serialize a v2 index for the given entries. Entries are sorted in place.
pub fn build(entries: &mut [IdxEntry], pack_sha: &Oid) -> Vec<u8> {
    entries.sort_unstable_by(|a, b| a.oid.cmp(&b.oid));
    let n = entries.len();
    let mut out = Vec::with_capacity(HEADER_SIZE + FANOUT_SIZE + n * 28 + 2 * OID_LEN);

    out.extend_from_slice(&IDX_MAGIC);
    out.extend_from_slice(&IDX_VERSION.to_be_bytes());

    let mut counts = [0u32; FANOUT_ENTRIES];
    for e in entries.iter() {
        counts[e.oid.as_bytes()[0] as usize] += 1;
    }
    let mut running = 0u32;
    for count in counts {
        running += count;
        out.extend_from_slice(&running.to_be_bytes());
    }

    for e in entries.iter() {
        out.extend_from_slice(e.oid.as_bytes());
    }
    for e in entries.iter() {
        out.extend_from_slice(&e.crc.to_be_bytes());
    }

    let mut large = Vec::new();
    for e in entries.iter() {
        if e.offset < LARGE_OFFSET_FLAG as u64 {
            out.extend_from_slice(&(e.offset as u32).to_be_bytes());
        } else {
            out.extend_from_slice(&(LARGE_OFFSET_FLAG | large.len() as u32).to_be_bytes());
            large.push(e.offset);
        }
    }
    for offset in large {
        out.extend_from_slice(&offset.to_be_bytes());
    }

    out.extend_from_slice(pack_sha.as_bytes());
    let mut hasher = IncrementalHasher::new();
    hasher.update(&out);
    let idx_sha = hasher.finalize();
    out.extend_from_slice(idx_sha.as_bytes());
    out
}

/// Memory-mapped v2 pack index
pub struct PackIdx {
    path: PathBuf,
    map: Mmap,
    count: usize,
    sha_ofs: usize,
    crc_ofs: usize,
    ofs_ofs: usize,
    large_ofs: usize,
    large_count: usize,
}

impl std::fmt::Debug for PackIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackIdx")
            .field("path", &self.path)
            .field("count", &self.count)
            .finish()
    }
}

impl PackIdx {
    /// Map and validate an index file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len() as usize;
        let min_size = HEADER_SIZE + FANOUT_SIZE + 2 * OID_LEN;
        if len < min_size {
            return Err(Error::corrupt(path, "pack index", "file too small"));
        }
        // SAFETY: finalized index files are never modified in place
        let map = unsafe { Mmap::map(&file)? };
        Self::from_map(path, map)
    }

    fn from_map(path: PathBuf, map: Mmap) -> Result<Self> {
        if map[0..4] != IDX_MAGIC {
            return Err(Error::corrupt(path, "pack index", "invalid magic"));
        }
        let version = BigEndian::read_u32(&map[4..8]);
        if version != IDX_VERSION {
            return Err(Error::UnsupportedVersion {
                path,
                what: "pack index",
                version,
            });
        }

        let fanout = &map[HEADER_SIZE..HEADER_SIZE + FANOUT_SIZE];
        let mut prev = 0u32;
        for i in 0..FANOUT_ENTRIES {
            let v = BigEndian::read_u32(&fanout[i * 4..]);
            if v < prev {
                return Err(Error::corrupt(path, "pack index", "fanout not monotonic"));
            }
            prev = v;
        }
        let count = prev as usize;

        let sha_ofs = HEADER_SIZE + FANOUT_SIZE;
        let crc_ofs = sha_ofs + count * OID_LEN;
        let ofs_ofs = crc_ofs + count * 4;
        let large_ofs = ofs_ofs + count * 4;
        let trailer = 2 * OID_LEN;
        if map.len() < large_ofs + trailer || (map.len() - large_ofs - trailer) % 8 != 0 {
            return Err(Error::corrupt(
                path,
                "pack index",
                format!("size {} does not fit {} objects", map.len(), count),
            ));
        }
        let large_count = (map.len() - large_ofs - trailer) / 8;

        for i in 0..count {
            let raw = BigEndian::read_u32(&map[ofs_ofs + i * 4..]);
            if raw & LARGE_OFFSET_FLAG != 0 && (raw & !LARGE_OFFSET_FLAG) as usize >= large_count {
                return Err(Error::corrupt(
                    path,
                    "pack index",
                    format!("large offset index {} out of range", raw & !LARGE_OFFSET_FLAG),
                ));
            }
        }

        Ok(Self {
            path,
            map,
            count,
            sha_ofs,
            crc_ofs,
            ofs_ofs,
            large_ofs,
            large_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Raw bytes of the sorted id table
    pub fn sha_table(&self) -> &[u8] {
        &self.map[self.sha_ofs..self.crc_ofs]
    }

    #[inline]
    fn oid_bytes(&self, i: usize) -> &[u8] {
        let start = self.sha_ofs + i * OID_LEN;
        &self.map[start..start + OID_LEN]
    }

    pub fn oid_at(&self, i: usize) -> Oid {
        let mut raw = [0u8; OID_LEN];
        raw.copy_from_slice(self.oid_bytes(i));
        Oid::from_bytes(raw)
    }

    pub fn crc_at(&self, i: usize) -> u32 {
        BigEndian::read_u32(&self.map[self.crc_ofs + i * 4..])
    }

    pub fn offset_at(&self, i: usize) -> u64 {
        let raw = BigEndian::read_u32(&self.map[self.ofs_ofs + i * 4..]);
        if raw & LARGE_OFFSET_FLAG == 0 {
            return raw as u64;
        }
        let idx = (raw & !LARGE_OFFSET_FLAG) as usize;
        debug_assert!(idx < self.large_count);
        BigEndian::read_u64(&self.map[self.large_ofs + idx * 8..])
    }

    fn fanout(&self, byte: usize) -> usize {
        BigEndian::read_u32(&self.map[HEADER_SIZE + byte * 4..]) as usize
    }

    /// Position of `oid` in the sorted table
    pub fn find_index(&self, oid: &Oid) -> Option<usize> {
        let first = oid.as_bytes()[0] as usize;
        let mut lo = if first == 0 { 0 } else { self.fanout(first - 1) };
        let mut hi = self.fanout(first);
        let want = oid.as_bytes().as_slice();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_bytes(mid).cmp(want) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    pub fn exists(&self, oid: &Oid) -> bool {
        self.find_index(oid).is_some()
    }

    /// Byte offset of `oid` in the paired pack
    pub fn find_offset(&self, oid: &Oid) -> Option<u64> {
        self.find_index(oid).map(|i| self.offset_at(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        (0..self.count).map(move |i| self.oid_at(i))
    }

    /// Checksum of the paired pack, as recorded in the trailer
    pub fn pack_sha(&self) -> Oid {
        let start = self.map.len() - 2 * OID_LEN;
        self.oid_slice(start)
    }

    /// Checksum recorded for the index itself
    pub fn idx_sha(&self) -> Oid {
        let start = self.map.len() - OID_LEN;
        self.oid_slice(start)
    }

    fn oid_slice(&self, start: usize) -> Oid {
        let mut raw = [0u8; OID_LEN];
        raw.copy_from_slice(&self.map[start..start + OID_LEN]);
        Oid::from_bytes(raw)
    }

    /// Recompute the trailing index checksum
    pub fn verify_checksum(&self) -> Result<()> {
        let body = &self.map[..self.map.len() - OID_LEN];
        let mut hasher = IncrementalHasher::new();
        hasher.update(body);
        if hasher.finalize() != self.idx_sha() {
            return Err(Error::corrupt(&self.path, "pack index", "checksum mismatch"));
        }
        Ok(())
    }

    /// Path of the `.pack` this index describes
    pub fn pack_path(&self) -> PathBuf {
        self.path.with_extension("pack")
    }

    pub fn basename(&self) -> String {
        basename(&self.path)
    }
}

impl PackIndexLike for PackIdx {
    fn path(&self) -> &Path {
        &self.path
    }

    fn len(&self) -> usize {
        self.count
    }

    fn exists(&self, oid: &Oid) -> bool {
        PackIdx::exists(self, oid)
    }

    fn find(&self, oid: &Oid) -> Result<Option<ObjectLocation>> {
        Ok(self.find_offset(oid).map(|offset| ObjectLocation {
            idx: self.path.clone(),
            offset,
        }))
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Oid> + '_> {
        Box::new(PackIdx::iter(self))
    }

    fn idxnames(&self) -> Vec<String> {
        vec![self.basename()]
    }
}

pub(crate) fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
