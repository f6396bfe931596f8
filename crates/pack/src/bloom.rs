//! Bloom filter over every object id in a pack directory
//!
//! # Layout
//! ```text
//! +-------------------+
//! | "BLOM"            |
//! | Version (4B)      |  big-endian 2
//! | Bits (2B)         |  table is 2^bits bytes
//! | K (2B)            |  probes per id, 4 or 5
//! | Entries (4B)      |  ids added so far
//! +-------------------+
//! | Table             |  2^bits bytes
//! +-------------------+
//! | Names             |  NUL-joined basenames of the folded-in .idx files
//! +-------------------+
//! ```
//!
//! Each probe takes a disjoint slice of the id: four bytes when k is 5,
//! five bytes when k is 4. The top `bits` bits of the slice pick a byte in
//! the table and the next three pick a bit in that byte.

use crate::error::{Error, Result};
use crate::idx::{basename, PackIdx, PackIndexLike};
use crate::midx::list_dir;
use byteorder::{BigEndian, ByteOrder};
use cairn_core::config::BloomConfig;
use cairn_core::Oid;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const BLOOM_MAGIC: &[u8; 4] = b"BLOM";
pub const BLOOM_VERSION: u32 = 2;
pub const BLOOM_FILE_NAME: &str = "bup.bloom";
const HEADER_SIZE: usize = 16;

/// Largest usable `bits` for a given k
pub fn max_bloom_bits(k: u32) -> u32 {
    match k {
        4 => 37,
        _ => 29,
    }
}

/// Table bits budgeted per expected entry
const MAX_BITS_EACH: usize = 32;

/// Byte index and bit mask for each of the k probes
fn probes(oid: &Oid, bits: u32, k: u32) -> impl Iterator<Item = (usize, u8)> + '_ {
    let raw = oid.as_bytes();
    let mask = (1u64 << bits) - 1;
    (0..k as usize).map(move |i| {
        let (word, width) = if k == 5 {
            (BigEndian::read_u32(&raw[i * 4..]) as u64, 32)
        } else {
            let s = &raw[i * 5..i * 5 + 5];
            (((BigEndian::read_u32(s) as u64) << 8) | s[4] as u64, 40)
        };
        let bit = (word >> (width - 3 - bits)) & 7;
        let byte = (word >> (width - bits)) & mask;
        (byte as usize, 1u8 << bit)
    })
}

enum Table {
    ReadOnly(Mmap),
    /// Writes land in the file as they happen
    Shared(MmapMut),
    /// Writes stay private until `close` copies the table back
    Private(MmapMut),
}

impl Table {
    fn bytes(&self) -> &[u8] {
        match self {
            Table::ReadOnly(m) => &m[..],
            Table::Shared(m) | Table::Private(m) => &m[..],
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Table::ReadOnly(_) => None,
            Table::Shared(m) | Table::Private(m) => Some(&mut m[..]),
        }
    }
}

/// An opened bloom filter
pub struct ShaBloom {
    path: PathBuf,
    file: File,
    table: Option<Table>,
    bits: u32,
    k: u32,
    entries: u32,
    idxnames: Vec<String>,
    dirty: bool,
}

impl std::fmt::Debug for ShaBloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaBloom")
            .field("path", &self.path)
            .field("bits", &self.bits)
            .field("k", &self.k)
            .field("entries", &self.entries)
            .finish()
    }
}

impl ShaBloom {
    /// Create an empty filter sized for `expected` ids, open for writing
    ///
    /// `k` of `None` picks 5 probes when the table fits, else 4.
    pub fn create(path: impl AsRef<Path>, expected: usize, k: Option<u32>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let wanted = (expected.max(1) * MAX_BITS_EACH / 8) as u64;
        let mut bits = 63 - wanted.leading_zeros();
        let k = match k {
            Some(k @ (4 | 5)) => k,
            Some(other) => {
                return Err(Error::corrupt(path, "bloom", format!("k must be 4 or 5, got {other}")));
            }
            None if bits <= max_bloom_bits(5) => 5,
            None => 4,
        };
        if bits > max_bloom_bits(k) {
            warn!(bits, max = max_bloom_bits(k), "bloom: max bits exceeded, filter will be non-optimal");
            bits = max_bloom_bits(k);
        }
        debug!(bytes = 1u64 << bits, k, "bloom: creating");

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(BLOOM_MAGIC);
        BigEndian::write_u32(&mut header[4..8], BLOOM_VERSION);
        BigEndian::write_u16(&mut header[8..10], bits as u16);
        BigEndian::write_u16(&mut header[10..12], k as u16);
        file.write_all(&header)?;
        file.set_len(HEADER_SIZE as u64 + (1u64 << bits))?;

        let table = Self::map_rw(&file, HEADER_SIZE + (1usize << bits), expected)?;
        Ok(Self {
            path,
            file,
            table: Some(table),
            bits,
            k,
            entries: 0,
            idxnames: Vec::new(),
            dirty: true,
        })
    }

    /// Open read-only, `Ok(None)` if there is no such file
    pub fn open(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // SAFETY: the live filter is only ever replaced by rename
        let map = unsafe { Mmap::map(&file)? };
        Self::parse(path.to_path_buf(), file, Table::ReadOnly(map)).map(Some)
    }

    /// Open for adding roughly `expected` more ids
    pub fn open_rw(path: impl AsRef<Path>, expected: usize) -> Result<Option<Self>> {
        let path = path.as_ref();
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len() as usize;
        let table = Self::map_rw(&file, len, expected)?;
        Self::parse(path.to_path_buf(), file, table).map(Some)
    }

    /// Shared mapping for light updates; a private one when nearly every
    /// page will be dirtied anyway, written back in one go on close.
    fn map_rw(file: &File, len: usize, expected: usize) -> Result<Table> {
        let delay_write = expected > len / 4096 * 5;
        // SAFETY: this handle is the only writer of the file while it is open
        let table = unsafe {
            if delay_write {
                Table::Private(MmapOptions::new().map_copy(file)?)
            } else {
                Table::Shared(MmapMut::map_mut(file)?)
            }
        };
        Ok(table)
    }

    fn parse(path: PathBuf, file: File, table: Table) -> Result<Self> {
        let bytes = table.bytes();
        if bytes.len() < HEADER_SIZE || &bytes[0..4] != BLOOM_MAGIC {
            return Err(Error::corrupt(path, "bloom", "invalid header"));
        }
        let version = BigEndian::read_u32(&bytes[4..8]);
        if version != BLOOM_VERSION {
            return Err(Error::UnsupportedVersion {
                path,
                what: "bloom",
                version,
            });
        }
        let bits = BigEndian::read_u16(&bytes[8..10]) as u32;
        let k = BigEndian::read_u16(&bytes[10..12]) as u32;
        let entries = BigEndian::read_u32(&bytes[12..16]);
        if k != 4 && k != 5 {
            return Err(Error::corrupt(path, "bloom", format!("unsupported k {k}")));
        }
        if bits > max_bloom_bits(k) {
            return Err(Error::corrupt(path, "bloom", format!("{bits} bits is too many for k {k}")));
        }
        let table_end = HEADER_SIZE + (1usize << bits);
        if bytes.len() < table_end {
            return Err(Error::corrupt(
                path,
                "bloom",
                format!("table needs {table_end} bytes, file has {}", bytes.len()),
            ));
        }
        let idxnames = bytes[table_end..]
            .split(|b| *b == 0)
            .filter(|n| !n.is_empty())
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .collect();
        Ok(Self {
            path,
            file,
            table: Some(table),
            bits,
            k,
            entries,
            idxnames,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    /// Ids added so far, counting repeats
    pub fn entries(&self) -> usize {
        self.entries as usize
    }

    pub fn idxnames(&self) -> &[String] {
        &self.idxnames
    }

    fn table(&self) -> &[u8] {
        let end = HEADER_SIZE + (1usize << self.bits);
        self.table
            .as_ref()
            .map(|t| &t.bytes()[HEADER_SIZE..end])
            .unwrap_or(&[])
    }

    fn table_mut(&mut self) -> Result<&mut [u8]> {
        let end = HEADER_SIZE + (1usize << self.bits);
        let path = &self.path;
        self.table
            .as_mut()
            .and_then(Table::bytes_mut)
            .map(|b| &mut b[HEADER_SIZE..end])
            .ok_or_else(|| Error::corrupt(path, "bloom", "filter is not open for writing"))
    }

    /// Predicted false-positive percentage after `additional` more ids
    pub fn pfalse_positive(&self, additional: usize) -> f64 {
        let n = (self.entries as usize + additional) as f64;
        let m = 8.0 * (1u64 << self.bits) as f64;
        let k = self.k as f64;
        100.0 * (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// False only if `oid` was never added
    pub fn contains(&self, oid: &Oid) -> bool {
        let table = self.table();
        if table.is_empty() {
            return false;
        }
        probes(oid, self.bits, self.k).all(|(byte, mask)| table[byte] & mask != 0)
    }

    /// Set the probe bits for `oid`, returning the new entry count
    pub fn add(&mut self, oid: &Oid) -> Result<usize> {
        let (bits, k) = (self.bits, self.k);
        let table = self.table_mut()?;
        for (byte, mask) in probes(oid, bits, k) {
            table[byte] |= mask;
        }
        self.entries = self.entries.wrapping_add(1);
        self.dirty = true;
        Ok(self.entries as usize)
    }

    /// Fold every id of an index into the filter
    pub fn add_idx(&mut self, idx: &PackIdx) -> Result<()> {
        let (bits, k) = (self.bits, self.k);
        let table = self.table_mut()?;
        for oid in idx.iter() {
            for (byte, mask) in probes(&oid, bits, k) {
                table[byte] |= mask;
            }
        }
        self.entries = self.entries.wrapping_add(idx.len() as u32);
        self.idxnames.push(idx.basename());
        self.dirty = true;
        Ok(())
    }

    /// Zero the table, leaving a filter that answers "no" to everything
    pub fn ruin(&mut self) -> Result<()> {
        self.table_mut()?.fill(0);
        self.dirty = true;
        Ok(())
    }

    /// Every id of every given index must probe positive
    pub fn check(&self, indexes: &[&dyn PackIndexLike]) -> Result<()> {
        for index in indexes {
            if let Some(oid) = index.iter().find(|oid| !self.contains(oid)) {
                return Err(Error::corrupt(
                    &self.path,
                    "bloom",
                    format!("{oid} from {} is missing", index.path().display()),
                ));
            }
        }
        Ok(())
    }

    /// Write the entry count, table and name list back to the file
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let Some(table) = self.table.take() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        self.dirty = false;
        let table_end = HEADER_SIZE + (1usize << self.bits);
        let mut entries = [0u8; 4];
        BigEndian::write_u32(&mut entries, self.entries);
        match table {
            Table::ReadOnly(_) => return Ok(()),
            Table::Shared(mut map) => {
                map[12..16].copy_from_slice(&entries);
                map.flush()?;
            }
            Table::Private(mut map) => {
                map[12..16].copy_from_slice(&entries);
                self.file.write_all_at(&map[..table_end], 0)?;
            }
        }
        self.file.set_len(table_end as u64)?;
        self.file.write_all_at(self.idxnames.join("\0").as_bytes(), table_end as u64)?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for ShaBloom {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.finish() {
                warn!(path = %self.path.display(), error = %e, "bloom: failed to write back filter");
            }
        }
    }
}

/// Bring the pack directory's bloom filter up to date with its `.idx` files
///
/// New indexes are added in place when the predicted false-positive rate
/// stays under the configured limit; otherwise, or when the existing filter
/// is unusable, it is rebuilt from every index. Either way the new filter
/// is built in a temp file and renamed over the old one. Returns the path
/// written, or `None` when nothing changed.
pub fn bloom_dir(dir: &Path, config: &BloomConfig, force: bool) -> Result<Option<PathBuf>> {
    let target = dir.join(BLOOM_FILE_NAME);
    let k = (config.k != 0).then_some(config.k);

    let mut existing = if force {
        None
    } else {
        match ShaBloom::open(&target) {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "bloom: existing filter is invalid, regenerating");
                None
            }
        }
    };

    let mut add = Vec::new();
    let mut rest = Vec::new();
    let (mut add_count, mut rest_count) = (0usize, 0usize);
    for path in list_dir(dir, "idx")? {
        let idx = match PackIdx::open(&path) {
            Ok(idx) => idx,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "bloom: skipping unreadable index");
                continue;
            }
        };
        let known = existing
            .as_ref()
            .is_some_and(|b| b.idxnames().contains(&basename(&path)));
        if known {
            rest_count += idx.len();
            rest.push(idx);
        } else {
            add_count += idx.len();
            add.push(idx);
        }
    }

    if add.is_empty() {
        debug!("bloom: nothing to do");
        return Ok(None);
    }

    if let Some(b) = &existing {
        let reason = if b.entries() != rest_count {
            Some(format!("size {} != idx total {}", b.entries(), rest_count))
        } else if k.is_some_and(|k| k != b.k()) {
            Some(format!("new k {} != existing k {}", config.k, b.k()))
        } else if b.bits() < max_bloom_bits(b.k()) && b.pfalse_positive(add_count) > config.max_false_positive {
            Some(format!(
                "adding {} entries gives {:.2}% false positives",
                add_count,
                b.pfalse_positive(add_count)
            ))
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(%reason, "bloom: regenerating");
            existing = None;
        }
    }

    let tmp = tempfile::Builder::new()
        .prefix("tmp-bloom-")
        .tempfile_in(dir)?;
    let mut bloom = match existing {
        Some(old) => {
            drop(old);
            std::fs::copy(&target, tmp.path())?;
            ShaBloom::open_rw(tmp.path(), add_count)?
                .ok_or_else(|| Error::corrupt(tmp.path(), "bloom", "temp copy vanished"))?
        }
        None => {
            add.append(&mut rest);
            add_count += rest_count;
            ShaBloom::create(tmp.path(), add_count, k)?
        }
    };
    for idx in &add {
        bloom.add_idx(idx)?;
    }
    let entries = bloom.entries();
    bloom.close()?;
    tmp.persist(&target).map_err(|e| e.error)?;
    info!(path = %target.display(), files = add.len(), entries, "bloom written");
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::oid::sha1_bytes;

    fn oid(n: u64) -> Oid {
        sha1_bytes(&n.to_le_bytes())
    }

    #[test]
    fn test_create_sizes_table() {
        let dir = tempfile::tempdir().unwrap();
        let b = ShaBloom::create(dir.path().join("a.bloom"), 1000, None).unwrap();
        // floor(log2(1000 * 4))
        assert_eq!(b.bits(), 11);
        assert_eq!(b.k(), 5);
        assert_eq!(b.entries(), 0);
        let b = ShaBloom::create(dir.path().join("b.bloom"), 1000, Some(4)).unwrap();
        assert_eq!(b.k(), 4);
        assert!(ShaBloom::create(dir.path().join("c.bloom"), 1000, Some(3)).is_err());
    }

    #[test]
    fn test_no_false_negatives() {
        let dir = tempfile::tempdir().unwrap();
        for k in [4, 5] {
            for n in [10u64, 1000, 20_000] {
                let path = dir.path().join(format!("k{k}-{n}.bloom"));
                // undersized on purpose for the last fill ratio
                let mut b = ShaBloom::create(&path, 1000, Some(k)).unwrap();
                for i in 0..n {
                    b.add(&oid(i)).unwrap();
                }
                for i in 0..n {
                    assert!(b.contains(&oid(i)), "k={k} n={n} lost {i}");
                }
                b.close().unwrap();
                let b = ShaBloom::open(&path).unwrap().unwrap();
                assert_eq!(b.entries(), n as usize);
                assert!((0..n).all(|i| b.contains(&oid(i))));
            }
        }
    }

    #[test]
    fn test_false_positive_rate_tracks_prediction() {
        let dir = tempfile::tempdir().unwrap();
        for k in [4, 5] {
            for fill in [2_000u64, 8_000, 16_000] {
                let mut b = ShaBloom::create(dir.path().join(format!("{k}-{fill}.bloom")), 8_000, Some(k)).unwrap();
                for i in 0..fill {
                    b.add(&oid(i)).unwrap();
                }
                let predicted = b.pfalse_positive(0);
                let trials = 50_000u64;
                let hits = (1_000_000..1_000_000 + trials).filter(|i| b.contains(&oid(*i))).count();
                let measured = hits as f64 * 100.0 / trials as f64;
                assert!(
                    measured <= predicted * 3.0 + 0.05,
                    "k={k} fill={fill}: measured {measured:.3}% predicted {predicted:.3}%"
                );
                assert!(
                    measured >= predicted / 3.0 - 0.05,
                    "k={k} fill={fill}: measured {measured:.3}% predicted {predicted:.3}%"
                );
            }
        }
    }

    #[test]
    fn test_pfalse_positive_grows_with_entries() {
        let dir = tempfile::tempdir().unwrap();
        let b = ShaBloom::create(dir.path().join("a.bloom"), 1000, None).unwrap();
        assert_eq!(b.pfalse_positive(0), 0.0);
        let small = b.pfalse_positive(100);
        let large = b.pfalse_positive(10_000);
        assert!(small > 0.0 && small < large && large <= 100.0);
    }

    #[test]
    fn test_ruin_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = ShaBloom::create(dir.path().join("a.bloom"), 100, None).unwrap();
        b.add(&oid(1)).unwrap();
        assert!(b.contains(&oid(1)));
        b.ruin().unwrap();
        assert!(!b.contains(&oid(1)));
    }

    #[test]
    fn test_read_only_rejects_add() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bloom");
        ShaBloom::create(&path, 100, None).unwrap().close().unwrap();
        let mut b = ShaBloom::open(&path).unwrap().unwrap();
        assert!(b.add(&oid(1)).is_err());
    }

    #[test]
    fn test_open_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShaBloom::open(dir.path().join("nope.bloom")).unwrap().is_none());
        let path = dir.path().join("bad.bloom");
        std::fs::write(&path, b"BLOM\0\0\0\x01\0\x02\0\x05\0\0\0\0").unwrap();
        assert!(matches!(
            ShaBloom::open(&path),
            Err(Error::UnsupportedVersion { version: 1, .. })
        ));
        // claims a 2^20 byte table
        std::fs::write(&path, b"BLOM\0\0\0\x02\0\x14\0\x05\0\0\0\0").unwrap();
        assert!(matches!(ShaBloom::open(&path), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_names_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let idx_path = dir.path().join("pack-x.idx");
        let mut entries = vec![crate::idx::IdxEntry {
            oid: oid(7),
            crc: 0,
            offset: 12,
        }];
        std::fs::write(&idx_path, crate::idx::build(&mut entries, &Oid::EMPTY)).unwrap();
        let idx = PackIdx::open(&idx_path).unwrap();

        let path = dir.path().join("a.bloom");
        let mut b = ShaBloom::create(&path, 10, None).unwrap();
        b.add_idx(&idx).unwrap();
        b.close().unwrap();

        let b = ShaBloom::open(&path).unwrap().unwrap();
        assert_eq!(b.idxnames(), ["pack-x.idx"]);
        assert_eq!(b.entries(), 1);
        b.check(&[&idx]).unwrap();
    }
}
