//! Packfile writer and reader
//!
//! A pack is `"PACK" + u32 version + u32 count`, the packed objects, then a
//! SHA-1 of everything before it. The writer streams objects into a temp
//! file in the pack directory and only renames it (and its index) into
//! place once the trailer and index are complete.

use crate::error::{Error, Result};
use crate::idx::{self, IdxEntry, PackIdx};
use byteorder::{BigEndian, ByteOrder};
use cairn_core::commit::Commit;
use cairn_core::config::RepoConfig;
use cairn_core::object::{self, ObjectKind};
use cairn_core::oid::{IncrementalHasher, OID_LEN};
use cairn_core::store::{ObjectSink, ObjectSource};
use cairn_core::{atomic_write, Oid};
use memmap2::Mmap;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PACK_MAGIC: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
const PACK_HEADER_SIZE: usize = 12;

/// Answers "is this object already stored somewhere?" for the writer
pub trait ObjectExists {
    fn exists(&mut self, oid: &Oid) -> bool;

    /// Note an object the writer has just stored
    fn add(&mut self, _oid: &Oid) {}

    /// Take back an object from `add` whose pack was aborted
    fn forget(&mut self, _oid: &Oid) {}

    /// Called after the writer finalizes a pack
    fn pack_finished(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Oracle that knows about nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOracle;

impl ObjectExists for NoOracle {
    fn exists(&mut self, _oid: &Oid) -> bool {
        false
    }
}

impl<F: FnMut(&Oid) -> bool> ObjectExists for F {
    fn exists(&mut self, oid: &Oid) -> bool {
        self(oid)
    }
}

struct OpenPack {
    out: BufWriter<tempfile::NamedTempFile>,
    entries: Vec<IdxEntry>,
}

/// Streams objects into packs, rolling over at the configured thresholds
pub struct PackWriter<O: ObjectExists = NoOracle> {
    pack_dir: PathBuf,
    config: RepoConfig,
    oracle: O,
    run_midx: bool,
    current: Option<OpenPack>,
    written: HashSet<Oid>,
    outbytes: u64,
    count: u64,
    finished: Vec<String>,
}

impl PackWriter<NoOracle> {
    /// Writer with no external existence check
    pub fn new(pack_dir: impl Into<PathBuf>, config: RepoConfig) -> Self {
        Self::with_oracle(pack_dir, config, NoOracle)
    }
}

impl<O: ObjectExists> PackWriter<O> {
    pub fn with_oracle(pack_dir: impl Into<PathBuf>, config: RepoConfig, oracle: O) -> Self {
        Self {
            pack_dir: pack_dir.into(),
            config,
            oracle,
            run_midx: true,
            current: None,
            written: HashSet::new(),
            outbytes: 0,
            count: 0,
            finished: Vec::new(),
        }
    }

    /// Whether automatic rollovers also consolidate midx and bloom files
    pub fn set_run_midx(&mut self, run_midx: bool) {
        self.run_midx = run_midx;
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle
    }

    /// Objects in the pack currently being written
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Bytes in the pack currently being written
    pub fn outbytes(&self) -> u64 {
        self.outbytes
    }

    /// Basenames of packs finalized by this writer, oldest first
    pub fn finished_packs(&self) -> &[String] {
        &self.finished
    }

    fn open(&mut self) -> Result<&mut OpenPack> {
        if self.current.is_none() {
            let tmp = tempfile::Builder::new()
                .prefix("tmp-pack-")
                .suffix(".pack")
                .tempfile_in(&self.pack_dir)?;
            let mut out = BufWriter::new(tmp);
            out.write_all(PACK_MAGIC)?;
            out.write_all(&PACK_VERSION.to_be_bytes())?;
            out.write_all(&0u32.to_be_bytes())?;
            self.outbytes = PACK_HEADER_SIZE as u64;
            self.count = 0;
            self.current = Some(OpenPack {
                out,
                entries: Vec::new(),
            });
        }
        // just populated above
        self.current
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("pack not open")))
    }

    /// Whether `oid` was written this session or is known to the oracle
    pub fn exists(&mut self, oid: &Oid) -> bool {
        self.written.contains(oid) || self.oracle.exists(oid)
    }

    /// Append an object unconditionally
    pub fn just_write(&mut self, oid: Oid, kind: ObjectKind, content: &[u8]) -> Result<()> {
        let encoded = object::encode_packed(kind, content, self.config.pack.compression)?;
        // a fresh pack starts outbytes past its header
        self.open()?;
        let offset = self.outbytes;
        let pack = self.open()?;
        pack.out.write_all(&encoded)?;
        pack.entries.push(IdxEntry {
            oid,
            crc: crc32fast::hash(&encoded),
            offset,
        });
        self.outbytes += encoded.len() as u64;
        self.count += 1;
        self.written.insert(oid);
        self.oracle.add(&oid);

        if self.outbytes >= self.config.pack.max_bytes || self.count >= self.config.pack.max_objects {
            debug!(
                bytes = self.outbytes,
                objects = self.count,
                "pack size limit reached, rolling over"
            );
            self.breakpoint()?;
        }
        Ok(())
    }

    /// Write an object unless it already exists; returns its id either way
    pub fn maybe_write(&mut self, kind: ObjectKind, content: &[u8]) -> Result<Oid> {
        let oid = object::hash_object(kind, content);
        if !self.exists(&oid) {
            self.just_write(oid, kind, content)?;
        }
        Ok(oid)
    }

    pub fn new_commit(&mut self, commit: &Commit) -> Result<Oid> {
        self.maybe_write(ObjectKind::Commit, &commit.encode())
    }

    /// Finalize the current pack and keep going with a fresh one
    pub fn breakpoint(&mut self) -> Result<Option<String>> {
        let run_midx = self.run_midx;
        self.end(run_midx)
    }

    /// Discard everything written since the last finalized pack
    pub fn abort(&mut self) {
        if let Some(pack) = self.current.take() {
            debug!(objects = pack.entries.len(), "aborting pack");
            for e in &pack.entries {
                self.written.remove(&e.oid);
                self.oracle.forget(&e.oid);
            }
            // dropping the temp file deletes it
        }
        self.outbytes = 0;
        self.count = 0;
    }

    /// Finalize the current pack, returning its basename (`pack-<hex>`)
    ///
    /// Returns `None` if nothing was written. With `run_midx` the pack
    /// directory's midx and bloom files are brought up to date afterwards.
    pub fn close(mut self, run_midx: bool) -> Result<Option<String>> {
        self.end(run_midx)
    }

    fn end(&mut self, run_midx: bool) -> Result<Option<String>> {
        let Some(pack) = self.current.take() else {
            return Ok(None);
        };
        self.outbytes = 0;
        self.count = 0;
        if pack.entries.is_empty() {
            debug!("no objects written, discarding empty pack");
            return Ok(None);
        }
        let name = finalize_pack(&self.pack_dir, pack)?;
        if run_midx {
            crate::midx::midx_dir(&self.pack_dir, &self.config.midx, false)?;
            crate::bloom::bloom_dir(&self.pack_dir, &self.config.bloom, false)?;
        }
        self.oracle.pack_finished()?;
        self.finished.push(name.clone());
        Ok(Some(name))
    }
}

impl<O: ObjectExists> ObjectSink for PackWriter<O> {
    type Error = Error;

    fn write_object(&mut self, kind: ObjectKind, content: &[u8]) -> Result<Oid> {
        self.maybe_write(kind, content)
    }
}

impl<O: ObjectExists> Drop for PackWriter<O> {
    fn drop(&mut self) {
        if let Some(pack) = &self.current {
            if !pack.entries.is_empty() {
                warn!(
                    objects = pack.entries.len(),
                    "pack writer dropped without close, discarding unfinished pack"
                );
            }
        }
    }
}

/// Patch the header, append the trailer, build the index and rename both
/// into place.
fn finalize_pack(pack_dir: &Path, pack: OpenPack) -> Result<String> {
    let OpenPack { out, mut entries } = pack;
    let mut tmp = out.into_inner().map_err(|e| e.into_error())?;
    let count = entries.len() as u32;

    // 1. object count
    let file = tmp.as_file_mut();
    file.seek(SeekFrom::Start(8))?;
    file.write_all(&count.to_be_bytes())?;

    // 2. whole-pack checksum
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = IncrementalHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let pack_sha = hasher.finalize();
    file.seek(SeekFrom::End(0))?;
    file.write_all(pack_sha.as_bytes())?;
    file.sync_all()?;

    // 3. index
    let idx_bytes = idx::build(&mut entries, &pack_sha);

    // 4. name from the sorted object ids
    let mut name_hasher = IncrementalHasher::new();
    for e in &entries {
        name_hasher.update(e.oid.as_bytes());
    }
    let name = format!("pack-{}", name_hasher.finalize());
    let pack_path = pack_dir.join(format!("{name}.pack"));
    let idx_path = pack_dir.join(format!("{name}.idx"));

    // 5. pack first, then the index readers discover it by
    if pack_path.exists() && idx_path.exists() {
        debug!(%name, "identical pack already present, discarding ours");
        return Ok(name);
    }
    tmp.persist(&pack_path).map_err(|e| e.error)?;
    atomic_write(&idx_path, &idx_bytes)?;
    debug!(%name, objects = count, "pack finalized");
    Ok(name)
}

/// A finalized pack opened together with its index
pub struct PackFile {
    idx: PackIdx,
    pack_path: PathBuf,
    map: Mmap,
}

impl PackFile {
    /// Open `pack-*.idx` and the `.pack` beside it
    pub fn open(idx_path: impl AsRef<Path>) -> Result<Self> {
        let idx = PackIdx::open(idx_path)?;
        let pack_path = idx.pack_path();
        let file = File::open(&pack_path)?;
        let len = file.metadata()?.len() as usize;
        if len < PACK_HEADER_SIZE + OID_LEN {
            return Err(Error::corrupt(pack_path, "pack", "file too small"));
        }
        // SAFETY: finalized packs are never modified in place
        let map = unsafe { Mmap::map(&file)? };
        if &map[0..4] != PACK_MAGIC {
            return Err(Error::corrupt(pack_path, "pack", "invalid magic"));
        }
        let version = BigEndian::read_u32(&map[4..8]);
        if version != 2 && version != 3 {
            return Err(Error::UnsupportedVersion {
                path: pack_path,
                what: "pack",
                version,
            });
        }
        let count = BigEndian::read_u32(&map[8..12]) as usize;
        if count != idx.len() {
            return Err(Error::corrupt(
                pack_path,
                "pack",
                format!("header says {} objects, index has {}", count, idx.len()),
            ));
        }
        Ok(Self {
            idx,
            pack_path,
            map,
        })
    }

    pub fn idx(&self) -> &PackIdx {
        &self.idx
    }

    pub fn pack_path(&self) -> &Path {
        &self.pack_path
    }

    fn body_end(&self) -> usize {
        self.map.len() - OID_LEN
    }

    /// Decode the object stored at `offset`
    pub fn read_at(&self, offset: u64) -> Result<(ObjectKind, Vec<u8>)> {
        let offset = offset as usize;
        if offset < PACK_HEADER_SIZE || offset >= self.body_end() {
            return Err(Error::corrupt(
                &self.pack_path,
                "pack",
                format!("offset {offset} outside object data"),
            ));
        }
        Ok(object::decode_packed(&self.map[offset..self.body_end()])?)
    }

    /// Decode an object by id, `Ok(None)` if this pack lacks it
    pub fn read(&self, oid: &Oid) -> Result<Option<(ObjectKind, Vec<u8>)>> {
        match self.idx.find_offset(oid) {
            Some(offset) => self.read_at(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Check the trailer, the index's copy of it, and every object
    pub fn verify(&self) -> Result<()> {
        let mut hasher = IncrementalHasher::new();
        hasher.update(&self.map[..self.body_end()]);
        let computed = hasher.finalize();
        let mut trailer = [0u8; OID_LEN];
        trailer.copy_from_slice(&self.map[self.body_end()..]);
        if computed != Oid::from_bytes(trailer) {
            return Err(Error::corrupt(&self.pack_path, "pack", "trailer checksum mismatch"));
        }
        if computed != self.idx.pack_sha() {
            return Err(Error::corrupt(
                self.idx.path(),
                "pack index",
                "recorded pack checksum does not match pack",
            ));
        }
        self.idx.verify_checksum()?;

        let mut extents: Vec<(u64, usize)> =
            (0..self.idx.len()).map(|i| (self.idx.offset_at(i), i)).collect();
        extents.sort_unstable();
        for (n, &(offset, i)) in extents.iter().enumerate() {
            let end = extents
                .get(n + 1)
                .map(|(next, _)| *next as usize)
                .unwrap_or(self.body_end());
            let start = offset as usize;
            if start >= end || end > self.body_end() {
                return Err(Error::corrupt(&self.pack_path, "pack", format!("bad extent at {start}")));
            }
            if crc32fast::hash(&self.map[start..end]) != self.idx.crc_at(i) {
                return Err(Error::corrupt(&self.pack_path, "pack", format!("crc mismatch at {start}")));
            }
            let oid = self.idx.oid_at(i);
            let (kind, content) = self.read_at(offset)?;
            if object::hash_object(kind, &content) != oid {
                return Err(Error::corrupt(
                    &self.pack_path,
                    "pack",
                    format!("object at {start} does not hash to {oid}"),
                ));
            }
        }
        Ok(())
    }
}

impl ObjectSource for PackFile {
    type Error = Error;

    fn read_object(&self, oid: &Oid) -> Result<(ObjectKind, Vec<u8>)> {
        self.read(oid)?.ok_or(Error::NotFound(*oid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::object::hash_object;

    fn quiet_config() -> RepoConfig {
        RepoConfig::default()
    }

    fn list_packs(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_close_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(dir.path(), quiet_config());
        let blobs: Vec<Vec<u8>> = (0..50).map(|i| format!("object {i}").into_bytes()).collect();
        let oids: Vec<Oid> = blobs.iter().map(|b| w.new_blob(b).unwrap()).collect();
        let name = w.close(false).unwrap().expect("pack written");

        let pack = PackFile::open(dir.path().join(format!("{name}.idx"))).unwrap();
        assert_eq!(pack.idx().len(), 50);
        for (oid, data) in oids.iter().zip(&blobs) {
            let (kind, content) = pack.read(oid).unwrap().unwrap();
            assert_eq!(kind, ObjectKind::Blob);
            assert_eq!(&content, data);
        }
        pack.verify().unwrap();
    }

    #[test]
    fn test_duplicates_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(dir.path(), quiet_config());
        let a = w.new_blob(b"same").unwrap();
        let b = w.new_blob(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(w.count(), 1);
        w.close(false).unwrap();
    }

    #[test]
    fn test_oracle_skips_known_objects() {
        let dir = tempfile::tempdir().unwrap();
        let known = hash_object(ObjectKind::Blob, b"remote has this");
        let mut w = PackWriter::with_oracle(dir.path(), quiet_config(), move |oid: &Oid| *oid == known);
        assert_eq!(w.new_blob(b"remote has this").unwrap(), known);
        assert_eq!(w.count(), 0);
        assert_eq!(w.close(false).unwrap(), None);
        assert!(list_packs(dir.path()).is_empty());
    }

    #[test]
    fn test_empty_close_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let w = PackWriter::new(dir.path(), quiet_config());
        assert_eq!(w.close(false).unwrap(), None);
        assert!(list_packs(dir.path()).is_empty());
    }

    #[test]
    fn test_abort_discards_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(dir.path(), quiet_config());
        w.new_blob(b"doomed").unwrap();
        assert_eq!(list_packs(dir.path()).len(), 1);
        w.abort();
        assert!(list_packs(dir.path()).is_empty());
        // the aborted object may be written again
        w.new_blob(b"doomed").unwrap();
        assert_eq!(w.count(), 1);
        assert!(w.close(false).unwrap().is_some());
    }

    #[test]
    fn test_drop_without_close_discards() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut w = PackWriter::new(dir.path(), quiet_config());
            w.new_blob(b"never finalized").unwrap();
        }
        assert!(list_packs(dir.path()).is_empty());
    }

    #[test]
    fn test_rollover_by_object_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config();
        config.pack.max_objects = 10;
        let mut w = PackWriter::new(dir.path(), config);
        w.set_run_midx(false);
        for i in 0..25 {
            w.new_blob(format!("blob {i}").as_bytes()).unwrap();
        }
        assert_eq!(w.finished_packs().len(), 2);
        assert_eq!(w.count(), 5);
        w.close(false).unwrap();
        let idx_count = list_packs(dir.path())
            .iter()
            .filter(|n| n.ends_with(".idx"))
            .count();
        assert_eq!(idx_count, 3);
    }

    #[test]
    fn test_first_object_of_each_pack_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config();
        config.pack.max_objects = 2;
        let mut w = PackWriter::new(dir.path(), config);
        w.set_run_midx(false);
        let first = w.new_blob(b"first").unwrap();
        w.new_blob(b"second").unwrap();
        // rolled over; this one opens the next pack
        let third = w.new_blob(b"third").unwrap();
        let second_pack = w.close(false).unwrap().unwrap();

        let names = list_packs(dir.path());
        let first_idx = names
            .iter()
            .find(|n| n.ends_with(".idx") && !n.starts_with(&second_pack))
            .unwrap();
        let pack = PackFile::open(dir.path().join(first_idx)).unwrap();
        assert_eq!(pack.idx().find_offset(&first), Some(PACK_HEADER_SIZE as u64));
        assert_eq!(pack.read(&first).unwrap().unwrap().1, b"first");
        pack.verify().unwrap();

        let pack = PackFile::open(dir.path().join(format!("{second_pack}.idx"))).unwrap();
        assert_eq!(pack.idx().find_offset(&third), Some(PACK_HEADER_SIZE as u64));
        assert_eq!(pack.read(&third).unwrap().unwrap().1, b"third");
        pack.verify().unwrap();
    }

    #[test]
    fn test_first_object_after_abort_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(dir.path(), quiet_config());
        w.new_blob(b"thrown away").unwrap();
        w.abort();
        let kept = w.new_blob(b"kept").unwrap();
        let name = w.close(false).unwrap().unwrap();
        let pack = PackFile::open(dir.path().join(format!("{name}.idx"))).unwrap();
        assert_eq!(pack.read(&kept).unwrap().unwrap().1, b"kept");
        pack.verify().unwrap();
    }

    #[test]
    fn test_pack_name_from_sorted_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(dir.path(), quiet_config());
        let mut oids = vec![w.new_blob(b"b").unwrap(), w.new_blob(b"a").unwrap()];
        let name = w.close(false).unwrap().unwrap();
        oids.sort();
        let mut hasher = IncrementalHasher::new();
        for oid in &oids {
            hasher.update(oid.as_bytes());
        }
        assert_eq!(name, format!("pack-{}", hasher.finalize()));
    }

    #[test]
    fn test_identical_pack_twice_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = PackWriter::new(dir.path(), quiet_config());
        first.new_blob(b"x").unwrap();
        let a = first.close(false).unwrap();
        let mut second = PackWriter::new(dir.path(), quiet_config());
        second.new_blob(b"x").unwrap();
        let b = second.close(false).unwrap();
        assert_eq!(a, b);
        assert_eq!(list_packs(dir.path()).len(), 2);
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(dir.path(), quiet_config());
        w.new_blob(&vec![9u8; 4096]).unwrap();
        let name = w.close(false).unwrap().unwrap();
        let pack_path = dir.path().join(format!("{name}.pack"));
        let mut bytes = std::fs::read(&pack_path).unwrap();
        bytes[20] ^= 0x55;
        std::fs::write(&pack_path, &bytes).unwrap();
        let pack = PackFile::open(dir.path().join(format!("{name}.idx"))).unwrap();
        assert!(pack.verify().is_err());
    }

    #[test]
    fn test_delta_entries_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PackWriter::new(dir.path(), quiet_config());
        let oid = w.new_blob(b"pretend delta").unwrap();
        let name = w.close(false).unwrap().unwrap();
        let pack_path = dir.path().join(format!("{name}.pack"));
        let mut bytes = std::fs::read(&pack_path).unwrap();
        // retag the first object as an offset delta
        bytes[12] = (bytes[12] & 0x8f) | (object::OFS_DELTA << 4);
        std::fs::write(&pack_path, &bytes).unwrap();
        let pack = PackFile::open(dir.path().join(format!("{name}.idx"))).unwrap();
        assert!(matches!(
            pack.read(&oid),
            Err(Error::Object(cairn_core::Error::UnsupportedDelta(6)))
        ));
    }
}
