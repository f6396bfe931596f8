//! Multi-pack index (`.midx`) v4
//!
//! # Layout
//! ```text
//! +-------------------+
//! | "MIDX"            |
//! | Version (4B)      |  big-endian 4
//! | Bits (4B)         |  width of the fanout prefix
//! +-------------------+
//! | Fanout            |  2^bits * u32 cumulative counts by prefix
//! | OID table         |  N * 20 bytes, ascending across all sources
//! | Which table       |  N * u32 index into the name list
//! +-------------------+
//! | Names             |  NUL-joined basenames of the source .idx files
//! +-------------------+
//! ```
//!
//! `midx_dir` keeps the number of indexes in a pack directory bounded by
//! merging the smallest ones together.

use crate::error::{Error, Result};
use crate::idx::{basename, ObjectLocation, PackIdx, PackIndexLike};
use crate::idxlist::PackIndex;
use byteorder::{BigEndian, ByteOrder};
use cairn_core::config::MidxConfig;
use cairn_core::oid::{IncrementalHasher, OID_LEN};
use cairn_core::{atomic_write, MergeIter, Oid};
use memmap2::Mmap;
use std::cell::OnceCell;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

pub const MIDX_MAGIC: &[u8; 4] = b"MIDX";
pub const MIDX_VERSION: u32 = 4;
const HEADER_SIZE: usize = 12;
/// Object ids that fit in one 4 KiB page
const SHA_PER_PAGE: usize = 4096 / OID_LEN;
const MAX_BITS: u32 = 24;

/// Fanout width putting roughly one page of ids in each bucket
pub fn fanout_bits(total: usize) -> u32 {
    let pages = (total / SHA_PER_PAGE).max(1);
    let bits = usize::BITS - (pages - 1).leading_zeros();
    bits.min(MAX_BITS)
}

/// Memory-mapped multi-pack index
pub struct PackMidx {
    path: PathBuf,
    map: Mmap,
    bits: u32,
    count: usize,
    idxnames: Vec<String>,
    sources: Vec<OnceCell<PackIdx>>,
}

impl std::fmt::Debug for PackMidx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackMidx")
            .field("path", &self.path)
            .field("bits", &self.bits)
            .field("count", &self.count)
            .field("idxnames", &self.idxnames)
            .finish()
    }
}

impl PackMidx {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: midx files are written once and renamed into place
        let map = unsafe { Mmap::map(&file)? };
        Self::from_map(path, map)
    }

    fn from_map(path: PathBuf, map: Mmap) -> Result<Self> {
        if map.len() < HEADER_SIZE {
            return Err(Error::corrupt(path, "midx", "file too small"));
        }
        if &map[0..4] != MIDX_MAGIC {
            return Err(Error::corrupt(path, "midx", "invalid magic"));
        }
        let version = BigEndian::read_u32(&map[4..8]);
        if version != MIDX_VERSION {
            return Err(Error::UnsupportedVersion {
                path,
                what: "midx",
                version,
            });
        }
        let bits = BigEndian::read_u32(&map[8..12]);
        if bits > MAX_BITS {
            return Err(Error::corrupt(path, "midx", format!("fanout width {bits} out of range")));
        }
        let entries = 1usize << bits;
        let fanout_end = HEADER_SIZE + entries * 4;
        if map.len() < fanout_end {
            return Err(Error::corrupt(path, "midx", "truncated fanout table"));
        }
        let mut prev = 0u32;
        for i in 0..entries {
            let v = BigEndian::read_u32(&map[HEADER_SIZE + i * 4..]);
            if v < prev {
                return Err(Error::corrupt(path, "midx", "fanout table is not monotonic"));
            }
            prev = v;
        }
        let count = prev as usize;
        let names_ofs = fanout_end + count * (OID_LEN + 4);
        if map.len() < names_ofs {
            return Err(Error::corrupt(
                path,
                "midx",
                format!("{count} objects need {names_ofs} bytes, file has {}", map.len()),
            ));
        }
        let idxnames: Vec<String> = map[names_ofs..]
            .split(|b| *b == 0)
            .filter(|n| !n.is_empty())
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .collect();
        let midx = Self {
            sources: idxnames.iter().map(|_| OnceCell::new()).collect(),
            path,
            map,
            bits,
            count,
            idxnames,
        };
        for i in 0..midx.count {
            if midx.which_at(i) as usize >= midx.idxnames.len() {
                return Err(Error::corrupt(
                    &midx.path,
                    "midx",
                    format!("entry {i} names source {} of {}", midx.which_at(i), midx.idxnames.len()),
                ));
            }
        }
        Ok(midx)
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    fn fanout(&self, prefix: usize) -> usize {
        BigEndian::read_u32(&self.map[HEADER_SIZE + prefix * 4..]) as usize
    }

    fn sha_ofs(&self) -> usize {
        HEADER_SIZE + (1usize << self.bits) * 4
    }

    fn which_ofs(&self) -> usize {
        self.sha_ofs() + self.count * OID_LEN
    }

    fn oid_bytes(&self, i: usize) -> &[u8] {
        let start = self.sha_ofs() + i * OID_LEN;
        &self.map[start..start + OID_LEN]
    }

    pub fn oid_at(&self, i: usize) -> Oid {
        let mut bytes = [0u8; OID_LEN];
        bytes.copy_from_slice(self.oid_bytes(i));
        Oid::from_bytes(bytes)
    }

    /// Position in `idxnames` of the index holding entry `i`
    pub fn which_at(&self, i: usize) -> u32 {
        BigEndian::read_u32(&self.map[self.which_ofs() + i * 4..])
    }

    /// Interpolation search inside the fanout bucket
    pub fn find_index(&self, oid: &Oid) -> Option<usize> {
        let want = oid.as_bytes().as_slice();
        let prefix = oid.extract_bits(self.bits) as usize;
        let mut lo = if prefix == 0 { 0 } else { self.fanout(prefix - 1) };
        let mut hi = self.fanout(prefix);
        let key = word64(want);
        while lo < hi {
            let lo_key = word64(self.oid_bytes(lo));
            let hi_key = word64(self.oid_bytes(hi - 1));
            if key < lo_key || key > hi_key {
                return None;
            }
            let span = (hi - 1 - lo) as u128;
            let mid = if hi_key == lo_key {
                lo + (hi - lo) / 2
            } else {
                lo + ((key - lo_key) as u128 * span / (hi_key - lo_key) as u128) as usize
            };
            match self.oid_bytes(mid).cmp(want) {
                std::cmp::Ordering::Equal => return Some(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    pub fn exists(&self, oid: &Oid) -> bool {
        self.find_index(oid).is_some()
    }

    /// Basename of the source index holding `oid`
    pub fn find_source(&self, oid: &Oid) -> Option<&str> {
        self.find_index(oid)
            .map(|i| self.idxnames[self.which_at(i) as usize].as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        (0..self.count).map(move |i| self.oid_at(i))
    }

    /// Ids paired with their position in `idxnames`
    pub fn iter_with_source(&self) -> impl Iterator<Item = (Oid, u32)> + '_ {
        (0..self.count).map(move |i| (self.oid_at(i), self.which_at(i)))
    }

    pub fn idxnames(&self) -> &[String] {
        &self.idxnames
    }

    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// First source index that is no longer on disk
    pub fn missing_idx(&self) -> Option<&str> {
        self.idxnames
            .iter()
            .find(|n| !self.dir().join(n).exists())
            .map(|n| n.as_str())
    }

    fn source(&self, which: usize) -> Result<&PackIdx> {
        let cell = &self.sources[which];
        if let Some(idx) = cell.get() {
            return Ok(idx);
        }
        let idx = PackIdx::open(self.dir().join(&self.idxnames[which]))?;
        Ok(cell.get_or_init(|| idx))
    }
}

impl PackIndexLike for PackMidx {
    fn path(&self) -> &Path {
        &self.path
    }

    fn len(&self) -> usize {
        self.count
    }

    fn exists(&self, oid: &Oid) -> bool {
        PackMidx::exists(self, oid)
    }

    fn find(&self, oid: &Oid) -> Result<Option<ObjectLocation>> {
        let Some(i) = self.find_index(oid) else {
            return Ok(None);
        };
        let source = self.source(self.which_at(i) as usize)?;
        match source.find_offset(oid) {
            Some(offset) => Ok(Some(ObjectLocation {
                idx: source.path().to_path_buf(),
                offset,
            })),
            None => Err(Error::corrupt(
                &self.path,
                "midx",
                format!("{oid} is not in {}", source.basename()),
            )),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Oid> + '_> {
        Box::new(PackMidx::iter(self))
    }

    fn idxnames(&self) -> Vec<String> {
        self.idxnames.clone()
    }
}

fn word64(bytes: &[u8]) -> u64 {
    BigEndian::read_u64(&bytes[..8])
}

/// Serialize a midx merging `inputs`
pub fn build(inputs: &[PackIndex]) -> Vec<u8> {
    let total: usize = inputs.iter().map(|p| p.len()).sum();
    let bits = fanout_bits(total);

    let mut idxnames: Vec<String> = Vec::new();
    let mut sources = Vec::with_capacity(inputs.len());
    for input in inputs {
        sources.push(input.iter_with_source(idxnames.len() as u32));
        idxnames.extend(input.idxnames());
    }

    let mut fanout = vec![0u32; 1usize << bits];
    let mut shas = Vec::with_capacity(total * OID_LEN);
    let mut which = Vec::with_capacity(total * 4);
    let merged = MergeIter::new(sources, |item: &(Oid, u32)| item.0).with_progress(100_000, |n| {
        debug!(objects = n, "midx: merging");
    });
    for (oid, source) in merged {
        fanout[oid.extract_bits(bits) as usize] += 1;
        shas.extend_from_slice(oid.as_bytes());
        which.extend_from_slice(&source.to_be_bytes());
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + fanout.len() * 4 + shas.len() + which.len());
    out.extend_from_slice(MIDX_MAGIC);
    out.extend_from_slice(&MIDX_VERSION.to_be_bytes());
    out.extend_from_slice(&bits.to_be_bytes());
    let mut running = 0u32;
    for count in fanout {
        running += count;
        out.extend_from_slice(&running.to_be_bytes());
    }
    out.extend_from_slice(&shas);
    out.extend_from_slice(&which);
    out.extend_from_slice(idxnames.join("\0").as_bytes());
    out
}

/// Content-derived file name for a midx over `inputs`
pub fn midx_name(inputs: &[PackIndex]) -> String {
    let names: Vec<String> = inputs.iter().map(|p| basename(p.path())).collect();
    let mut hasher = IncrementalHasher::new();
    hasher.update(names.join("\0").as_bytes());
    format!("midx-{}.midx", hasher.finalize())
}

/// Merge `inputs` into a new midx in `dir`
///
/// Returns `None` without writing anything when merging would not pay off.
pub fn write_midx(dir: &Path, inputs: &[PackIndex], force: bool) -> Result<Option<PathBuf>> {
    let total: usize = inputs.iter().map(|p| p.len()).sum();
    if (!force && total < 1024 && inputs.len() < 3) || inputs.len() < 2 || (force && total == 0) {
        debug!(files = inputs.len(), objects = total, "midx: nothing to do");
        return Ok(None);
    }
    debug!(files = inputs.len(), objects = total, "midx: creating");
    let path = dir.join(midx_name(inputs));
    atomic_write(&path, &build(inputs))?;
    info!(path = %path.display(), objects = total, "midx written");
    Ok(Some(path))
}

pub(crate) fn list_dir(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == ext) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn remove_quietly(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Open every midx in `dir`, keeping the ones that still earn their place.
///
/// A midx naming a missing `.idx` is deleted. The rest are ranked largest
/// and newest first; a midx whose sources are all covered by better ranked
/// ones is redundant and deleted too.
pub(crate) fn load_midxs(dir: &Path) -> Result<Vec<PackMidx>> {
    let mut candidates = Vec::new();
    for path in list_dir(dir, "midx")? {
        let midx = match PackMidx::open(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable midx");
                continue;
            }
        };
        if let Some(missing) = midx.missing_idx() {
            warn!(
                midx = %path.display(),
                missing,
                "midx references a missing index, removing it"
            );
            drop(midx);
            remove_quietly(&path)?;
            continue;
        }
        let modified = mtime(&path);
        candidates.push((midx, modified));
    }
    candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(b.1.cmp(&a.1)));

    let mut covered: HashSet<String> = HashSet::new();
    let mut kept = Vec::new();
    for (midx, _) in candidates {
        let needed = midx.idxnames().iter().any(|n| !covered.contains(n));
        if needed {
            covered.extend(midx.idxnames().iter().cloned());
            kept.push(midx);
        } else {
            debug!(path = %midx.path.display(), "midx: removing redundant");
            let path = midx.path.clone();
            drop(midx);
            remove_quietly(&path)?;
        }
    }
    Ok(kept)
}

/// Files one merge may hold open, leaving headroom below the descriptor limit
pub fn max_merge_files(config: &MidxConfig) -> usize {
    if config.max_files > 0 {
        return config.max_files.max(2);
    }
    use nix::sys::resource::{getrlimit, Resource};
    let limit = match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) => soft.min(hard).min(4096) as usize,
        Err(e) => {
            debug!(error = %e, "midx: getrlimit failed, assuming 64 descriptors");
            64
        }
    };
    let headroom = if limit > 32 { 20 } else { 6 };
    limit.saturating_sub(headroom).max(2)
}

/// Bring the midx files of a pack directory up to date.
///
/// Redundant midx files are removed; then while more than the high-water
/// mark of indexes remain, the smallest are merged in groups bounded by
/// `max_merge_files` until the low-water mark is reached. `force` merges
/// every `.idx` into a single midx. Returns the midx files written.
pub fn midx_dir(dir: &Path, config: &MidxConfig, force: bool) -> Result<Vec<PathBuf>> {
    let existing = if force { Vec::new() } else { load_midxs(dir)? };
    let covered: HashSet<String> = existing
        .iter()
        .flat_map(|m| m.idxnames().iter().cloned())
        .collect();

    let mut all: Vec<(usize, PathBuf)> = existing.iter().map(|m| (m.len(), m.path.clone())).collect();
    drop(existing);
    for path in list_dir(dir, "idx")? {
        if covered.contains(&basename(&path)) {
            continue;
        }
        match PackIdx::open(&path) {
            Ok(idx) => all.push((idx.len(), path)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable index"),
        }
    }

    let (high, low) = if force {
        (1, 1)
    } else {
        (config.high_water.max(1), config.low_water.clamp(1, config.high_water.max(1)))
    };
    debug!(indexes = all.len(), want = high, "midx: checking");
    if all.len() <= high {
        debug!("midx: nothing to do");
    }

    let max_files = max_merge_files(config);
    let mut written = Vec::new();
    while all.len() > high {
        all.sort();
        let split = all.len() - low + 1;
        let rest = all.split_off(split);
        let mut merged = Vec::new();
        for group in all.chunks(max_files) {
            let inputs = group
                .iter()
                .map(|(_, path)| PackIndex::open(path))
                .collect::<Result<Vec<_>>>()?;
            if let Some(path) = write_midx(dir, &inputs, force)? {
                let len = PackMidx::open(&path)?.len();
                // inputs that were midx files are now subsumed
                for input in &inputs {
                    if let PackIndex::Midx(m) = input {
                        if m.path() != path {
                            remove_quietly(m.path())?;
                        }
                    }
                }
                merged.push((len, path.clone()));
                written.push(path);
            }
        }
        all = merged;
        all.extend(rest);
        if all.len() > high {
            debug!(indexes = all.len(), want = high, "midx: still too many indexes, merging again");
        }
    }

    if force && !written.is_empty() {
        load_midxs(dir)?;
    }
    Ok(written)
}
