//! Existence and lookup across every index in a pack directory
//!
//! `PackIdxList` answers "is this object stored?" by checking, in order:
//! ids added this session, the bloom filter, then each midx and plain
//! index with the most recently successful one tried first.

use crate::bloom::{ShaBloom, BLOOM_FILE_NAME};
use crate::error::Result;
use crate::idx::{basename, ObjectLocation, PackIdx, PackIndexLike};
use crate::midx::{self, list_dir, PackMidx};
use crate::pack::ObjectExists;
use cairn_core::config::MidxConfig;
use cairn_core::{MergeIter, Oid};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Either kind of on-disk index
#[derive(Debug)]
pub enum PackIndex {
    Idx(PackIdx),
    Midx(PackMidx),
}

impl PackIndex {
    /// Open by extension: `.midx` as a multi-pack index, anything else as `.idx`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.extension().is_some_and(|e| e == "midx") {
            Ok(PackIndex::Midx(PackMidx::open(path)?))
        } else {
            Ok(PackIndex::Idx(PackIdx::open(path)?))
        }
    }

    fn inner(&self) -> &dyn PackIndexLike {
        match self {
            PackIndex::Idx(i) => i as &dyn PackIndexLike,
            PackIndex::Midx(m) => m as &dyn PackIndexLike,
        }
    }

    /// Ids paired with the position of their source in a combined name list
    /// starting at `base`
    pub fn iter_with_source(&self, base: u32) -> Box<dyn Iterator<Item = (Oid, u32)> + '_> {
        match self {
            PackIndex::Idx(i) => Box::new(i.iter().map(move |oid| (oid, base))),
            PackIndex::Midx(m) => Box::new(m.iter_with_source().map(move |(oid, w)| (oid, base + w))),
        }
    }
}

impl PackIndexLike for PackIndex {
    fn path(&self) -> &Path {
        self.inner().path()
    }

    fn len(&self) -> usize {
        self.inner().len()
    }

    fn exists(&self, oid: &Oid) -> bool {
        self.inner().exists(oid)
    }

    fn find(&self, oid: &Oid) -> Result<Option<ObjectLocation>> {
        self.inner().find(oid)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Oid> + '_> {
        self.inner().iter()
    }

    fn idxnames(&self) -> Vec<String> {
        self.inner().idxnames()
    }
}

/// The set of indexes in one pack directory, plus session state
pub struct PackIdxList {
    dir: PathBuf,
    packs: Vec<PackIndex>,
    also: HashSet<Oid>,
    bloom: Option<ShaBloom>,
    distrust_bloom: bool,
    ignore_midx: bool,
    auto_midx: Option<MidxConfig>,
    searches: u64,
    steps: u64,
}

impl std::fmt::Debug for PackIdxList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackIdxList")
            .field("dir", &self.dir)
            .field("packs", &self.packs.len())
            .field("bloom", &self.bloom.is_some())
            .finish()
    }
}

impl PackIdxList {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_options(dir, false)
    }

    /// `ignore_midx` loads only plain `.idx` files
    pub fn with_options(dir: impl Into<PathBuf>, ignore_midx: bool) -> Result<Self> {
        Self::build(dir.into(), ignore_midx, None)
    }

    /// Like `open`, but every refresh first consolidates the directory
    /// into midx files once it holds more than `config.high_water` indexes
    pub fn with_auto_midx(dir: impl Into<PathBuf>, config: MidxConfig) -> Result<Self> {
        Self::build(dir.into(), false, Some(config))
    }

    fn build(dir: PathBuf, ignore_midx: bool, auto_midx: Option<MidxConfig>) -> Result<Self> {
        let mut list = Self {
            dir,
            packs: Vec::new(),
            also: HashSet::new(),
            bloom: None,
            distrust_bloom: false,
            ignore_midx,
            auto_midx,
            searches: 0,
            steps: 0,
        };
        list.refresh()?;
        Ok(list)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rescan the directory for indexes and reload the bloom filter
    ///
    /// Broken or redundant midx files are deleted on the way. Indexes that
    /// fail to parse are skipped with a warning.
    pub fn refresh(&mut self) -> Result<()> {
        self.load()?;
        let Some(config) = self.auto_midx.as_ref().filter(|_| !self.ignore_midx) else {
            return Ok(());
        };
        if self.packs.len() <= config.high_water {
            return Ok(());
        }
        debug!(indexes = self.packs.len(), "too many indexes, consolidating");
        match midx::midx_dir(&self.dir, config, false) {
            Ok(written) if written.is_empty() => Ok(()),
            Ok(_) => self.load(),
            Err(e) => {
                warn!(error = %e, "midx consolidation failed, using the indexes as they are");
                Ok(())
            }
        }
    }

    fn load(&mut self) -> Result<()> {
        self.packs.clear();
        self.bloom = None;
        self.distrust_bloom = false;
        if !self.dir.exists() {
            return Ok(());
        }

        let mut covered: HashSet<String> = HashSet::new();
        if !self.ignore_midx {
            for midx in midx::load_midxs(&self.dir)? {
                covered.extend(midx.idxnames().iter().cloned());
                self.packs.push(PackIndex::Midx(midx));
            }
        }
        for path in list_dir(&self.dir, "idx")? {
            if covered.contains(&basename(&path)) {
                continue;
            }
            match PackIdx::open(&path) {
                Ok(idx) => self.packs.push(PackIndex::Idx(idx)),
                Err(e) => warn!(path = %path.display(), error = %e, "excluding unreadable index"),
            }
        }
        self.packs.sort_by(|a, b| b.len().cmp(&a.len()));

        let total = self.len();
        self.bloom = match ShaBloom::open(self.dir.join(BLOOM_FILE_NAME)) {
            Ok(Some(bloom)) if bloom.entries() >= total => Some(bloom),
            Ok(Some(bloom)) => {
                debug!(entries = bloom.entries(), total, "bloom is behind the indexes, not using it");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "ignoring invalid bloom filter");
                None
            }
        };
        debug!(indexes = self.packs.len(), bloom = self.bloom.is_some(), "PackIdxList refreshed");
        Ok(())
    }

    /// Objects across all indexes, counting any duplicates between them
    pub fn len(&self) -> usize {
        self.packs.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.iter().all(|p| p.is_empty())
    }

    pub fn packs(&self) -> &[PackIndex] {
        &self.packs
    }

    pub fn has_bloom(&self) -> bool {
        self.bloom.is_some() && !self.distrust_bloom
    }

    /// Lookups made so far
    pub fn searches(&self) -> u64 {
        self.searches
    }

    /// Bloom probes and index probes made so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Remember an object written this session but not yet in an index
    pub fn add(&mut self, oid: Oid) {
        self.also.insert(oid);
    }

    fn bring_to_front(&mut self, i: usize) {
        self.packs[..=i].rotate_right(1);
    }

    pub fn exists(&mut self, oid: &Oid) -> bool {
        self.searches += 1;
        if self.also.contains(oid) {
            return true;
        }
        let mut bloom_said_yes = false;
        if !self.distrust_bloom {
            if let Some(bloom) = &self.bloom {
                self.steps += 1;
                if !bloom.contains(oid) {
                    return false;
                }
                bloom_said_yes = true;
            }
        }
        for i in 0..self.packs.len() {
            self.steps += 1;
            if self.packs[i].exists(oid) {
                self.bring_to_front(i);
                return true;
            }
        }
        if bloom_said_yes {
            debug!(%oid, "bloom false positive, bypassing it until refresh");
            self.distrust_bloom = true;
        }
        false
    }

    /// Which index holds `oid`, and where in its pack
    pub fn find(&mut self, oid: &Oid) -> Result<Option<ObjectLocation>> {
        self.searches += 1;
        for i in 0..self.packs.len() {
            self.steps += 1;
            if let Some(loc) = self.packs[i].find(oid)? {
                self.bring_to_front(i);
                return Ok(Some(loc));
            }
        }
        Ok(None)
    }

    /// Every id in every index, ascending and de-duplicated
    pub fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        let sources: Vec<_> = self.packs.iter().map(|p| p.iter()).collect();
        MergeIter::new(sources, |oid: &Oid| *oid)
    }
}

impl ObjectExists for PackIdxList {
    fn exists(&mut self, oid: &Oid) -> bool {
        PackIdxList::exists(self, oid)
    }

    fn add(&mut self, oid: &Oid) {
        PackIdxList::add(self, *oid);
    }

    fn forget(&mut self, oid: &Oid) {
        self.also.remove(oid);
    }

    fn pack_finished(&mut self) -> Result<()> {
        self.also.clear();
        self.refresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::bloom_dir;
    use crate::idx::{self, IdxEntry};
    use cairn_core::config::BloomConfig;
    use cairn_core::oid::sha1_bytes;

    fn oid(n: u32) -> Oid {
        sha1_bytes(&n.to_be_bytes())
    }

    fn write_idx(dir: &Path, name: &str, range: std::ops::Range<u32>) -> PathBuf {
        let mut entries: Vec<IdxEntry> = range
            .enumerate()
            .map(|(i, n)| IdxEntry {
                oid: oid(n),
                crc: 0,
                offset: 12 + i as u64,
            })
            .collect();
        let path = dir.join(format!("{name}.idx"));
        std::fs::write(&path, idx::build(&mut entries, &Oid::EMPTY)).unwrap();
        path
    }

    #[test]
    fn test_exists_across_packs() {
        let dir = tempfile::tempdir().unwrap();
        write_idx(dir.path(), "pack-a", 0..100);
        write_idx(dir.path(), "pack-b", 100..150);
        let mut list = PackIdxList::open(dir.path()).unwrap();
        assert_eq!(list.packs().len(), 2);
        assert_eq!(list.len(), 150);
        // largest first
        assert_eq!(list.packs()[0].len(), 100);
        assert!(list.exists(&oid(5)));
        assert!(list.exists(&oid(120)));
        assert!(!list.exists(&oid(500)));
        assert_eq!(list.searches(), 3);
    }

    #[test]
    fn test_successful_lookup_moves_pack_to_front() {
        let dir = tempfile::tempdir().unwrap();
        write_idx(dir.path(), "pack-a", 0..100);
        write_idx(dir.path(), "pack-b", 100..150);
        let mut list = PackIdxList::open(dir.path()).unwrap();
        assert!(list.exists(&oid(120)));
        assert_eq!(list.packs()[0].len(), 50);
        let before = list.steps();
        assert!(list.exists(&oid(121)));
        assert_eq!(list.steps() - before, 1);
    }

    #[test]
    fn test_also_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = PackIdxList::open(dir.path()).unwrap();
        assert!(list.is_empty());
        assert!(!list.exists(&oid(1)));
        list.add(oid(1));
        assert!(list.exists(&oid(1)));
        list.pack_finished().unwrap();
        assert!(!list.exists(&oid(1)));
    }

    #[test]
    fn test_iter_merges_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        write_idx(dir.path(), "pack-a", 0..60);
        write_idx(dir.path(), "pack-b", 40..100);
        let list = PackIdxList::open(dir.path()).unwrap();
        let all: Vec<Oid> = list.iter().collect();
        assert_eq!(all.len(), 100);
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_find_returns_location() {
        let dir = tempfile::tempdir().unwrap();
        let b = write_idx(dir.path(), "pack-b", 100..150);
        write_idx(dir.path(), "pack-a", 0..100);
        let mut list = PackIdxList::open(dir.path()).unwrap();
        let loc = list.find(&oid(110)).unwrap().unwrap();
        assert_eq!(loc.idx, b);
        assert_eq!(loc.offset, PackIdx::open(&b).unwrap().find_offset(&oid(110)).unwrap());
        assert_eq!(list.find(&oid(999)).unwrap(), None);
    }

    #[test]
    fn test_midx_replaces_covered_idx() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3u32 {
            write_idx(dir.path(), &format!("pack-{i}"), i * 10..(i + 1) * 10);
        }
        midx::midx_dir(dir.path(), &Default::default(), true).unwrap();
        let mut list = PackIdxList::open(dir.path()).unwrap();
        assert_eq!(list.packs().len(), 1);
        assert!(matches!(list.packs()[0], PackIndex::Midx(_)));
        assert!((0..30).all(|n| list.exists(&oid(n))));

        let plain = PackIdxList::with_options(dir.path(), true).unwrap();
        assert_eq!(plain.packs().len(), 3);
    }

    #[test]
    fn test_auto_midx_consolidates_past_high_water() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4u32 {
            write_idx(dir.path(), &format!("pack-{i}"), i * 10..(i + 1) * 10);
        }
        let config = MidxConfig {
            high_water: 4,
            low_water: 2,
            ..MidxConfig::default()
        };
        let mut list = PackIdxList::with_auto_midx(dir.path(), config).unwrap();
        assert_eq!(list.packs().len(), 4);

        write_idx(dir.path(), "pack-4", 40..50);
        list.refresh().unwrap();
        assert!(list.packs().len() <= 2);
        assert!(list.packs().iter().any(|p| matches!(p, PackIndex::Midx(_))));
        assert!((0..50).all(|n| list.exists(&oid(n))));

        // a plain list leaves the directory alone
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6u32 {
            write_idx(dir.path(), &format!("pack-{i}"), i * 10..(i + 1) * 10);
        }
        let list = PackIdxList::open(dir.path()).unwrap();
        assert_eq!(list.packs().len(), 6);
    }

    #[test]
    fn test_midx_with_missing_idx_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_idx(dir.path(), "pack-a", 0..10);
        write_idx(dir.path(), "pack-b", 10..20);
        let written = midx::midx_dir(dir.path(), &Default::default(), true).unwrap();
        std::fs::remove_file(&a).unwrap();
        let mut list = PackIdxList::open(dir.path()).unwrap();
        assert!(!written[0].exists());
        assert_eq!(list.packs().len(), 1);
        assert!(list.exists(&oid(15)));
        assert!(!list.exists(&oid(5)));
    }

    #[test]
    fn test_unreadable_idx_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        write_idx(dir.path(), "pack-a", 0..10);
        std::fs::write(dir.path().join("pack-bad.idx"), b"garbage").unwrap();
        let mut list = PackIdxList::open(dir.path()).unwrap();
        assert_eq!(list.packs().len(), 1);
        assert!(list.exists(&oid(3)));
    }

    #[test]
    fn test_bloom_negative_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        write_idx(dir.path(), "pack-a", 0..200);
        bloom_dir(dir.path(), &BloomConfig::default(), false).unwrap();
        let mut list = PackIdxList::open(dir.path()).unwrap();
        assert!(list.has_bloom());
        assert!((0..200).all(|n| list.exists(&oid(n))));

        // ids the bloom rejects never reach the index
        let before = list.steps();
        let mut rejected = 0;
        for n in 1000..1100 {
            let steps = list.steps();
            assert!(!list.exists(&oid(n)));
            if list.steps() - steps == 1 {
                rejected += 1;
            }
        }
        assert!(rejected > 0);
        assert!(list.steps() > before);
    }

    #[test]
    fn test_stale_bloom_not_used() {
        let dir = tempfile::tempdir().unwrap();
        write_idx(dir.path(), "pack-a", 0..50);
        bloom_dir(dir.path(), &BloomConfig::default(), false).unwrap();
        write_idx(dir.path(), "pack-b", 50..100);
        let mut list = PackIdxList::open(dir.path()).unwrap();
        assert!(!list.has_bloom());
        assert!(list.exists(&oid(75)));
    }
}
