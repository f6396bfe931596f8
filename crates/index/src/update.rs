//! Bring an index up to date with a directory tree
//!
//! The tree is walked deepest-first in descending name order, the same
//! order the index stores, so the walk and the previous generation can be
//! stepped side by side:
//! - a path only in the old index has vanished and is marked deleted
//! - a path in both is refreshed in place when its stat changed
//! - a path only on disk goes to a new generation
//!
//! The old generation is edited in a temporary copy, and the new one is
//! merged with it into a temporary file before anything is renamed over
//! the index, so an interrupted update leaves the previous index intact.

use crate::entry::{gitmode_for, StatInfo, Timestamp};
use crate::error::{Error, Result};
use crate::merge::merge_into;
use crate::reader::Reader;
use crate::writer::Writer;
use cairn_core::config::IndexConfig;
use cairn_core::Oid;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

const TEMP_PREFIX: &str = ".tmp-bupindex-";

/// Where per-path metadata blobs are kept; the index only records the
/// offset a store hands back
pub trait MetaStore {
    /// Record metadata for `path` and return its offset
    fn store(&mut self, path: &Path, st: &StatInfo) -> Result<u64>;

    /// Offset recorded for directories the writer has to fill in
    fn default_offset(&mut self) -> Result<u64> {
        Ok(0)
    }
}

/// Records nothing; every offset is 0
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetaStore;

impl MetaStore for NullMetaStore {
    fn store(&mut self, _path: &Path, _st: &StatInfo) -> Result<u64> {
        Ok(0)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Treat a changed device number as a change
    pub check_device: bool,
    /// Do not cross into other filesystems
    pub one_file_system: bool,
    /// Mark new and changed paths valid with the fake hash instead of
    /// leaving them for the next save to hash
    pub fake_valid: bool,
    /// Invalidate every path seen, changed or not
    pub fake_invalidate: bool,
    /// Paths to skip, with everything below them
    pub excluded: Vec<PathBuf>,
    /// Override the racy-change cut-off; defaults to one second before
    /// the update starts
    pub tmax: Option<Timestamp>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            check_device: true,
            one_file_system: false,
            fake_valid: false,
            fake_invalidate: false,
            excluded: Vec::new(),
            tmax: None,
        }
    }
}

impl UpdateOptions {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            check_device: config.check_device,
            ..Self::default()
        }
    }
}

/// A per-path problem that was skipped rather than aborting the update
#[derive(Debug, Clone)]
pub struct SoftError {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl fmt::Display for SoftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}: {}", p.display(), self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct UpdateReport {
    /// Paths visited
    pub paths: u64,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub errors: Vec<SoftError>,
}

impl UpdateReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn add_error(&mut self, path: Option<&Path>, message: impl fmt::Display) {
        let err = SoftError {
            path: path.map(Path::to_path_buf),
            message: message.to_string(),
        };
        warn!(error = %err, "skipping path");
        self.errors.push(err);
    }
}

/// Sort key putting each directory where its `/`-terminated name sorts
fn walk_key(e: &DirEntry) -> Vec<u8> {
    let mut key = e.file_name().as_bytes().to_vec();
    if e.file_type().is_dir() {
        key.push(b'/');
    }
    key
}

fn index_name(path: &Path, is_dir: bool) -> Vec<u8> {
    let mut name = path.as_os_str().as_bytes().to_vec();
    if is_dir && !name.ends_with(b"/") {
        name.push(b'/');
    }
    name
}

/// Holds each directory of a parents-first walk back until its contents
/// have been yielded
struct PostOrder<I> {
    inner: I,
    dirs: Vec<DirEntry>,
    held: Option<walkdir::Result<DirEntry>>,
}

impl<I> PostOrder<I> {
    fn new(inner: I) -> Self {
        Self {
            inner,
            dirs: Vec::new(),
            held: None,
        }
    }
}

impl<I: Iterator<Item = walkdir::Result<DirEntry>>> Iterator for PostOrder<I> {
    type Item = walkdir::Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(item) = self.held.take() else {
                match self.inner.next() {
                    Some(item) => {
                        self.held = Some(item);
                        continue;
                    }
                    None => return self.dirs.pop().map(Ok),
                }
            };
            let depth = match &item {
                Ok(e) => e.depth(),
                Err(e) => e.depth(),
            };
            // a sibling or an uncle means the open directory is complete
            if self.dirs.last().is_some_and(|d| d.depth() >= depth) {
                self.held = Some(item);
                return self.dirs.pop().map(Ok);
            }
            match item {
                Ok(e) if e.file_type().is_dir() => self.dirs.push(e),
                other => return Some(other),
            }
        }
    }
}

/// Index everything under `top` into the index at `index_path`, creating
/// it if needed
pub fn update_index(
    index_path: &Path,
    top: &Path,
    options: &UpdateOptions,
    meta: &mut dyn MetaStore,
) -> Result<UpdateReport> {
    let tmax = options.tmax.unwrap_or_else(Timestamp::update_start);
    let top = top.canonicalize()?;
    let top_name = index_name(&top, top.is_dir());
    let dir = match index_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let index_abs = match index_path.file_name() {
        Some(file) => dir.canonicalize()?.join(file),
        None => return Err(Error::InvalidPath(index_path.display().to_string(), "index path names no file")),
    };

    // previous generation, edited in a private copy
    let copy = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(&dir)?;
    let mut old = match std::fs::copy(index_path, copy.path()) {
        Ok(_) => Reader::open_rw(copy.path())?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let mut pending = old
        .as_ref()
        .map(|r| r.iter_prefix(&top_name).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .peekable();

    let default_meta = meta.default_offset()?;
    let mut fresh = Writer::create(index_path, tmax)?.with_default_meta_ofs(default_meta);
    let mut report = UpdateReport::default();

    // pruning happens on the way down, so the walk runs parents first and
    // is reordered afterwards
    let excluded = options.excluded.clone();
    let walker = PostOrder::new(
        WalkDir::new(&top)
            .follow_links(false)
            .same_file_system(options.one_file_system)
            .sort_by(|a, b| walk_key(b).cmp(&walk_key(a)))
            .into_iter()
            .filter_entry(move |e| {
                !excluded.iter().any(|x| e.path() == x) && !e.file_name().as_bytes().starts_with(TEMP_PREFIX.as_bytes())
            }),
    );

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                report.add_error(e.path(), &e);
                continue;
            }
        };
        if entry.path() == index_abs {
            continue;
        }
        let st = match entry.metadata() {
            Ok(m) => StatInfo::from(&m),
            Err(e) => {
                report.add_error(Some(entry.path()), &e);
                continue;
            }
        };
        let name = index_name(entry.path(), st.is_dir());
        report.paths += 1;

        // everything sorting above this path is gone from disk
        while let Some(mut gone) = pending.next_if(|e| e.name.as_slice() > name.as_slice()) {
            if gone.exists() {
                gone.set_deleted();
                if let Some(r) = old.as_mut() {
                    r.write_entry(&gone)?;
                }
                report.deleted += 1;
            }
        }

        let fake_hash = options.fake_valid.then(|| (gitmode_for(st.mode), Oid::FAKE));
        match pending.next_if(|e| e.name == name) {
            Some(mut cur) => {
                let mut changed = false;
                if cur.stale(&st, options.check_device) {
                    let meta_ofs = match meta.store(entry.path(), &st) {
                        Ok(ofs) => ofs,
                        Err(e) => {
                            report.add_error(Some(entry.path()), &e);
                            continue;
                        }
                    };
                    cur.update_from_stat(&st, meta_ofs, tmax);
                    cur.invalidate();
                    changed = true;
                }
                if !cur.is_valid() && !cur.racy(tmax) {
                    if let Some(fake) = fake_hash {
                        let (gitmode, sha) = if cur.sha == Oid::EMPTY { fake } else { (cur.gitmode, cur.sha) };
                        cur.validate(gitmode, sha);
                        changed = true;
                    }
                }
                if options.fake_invalidate {
                    cur.invalidate();
                    changed = true;
                }
                if changed {
                    if let Some(r) = old.as_mut() {
                        r.write_entry(&cur)?;
                    }
                    report.updated += 1;
                }
            }
            None => {
                let meta_ofs = match meta.store(entry.path(), &st) {
                    Ok(ofs) => ofs,
                    Err(e) => {
                        report.add_error(Some(entry.path()), &e);
                        continue;
                    }
                };
                fresh.add(&name, Some(&st), meta_ofs, fake_hash)?;
                report.added += 1;
            }
        }
    }

    match old {
        None => {
            fresh.close()?;
        }
        Some(old) => {
            old.flush()?;
            let (new_gen, count) = fresh.finish()?;
            if count == 0 {
                drop(old);
                persist(copy, index_path)?;
            } else {
                merge_generations(&old, &new_gen, index_path, tmax, default_meta)?;
            }
        }
    }

    info!(
        index = %index_path.display(),
        top = %top.display(),
        paths = report.paths,
        added = report.added,
        updated = report.updated,
        deleted = report.deleted,
        errors = report.errors.len(),
        "index updated"
    );
    Ok(report)
}

fn merge_generations(old: &Reader, new_gen: &NamedTempFile, index_path: &Path, tmax: Timestamp, default_meta: u64) -> Result<()> {
    let Some(new) = Reader::open(new_gen.path())? else {
        return Ok(());
    };
    let mut out = Writer::create(index_path, tmax)?.with_default_meta_ofs(default_meta);
    merge_into(&[old, &new], &mut out)?;
    let count = out.close()?;
    debug!(count, "merged index generations");
    Ok(())
}

fn persist(tmp: NamedTempFile, dest: &Path) -> Result<()> {
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
