//! bupindex writer
//!
//! Paths arrive in descending order, so a directory always shows up after
//! everything below it. The writer keeps one open level per directory on
//! the current path; a level's buffered children are written out when
//! the directory itself arrives (or is left behind), and the directory's
//! record then points back at them. The parent is buffered, so each
//! directory's record lands after its children's.

use crate::entry::{pathsplit, Entry, StatInfo, Timestamp, ENTRY_LEN, HEADER_LEN, INDEX_HEADER, IX_EXISTS, IX_HASHVALID};
use crate::error::{Error, Result};
use byteorder::{BigEndian, WriteBytesExt};
use cairn_core::Oid;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

struct Level {
    ename: Vec<Vec<u8>>,
    list: Vec<Entry>,
}

impl Level {
    fn new(ename: Vec<Vec<u8>>) -> Self {
        Self { ename, list: Vec::new() }
    }
}

pub struct Writer {
    path: PathBuf,
    out: BufWriter<NamedTempFile>,
    pos: u64,
    levels: Vec<Level>,
    last: Option<Vec<Vec<u8>>>,
    count: u64,
    tmax: Timestamp,
    default_meta_ofs: u64,
}

impl Writer {
    /// Start a new index that `close` will rename to `path`
    pub fn create(path: impl Into<PathBuf>, tmax: Timestamp) -> Result<Self> {
        let path = path.into();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let tmp = tempfile::Builder::new().prefix(".tmp-bupindex-").tempfile_in(&dir)?;
        let mut out = BufWriter::with_capacity(65536, tmp);
        out.write_all(INDEX_HEADER)?;
        Ok(Self {
            path,
            out,
            pos: HEADER_LEN as u64,
            levels: vec![Level::new(Vec::new())],
            last: None,
            count: 0,
            tmax,
            default_meta_ofs: 0,
        })
    }

    /// Metadata offset recorded for directories the writer fills in
    pub fn with_default_meta_ofs(mut self, ofs: u64) -> Self {
        self.default_meta_ofs = ofs;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written so far; buffered levels are not counted until
    /// they are flushed
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Add a path. `st` may be omitted for directories, `hash` is the
    /// `(gitmode, sha)` to record as already known.
    pub fn add(&mut self, name: &[u8], st: Option<&StatInfo>, meta_ofs: u64, hash: Option<(u32, Oid)>) -> Result<()> {
        let dir_name = name.ends_with(b"/");
        let mut entry = match st {
            Some(st) => {
                if st.is_dir() != dir_name {
                    return Err(Error::InvalidPath(lossy(name), "only directory names end with '/'"));
                }
                Entry::from_stat(name.to_vec(), st, meta_ofs, self.tmax)
            }
            None if dir_name => Entry::blank(name.to_vec(), meta_ofs),
            None => return Err(Error::InvalidPath(lossy(name), "only directories may be added without stat")),
        };
        entry.flags |= IX_EXISTS;
        if let Some((gitmode, sha)) = hash {
            entry.gitmode = gitmode;
            entry.sha = sha;
            if !entry.racy(self.tmax) {
                entry.flags |= IX_HASHVALID;
            }
        }
        self.push(entry)
    }

    /// Copy an entry from another index, e.g. while merging
    pub fn add_entry(&mut self, entry: &Entry) -> Result<()> {
        let mut entry = entry.clone();
        entry.children_ofs = 0;
        entry.children_n = 0;
        entry.location = None;
        self.push(entry)
    }

    fn push(&mut self, entry: Entry) -> Result<()> {
        if !entry.name.starts_with(b"/") {
            return Err(Error::InvalidPath(entry.name_lossy(), "path must be absolute"));
        }
        let ename = pathsplit(&entry.name);
        if let Some(last) = &self.last {
            if *last <= ename {
                return Err(Error::OutOfOrder {
                    previous: lossy(&last.concat()),
                    next: entry.name_lossy(),
                });
            }
        }
        self.golevel(&ename, Some(entry))?;
        self.last = Some(ename);
        Ok(())
    }

    fn golevel(&mut self, ename: &[Vec<u8>], entry: Option<Entry>) -> Result<()> {
        // close the levels we are leaving
        while let Some(level) = self.levels.last() {
            if ename.starts_with(&level.ename) {
                break;
            }
            let Some(level) = self.levels.pop() else { break };
            let mut dir = Entry::blank(level.ename.concat(), self.default_meta_ofs);
            dir.flags |= IX_EXISTS;
            self.write_level(level, &mut dir)?;
            if let Some(parent) = self.levels.last_mut() {
                parent.list.push(dir);
            }
        }

        // open the ones on the way down
        loop {
            let depth = self.levels.last().map_or(0, |l| l.ename.len());
            if depth >= ename.len() {
                break;
            }
            self.levels.push(Level::new(ename[..depth + 1].to_vec()));
        }

        let Some(level) = self.levels.pop() else {
            return Ok(());
        };
        let mut entry = entry.unwrap_or_else(|| Entry::blank(level.ename.concat(), self.default_meta_ofs));
        self.write_level(level, &mut entry)?;
        if let Some(parent) = self.levels.last_mut() {
            parent.list.push(entry);
        }
        Ok(())
    }

    /// Write a level's children and point `owner` at them
    fn write_level(&mut self, level: Level, owner: &mut Entry) -> Result<()> {
        owner.children_ofs = self.pos;
        owner.children_n = level.list.len() as u32;
        for e in &level.list {
            let base = e.basename();
            self.out.write_all(base)?;
            self.out.write_all(&[0])?;
            self.out.write_all(&e.encode())?;
            self.pos += (base.len() + 1 + ENTRY_LEN) as u64;
            self.count += 1;
        }
        Ok(())
    }

    /// Flush every open level and the footer, leaving the result in a
    /// temporary file next to the destination without renaming it
    pub fn finish(mut self) -> Result<(NamedTempFile, u64)> {
        self.golevel(&[], None)?;
        self.out.write_u64::<BigEndian>(self.count)?;
        let tmp = self.out.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        Ok((tmp, self.count))
    }

    /// Finish and atomically replace the destination; returns the number
    /// of records
    pub fn close(self) -> Result<u64> {
        let path = self.path.clone();
        let (tmp, count) = self.finish()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(path = %path.display(), count, "wrote index");
        Ok(count)
    }
}

fn lossy(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Reader;
    use cairn_core::tree::MODE_FILE;

    const TMAX: Timestamp = Timestamp::new(2_000_000_000, 0);

    fn file() -> StatInfo {
        StatInfo {
            nlink: 1,
            size: 1,
            mode: 0o100644,
            mtime: Timestamp::new(1_700_000_000, 0),
            ctime: Timestamp::new(1_700_000_000, 0),
            ..StatInfo::default()
        }
    }

    fn temp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(".tmp-bupindex-"))
            .count()
    }

    #[test]
    fn test_empty_index_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bupindex");
        assert_eq!(Writer::create(&path, TMAX).unwrap().close().unwrap(), 0);
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..8], INDEX_HEADER);
        assert_eq!(&raw[8..], &0u64.to_be_bytes());
    }

    #[test]
    fn test_rejects_ascending_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = Writer::create(dir.path().join("bupindex"), TMAX).unwrap();
        w.add(b"/a/b", Some(&file()), 0, None).unwrap();
        let err = w.add(b"/a/c", Some(&file()), 0, None).unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { .. }));
        assert!(matches!(w.add(b"/a/b", Some(&file()), 0, None), Err(Error::OutOfOrder { .. })));
    }

    #[test]
    fn test_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = Writer::create(dir.path().join("bupindex"), TMAX).unwrap();
        assert!(matches!(w.add(b"rel/x", Some(&file()), 0, None), Err(Error::InvalidPath(..))));
        assert!(matches!(w.add(b"/x/", Some(&file()), 0, None), Err(Error::InvalidPath(..))));
        assert!(matches!(w.add(b"/x", None, 0, None), Err(Error::InvalidPath(..))));
    }

    #[test]
    fn test_missing_directories_are_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bupindex");
        let mut w = Writer::create(&path, TMAX).unwrap().with_default_meta_ofs(42);
        w.add(b"/a/b/c", Some(&file()), 7, None).unwrap();
        w.add(b"/a/a", Some(&file()), 8, None).unwrap();
        assert_eq!(w.close().unwrap(), 5);

        let r = Reader::open(&path).unwrap().unwrap();
        let names: Vec<String> = r.iter().map(|e| e.name_lossy()).collect();
        assert_eq!(names, ["/a/b/c", "/a/b/", "/a/a", "/a/", "/"]);
        let b = r.find(b"/a/b/").unwrap();
        assert!(b.exists());
        assert_eq!(b.meta_ofs, 42);
        assert_eq!(r.find(b"/a/b/c").unwrap().meta_ofs, 7);
        r.check().unwrap();
    }

    #[test]
    fn test_children_precede_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bupindex");
        let mut w = Writer::create(&path, TMAX).unwrap();
        for name in ["/t/z", "/t/m/q", "/t/m/p", "/t/a"] {
            w.add(name.as_bytes(), Some(&file()), 0, None).unwrap();
        }
        w.close().unwrap();

        let r = Reader::open(&path).unwrap().unwrap();
        let physical: Vec<String> = r.forward_iter().map(|e| e.name_lossy()).collect();
        let pos = |n: &str| physical.iter().position(|p| p == n).unwrap();
        assert!(pos("q") < pos("m/"));
        assert!(pos("p") < pos("m/"));
        assert!(pos("m/") < pos("t/"));
        assert!(pos("z") < pos("t/"));
        assert_eq!(physical.last().map(String::as_str), Some("/"));
    }

    #[test]
    fn test_known_hash_is_valid_unless_racy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bupindex");
        let tmax = Timestamp::new(1_700_000_000, 0);
        let mut w = Writer::create(&path, tmax).unwrap();
        let old = StatInfo {
            mtime: Timestamp::new(1_600_000_000, 0),
            ctime: Timestamp::new(1_600_000_000, 0),
            ..file()
        };
        w.add(b"/d/old", Some(&old), 0, Some((MODE_FILE, Oid::FAKE))).unwrap();
        w.add(b"/d/new", Some(&file()), 0, Some((MODE_FILE, Oid::FAKE))).unwrap();
        w.close().unwrap();

        let r = Reader::open(&path).unwrap().unwrap();
        assert!(r.find(b"/d/old").unwrap().is_valid());
        let new = r.find(b"/d/new").unwrap();
        assert!(!new.is_valid());
        assert_eq!(new.sha, Oid::FAKE);
    }

    #[test]
    fn test_dropped_writer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bupindex");
        {
            let mut w = Writer::create(&path, TMAX).unwrap();
            w.add(b"/x", Some(&file()), 0, None).unwrap();
        }
        assert!(!path.exists());
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[test]
    fn test_close_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bupindex");
        let mut w = Writer::create(&path, TMAX).unwrap();
        w.add(b"/one", Some(&file()), 0, None).unwrap();
        w.close().unwrap();
        let old = Reader::open(&path).unwrap().unwrap();

        let mut w = Writer::create(&path, TMAX).unwrap();
        w.add(b"/two", Some(&file()), 0, None).unwrap();
        w.add(b"/one", Some(&file()), 0, None).unwrap();
        w.close().unwrap();

        assert_eq!(old.len(), 2);
        assert_eq!(Reader::open(&path).unwrap().unwrap().len(), 3);
        assert_eq!(temp_files(dir.path()), 0);
    }
}
