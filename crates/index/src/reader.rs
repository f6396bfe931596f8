//! Memory-mapped bupindex reader
//!
//! The whole file is validated when opened, so iteration never has to
//! fail: every record is NUL-terminated and complete, the footer count
//! matches, and each directory's children are whole records stored
//! before the directory itself.

use crate::entry::{Entry, CHILDREN_LEN, ENTRY_LEN, FOOTER_LEN, HEADER_LEN, INDEX_HEADER, OFS_CHILDREN};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

enum Map {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl Map {
    fn bytes(&self) -> &[u8] {
        match self {
            Map::ReadOnly(m) => &m[..],
            Map::Writable(m) => &m[..],
        }
    }
}

pub struct Reader {
    path: PathBuf,
    map: Map,
    count: u64,
}

impl Reader {
    /// Open an index read-only; `Ok(None)` if there is no such file
    pub fn open(path: impl AsRef<Path>) -> Result<Option<Self>> {
        Self::open_with(path.as_ref(), false)
    }

    /// Open an index whose entries can be rewritten in place
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Option<Self>> {
        Self::open_with(path.as_ref(), true)
    }

    fn open_with(path: &Path, writable: bool) -> Result<Option<Self>> {
        let mut file = match OpenOptions::new().read(true).write(writable).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        check_header(path, &mut file)?;
        let len = file.metadata()?.len();
        if len < (HEADER_LEN + FOOTER_LEN) as u64 {
            return Err(Error::corrupt(path, format!("{len} bytes is too short")));
        }
        // SAFETY: finished indexes are only ever replaced by rename, and
        // in-place updates go through this mapping
        let map = if writable {
            Map::Writable(unsafe { MmapMut::map_mut(&file)? })
        } else {
            Map::ReadOnly(unsafe { Mmap::map(&file)? })
        };
        let count = validate(path, map.bytes())?;
        debug!(path = %path.display(), count, writable, "opened index");
        Ok(Some(Self {
            path: path.to_path_buf(),
            map,
            count,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records, as recorded in the footer
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, Map::Writable(_))
    }

    fn data(&self) -> &[u8] {
        self.map.bytes()
    }

    /// Every entry, deepest first, in descending path order, with the
    /// root `/` last
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self.data(), None)
    }

    /// Entries at or below `name`, in the same order as `iter`
    pub fn iter_prefix(&self, name: &[u8]) -> Iter<'_> {
        Iter::new(self.data(), Some(name))
    }

    /// Records in physical file order; names are basenames only
    pub fn forward_iter(&self) -> impl Iterator<Item = Entry> + '_ {
        let data = self.data();
        let end = data.len() - FOOTER_LEN;
        let mut ofs = HEADER_LEN;
        std::iter::from_fn(move || {
            if ofs >= end {
                return None;
            }
            let (entry, next) = read_entry(data, ofs, b"");
            ofs = next;
            Some(entry)
        })
    }

    pub fn find(&self, name: &[u8]) -> Option<Entry> {
        self.iter_prefix(name).find(|e| e.name == name)
    }

    /// Walk the tree links and confirm they agree with the footer and
    /// the ordering rules
    pub fn check(&self) -> Result<()> {
        let forward = self.forward_iter().count() as u64;
        if forward != self.count {
            return Err(Error::corrupt(
                &self.path,
                format!("footer says {} entries, found {forward}", self.count),
            ));
        }
        let mut seen = 0u64;
        let mut last: Option<Vec<u8>> = None;
        for e in self.iter() {
            if let Some(prev) = &last {
                if e.name.as_slice() >= prev.as_slice() {
                    return Err(Error::corrupt(
                        &self.path,
                        format!("{:?} is out of order after {:?}", e.name_lossy(), String::from_utf8_lossy(prev)),
                    ));
                }
            }
            last = Some(e.name);
            seen += 1;
        }
        if seen != self.count {
            return Err(Error::corrupt(
                &self.path,
                format!("{seen} of {} entries reachable from the root", self.count),
            ));
        }
        Ok(())
    }

    /// Rewrite `entry`'s record in place; the entry must have been read
    /// from this reader. Directory links are left untouched.
    pub fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        let rec = entry
            .location
            .ok_or_else(|| Error::InvalidPath(entry.name_lossy(), "entry was not read from an index"))?;
        let end = self.data().len() - FOOTER_LEN;
        if rec < HEADER_LEN || rec + ENTRY_LEN > end {
            return Err(Error::corrupt(&self.path, format!("entry offset {rec} out of range")));
        }
        let map = match &mut self.map {
            Map::Writable(m) => m,
            Map::ReadOnly(_) => return Err(Error::ReadOnly(self.path.clone())),
        };
        let mut raw = entry.encode();
        let links = OFS_CHILDREN..OFS_CHILDREN + CHILDREN_LEN;
        raw[links.clone()].copy_from_slice(&map[rec + links.start..rec + links.end]);
        map[rec..rec + ENTRY_LEN].copy_from_slice(&raw);
        Ok(())
    }

    /// Push in-place updates to the file
    pub fn flush(&self) -> Result<()> {
        if let Map::Writable(m) = &self.map {
            m.flush()?;
        }
        Ok(())
    }
}

fn check_header(path: &Path, file: &mut File) -> Result<()> {
    let mut found = Vec::with_capacity(HEADER_LEN);
    file.by_ref().take(HEADER_LEN as u64).read_to_end(&mut found)?;
    if found != INDEX_HEADER {
        warn!(path = %path.display(), ?found, "index header mismatch");
        return Err(Error::BadHeader {
            path: path.to_path_buf(),
            expected: INDEX_HEADER.to_vec(),
            found,
        });
    }
    Ok(())
}

/// Scan every record once; returns the entry count
fn validate(path: &Path, data: &[u8]) -> Result<u64> {
    let end = data.len() - FOOTER_LEN;
    let count = BigEndian::read_u64(&data[end..]);

    // (name offset, struct offset) of each record
    let mut records: Vec<(usize, usize)> = Vec::new();
    let mut ofs = HEADER_LEN;
    while ofs < end {
        let eon = data[ofs..end]
            .iter()
            .position(|&b| b == 0)
            .map(|p| ofs + p)
            .ok_or_else(|| Error::corrupt(path, format!("unterminated name at {ofs}")))?;
        if eon == ofs {
            return Err(Error::corrupt(path, format!("empty name at {ofs}")));
        }
        let rec = eon + 1;
        if rec + ENTRY_LEN > end {
            return Err(Error::corrupt(path, format!("truncated record at {ofs}")));
        }
        records.push((ofs, rec));
        ofs = rec + ENTRY_LEN;
    }
    if records.len() as u64 != count {
        return Err(Error::corrupt(
            path,
            format!("footer says {count} entries, found {}", records.len()),
        ));
    }

    for (i, &(_, rec)) in records.iter().enumerate() {
        let n = BigEndian::read_u32(&data[rec + OFS_CHILDREN + 8..rec + OFS_CHILDREN + 12]) as usize;
        if n == 0 {
            continue;
        }
        let first_ofs = BigEndian::read_u64(&data[rec + OFS_CHILDREN..rec + OFS_CHILDREN + 8]);
        let first = usize::try_from(first_ofs)
            .ok()
            .and_then(|o| records.binary_search_by_key(&o, |&(name, _)| name).ok())
            .ok_or_else(|| Error::corrupt(path, format!("children offset {first_ofs} is not a record")))?;
        if first + n > i {
            return Err(Error::corrupt(
                path,
                format!("record {i} links to children after itself"),
            ));
        }
    }

    if let Some(&(name, rec)) = records.last() {
        if &data[name..rec - 1] != b"/" {
            return Err(Error::corrupt(path, "last record is not the root"));
        }
    }
    Ok(count)
}

/// Decode the record whose name starts at `ofs`; returns it and the
/// offset of the next record
fn read_entry(data: &[u8], ofs: usize, prefix: &[u8]) -> (Entry, usize) {
    let eon = data[ofs..].iter().position(|&b| b == 0).map_or(ofs, |p| ofs + p);
    let mut name = Vec::with_capacity(prefix.len() + eon - ofs);
    name.extend_from_slice(prefix);
    name.extend_from_slice(&data[ofs..eon]);
    let rec = eon + 1;
    (Entry::decode(name, &data[rec..rec + ENTRY_LEN], rec), rec + ENTRY_LEN)
}

struct Frame {
    prefix: Vec<u8>,
    ofs: usize,
    remaining: u32,
    after: Option<Entry>,
}

/// Post-order walk over the directory links, driven by an explicit
/// stack of open directories
pub struct Iter<'a> {
    data: &'a [u8],
    stack: Vec<Frame>,
    name: Option<Vec<u8>>,
    dname: Option<Vec<u8>>,
}

impl<'a> Iter<'a> {
    fn new(data: &'a [u8], name: Option<&[u8]>) -> Self {
        let name = name.filter(|n| !n.is_empty()).map(<[u8]>::to_vec);
        let dname = name.as_ref().map(|n| {
            let mut d = n.clone();
            if !d.ends_with(b"/") {
                d.push(b'/');
            }
            d
        });
        let mut iter = Self {
            data,
            stack: Vec::new(),
            name,
            dname,
        };
        let end = data.len() - FOOTER_LEN;
        if end >= HEADER_LEN + ENTRY_LEN + 2 {
            let rec = end - ENTRY_LEN;
            let root = Entry::decode(b"/".to_vec(), &data[rec..end], rec);
            let emit_root = iter.dname.as_deref().map_or(true, |d| d == b"/");
            iter.stack.push(Frame {
                prefix: root.name.clone(),
                ofs: root.children_ofs as usize,
                remaining: root.children_n,
                after: emit_root.then_some(root),
            });
        }
        iter
    }

    fn descend(&self, child: &Entry) -> bool {
        match &self.dname {
            None => true,
            Some(d) => {
                child.name.starts_with(d)
                    || (child.is_dir() && d.starts_with(&child.name))
                    || self.name.as_ref() == Some(&child.name)
            }
        }
    }

    fn emit(&self, child: &Entry) -> bool {
        match (&self.name, &self.dname) {
            (Some(n), Some(d)) => child.name == *n || child.name.starts_with(d),
            _ => true,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.remaining == 0 {
                if let Some(done) = self.stack.pop() {
                    if let Some(entry) = done.after {
                        return Some(entry);
                    }
                }
                continue;
            }
            let (child, next) = read_entry(self.data, frame.ofs, &frame.prefix);
            frame.ofs = next;
            frame.remaining -= 1;

            if !self.descend(&child) {
                continue;
            }
            let emit = self.emit(&child);
            self.stack.push(Frame {
                prefix: child.name.clone(),
                ofs: child.children_ofs as usize,
                remaining: child.children_n,
                after: emit.then_some(child),
            });
        }
    }
}
