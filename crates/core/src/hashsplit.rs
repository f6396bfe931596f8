//! Content-defined chunking and bounded-fanout tree building
//!
//! `HashSplitter` turns one or more byte streams into chunks whose
//! boundaries depend only on nearby content, so an insertion early in a
//! file only disturbs the chunks around it. Each chunk carries a fanout
//! level derived from how many extra rolling-sum bits matched at its
//! boundary.
//!
//! The tree builder stacks chunk blobs per level and closes a level into a
//! tree object whenever a stronger boundary arrives. Entry names are
//! zero-padded hex byte offsets, so Git's name order is stream order and
//! `join` can reassemble the original bytes.

use crate::config::SplitConfig;
use crate::error::{Error, Result};
use crate::object::ObjectKind;
use crate::oid::Oid;
use crate::rollsum;
use crate::store::{ObjectSink, ObjectSource};
use crate::tree::{self, EntryKind, TreeEntry, MODE_FILE, MODE_TREE};
use std::io::{Read, Write};
use tracing::trace;

/// One content-defined piece of the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    /// Boundary strength: 0 for ordinary and forced boundaries
    pub level: u32,
}

/// Lazily splits a sequence of readers into chunks
pub struct HashSplitter<R> {
    sources: std::vec::IntoIter<R>,
    current: Option<R>,
    buf: Vec<u8>,
    start: usize,
    keep_boundaries: bool,
    blob_bits: u32,
    fan_bits: u32,
    max_blob: usize,
    read_block: usize,
    failed: bool,
}

impl<R: Read> HashSplitter<R> {
    /// Split the concatenation of `sources`
    ///
    /// With `keep_boundaries` each source is split independently, so no
    /// chunk ever spans two sources. Fails if `config` is unusable.
    pub fn new(sources: Vec<R>, config: &SplitConfig, keep_boundaries: bool) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sources: sources.into_iter(),
            current: None,
            buf: Vec::new(),
            start: 0,
            keep_boundaries,
            blob_bits: config.blob_bits,
            fan_bits: config.fan_bits(),
            max_blob: config.max_blob,
            read_block: config.read_block,
            failed: false,
        })
    }

    /// Split a single reader
    pub fn single(source: R, config: &SplitConfig) -> Result<Self> {
        Self::new(vec![source], config, false)
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn cut(&mut self, len: usize, level: u32) -> Chunk {
        let data = self.buf[self.start..self.start + len].to_vec();
        self.start += len;
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        }
        Chunk { data, level }
    }

    fn level_for(&self, bits: u32) -> u32 {
        if self.fan_bits == 0 {
            0
        } else {
            (bits - self.blob_bits) / self.fan_bits
        }
    }

    /// Look for a boundary in what is buffered, without reading more
    fn try_split(&mut self) -> Option<Chunk> {
        let avail = self.available();
        if avail.is_empty() {
            return None;
        }
        let window = &avail[..avail.len().min(self.max_blob)];
        if let Some((ofs, bits)) = rollsum::find_ofs(window, self.blob_bits) {
            let level = self.level_for(bits);
            return Some(self.cut(ofs, level));
        }
        if avail.len() >= self.max_blob {
            return Some(self.cut(self.max_blob, 0));
        }
        None
    }

    /// Append one block from the current source. Returns false at its end.
    fn fill(&mut self) -> std::io::Result<bool> {
        let Some(reader) = self.current.as_mut() else {
            return Ok(false);
        };
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        let old_len = self.buf.len();
        self.buf.resize(old_len + self.read_block, 0);
        let n = loop {
            match reader.read(&mut self.buf[old_len..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(old_len);
                    return Err(e);
                }
            }
        };
        self.buf.truncate(old_len + n);
        Ok(n > 0)
    }
}

impl<R: Read> Iterator for HashSplitter<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(chunk) = self.try_split() {
                return Some(Ok(chunk));
            }
            if self.current.is_none() {
                match self.sources.next() {
                    Some(reader) => self.current = Some(reader),
                    None => {
                        let rest = self.available().len();
                        return (rest > 0).then(|| Ok(self.cut(rest, 0)));
                    }
                }
            }
            match self.fill() {
                Ok(true) => {}
                Ok(false) => {
                    self.current = None;
                    let rest = self.available().len();
                    if self.keep_boundaries && rest > 0 {
                        return Some(Ok(self.cut(rest, 0)));
                    }
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(Error::Io(e)));
                }
            }
        }
    }
}

/// A built level entry: mode, id and the number of stream bytes it covers
type LevelItem = (u32, Oid, u64);

fn hex_width(total: u64) -> usize {
    format!("{total:x}").len()
}

/// Name each item by its starting byte offset, zero-padded so names sort
/// in stream order
fn make_shalist(items: &[LevelItem]) -> (Vec<TreeEntry>, u64) {
    let total: u64 = items.iter().map(|(_, _, size)| size).sum();
    let width = hex_width(total);
    let mut ofs = 0u64;
    let mut entries = Vec::with_capacity(items.len());
    for (mode, oid, size) in items {
        entries.push(TreeEntry::new(*mode, format!("{ofs:0width$x}"), *oid));
        ofs += size;
    }
    (entries, total)
}

/// Close levels `0..n`, and any level that has grown past `max_per_tree`
fn squish<S: ObjectSink>(
    sink: &mut S,
    stacks: &mut Vec<Vec<LevelItem>>,
    n: usize,
    max_per_tree: usize,
) -> std::result::Result<(), S::Error> {
    let mut i = 0;
    while i < n || stacks[i].len() >= max_per_tree {
        while stacks.len() <= i + 1 {
            stacks.push(Vec::new());
        }
        let level = std::mem::take(&mut stacks[i]);
        match level.len() {
            0 => {}
            1 => stacks[i + 1].extend(level),
            _ => {
                let (shalist, size) = make_shalist(&level);
                let oid = sink.new_tree(&shalist)?;
                trace!(level = i, children = shalist.len(), %oid, "closed split tree");
                stacks[i + 1].push((MODE_TREE, oid, size));
            }
        }
        i += 1;
    }
    Ok(())
}

fn build_shalist<S, I>(
    sink: &mut S,
    chunks: I,
    config: &SplitConfig,
) -> std::result::Result<Vec<TreeEntry>, S::Error>
where
    S: ObjectSink,
    I: Iterator<Item = Result<Chunk>>,
{
    if config.fanout == 0 {
        let mut flat = Vec::new();
        for chunk in chunks {
            let chunk = chunk?;
            let oid = sink.new_blob(&chunk.data)?;
            flat.push((MODE_FILE, oid, chunk.data.len() as u64));
        }
        return Ok(make_shalist(&flat).0);
    }

    let mut stacks: Vec<Vec<LevelItem>> = vec![Vec::new()];
    for chunk in chunks {
        let chunk = chunk?;
        let oid = sink.new_blob(&chunk.data)?;
        stacks[0].push((MODE_FILE, oid, chunk.data.len() as u64));
        squish(sink, &mut stacks, chunk.level as usize, config.max_per_tree)?;
    }
    let top = stacks.len() - 1;
    squish(sink, &mut stacks, top, config.max_per_tree)?;
    let last = stacks.pop().unwrap_or_default();
    Ok(make_shalist(&last).0)
}

fn collapse<S: ObjectSink>(
    sink: &mut S,
    shalist: Vec<TreeEntry>,
) -> std::result::Result<(u32, Oid), S::Error> {
    match shalist.len() {
        0 => Ok((MODE_FILE, sink.new_blob(b"")?)),
        1 => Ok((shalist[0].mode, shalist[0].oid)),
        _ => Ok((MODE_TREE, sink.new_tree(&shalist)?)),
    }
}

/// Split `sources` as one stream and return the top-level tree entries
pub fn split_to_shalist<S: ObjectSink, R: Read>(
    sink: &mut S,
    sources: Vec<R>,
    config: &SplitConfig,
) -> std::result::Result<Vec<TreeEntry>, S::Error> {
    build_shalist(sink, HashSplitter::new(sources, config, false)?, config)
}

/// Split `sources` as one stream into a single blob or tree.
///
/// Returns the Git mode to use for the result (`MODE_FILE` for a blob,
/// `MODE_TREE` for a chunk tree) and its id. Empty input yields the empty
/// blob; a single chunk yields that chunk's blob directly.
pub fn split_to_blob_or_tree<S: ObjectSink, R: Read>(
    sink: &mut S,
    sources: Vec<R>,
    config: &SplitConfig,
) -> std::result::Result<(u32, Oid), S::Error> {
    let shalist = split_to_shalist(sink, sources, config)?;
    collapse(sink, shalist)
}

/// Split each source independently, one blob-or-tree result per source
pub fn split_each_to_blob_or_tree<S: ObjectSink, R: Read>(
    sink: &mut S,
    sources: Vec<R>,
    config: &SplitConfig,
) -> std::result::Result<Vec<(u32, Oid)>, S::Error> {
    let mut results = Vec::with_capacity(sources.len());
    for source in sources {
        let shalist = build_shalist(sink, HashSplitter::single(source, config)?, config)?;
        results.push(collapse(sink, shalist)?);
    }
    Ok(results)
}

/// Write the bytes a blob-or-tree result stands for into `out`
pub fn join<S: ObjectSource, W: Write>(
    source: &S,
    oid: &Oid,
    out: &mut W,
) -> std::result::Result<u64, S::Error> {
    let (kind, content) = source.read_object(oid)?;
    match kind {
        ObjectKind::Blob => {
            out.write_all(&content).map_err(Error::from)?;
            Ok(content.len() as u64)
        }
        ObjectKind::Tree => {
            let mut written = 0;
            for entry in tree::decode(&content)? {
                match entry.kind() {
                    EntryKind::File | EntryKind::Tree => {
                        written += join(source, &entry.oid, out)?;
                    }
                    _ => {
                        return Err(Error::corrupt(
                            "chunk tree",
                            format!("unexpected mode {:o} in {oid}", entry.mode),
                        )
                        .into())
                    }
                }
            }
            Ok(written)
        }
        other => Err(Error::corrupt("chunk tree", format!("{oid} is a {other}")).into()),
    }
}

/// Convenience wrapper around `join` that collects into memory
pub fn join_to_vec<S: ObjectSource>(source: &S, oid: &Oid) -> std::result::Result<Vec<u8>, S::Error> {
    let mut out = Vec::new();
    join(source, oid, &mut out)?;
    Ok(out)
}
