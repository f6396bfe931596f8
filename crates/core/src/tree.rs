//! Git tree objects
//!
//! A tree is a list of `"<octal mode> <name>\0<20-byte oid>"` records.
//! Records are sorted by name, with directory names compared as if they
//! ended in `/`, so `foo.c` sorts before the directory `foo` but after
//! the file `foo`.

use crate::error::{Error, Result};
use crate::oid::{Oid, OID_LEN};
use smallvec::SmallVec;

/// Regular file
pub const MODE_FILE: u32 = 0o100644;
/// Executable file
pub const MODE_EXEC: u32 = 0o100755;
/// Subdirectory
pub const MODE_TREE: u32 = 0o40000;
/// Symbolic link
pub const MODE_SYMLINK: u32 = 0o120000;
/// Submodule commit
pub const MODE_GITLINK: u32 = 0o160000;

/// Type of tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular or executable file
    File,
    /// Subtree
    Tree,
    /// Symbolic link
    Symlink,
    /// Submodule
    Gitlink,
}

impl EntryKind {
    /// Classify a Git mode
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o040000 => EntryKind::Tree,
            0o120000 => EntryKind::Symlink,
            0o160000 => EntryKind::Gitlink,
            _ => EntryKind::File,
        }
    }
}

/// Entry in a tree object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeEntry {
    /// Git mode bits
    pub mode: u32,
    /// Entry name, no slashes
    pub name: SmallVec<[u8; 32]>,
    /// Id of the referenced blob or tree
    pub oid: Oid,
}

impl TreeEntry {
    /// Create an entry
    pub fn new(mode: u32, name: impl AsRef<[u8]>, oid: Oid) -> Self {
        Self {
            mode,
            name: SmallVec::from_slice(name.as_ref()),
            oid,
        }
    }

    /// Regular file entry
    pub fn file(name: impl AsRef<[u8]>, oid: Oid) -> Self {
        Self::new(MODE_FILE, name, oid)
    }

    /// Subtree entry
    pub fn tree(name: impl AsRef<[u8]>, oid: Oid) -> Self {
        Self::new(MODE_TREE, name, oid)
    }

    pub fn kind(&self) -> EntryKind {
        EntryKind::from_mode(self.mode)
    }

    /// Key that gives Git's canonical order
    pub fn sort_key(&self) -> SmallVec<[u8; 32]> {
        let mut key = SmallVec::from_slice(&self.name);
        if self.kind() == EntryKind::Tree {
            key.push(b'/');
        }
        key
    }
}

/// Encode entries into tree object content, sorting them canonically
pub fn encode(entries: &[TreeEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by_cached_key(|e| e.sort_key());

    let mut out = Vec::with_capacity(entries.len() * (OID_LEN + 16));
    for e in sorted {
        out.extend_from_slice(format!("{:o} ", e.mode).as_bytes());
        out.extend_from_slice(&e.name);
        out.push(0);
        out.extend_from_slice(e.oid.as_bytes());
    }
    out
}

/// Decode tree object content, preserving stored order
pub fn decode(mut data: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        let space = data
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::corrupt("tree", "entry without mode separator"))?;
        let mode = std::str::from_utf8(&data[..space])
            .ok()
            .and_then(|s| u32::from_str_radix(s, 8).ok())
            .ok_or_else(|| Error::corrupt("tree", "mode is not octal"))?;
        let rest = &data[space + 1..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::corrupt("tree", "unterminated entry name"))?;
        let name = &rest[..nul];
        let oid_start = nul + 1;
        if rest.len() < oid_start + OID_LEN {
            return Err(Error::corrupt("tree", "truncated object id"));
        }
        let oid = Oid::from_slice(&rest[oid_start..oid_start + OID_LEN])?;
        entries.push(TreeEntry::new(mode, name, oid));
        data = &rest[oid_start + OID_LEN..];
    }
    Ok(entries)
}
