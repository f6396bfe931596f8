//! Object store capabilities and the loose object directory
//!
//! The chunker and tree builder only need two capabilities: write an object
//! and get its id back (`ObjectSink`), and read an object by id
//! (`ObjectSource`). Pack writers, the in-memory `MemStore` and the loose
//! store all implement them.
//!
//! Loose objects live under:
//! ```text
//! objects/
//!   ab/
//!     cdef0123...   (remaining 38 hex digits)
//! ```

use crate::error::{Error, Result};
use crate::object::{self, hash_object, ObjectKind};
use crate::oid::Oid;
use crate::tree::{self, TreeEntry};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Somewhere objects can be written
pub trait ObjectSink {
    type Error: From<Error>;

    /// Store an object, returning its id. Storing an existing object is a no-op.
    fn write_object(&mut self, kind: ObjectKind, content: &[u8]) -> std::result::Result<Oid, Self::Error>;

    fn new_blob(&mut self, data: &[u8]) -> std::result::Result<Oid, Self::Error> {
        self.write_object(ObjectKind::Blob, data)
    }

    fn new_tree(&mut self, entries: &[TreeEntry]) -> std::result::Result<Oid, Self::Error> {
        self.write_object(ObjectKind::Tree, &tree::encode(entries))
    }
}

/// Somewhere objects can be read back from
pub trait ObjectSource {
    type Error: From<Error>;

    /// Fetch an object, failing with `NotFound` if it is absent
    fn read_object(&self, oid: &Oid) -> std::result::Result<(ObjectKind, Vec<u8>), Self::Error>;
}

/// In-memory object map, for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    objects: HashMap<Oid, (ObjectKind, Vec<u8>)>,
    writes: usize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, oid: &Oid) -> bool {
        self.objects.contains_key(oid)
    }

    /// Total write calls, including ones for objects already present
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Iterate over stored objects in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (&Oid, ObjectKind, &[u8])> {
        self.objects
            .iter()
            .map(|(oid, (kind, content))| (oid, *kind, content.as_slice()))
    }
}

impl ObjectSink for MemStore {
    type Error = Error;

    fn write_object(&mut self, kind: ObjectKind, content: &[u8]) -> Result<Oid> {
        let oid = hash_object(kind, content);
        self.writes += 1;
        self.objects
            .entry(oid)
            .or_insert_with(|| (kind, content.to_vec()));
        Ok(oid)
    }
}

impl ObjectSource for MemStore {
    type Error = Error;

    fn read_object(&self, oid: &Oid) -> Result<(ObjectKind, Vec<u8>)> {
        self.objects
            .get(oid)
            .map(|(kind, content)| (*kind, content.clone()))
            .ok_or(Error::NotFound(*oid))
    }
}

/// Write `data` to a temp file beside `target`, fsync it, then rename into place.
///
/// Readers never observe a partially written `target`.
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "target has no parent")))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Directory of zlib-framed loose objects
#[derive(Debug, Clone)]
pub struct LooseStore {
    objects_dir: PathBuf,
    compression: u32,
}

impl LooseStore {
    pub fn new(objects_dir: impl Into<PathBuf>, compression: u32) -> Self {
        Self {
            objects_dir: objects_dir.into(),
            compression,
        }
    }

    /// Path of the file holding `oid`
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        let hex = oid.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    pub fn exists(&self, oid: &Oid) -> bool {
        self.object_path(oid).is_file()
    }

    /// Read an object, returning `Ok(None)` if it is not stored loose
    pub fn read(&self, oid: &Oid) -> Result<Option<(ObjectKind, Vec<u8>)>> {
        let raw = match std::fs::read(self.object_path(oid)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (kind, content) = object::decode_loose(&raw)?;
        if hash_object(kind, &content) != *oid {
            return Err(Error::corrupt(
                "loose object",
                format!("{oid} does not hash to its own name"),
            ));
        }
        Ok(Some((kind, content)))
    }
}

impl ObjectSink for LooseStore {
    type Error = Error;

    fn write_object(&mut self, kind: ObjectKind, content: &[u8]) -> Result<Oid> {
        let oid = hash_object(kind, content);
        let path = self.object_path(&oid);
        if path.exists() {
            return Ok(oid);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(&path, &object::encode_loose(kind, content, self.compression)?)?;
        Ok(oid)
    }
}

impl ObjectSource for LooseStore {
    type Error = Error;

    fn read_object(&self, oid: &Oid) -> Result<(ObjectKind, Vec<u8>)> {
        self.read(oid)?.ok_or(Error::NotFound(*oid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_store_dedups() {
        let mut store = MemStore::new();
        let a = store.new_blob(b"same").unwrap();
        let b = store.new_blob(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.writes(), 2);
        assert_eq!(store.read_object(&a).unwrap(), (ObjectKind::Blob, b"same".to_vec()));
        assert!(matches!(
            store.read_object(&Oid::FAKE),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_atomic_write_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file");
        atomic_write(&target, b"one").unwrap();
        atomic_write(&target, b"two").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"two");
        // no temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_loose_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LooseStore::new(dir.path().join("objects"), 1);
        let oid = store.new_blob(b"hello\n").unwrap();
        assert_eq!(oid.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert!(dir
            .path()
            .join("objects/ce/013625030ba8dba906f756967f9e9ca394464a")
            .is_file());
        assert_eq!(
            store.read(&oid).unwrap(),
            Some((ObjectKind::Blob, b"hello\n".to_vec()))
        );
        assert_eq!(store.read(&Oid::FAKE).unwrap(), None);
    }

    #[test]
    fn test_loose_store_detects_wrong_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LooseStore::new(dir.path(), 1);
        let oid = store.new_blob(b"original").unwrap();
        std::fs::write(
            store.object_path(&oid),
            object::encode_loose(ObjectKind::Blob, b"tampered", 1).unwrap(),
        )
        .unwrap();
        assert!(store.read(&oid).is_err());
    }
}
