//! Repository directory handle
//!
//! ```text
//! <repo>/
//!   config.toml        optional, see RepoConfig
//!   objects/
//!     pack/            pack-*.pack, pack-*.idx, midx-*.midx, bup.bloom
//!     ab/cdef...       loose objects
//! ```

use crate::bloom;
use crate::error::{Error, Result};
use crate::idxlist::PackIdxList;
use crate::midx;
use crate::pack::{PackFile, PackWriter};
use cairn_core::config::{RepoConfig, CONFIG_FILE_NAME};
use cairn_core::store::{LooseStore, ObjectSource};
use cairn_core::{atomic_write, ObjectKind, Oid};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Repo {
    root: PathBuf,
    config: RepoConfig,
}

impl Repo {
    /// Create the directory layout (if needed) and open it
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("objects").join("pack"))?;
        let config_path = root.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            atomic_write(&config_path, RepoConfig::default().to_toml()?.as_bytes())?;
        }
        debug!(root = %root.display(), "initialized repository");
        Self::open(root)
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join("objects").join("pack").is_dir() {
            return Err(Error::NotARepository(root));
        }
        let config = RepoConfig::load(&root)?;
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    pub fn pack_dir(&self) -> PathBuf {
        self.objects_dir().join("pack")
    }

    pub fn loose(&self) -> LooseStore {
        LooseStore::new(self.objects_dir(), self.config.pack.compression)
    }

    /// Lookup over this repository's packs, consolidating them into midx
    /// files when there are too many
    pub fn idx_list(&self) -> Result<PackIdxList> {
        PackIdxList::with_auto_midx(self.pack_dir(), self.config.midx.clone())
    }

    /// A writer that skips objects already in this repository's packs
    pub fn pack_writer(&self) -> Result<PackWriter<PackIdxList>> {
        Ok(PackWriter::with_oracle(
            self.pack_dir(),
            self.config.clone(),
            self.idx_list()?,
        ))
    }

    pub fn midx_dir(&self, force: bool) -> Result<Vec<PathBuf>> {
        midx::midx_dir(&self.pack_dir(), &self.config.midx, force)
    }

    pub fn bloom_dir(&self, force: bool) -> Result<Option<PathBuf>> {
        bloom::bloom_dir(&self.pack_dir(), &self.config.bloom, force)
    }

    /// Reader over the packs as they are now, then the loose objects
    pub fn reader(&self) -> Result<RepoReader> {
        Ok(RepoReader {
            list: RefCell::new(self.idx_list()?),
            packs: RefCell::new(HashMap::new()),
            loose: self.loose(),
        })
    }

    /// One-off object read; use `reader` for many
    pub fn read_object(&self, oid: &Oid) -> Result<(ObjectKind, Vec<u8>)> {
        self.reader()?.read_object(oid)
    }
}

/// Reads objects by id, keeping opened packs for reuse
pub struct RepoReader {
    list: RefCell<PackIdxList>,
    packs: RefCell<HashMap<PathBuf, PackFile>>,
    loose: LooseStore,
}

impl RepoReader {
    pub fn exists(&self, oid: &Oid) -> bool {
        self.list.borrow_mut().exists(oid) || self.loose.exists(oid)
    }
}

impl ObjectSource for RepoReader {
    type Error = Error;

    fn read_object(&self, oid: &Oid) -> Result<(ObjectKind, Vec<u8>)> {
        let location = self.list.borrow_mut().find(oid)?;
        if let Some(loc) = location {
            let mut packs = self.packs.borrow_mut();
            if !packs.contains_key(&loc.idx) {
                let pack = PackFile::open(&loc.idx)?;
                packs.insert(loc.idx.clone(), pack);
            }
            if let Some(pack) = packs.get(&loc.idx) {
                return pack.read_at(loc.offset);
            }
        }
        self.loose.read(oid)?.ok_or(Error::NotFound(*oid))
    }
}
