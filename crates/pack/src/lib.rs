//! Cairn Pack - Packfiles and the indexes that find objects in them
//!
//! This crate owns everything under `objects/pack/`:
//! - Pack writer and reader (`.pack`)
//! - Pack index v2 (`.idx`)
//! - Multi-pack index and its consolidation policy (`.midx`)
//! - Bloom filter pre-check (`bup.bloom`)
//! - `PackIdxList`, the combined existence and lookup view
//! - `Repo`, the repository directory handle

pub mod bloom;
pub mod error;
pub mod idx;
pub mod idxlist;
pub mod midx;
pub mod pack;
pub mod repo;

pub use bloom::{bloom_dir, ShaBloom};
pub use error::{Error, Result};
pub use idx::{ObjectLocation, PackIdx, PackIndexLike};
pub use idxlist::{PackIdxList, PackIndex};
pub use midx::{midx_dir, PackMidx};
pub use pack::{NoOracle, ObjectExists, PackFile, PackWriter};
pub use repo::{Repo, RepoReader};
