//! Repository configuration via `config.toml`
//!
//! Every field has a default, so a missing file or a partial file is
//! fine. Values are passed explicitly to the components that need them;
//! nothing here is global.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name placed in the repository directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level repository configuration
///
/// # Example
///
/// ```toml
/// [pack]
/// max_bytes = 1000000000
/// compression = 1
///
/// [split]
/// fanout = 16
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub pack: PackConfig,
    pub split: SplitConfig,
    pub midx: MidxConfig,
    pub bloom: BloomConfig,
    pub index: IndexConfig,
}

/// Pack writer thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Roll over to a new pack once this many bytes are written
    pub max_bytes: u64,
    /// Roll over to a new pack once this many objects are written
    pub max_objects: u64,
    /// zlib level used for packed objects (0-9)
    pub compression: u32,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1_000_000_000,
            max_objects: 200_000,
            compression: 1,
        }
    }
}

/// Chunker and tree builder parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Number of low rolling-sum bits that must match for a boundary
    pub blob_bits: u32,
    /// Hard upper bound on a chunk
    pub max_blob: usize,
    /// Average tree branching factor; 0 builds a flat list of blobs
    pub fanout: u32,
    /// Children per tree before a level is forced to close
    pub max_per_tree: usize,
    /// Bytes read from the input per refill
    pub read_block: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            blob_bits: 13,
            max_blob: 32 * 1024,
            fanout: 16,
            max_per_tree: 256,
            read_block: 1024 * 1024,
        }
    }
}

impl SplitConfig {
    /// Reject settings the chunker cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(1..=30).contains(&self.blob_bits) {
            return Err(Error::Config(format!(
                "split.blob_bits must be 1-30, got {}",
                self.blob_bits
            )));
        }
        if self.max_blob == 0 || self.read_block == 0 {
            return Err(Error::Config(
                "split.max_blob and split.read_block must be positive".into(),
            ));
        }
        if self.fanout != 0 && !self.fanout.is_power_of_two() {
            return Err(Error::Config(format!(
                "split.fanout must be 0 or a power of two, got {}",
                self.fanout
            )));
        }
        if self.max_per_tree < 2 {
            return Err(Error::Config("split.max_per_tree must be at least 2".into()));
        }
        Ok(())
    }

    /// Extra boundary bits per fanout level (`log2(fanout)`)
    pub fn fan_bits(&self) -> u32 {
        if self.fanout <= 1 {
            0
        } else {
            31 - self.fanout.leading_zeros()
        }
    }
}

/// Midx consolidation thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidxConfig {
    /// Consolidate once more than this many indexes exist
    pub high_water: usize,
    /// Stop consolidating at this many indexes
    pub low_water: usize,
    /// Files opened per merge; 0 derives it from the descriptor limit
    pub max_files: usize,
}

impl Default for MidxConfig {
    fn default() -> Self {
        Self {
            high_water: 5,
            low_water: 2,
            max_files: 0,
        }
    }
}

/// Bloom filter tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    /// Rebuild instead of growing once the predicted rate passes this (percent)
    pub max_false_positive: f64,
    /// Number of probes; 0 picks 5 or 4 from the table size
    pub k: u32,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            max_false_positive: 1.0,
            k: 0,
        }
    }
}

/// bupindex staleness options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Treat a changed device number as a change
    pub check_device: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { check_device: true }
    }
}

impl RepoConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: RepoConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `config.toml` from a repository directory, falling back to defaults
    pub fn load(repo_dir: &Path) -> Result<Self> {
        let path = repo_dir.join(CONFIG_FILE_NAME);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serialize to TOML text
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.pack.compression > 9 {
            return Err(Error::Config(format!(
                "pack.compression must be 0-9, got {}",
                self.pack.compression
            )));
        }
        self.split.validate()?;
        if self.midx.low_water == 0 || self.midx.low_water > self.midx.high_water {
            return Err(Error::Config(format!(
                "midx.low_water must be in 1..=high_water ({}), got {}",
                self.midx.high_water, self.midx.low_water
            )));
        }
        if !matches!(self.bloom.k, 0 | 4 | 5) {
            return Err(Error::Config(format!(
                "bloom.k must be 0, 4 or 5, got {}",
                self.bloom.k
            )));
        }
        Ok(())
    }
}
