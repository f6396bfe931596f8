//! Error type for pack, index, midx and bloom files

use cairn_core::Oid;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Object(#[from] cairn_core::Error),

    #[error("{}: not a valid {what}: {detail}", path.display())]
    Corrupt {
        path: PathBuf,
        what: &'static str,
        detail: String,
    },

    #[error("{}: unsupported {what} version {version}", path.display())]
    UnsupportedVersion {
        path: PathBuf,
        what: &'static str,
        version: u32,
    },

    #[error("object not found: {0}")]
    NotFound(Oid),

    #[error("not a repository: {}", .0.display())]
    NotARepository(PathBuf),
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, what: &'static str, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            what,
            detail: detail.into(),
        }
    }
}
