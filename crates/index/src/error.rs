//! Error type for bupindex files and the update pass

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Object(#[from] cairn_core::Error),

    #[error("{}: not a valid index: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error("{}: index header: expected {expected:?}, got {found:?}", path.display())]
    BadHeader {
        path: PathBuf,
        expected: Vec<u8>,
        found: Vec<u8>,
    },

    #[error("{next:?} must come before {previous:?}")]
    OutOfOrder { previous: String, next: String },

    #[error("invalid index path {0:?}: {1}")]
    InvalidPath(String, &'static str),

    #[error("{}: index is read-only", .0.display())]
    ReadOnly(PathBuf),
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }
}
