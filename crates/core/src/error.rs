//! Error type shared by the object codec, chunker and tree builder

use thiserror::Error;

/// Common result type used throughout cairn-core
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt {what}: {detail}")]
    Corrupt { what: &'static str, detail: String },

    #[error("unknown object type tag: {0}")]
    UnknownObjectType(u8),

    #[error("unknown object type name: {0:?}")]
    UnknownTypeName(String),

    #[error("unsupported delta object (pack type {0})")]
    UnsupportedDelta(u8),

    #[error("invalid object id: {0:?}")]
    InvalidOid(String),

    #[error("object not found: {0}")]
    NotFound(crate::oid::Oid),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Constructs a corruption error for the named structure.
    pub fn corrupt(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            what,
            detail: detail.into(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(value: toml::de::Error) -> Self {
        Error::Config(value.to_string())
    }
}
