//! Cairn Index - The bupindex file that remembers what each path looked like
//!
//! This crate provides:
//! - The fixed-record entry format and its staleness rules
//! - A stack-based writer producing children-before-parent files
//! - A memory-mapped reader with tree-order and physical-order walks
//! - Merging of index generations
//! - The update pass that reconciles an index with a directory tree

pub mod entry;
pub mod error;
pub mod merge;
pub mod reader;
pub mod update;
pub mod writer;

pub use entry::{Entry, StatInfo, Timestamp};
pub use error::{Error, Result};
pub use merge::{merge, merge_into};
pub use reader::Reader;
pub use update::{update_index, MetaStore, NullMetaStore, SoftError, UpdateOptions, UpdateReport};
pub use writer::Writer;
