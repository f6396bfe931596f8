//! Cairn Core - Content-addressed object primitives for the Cairn backup store
//!
//! This crate provides the foundational layer shared by the pack and index crates:
//! - SHA-1 object ids and Git object hashing
//! - Loose and packed object framing (zlib)
//! - Tree and commit object encoding
//! - Rolling-checksum content-defined chunking
//! - Bounded-fanout tree building over chunk streams
//! - N-way sorted merge
//! - Repository configuration

pub mod commit;
pub mod config;
pub mod error;
pub mod hashsplit;
pub mod merge;
pub mod object;
pub mod oid;
pub mod rollsum;
pub mod store;
pub mod tree;

// Re-export main types for convenience
pub use commit::{Commit, Signature};
pub use config::RepoConfig;
pub use error::{Error, Result};
pub use hashsplit::{join, split_to_blob_or_tree, Chunk, HashSplitter};
pub use merge::MergeIter;
pub use object::ObjectKind;
pub use oid::Oid;
pub use store::{atomic_write, LooseStore, MemStore, ObjectSink, ObjectSource};
pub use tree::{EntryKind, TreeEntry};
