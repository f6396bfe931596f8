//! Merging index generations

use crate::entry::Entry;
use crate::error::Result;
use crate::reader::Reader;
use crate::writer::Writer;
use cairn_core::MergeIter;
use std::cmp::Reverse;
use tracing::{debug, trace};

/// All entries of `readers` in descending path order. A path present in
/// several readers is taken from the earliest one; deleted entries are
/// carried through like any other.
pub fn merge<'a>(readers: &[&'a Reader]) -> impl Iterator<Item = Entry> + 'a {
    let sources: Vec<_> = readers.iter().map(|&r| r.iter()).collect();
    MergeIter::new(sources, |e: &Entry| Reverse(e.name.clone()))
        .with_progress(1024, |n| trace!(merged = n, "merging indexes"))
}

/// Merge `readers` into `out`; returns the number of entries copied
pub fn merge_into(readers: &[&Reader], out: &mut Writer) -> Result<u64> {
    let mut copied = 0;
    for entry in merge(readers) {
        out.add_entry(&entry)?;
        copied += 1;
    }
    debug!(sources = readers.len(), copied, "merged indexes");
    Ok(copied)
}
