//! N-way merge of already-sorted sequences
//!
//! Used to build multi-pack indexes from many pack indexes and to merge
//! bupindex generations. Items with a key equal to the previously emitted
//! key are dropped; among equal keys the lowest-numbered source wins.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct HeapEntry<K, T> {
    key: K,
    source: usize,
    item: T,
}

impl<K: Ord, T> PartialEq for HeapEntry<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl<K: Ord, T> Eq for HeapEntry<K, T> {}

impl<K: Ord, T> PartialOrd for HeapEntry<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> Ord for HeapEntry<K, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Lazily merges sorted sources into one sorted, de-duplicated sequence
pub struct MergeIter<'a, I, K, F>
where
    I: Iterator,
{
    sources: Vec<I>,
    heap: BinaryHeap<HeapEntry<K, I::Item>>,
    key_fn: F,
    last: Option<K>,
    emitted: usize,
    progress: Option<(usize, Box<dyn FnMut(usize) + 'a>)>,
}

impl<'a, I, K, F> MergeIter<'a, I, K, F>
where
    I: Iterator,
    K: Ord + Clone,
    F: FnMut(&I::Item) -> K,
{
    /// Merge `sources`, each of which must already be ascending by `key_fn`
    pub fn new(sources: Vec<I>, mut key_fn: F) -> Self {
        let mut sources = sources;
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some(item) = iter.next() {
                heap.push(HeapEntry {
                    key: key_fn(&item),
                    source,
                    item,
                });
            }
        }
        Self {
            sources,
            heap,
            key_fn,
            last: None,
            emitted: 0,
            progress: None,
        }
    }

    /// Call `callback` with the running output count every `every` items
    pub fn with_progress(mut self, every: usize, callback: impl FnMut(usize) + 'a) -> Self {
        self.progress = Some((every.max(1), Box::new(callback)));
        self
    }

    /// Number of items emitted so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

impl<'a, I, K, F> Iterator for MergeIter<'a, I, K, F>
where
    I: Iterator,
    K: Ord + Clone,
    F: FnMut(&I::Item) -> K,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(HeapEntry { key, source, item }) = self.heap.pop() {
            if let Some(next) = self.sources[source].next() {
                self.heap.push(HeapEntry {
                    key: (self.key_fn)(&next),
                    source,
                    item: next,
                });
            }
            if self.last.as_ref() == Some(&key) {
                continue;
            }
            self.last = Some(key);
            self.emitted += 1;
            if let Some((every, callback)) = self.progress.as_mut() {
                if self.emitted % *every == 0 {
                    callback(self.emitted);
                }
            }
            return Some(item);
        }
        None
    }
}
