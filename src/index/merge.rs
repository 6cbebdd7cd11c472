// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::entry::{IndexEntry, IndexKey};
use min_max_heap::MinMaxHeap;

pub type BoxedIterator<'a> = Box<dyn Iterator<Item = crate::Result<IndexEntry>> + 'a>;

#[derive(Debug)]
struct IteratorValue {
    source: usize,
    entry: IndexEntry,
}

impl IteratorValue {
    fn key(&self) -> IndexKey {
        self.entry.key()
    }
}

impl PartialEq for IteratorValue {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && self.source == other.source
    }
}
impl Eq for IteratorValue {}

impl PartialOrd for IteratorValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IteratorValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.key(), self.source).cmp(&(other.key(), other.source))
    }
}

/// This iterator can iterate through N iterators simultaneously in table order
///
/// Every source needs to yield its entries in table order.
/// Sources are given newest first: if multiple sources yield the same key,
/// the entry of the newest source is kept and the others are skipped.
pub struct MergeIterator<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: MinMaxHeap<IteratorValue>,
    is_initialized: bool,
}

impl<'a> MergeIterator<'a> {
    /// Initializes a new merge iterator
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        let heap = MinMaxHeap::with_capacity(iterators.len());

        Self {
            iterators,
            heap,
            is_initialized: false,
        }
    }

    fn advance(&mut self, source: usize) -> crate::Result<()> {
        if let Some(iterator) = self.iterators.get_mut(source) {
            if let Some(entry) = iterator.next() {
                self.heap.push(IteratorValue {
                    source,
                    entry: entry?,
                });
            }
        }
        Ok(())
    }

    fn initialize(&mut self) -> crate::Result<()> {
        for source in 0..self.iterators.len() {
            self.advance(source)?;
        }
        self.is_initialized = true;
        Ok(())
    }
}

impl<'a> Iterator for MergeIterator<'a> {
    type Item = crate::Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.is_initialized {
            if let Err(e) = self.initialize() {
                return Some(Err(e));
            }
        }

        let head = self.heap.pop_min()?;

        if let Err(e) = self.advance(head.source) {
            return Some(Err(e));
        }

        // NOTE: Skip shadowed entries of older sources
        while let Some(next) = self.heap.peek_min() {
            if next.key() != head.key() {
                break;
            }

            let source = next.source;
            self.heap.pop_min();

            if let Err(e) = self.advance(source) {
                return Some(Err(e));
            }
        }

        Some(Ok(head.entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn source(entries: Vec<IndexEntry>) -> BoxedIterator<'static> {
        Box::new(entries.into_iter().map(Ok))
    }

    #[test]
    fn merge_disjoint() -> crate::Result<()> {
        let iter0 = source((0..100).rev().map(|v| IndexEntry::new(3, v, v)).collect());
        let iter1 = source((0..100).rev().map(|v| IndexEntry::new(2, v, v)).collect());
        let iter2 = source((0..100).rev().map(|v| IndexEntry::new(1, v, v)).collect());

        let merged = MergeIterator::new(vec![iter2, iter0, iter1]).collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(300, merged.len());

        for pair in merged.windows(2) {
            assert!(pair[0].key() < pair[1].key());
        }

        Ok(())
    }

    #[test]
    fn merge_newest_wins() -> crate::Result<()> {
        let newest = source(vec![IndexEntry::new(1, 5, 500), IndexEntry::new(1, 3, 300)]);
        let middle = source(vec![
            IndexEntry::new(1, 5, 50),
            IndexEntry::new(1, 4, 40),
            IndexEntry::new(1, 3, 30),
        ]);
        let oldest = source(vec![IndexEntry::new(1, 5, 5), IndexEntry::new(1, 0, 0)]);

        let merged =
            MergeIterator::new(vec![newest, middle, oldest]).collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(
            vec![
                IndexEntry::new(1, 5, 500),
                IndexEntry::new(1, 4, 40),
                IndexEntry::new(1, 3, 300),
                IndexEntry::new(1, 0, 0),
            ],
            merged
        );

        Ok(())
    }

    #[test]
    fn merge_empty() {
        assert_eq!(0, MergeIterator::new(vec![]).count());
        assert_eq!(0, MergeIterator::new(vec![source(vec![]), source(vec![])]).count());
    }

    #[test]
    fn merge_forwards_errors() {
        let broken: BoxedIterator<'static> = Box::new(std::iter::once(Err(crate::Error::Poisoned)));
        let mut merged = MergeIterator::new(vec![source(vec![IndexEntry::new(1, 0, 0)]), broken]);

        assert!(matches!(merged.next(), Some(Err(crate::Error::Poisoned))));
    }
}
