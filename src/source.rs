// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Input intake and partitioning.
//!
//! The input sequence is enumerated exactly once per run and materialized
//! into a buffer, so that lazy or single-pass sources are never enumerated
//! twice and every item keeps a stable index under concurrent dispatch.
//!
//! For bounded runs, the materialized items are split into contiguous
//! partitions: partition `w` out of `n` covers indices
//! `w*len/n..(w+1)*len/n`, so that all partitions are disjoint, their sizes
//! differ by at most one, and their union covers `0..len` exactly.

/// Enumerates the given sequence once into an indexable buffer.
///
/// Sources with an exact size hint are materialized with a single allocation.
pub(crate) fn materialize<I: IntoIterator>(items: I) -> Vec<I::Item> {
    let items = items.into_iter();
    let (lower, upper) = items.size_hint();
    let mut buffer = Vec::with_capacity(upper.unwrap_or(lower));
    buffer.extend(items);
    buffer
}

/// Splits the materialized items into `num_workers` contiguous partitions.
///
/// Each index in `0..items.len()` appears in exactly one partition, partition
/// sizes differ by at most one, and indices are assigned in enumeration
/// order. More workers than items is legal: the surplus partitions are
/// empty.
pub(crate) fn split<T>(items: Vec<T>, num_workers: usize) -> Vec<Partition<T>> {
    let num_items = items.len();
    let mut rest = items.into_iter();
    (0..num_workers)
        .map(|worker| {
            let start = (worker * num_items) / num_workers;
            let end = ((worker + 1) * num_items) / num_workers;
            Partition {
                next_index: start,
                items: rest
                    .by_ref()
                    .take(end - start)
                    .collect::<Vec<_>>()
                    .into_iter(),
            }
        })
        .collect()
}

/// An exhaustible cursor over one worker's contiguous slice of the input,
/// yielding each item together with its original index.
pub(crate) struct Partition<T> {
    /// Original index of the next item in this partition.
    next_index: usize,
    /// Remaining items of this partition.
    items: std::vec::IntoIter<T>,
}

impl<T> Partition<T> {
    /// Number of items remaining in this partition.
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

impl<T> Iterator for Partition<T> {
    type Item = (usize, T);

    fn next(&mut self) -> Option<(usize, T)> {
        let item = self.items.next()?;
        let index = self.next_index;
        self.next_index += 1;
        Some((index, item))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn materialize_preserves_enumeration_order() {
        let buffer = materialize((0..10).map(|i| i * i));
        assert_eq!(buffer, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
    }

    #[test]
    fn materialize_handles_an_inexact_size_hint() {
        // A filtered iterator only reports a size range.
        let buffer = materialize((0..10).filter(|i| i % 2 == 0));
        assert_eq!(buffer, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn partitions_pair_items_with_original_indices() {
        let partitions = split((0..7).map(|i| i * 10).collect(), 3);
        let pairs = partitions
            .into_iter()
            .map(|partition| partition.collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                vec![(0, 0), (1, 10)],
                vec![(2, 20), (3, 30)],
                vec![(4, 40), (5, 50), (6, 60)],
            ]
        );
    }

    #[test]
    fn partitions_cover_all_indices_exactly_once() {
        for num_items in [0, 1, 2, 5, 17, 100] {
            for num_workers in [1, 2, 3, 7, 100, 128] {
                let partitions = split((0..num_items).collect::<Vec<_>>(), num_workers);
                assert_eq!(partitions.len(), num_workers);

                let mut seen = vec![false; num_items];
                for partition in partitions {
                    let mut previous = None;
                    for (index, item) in partition {
                        // Indices are contiguous within a partition and match
                        // the item they were paired with.
                        assert_eq!(index, item);
                        if let Some(previous) = previous {
                            assert_eq!(index, previous + 1);
                        }
                        previous = Some(index);
                        assert!(!seen[index], "index {index} appeared twice");
                        seen[index] = true;
                    }
                }
                assert!(seen.iter().all(|&visited| visited));
            }
        }
    }

    #[test]
    fn partition_sizes_differ_by_at_most_one() {
        for num_items in [0, 1, 5, 17, 100] {
            for num_workers in [1, 2, 3, 7, 100, 128] {
                let sizes = split((0..num_items).collect::<Vec<_>>(), num_workers)
                    .iter()
                    .map(Partition::len)
                    .collect::<Vec<_>>();
                let min = sizes.iter().min().unwrap();
                let max = sizes.iter().max().unwrap();
                assert!(max - min <= 1);
                assert_eq!(sizes.iter().sum::<usize>(), num_items);
            }
        }
    }

    #[test]
    fn more_workers_than_items_yields_empty_partitions() {
        let partitions = split(vec![1, 2, 3], 5);
        assert_eq!(partitions.len(), 5);
        let sizes = partitions.iter().map(Partition::len).collect::<Vec<_>>();
        assert_eq!(sizes.iter().sum::<usize>(), 3);
        assert!(sizes.iter().any(|&size| size == 0));
    }
}
