/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Sorted inputs of the sort-based joins.

use qp_runtime::runtime::hw_info::DeviceLimits;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem};
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface};

use std::convert::TryFrom;
use std::ops::Range;

use crate::error::{ErrorKind, Result};
use crate::gather_scatter::GatherScatter;
use crate::partition::{RadixKey, RadixPartitioner, Relation, RelationMut, SplitAlgorithm, Tuple};
use crate::radix_sort::RadixSort;
use crate::SORT_BITS;

/// Returns the split algorithm of the radix sort, preferring `WorkGroup` if
/// its counters fit into shared memory.
pub(super) fn sort_algorithm<K, V>(
    limits: &DeviceLimits,
    block_size: BlockSize,
) -> Result<SplitAlgorithm> {
    let fits = RadixPartitioner::new(SplitAlgorithm::WorkGroup, block_size.x)?
        .shared_mem_bytes::<K, V>(1 << SORT_BITS)
        .map_or(false, |bytes| bytes <= limits.shared_mem_per_block);

    Ok(if fits {
        SplitAlgorithm::WorkGroup
    } else {
        SplitAlgorithm::WorkItem
    })
}

/// Copies `relation` into a new array-of-structures relation, and sorts it by
/// key.
///
/// The sort is stable, thus tuples with equal keys keep their input order.
pub(super) fn sorted_by_key<K, V>(
    surface: &dyn ExecutionSurface,
    block_size: BlockSize,
    relation: Relation<'_, K, V>,
) -> Result<Vec<Tuple<K, V>>>
where
    K: RadixKey,
    V: DeviceCopy + Default,
{
    let len = relation.len();
    let positions_end = u32::try_from(len).map_err(|_| {
        ErrorKind::IntegerOverflow("Join input exceeds the 32-bit position range".to_string())
    })?;

    let mut sorted = vec![Tuple::default(); len];
    if len == 0 {
        return Ok(sorted);
    }

    let positions: Vec<u32> = (0..positions_end).collect();
    let mut aos = RelationMut::Aos(&mut sorted);
    GatherScatter::new(block_size.x).scatter_views(
        surface,
        relation.as_view(),
        positions.as_launchable_slice(),
        aos.as_view(),
    )?;

    let algorithm = sort_algorithm::<K, V>(surface.device_limits(), block_size)?;
    let mut scratch = vec![Tuple::default(); len];
    RadixSort::new(algorithm, block_size.x)?.sort(
        surface,
        RelationMut::Aos(&mut sorted),
        RelationMut::Aos(&mut scratch),
        K::BITS,
    )?;

    Ok(sorted)
}

/// Returns the first index in `range` whose key is not less than `key`.
///
/// The keys returned by `key_at` must be sorted within `range`.
pub(super) fn lower_bound<K, F>(range: Range<usize>, key: K, key_at: F) -> usize
where
    K: Ord,
    F: Fn(usize) -> K,
{
    let (mut low, mut high) = (range.start, range.end);

    while low < high {
        let mid = low + (high - low) / 2;
        if key_at(mid) < key {
            low = mid + 1;
        } else {
            high = mid;
        }
    }

    low
}

/// Returns the first index in `range` whose key is greater than `key`.
///
/// The keys returned by `key_at` must be sorted within `range`.
pub(super) fn upper_bound<K, F>(range: Range<usize>, key: K, key_at: F) -> usize
where
    K: Ord,
    F: Fn(usize) -> K,
{
    let (mut low, mut high) = (range.start, range.end);

    while low < high {
        let mid = low + (high - low) / 2;
        if key_at(mid) <= key {
            low = mid + 1;
        } else {
            high = mid;
        }
    }

    low
}
