// Copyright 2021-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hash tables in work-group shared memory.
//!
//! The tables index into an array of build tuples that is also kept in shared
//! memory. Slots store the index of a build tuple, or `EMPTY_SLOT`.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::surface::WorkGroup;

use std::cmp;
use std::mem::size_of;

use super::{HashingScheme, HtEntry};
use crate::constants::JOIN_HT_LOAD_FACTOR_PERCENT;
use crate::partition::{hash_key, RadixKey};
use crate::prefix_scan::padded_len;

pub(super) const EMPTY_SLOT: u32 = u32::max_value();

/// Returns the number of slots of a table that holds `capacity` tuples.
pub(super) fn slot_count(scheme: HashingScheme, capacity: usize) -> usize {
    let slots = match scheme {
        HashingScheme::LinearProbing => capacity * 100 / JOIN_HT_LOAD_FACTOR_PERCENT,
        HashingScheme::BucketChaining => capacity,
    };

    cmp::max(slots, 1).next_power_of_two()
}

/// Returns the slot of `key` in a table of `mask + 1` slots.
///
/// Partitioning consumes the hash bits from the bottom up, thus the slot is
/// taken from the upper half of the hash.
pub(super) fn slot_of<K: RadixKey>(key: K, mask: usize) -> usize {
    (hash_key(key) >> 32) as usize & mask
}

/// Returns the shared memory bytes needed by a probe work-group with an
/// on-chip capacity of `capacity` build tuples.
pub(super) fn probe_shared_bytes<K, V>(
    scheme: HashingScheme,
    capacity: usize,
    block_size: u32,
) -> Option<usize> {
    let tuple_bytes = capacity.checked_mul(size_of::<HtEntry<K, V>>())?;
    let slot_bytes = slot_count(scheme, capacity).checked_mul(size_of::<u32>())?;
    let chain_bytes = match scheme {
        HashingScheme::LinearProbing => 0,
        HashingScheme::BucketChaining => capacity.checked_mul(size_of::<u32>())?,
    };
    let scan_bytes = padded_len(block_size as usize) * size_of::<u64>();

    tuple_bytes
        .checked_add(slot_bytes)?
        .checked_add(chain_bytes)?
        .checked_add(scan_bytes)
}

/// Returns the largest power-of-two capacity that fits into `shared_mem`
/// bytes, or zero if not even one tuple fits.
pub(super) fn max_capacity<K, V>(scheme: HashingScheme, block_size: u32, shared_mem: usize) -> usize {
    let entry_size = cmp::max(size_of::<HtEntry<K, V>>(), 1);
    let mut capacity = cmp::max(shared_mem / entry_size, 1).next_power_of_two();

    while capacity > 0
        && probe_shared_bytes::<K, V>(scheme, capacity, block_size)
            .map_or(true, |bytes| bytes > shared_mem)
    {
        capacity >>= 1;
    }

    capacity
}

/// An open-addressed or chained hash table in shared memory.
pub(super) enum OnChipTable {
    LinearProbing { slots: Vec<u32> },
    BucketChaining { heads: Vec<u32>, next: Vec<u32> },
}

impl OnChipTable {
    pub(super) fn alloc(
        group: &mut WorkGroup<'_>,
        scheme: HashingScheme,
        capacity: usize,
    ) -> RtResult<Self> {
        let slots = slot_count(scheme, capacity);

        let table = match scheme {
            HashingScheme::LinearProbing => OnChipTable::LinearProbing {
                slots: group.alloc_shared(slots)?,
            },
            HashingScheme::BucketChaining => OnChipTable::BucketChaining {
                heads: group.alloc_shared(slots)?,
                next: group.alloc_shared(capacity)?,
            },
        };

        Ok(table)
    }

    /// Marks all slots as empty.
    pub(super) fn clear(&mut self, group: &WorkGroup<'_>) {
        let block_size = group.block_size() as usize;
        let slots = match self {
            OnChipTable::LinearProbing { slots } => slots,
            OnChipTable::BucketChaining { heads, .. } => heads,
        };
        let len = slots.len();

        for lane in group.lanes() {
            for slot in (lane as usize..len).step_by(block_size) {
                slots[slot] = EMPTY_SLOT;
            }
        }
    }

    /// Inserts the build tuple at `index`.
    ///
    /// Returns `false` if the table is full.
    pub(super) fn insert<K: RadixKey, V>(&mut self, build: &[HtEntry<K, V>], index: u32) -> bool {
        let key = build[index as usize].key;

        match self {
            OnChipTable::LinearProbing { slots } => {
                let mask = slots.len() - 1;
                let mut slot = slot_of(key, mask);

                for _ in 0..slots.len() {
                    if slots[slot] == EMPTY_SLOT {
                        slots[slot] = index;
                        return true;
                    }
                    slot = (slot + 1) & mask;
                }

                false
            }
            OnChipTable::BucketChaining { heads, next } => {
                if index as usize >= next.len() {
                    return false;
                }

                let head = slot_of(key, heads.len() - 1);
                next[index as usize] = heads[head];
                heads[head] = index;
                true
            }
        }
    }

    /// Calls `on_match` for each build tuple with key `key`.
    pub(super) fn probe<K, V, F>(&self, build: &[HtEntry<K, V>], key: K, mut on_match: F)
    where
        K: RadixKey,
        F: FnMut(&HtEntry<K, V>),
    {
        match self {
            OnChipTable::LinearProbing { slots } => {
                let mask = slots.len() - 1;
                let mut slot = slot_of(key, mask);

                for _ in 0..slots.len() {
                    let index = slots[slot];
                    if index == EMPTY_SLOT {
                        break;
                    }

                    let entry = &build[index as usize];
                    if entry.key == key {
                        on_match(entry);
                    }
                    slot = (slot + 1) & mask;
                }
            }
            OnChipTable::BucketChaining { heads, next } => {
                let mut index = heads[slot_of(key, heads.len() - 1)];

                while index != EMPTY_SLOT {
                    let entry = &build[index as usize];
                    if entry.key == key {
                        on_match(entry);
                    }
                    index = next[index as usize];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Tuple;
    use qp_runtime::runtime::hw_info::DeviceLimits;
    use qp_runtime::runtime::surface::{BlockSize, GridSize};

    fn probe_all(scheme: HashingScheme) -> Vec<u32> {
        let limits = DeviceLimits::default();
        let mut group = WorkGroup::new(0, GridSize::from(1), BlockSize::from(4), &limits);

        let build = vec![
            Tuple { key: 7_u32, value: 1_u32 },
            Tuple { key: 3, value: 2 },
            Tuple { key: 7, value: 3 },
        ];

        let mut table = OnChipTable::alloc(&mut group, scheme, build.len()).unwrap();
        table.clear(&group);
        for index in 0..build.len() as u32 {
            assert!(table.insert(&build, index));
        }

        let mut values = Vec::new();
        table.probe(&build, 7, |entry| values.push(entry.value));
        table.probe(&build, 5, |entry| values.push(entry.value));
        values.sort();
        values
    }

    #[test]
    fn linear_probing_finds_duplicates() {
        assert_eq!(probe_all(HashingScheme::LinearProbing), vec![1, 3]);
    }

    #[test]
    fn bucket_chaining_finds_duplicates() {
        assert_eq!(probe_all(HashingScheme::BucketChaining), vec![1, 3]);
    }

    #[test]
    fn capacity_fits_shared_memory() {
        let shared_mem = 48 * 1024;
        let capacity =
            max_capacity::<u64, u64>(HashingScheme::LinearProbing, 128, shared_mem);

        assert!(capacity.is_power_of_two());
        assert!(
            probe_shared_bytes::<u64, u64>(HashingScheme::LinearProbing, capacity, 128).unwrap()
                <= shared_mem
        );
        assert!(
            probe_shared_bytes::<u64, u64>(HashingScheme::LinearProbing, capacity * 2, 128)
                .unwrap()
                > shared_mem
        );
    }
}
