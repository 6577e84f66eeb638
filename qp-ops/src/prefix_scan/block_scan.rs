/*
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Work-group scan in shared memory.
//!
//! Implements the work-efficient scan by Blelloch, as described in GPU Gems 3,
//! chapter 39. The scan tree is stored in shared memory with one padding
//! element every `2^LOG2_NUM_BANKS` elements, so that the strided accesses of
//! the up-sweep and down-sweep hit distinct banks.

use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::surface::WorkGroup;

use super::ScanValue;
use crate::constants::LOG2_NUM_BANKS;
use crate::error::FAULT_INTEGER_OVERFLOW;

/// Returns the bank-conflict-free shared memory index of `index`.
pub(crate) fn padded_index(index: usize) -> usize {
    index + (index >> LOG2_NUM_BANKS)
}

/// Returns the shared memory length required to scan `len` elements.
pub(crate) fn padded_len(len: usize) -> usize {
    padded_index(len) + 1
}

/// Adds two values, raising an overflow fault instead of wrapping.
pub(crate) fn checked_add<T: ScanValue>(a: T, b: T, fault: &FaultFlag) -> T {
    match a.checked_add(&b) {
        Some(sum) => sum,
        None => {
            fault.raise(FAULT_INTEGER_OVERFLOW);
            T::zero()
        }
    }
}

/// Computes the exclusive prefix sum of `len` elements in `scratch`.
///
/// The elements must be stored at their padded indices. All lanes of `group`
/// take part in the scan, each handling every `block_size`-th node of a tree
/// level. Returns the sum of all elements.
///
/// `len` must be a power of two.
pub(crate) fn work_group_exclusive_scan<T: ScanValue>(
    group: &mut WorkGroup<'_>,
    scratch: &mut [T],
    len: usize,
    fault: &FaultFlag,
) -> T {
    debug_assert!(len.is_power_of_two());
    debug_assert!(scratch.len() >= padded_len(len));

    let block_size = group.block_size() as usize;
    let mut offset = 1;

    // Up-sweep: build the sum tree in place.
    let mut nodes = len >> 1;
    while nodes > 0 {
        group.barrier();
        for lane in group.lanes() {
            for node in (lane as usize..nodes).step_by(block_size) {
                let ai = padded_index(offset * (2 * node + 1) - 1);
                let bi = padded_index(offset * (2 * node + 2) - 1);
                scratch[bi] = checked_add(scratch[bi], scratch[ai], fault);
            }
        }
        offset <<= 1;
        nodes >>= 1;
    }

    group.barrier();
    let root = padded_index(len - 1);
    let total = scratch[root];
    scratch[root] = T::zero();

    // Down-sweep: traverse the tree back down and build the scan in place.
    let mut nodes = 1;
    while nodes < len {
        offset >>= 1;
        group.barrier();
        for lane in group.lanes() {
            for node in (lane as usize..nodes).step_by(block_size) {
                let ai = padded_index(offset * (2 * node + 1) - 1);
                let bi = padded_index(offset * (2 * node + 2) - 1);
                let left = scratch[ai];
                scratch[ai] = scratch[bi];
                scratch[bi] = checked_add(scratch[bi], left, fault);
            }
        }
        nodes <<= 1;
    }

    group.barrier();
    total
}
