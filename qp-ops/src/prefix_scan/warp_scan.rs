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

//! Warp-level work-group scan.
//!
//! Each lane first scans its own run of contiguous elements. The lane totals
//! are then scanned within each warp by the Kogge-Stone scheme, which takes
//! `log2(warp_size)` steps and needs no barrier on a device, because the lanes
//! of a warp execute in lock-step. A second Kogge-Stone scan over the warp
//! totals, executed by the first warp, yields the offset of each warp.

use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::surface::WorkGroup;
use qp_runtime::utils::div_ceil;

use super::block_scan::checked_add;
use super::ScanValue;

/// Returns the number of warps in a work-group of `block_size` lanes.
pub(crate) fn warp_count(block_size: usize, warp_size: usize) -> usize {
    div_ceil(block_size, warp_size)
}

/// Computes the exclusive prefix sum of `values` in place.
///
/// Lane `l` owns the run `values[l * run_len..(l + 1) * run_len]`, with
/// `run_len = values.len() / block_size`. `lane_sums` holds one element per
/// lane, and `warp_sums` one element per warp. Returns the sum of all
/// elements.
pub(crate) fn work_group_warp_scan<T: ScanValue>(
    group: &mut WorkGroup<'_>,
    values: &mut [T],
    lane_sums: &mut [T],
    warp_sums: &mut [T],
    fault: &FaultFlag,
) -> T {
    let block_size = group.block_size() as usize;
    let warp_size = group.limits().warp_size as usize;
    let warps = warp_count(block_size, warp_size);
    let run_len = values.len() / block_size;

    debug_assert_eq!(run_len * block_size, values.len());
    debug_assert!(lane_sums.len() >= block_size);
    debug_assert!(warp_sums.len() >= warps);

    for lane in group.lanes() {
        let begin = lane as usize * run_len;
        let mut sum = T::zero();
        for item in values[begin..begin + run_len].iter_mut() {
            let value = *item;
            *item = sum;
            sum = checked_add(sum, value, fault);
        }
        lane_sums[lane as usize] = sum;
    }

    group.barrier();
    lock_step_inclusive_scan(&mut lane_sums[..block_size], warp_size, fault);

    group.barrier();
    for lane in group.lanes() {
        let l = lane as usize;
        if l % warp_size == warp_size - 1 || l == block_size - 1 {
            warp_sums[l / warp_size] = lane_sums[l];
        }
    }

    group.barrier();
    lock_step_inclusive_scan(&mut warp_sums[..warps], warps, fault);
    let total = warp_sums[warps - 1];

    group.barrier();
    for lane in group.lanes() {
        let l = lane as usize;
        let warp = l / warp_size;

        let warp_prefix = if warp == 0 {
            T::zero()
        } else {
            warp_sums[warp - 1]
        };
        let lane_prefix = if l % warp_size == 0 {
            T::zero()
        } else {
            lane_sums[l - 1]
        };
        let prefix = checked_add(warp_prefix, lane_prefix, fault);

        let begin = l * run_len;
        for item in values[begin..begin + run_len].iter_mut() {
            *item = checked_add(*item, prefix, fault);
        }
    }

    group.barrier();
    total
}

/// Inclusive Kogge-Stone scan of each `segment_len` segment of `values`.
///
/// In every step, all lanes read the value `offset` positions to their left
/// before any lane writes. Visiting the lanes from right to left preserves
/// this, as a lane only reads from lanes that are not yet updated.
fn lock_step_inclusive_scan<T: ScanValue>(values: &mut [T], segment_len: usize, fault: &FaultFlag) {
    let mut offset = 1;
    while offset < segment_len {
        for i in (0..values.len()).rev() {
            if i % segment_len >= offset {
                values[i] = checked_add(values[i - offset], values[i], fault);
            }
        }
        offset <<= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qp_runtime::runtime::hw_info::DeviceLimits;
    use qp_runtime::runtime::surface::{BlockSize, GridSize};

    fn warp_scan(values: &[u32], block_size: u32, warp_size: u32) -> (Vec<u32>, u32) {
        let limits = DeviceLimits {
            warp_size,
            ..DeviceLimits::default()
        };
        let mut group = WorkGroup::new(0, GridSize::from(1), BlockSize::from(block_size), &limits);
        let fault = FaultFlag::new();

        let mut data = values.to_vec();
        let mut lane_sums = vec![0; block_size as usize];
        let mut warp_sums = vec![0; warp_count(block_size as usize, warp_size as usize)];
        let total = work_group_warp_scan(
            &mut group,
            &mut data,
            &mut lane_sums,
            &mut warp_sums,
            &fault,
        );
        assert!(!fault.is_raised());

        (data, total)
    }

    fn exclusive_reference(values: &[u32]) -> Vec<u32> {
        values
            .iter()
            .scan(0, |sum, &item| {
                let old_sum = *sum;
                *sum += item;
                Some(old_sum)
            })
            .collect()
    }

    #[test]
    fn scan_single_warp() {
        let (result, total) = warp_scan(&[3, 1, 2, 4], 2, 32);

        assert_eq!(result, vec![0, 3, 4, 6]);
        assert_eq!(total, 10);
    }

    #[test]
    fn scan_spans_multiple_warps() {
        let values: Vec<u32> = (0..384).map(|i| i % 11).collect();

        let (result, total) = warp_scan(&values, 96, 32);

        assert_eq!(result, exclusive_reference(&values));
        assert_eq!(total, values.iter().sum::<u32>());
    }

    #[test]
    fn scan_with_partial_last_warp() {
        let values: Vec<u32> = (0..40).map(|i| i * 3 % 5).collect();

        let (result, total) = warp_scan(&values, 20, 8);

        assert_eq!(result, exclusive_reference(&values));
        assert_eq!(total, values.iter().sum::<u32>());
    }

    #[test]
    fn warp_scan_overflow_raises_fault() {
        let limits = DeviceLimits {
            warp_size: 2,
            ..DeviceLimits::default()
        };
        let mut group = WorkGroup::new(0, GridSize::from(1), BlockSize::from(4), &limits);
        let fault = FaultFlag::new();

        let mut data = vec![100_u8; 4];
        let mut lane_sums = vec![0; 4];
        let mut warp_sums = vec![0; 2];
        work_group_warp_scan(&mut group, &mut data, &mut lane_sums, &mut warp_sums, &fault);

        assert!(fault.is_raised());
    }
}
