/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Kernels of the split algorithms.
//!
//! The tile kernels (`WorkGroup`, `WorkGroupReorder`, `Single`) store the
//! histogram digit-major, i.e., the count of digit `d` in tile `t` is at
//! `d * num_tiles + t`. The work-item kernels store one histogram per global
//! lane, at `d * global_lanes + g`. In both cases, a single exclusive prefix
//! scan over the histogram yields the output base of each (digit, tile) or
//! (digit, lane) pair, and the bucket offsets.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMutSlice, LaunchableSlice};
use qp_runtime::runtime::surface::{Kernel, WorkGroup};
use qp_runtime::utils::div_ceil;

use std::cmp;
use std::ops::Range;

use super::{DigitFn, RadixKey, RelationMutView, RelationView, Tuple};
use crate::error::FAULT_DIGIT_OUT_OF_RANGE;
use crate::gather_scatter::{lane_elements, WorkDistribution};
use crate::prefix_scan::{padded_index, padded_len, work_group_exclusive_scan};

/// Division of the input into tiles of `elements_per_lane * block_size`
/// elements. Each lane owns a contiguous run within a tile.
#[derive(Copy, Clone, Debug)]
pub(super) struct TileGeometry {
    len: usize,
    elements_per_lane: usize,
    tile_len: usize,
}

impl TileGeometry {
    pub(super) fn new(len: usize, elements_per_lane: usize, block_size: u32) -> Self {
        Self {
            len,
            elements_per_lane,
            tile_len: elements_per_lane * block_size as usize,
        }
    }

    pub(super) fn tile_len(&self) -> usize {
        self.tile_len
    }

    pub(super) fn num_tiles(&self) -> usize {
        div_ceil(self.len, self.tile_len)
    }

    fn tile_range(&self, tile: usize) -> Range<usize> {
        let begin = cmp::min(tile * self.tile_len, self.len);
        let end = cmp::min(begin + self.tile_len, self.len);
        begin..end
    }

    fn lane_range(&self, tile: usize, lane: u32) -> Range<usize> {
        let tile_range = self.tile_range(tile);
        let begin = cmp::min(
            tile_range.start + lane as usize * self.elements_per_lane,
            tile_range.end,
        );
        let end = cmp::min(begin + self.elements_per_lane, tile_range.end);
        begin..end
    }
}

/// Returns the number of per-lane digit counters of a tile, rounded up to a
/// power of two for the work-group scan.
pub(super) fn lane_matrix_len(fanout: u32, block_size: u32) -> Option<usize> {
    (fanout as usize)
        .checked_mul(block_size as usize)
        .and_then(usize::checked_next_power_of_two)
}

/// Returns the shared memory bytes used by the tile scatter kernel.
pub(super) fn tile_scatter_shared_bytes<K, V>(
    fanout: u32,
    block_size: u32,
    tile_len: usize,
    reorder: bool,
) -> Option<usize> {
    let matrix = padded_len(lane_matrix_len(fanout, block_size)?);
    let counters = matrix.checked_add(fanout as usize)?;
    let counter_bytes = counters.checked_mul(std::mem::size_of::<u32>())?;
    let buffer_bytes = if reorder {
        tile_len.checked_mul(std::mem::size_of::<Tuple<K, V>>())?
    } else {
        0
    };

    counter_bytes.checked_add(buffer_bytes)
}

fn checked_digit<K, D: DigitFn<K>>(digit_fn: &D, key: K, fault: &FaultFlag) -> Option<usize> {
    let digit = digit_fn.digit(key);
    if digit < digit_fn.fanout() {
        Some(digit as usize)
    } else {
        fault.raise(FAULT_DIGIT_OUT_OF_RANGE);
        None
    }
}

/// Counts the digits of each tile.
pub(super) struct TileHistogramKernel<'a, K, V, D> {
    pub(super) input: RelationView<'a, K, V>,
    pub(super) digit_fn: &'a D,
    pub(super) geometry: TileGeometry,
    pub(super) histogram: LaunchableMutSlice<'a, u32>,
    pub(super) fault: &'a FaultFlag,
}

impl<'a, K, V, D> Kernel for TileHistogramKernel<'a, K, V, D>
where
    K: RadixKey,
    V: DeviceCopy + Default,
    D: DigitFn<K>,
{
    fn name(&self) -> &str {
        "split_tile_histogram"
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let fanout = self.digit_fn.fanout() as usize;
        let block_size = group.block_size() as usize;
        let num_tiles = self.geometry.num_tiles();
        let mut counters = group.alloc_shared::<u32>(fanout)?;

        for tile in (group.group_id() as usize..num_tiles).step_by(group.num_groups() as usize) {
            for lane in group.lanes() {
                for digit in (lane as usize..fanout).step_by(block_size) {
                    counters[digit] = 0;
                }
            }
            group.barrier();

            for lane in group.lanes() {
                for i in self.geometry.lane_range(tile, lane) {
                    let key = unsafe { self.input.key_unchecked(i) };
                    if let Some(digit) = checked_digit(self.digit_fn, key, self.fault) {
                        counters[digit] += 1;
                    }
                }
            }
            group.barrier();

            for lane in group.lanes() {
                for digit in (lane as usize..fanout).step_by(block_size) {
                    unsafe {
                        self.histogram
                            .set_unchecked(digit * num_tiles + tile, counters[digit])
                    };
                }
            }
            group.barrier();
        }

        Ok(())
    }
}

/// Moves each tuple of a tile to its bucket.
///
/// The local rank of a tuple is derived from an exclusive scan over the
/// per-lane digit counts of the tile. The scanned counter matrix is
/// digit-major, thus the scan yields the tuple's position in the tile after
/// sorting the tile by digit. Subtracting the tile-local start of the digit
/// and adding the global base of the (digit, tile) pair gives the output
/// position.
///
/// With `reorder`, tuples are first placed into a shared memory buffer in
/// their tile-local order, and then written out such that neighboring lanes
/// write neighboring positions.
pub(super) struct TileScatterKernel<'a, K, V, D> {
    pub(super) input: RelationView<'a, K, V>,
    pub(super) output: RelationMutView<'a, K, V>,
    pub(super) digit_fn: &'a D,
    pub(super) geometry: TileGeometry,
    pub(super) histogram: LaunchableSlice<'a, u32>,
    pub(super) reorder: bool,
    pub(super) fault: &'a FaultFlag,
}

impl<'a, K, V, D> Kernel for TileScatterKernel<'a, K, V, D>
where
    K: RadixKey,
    V: DeviceCopy + Default,
    D: DigitFn<K>,
{
    fn name(&self) -> &str {
        if self.reorder {
            "split_tile_scatter_reorder"
        } else {
            "split_tile_scatter"
        }
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let fanout = self.digit_fn.fanout() as usize;
        let block_size = group.block_size() as usize;
        let num_tiles = self.geometry.num_tiles();
        let matrix_len = lane_matrix_len(fanout as u32, group.block_size()).ok_or_else(|| {
            qp_runtime::error::ErrorKind::IntegerOverflow(
                "Per-lane histogram size overflows".to_string(),
            )
        })?;

        let mut lane_counts = group.alloc_shared::<u32>(padded_len(matrix_len))?;
        let mut digit_start = group.alloc_shared::<u32>(fanout)?;
        let mut tile_buffer = if self.reorder {
            group.alloc_shared::<Tuple<K, V>>(self.geometry.tile_len())?
        } else {
            Vec::new()
        };

        for tile in (group.group_id() as usize..num_tiles).step_by(group.num_groups() as usize) {
            for lane in group.lanes() {
                for idx in (lane as usize..matrix_len).step_by(block_size) {
                    lane_counts[padded_index(idx)] = 0;
                }
            }
            group.barrier();

            for lane in group.lanes() {
                for i in self.geometry.lane_range(tile, lane) {
                    let key = unsafe { self.input.key_unchecked(i) };
                    if let Some(digit) = checked_digit(self.digit_fn, key, self.fault) {
                        lane_counts[padded_index(digit * block_size + lane as usize)] += 1;
                    }
                }
            }

            work_group_exclusive_scan(group, &mut lane_counts, matrix_len, self.fault);

            for lane in group.lanes() {
                for digit in (lane as usize..fanout).step_by(block_size) {
                    digit_start[digit] = lane_counts[padded_index(digit * block_size)];
                }
            }
            group.barrier();

            // The counters of each lane become its write cursors.
            for lane in group.lanes() {
                for i in self.geometry.lane_range(tile, lane) {
                    let tuple = unsafe { self.input.tuple_unchecked(i) };
                    let digit = match checked_digit(self.digit_fn, tuple.key, self.fault) {
                        Some(digit) => digit,
                        None => continue,
                    };

                    let cursor = padded_index(digit * block_size + lane as usize);
                    let rank = lane_counts[cursor] as usize;
                    lane_counts[cursor] += 1;

                    if self.reorder {
                        tile_buffer[rank] = tuple;
                    } else {
                        let base =
                            unsafe { self.histogram.get_unchecked(digit * num_tiles + tile) };
                        let pos = base as usize + rank - digit_start[digit] as usize;
                        unsafe { self.output.write(pos, tuple)? };
                    }
                }
            }

            if self.reorder {
                group.barrier();

                let tile_elements = self.geometry.tile_range(tile).len();
                for lane in group.lanes() {
                    for rank in (lane as usize..tile_elements).step_by(block_size) {
                        let tuple = tile_buffer[rank];
                        let digit = match checked_digit(self.digit_fn, tuple.key, self.fault) {
                            Some(digit) => digit,
                            None => continue,
                        };

                        let base =
                            unsafe { self.histogram.get_unchecked(digit * num_tiles + tile) };
                        let pos = base as usize + rank - digit_start[digit] as usize;
                        unsafe { self.output.write(pos, tuple)? };
                    }
                }
            }

            group.barrier();
        }

        Ok(())
    }
}

/// Counts the digits of each global lane's contiguous input chunk.
pub(super) struct LaneHistogramKernel<'a, K, V, D> {
    pub(super) input: RelationView<'a, K, V>,
    pub(super) digit_fn: &'a D,
    pub(super) histogram: LaunchableMutSlice<'a, u32>,
    pub(super) fault: &'a FaultFlag,
}

impl<'a, K, V, D> Kernel for LaneHistogramKernel<'a, K, V, D>
where
    K: RadixKey,
    V: DeviceCopy + Default,
    D: DigitFn<K>,
{
    fn name(&self) -> &str {
        "split_lane_histogram"
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let global_lanes = group.global_lanes();
        let len = self.input.len();

        for lane in group.lanes() {
            let global_id = group.global_lane_id(lane);
            let (chunk, _) =
                lane_elements(WorkDistribution::Contiguous, global_id, global_lanes, len);

            for i in chunk {
                let key = unsafe { self.input.key_unchecked(i) };
                if let Some(digit) = checked_digit(self.digit_fn, key, self.fault) {
                    let idx = digit * global_lanes + global_id;
                    unsafe {
                        let count = self.histogram.get_unchecked(idx);
                        self.histogram.set_unchecked(idx, count + 1);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Computes the output position of each tuple from the scanned per-lane
/// histograms.
///
/// The scanned histogram serves as write cursors and is consumed.
pub(super) struct LanePositionsKernel<'a, K, V, D> {
    pub(super) input: RelationView<'a, K, V>,
    pub(super) digit_fn: &'a D,
    pub(super) cursors: LaunchableMutSlice<'a, u32>,
    pub(super) positions: LaunchableMutSlice<'a, u32>,
    pub(super) fault: &'a FaultFlag,
}

impl<'a, K, V, D> Kernel for LanePositionsKernel<'a, K, V, D>
where
    K: RadixKey,
    V: DeviceCopy + Default,
    D: DigitFn<K>,
{
    fn name(&self) -> &str {
        "split_lane_positions"
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let global_lanes = group.global_lanes();
        let len = self.input.len();

        for lane in group.lanes() {
            let global_id = group.global_lane_id(lane);
            let (chunk, _) =
                lane_elements(WorkDistribution::Contiguous, global_id, global_lanes, len);

            for i in chunk {
                let key = unsafe { self.input.key_unchecked(i) };
                if let Some(digit) = checked_digit(self.digit_fn, key, self.fault) {
                    let idx = digit * global_lanes + global_id;
                    unsafe {
                        let pos = self.cursors.get_unchecked(idx);
                        self.cursors.set_unchecked(idx, pos + 1);
                        self.positions.set_unchecked(i, pos);
                    }
                }
            }
        }

        Ok(())
    }
}
