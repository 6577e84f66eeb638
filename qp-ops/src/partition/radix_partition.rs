/*
 * Copyright 2019-2022 Clemens Lutz
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

//! Split operator.
//!
//! # Overview
//!
//! A split runs in three phases:
//!
//! 1. Each tile (or lane) computes a local histogram of its digits.
//! 2. An exclusive prefix scan over the digit-major histogram resolves the
//!    global output base of each (digit, tile) pair. The scan combines the
//!    digit-within-tile and tile-within-digit offsets, because the histogram is
//!    ordered by digit first and by tile second. The bucket offsets are the
//!    bases of the first tile.
//! 3. Each tile moves its tuples to their output positions, using stable local
//!    ranks.
//!
//! Each phase is a separate launch on the execution surface.
//!
//! # Limits
//!
//! Positions and counters are 32-bit integers. Inputs longer than `u32::MAX`
//! elements are rejected with an `IntegerOverflow` error.
//!
//! The tile algorithms keep a counter per digit and lane in shared memory.
//! Thus, `fanout * block_size` is bounded by the shared memory capacity. The
//! `WorkItem` algorithm keeps its histograms in global memory and has no such
//! limit.

use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem};
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, GridSize};
use qp_runtime::utils::{div_ceil, elapsed_millis};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use std::cmp;
use std::convert::TryFrom;
use std::time::Instant;

use super::split_kernels::{
    tile_scatter_shared_bytes, LaneHistogramKernel, LanePositionsKernel, TileGeometry,
    TileHistogramKernel, TileScatterKernel,
};
use super::{
    DigitFn, PartitionOffsets, PartitionedRelation, RadixKey, Relation, RelationMut,
    RelationMutView, RelationView,
};
use crate::constants::SPLIT_ELEMENTS_PER_LANE;
use crate::error::{check_fault, ErrorKind, Result};
use crate::gather_scatter::{GatherScatter, WorkDistribution};
use crate::prefix_scan::{PrefixScan, ScanKind};

/// Specifies the split algorithm.
///
/// All algorithms compute the same, stable result. They differ in how work is
/// assigned to lanes, and in their memory access patterns.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SplitAlgorithm {
    /// One histogram per lane.
    ///
    /// Each lane owns a contiguous chunk of the input and counts its digits
    /// into a private histogram in global memory. The scanned histograms yield
    /// a position per tuple, and the tuples are moved with a scatter.
    ///
    /// Each lane handles at least `fanout` tuples, which bounds the histogram
    /// size by roughly the input length.
    WorkItem,

    /// One histogram per tile.
    ///
    /// A work-group partitions tiles of `elements_per_lane * block_size`
    /// tuples. Local ranks are computed with a work-group scan over the
    /// per-lane digit counts in shared memory.
    WorkGroup,

    /// One histogram per tile, with coalesced writes.
    ///
    /// Like `WorkGroup`, but tuples are reordered by digit in shared memory
    /// before being written out. Neighboring lanes thus write neighboring
    /// positions of the same bucket.
    WorkGroupReorder,

    /// A single work-group partitions the whole input as one tile.
    ///
    /// Avoids the global histogram for small inputs.
    Single,
}

/// Splits relations into buckets on an execution surface.
#[derive(Clone, Debug)]
pub struct RadixPartitioner {
    algorithm: SplitAlgorithm,
    block_size: BlockSize,
    grid_size: Option<GridSize>,
    elements_per_lane: u32,
    prefix_scan: PrefixScan,
}

impl RadixPartitioner {
    /// Creates a new radix partitioner.
    ///
    /// The block size must be a power of two.
    pub fn new(algorithm: SplitAlgorithm, block_size: u32) -> Result<Self> {
        if !block_size.is_power_of_two() {
            Err(ErrorKind::InvalidArgument(
                "Split block size must be a power of two".to_string(),
            ))?;
        }

        Ok(Self {
            algorithm,
            block_size: BlockSize::from(block_size),
            grid_size: None,
            elements_per_lane: SPLIT_ELEMENTS_PER_LANE,
            prefix_scan: PrefixScan::new(block_size)?,
        })
    }

    /// Sets a fixed number of work-groups.
    ///
    /// Ignored by `SplitAlgorithm::Single`.
    pub fn grid_size(mut self, grid_size: u32) -> Self {
        self.grid_size = Some(GridSize::from(grid_size));
        self
    }

    /// Sets the number of tuples each lane handles per tile.
    pub fn elements_per_lane(mut self, elements_per_lane: u32) -> Self {
        self.elements_per_lane = cmp::max(elements_per_lane, 1);
        self
    }

    pub fn algorithm(&self) -> SplitAlgorithm {
        self.algorithm
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.x
    }

    /// Returns the shared memory bytes per work-group that a split with
    /// `fanout` buckets requires.
    ///
    /// Returns `None` if the size overflows. `Single` additionally depends on
    /// the input length, and is reported without its tuple buffer.
    pub fn shared_mem_bytes<K, V>(&self, fanout: u32) -> Option<usize> {
        let tile_len = self.elements_per_lane as usize * self.block_size.x as usize;

        match self.algorithm {
            SplitAlgorithm::WorkItem => Some(0),
            SplitAlgorithm::WorkGroup | SplitAlgorithm::Single => {
                tile_scatter_shared_bytes::<K, V>(fanout, self.block_size.x, tile_len, false)
            }
            SplitAlgorithm::WorkGroupReorder => {
                tile_scatter_shared_bytes::<K, V>(fanout, self.block_size.x, tile_len, true)
            }
        }
    }

    /// Splits `input` into `output` by the digits of `digit_fn`.
    ///
    /// After the split, bucket `b` spans `offsets.range(b)` of `output`, and
    /// `offsets` holds `fanout + 1` monotone boundaries ending in the input
    /// length. Tuples within a bucket keep their input order.
    ///
    /// `input` and `output` must have the same layout and length, and
    /// `offsets` must have the fanout of `digit_fn`.
    ///
    /// Returns the elapsed time in milliseconds.
    pub fn split<K, V, D>(
        &self,
        surface: &dyn ExecutionSurface,
        digit_fn: &D,
        input: Relation<'_, K, V>,
        mut output: RelationMut<'_, K, V>,
        offsets: &mut PartitionOffsets,
    ) -> Result<f64>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
        D: DigitFn<K>,
    {
        input.validate()?;
        output.validate()?;

        if input.layout() != output.layout() {
            Err(ErrorKind::InvalidArgument(format!(
                "Input layout {:?} differs from output layout {:?}",
                input.layout(),
                output.layout()
            )))?;
        }

        if input.len() != output.len() {
            Err(ErrorKind::InvalidArgument(
                "Input and output lengths must be equal".to_string(),
            ))?;
        }

        self.split_views(surface, digit_fn, input.as_view(), output.as_view(), offsets)
    }

    /// Splits `input` into a new array-of-structures relation.
    ///
    /// Accepts all input layouts. Key-only inputs yield tuples with a default
    /// value.
    pub fn partition<K, V, D>(
        &self,
        surface: &dyn ExecutionSurface,
        digit_fn: &D,
        input: Relation<'_, K, V>,
    ) -> Result<PartitionedRelation<K, V>>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
        D: DigitFn<K>,
    {
        input.validate()?;

        let mut partitioned = PartitionedRelation::new(input.len(), digit_fn.fanout());
        {
            let PartitionedRelation { relation, offsets } = &mut partitioned;
            let mut output = RelationMut::Aos(relation.as_mut_slice());
            self.split_views(surface, digit_fn, input.as_view(), output.as_view(), offsets)?;
        }

        Ok(partitioned)
    }

    fn split_views<K, V, D>(
        &self,
        surface: &dyn ExecutionSurface,
        digit_fn: &D,
        input: RelationView<'_, K, V>,
        output: RelationMutView<'_, K, V>,
        offsets: &mut PartitionOffsets,
    ) -> Result<f64>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
        D: DigitFn<K>,
    {
        let len = input.len();
        let fanout = digit_fn.fanout();

        if fanout == 0 {
            Err(ErrorKind::InvalidArgument(
                "Digit function must have at least one bucket".to_string(),
            ))?;
        }

        if offsets.fanout() != fanout {
            Err(ErrorKind::InvalidArgument(format!(
                "Partition offsets have {} buckets, but the digit function has {}",
                offsets.fanout(),
                fanout
            )))?;
        }

        if u32::try_from(len).is_err() {
            Err(ErrorKind::IntegerOverflow(
                "Split input exceeds the 32-bit position range".to_string(),
            ))?;
        }

        let timer = Instant::now();
        offsets.as_mut_slice().iter_mut().for_each(|o| *o = 0);

        if len != 0 {
            match self.algorithm {
                SplitAlgorithm::WorkItem => {
                    self.split_work_item(surface, digit_fn, input, output, offsets)?
                }
                SplitAlgorithm::WorkGroup | SplitAlgorithm::WorkGroupReorder => {
                    let geometry =
                        TileGeometry::new(len, self.elements_per_lane as usize, self.block_size.x);
                    let grid_size = self.grid_size.unwrap_or_else(|| {
                        let max_grid = surface.device_limits().max_grid_size as usize;
                        GridSize::from(cmp::min(geometry.num_tiles(), max_grid) as u32)
                    });
                    let reorder = self.algorithm == SplitAlgorithm::WorkGroupReorder;

                    self.split_tiles(
                        surface, digit_fn, input, output, offsets, geometry, grid_size, reorder,
                    )?
                }
                SplitAlgorithm::Single => {
                    let elements_per_lane = div_ceil(len, self.block_size.x as usize);
                    let geometry = TileGeometry::new(len, elements_per_lane, self.block_size.x);

                    self.split_tiles(
                        surface,
                        digit_fn,
                        input,
                        output,
                        offsets,
                        geometry,
                        GridSize::from(1),
                        false,
                    )?
                }
            }
        }

        let elapsed = elapsed_millis(timer);
        debug!(
            algorithm = ?self.algorithm,
            len,
            fanout,
            block_size = self.block_size.x,
            elapsed_ms = elapsed,
            "Split finished"
        );

        Ok(elapsed)
    }

    #[allow(clippy::too_many_arguments)]
    fn split_tiles<K, V, D>(
        &self,
        surface: &dyn ExecutionSurface,
        digit_fn: &D,
        input: RelationView<'_, K, V>,
        output: RelationMutView<'_, K, V>,
        offsets: &mut PartitionOffsets,
        geometry: TileGeometry,
        grid_size: GridSize,
        reorder: bool,
    ) -> Result<()>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
        D: DigitFn<K>,
    {
        let fanout = digit_fn.fanout();
        let num_tiles = geometry.num_tiles();

        let shared_bytes = tile_scatter_shared_bytes::<K, V>(
            fanout,
            self.block_size.x,
            geometry.tile_len(),
            reorder,
        )
        .unwrap_or(usize::max_value());
        let available = surface.device_limits().shared_mem_per_block;
        if shared_bytes > available {
            Err(ErrorKind::InvalidArgument(format!(
                "Split of {} buckets with {} lanes needs {} bytes of shared memory, but only {} are available; use fewer radix bits, a smaller block, or the WorkItem algorithm",
                fanout, self.block_size.x, shared_bytes, available
            )))?;
        }

        let histogram_len = (fanout as usize).checked_mul(num_tiles).ok_or_else(|| {
            ErrorKind::IntegerOverflow("Split histogram size overflows".to_string())
        })?;
        let mut histogram = vec![0_u32; histogram_len];
        let fault = FaultFlag::new();

        surface.launch(
            &TileHistogramKernel {
                input,
                digit_fn,
                geometry,
                histogram: histogram.as_launchable_mut_slice(),
                fault: &fault,
            },
            grid_size,
            self.block_size,
        )?;
        check_fault(&fault, "split")?;

        self.prefix_scan
            .prefix_sum_in_place(surface, &mut histogram, ScanKind::Exclusive)?;
        resolve_offsets(&histogram, num_tiles, input.len(), offsets);

        surface.launch(
            &TileScatterKernel {
                input,
                output,
                digit_fn,
                geometry,
                histogram: histogram.as_launchable_slice(),
                reorder,
                fault: &fault,
            },
            grid_size,
            self.block_size,
        )?;
        check_fault(&fault, "split")?;

        Ok(())
    }

    fn split_work_item<K, V, D>(
        &self,
        surface: &dyn ExecutionSurface,
        digit_fn: &D,
        input: RelationView<'_, K, V>,
        output: RelationMutView<'_, K, V>,
        offsets: &mut PartitionOffsets,
    ) -> Result<()>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
        D: DigitFn<K>,
    {
        let len = input.len();
        let fanout = digit_fn.fanout() as usize;
        let block_size = self.block_size.x as usize;

        let grid_size = self.grid_size.unwrap_or_else(|| {
            let per_lane = cmp::max(self.elements_per_lane as usize, fanout);
            let lanes = div_ceil(len, per_lane);
            let max_grid = surface.device_limits().max_grid_size as usize;
            GridSize::from(cmp::min(div_ceil(lanes, block_size), max_grid) as u32)
        });
        let global_lanes = grid_size.x as usize * block_size;

        let histogram_len = fanout.checked_mul(global_lanes).ok_or_else(|| {
            ErrorKind::IntegerOverflow("Split histogram size overflows".to_string())
        })?;
        let mut histogram = vec![0_u32; histogram_len];
        let fault = FaultFlag::new();

        surface.launch(
            &LaneHistogramKernel {
                input,
                digit_fn,
                histogram: histogram.as_launchable_mut_slice(),
                fault: &fault,
            },
            grid_size,
            self.block_size,
        )?;
        check_fault(&fault, "split")?;

        self.prefix_scan
            .prefix_sum_in_place(surface, &mut histogram, ScanKind::Exclusive)?;
        resolve_offsets(&histogram, global_lanes, len, offsets);

        let mut positions = vec![0_u32; len];
        surface.launch(
            &LanePositionsKernel {
                input,
                digit_fn,
                cursors: histogram.as_launchable_mut_slice(),
                positions: positions.as_launchable_mut_slice(),
                fault: &fault,
            },
            grid_size,
            self.block_size,
        )?;
        check_fault(&fault, "split")?;

        GatherScatter::new(self.block_size.x)
            .distribution(WorkDistribution::Contiguous)
            .scatter_views(surface, input, positions.as_launchable_slice(), output)?;

        Ok(())
    }
}

impl Default for RadixPartitioner {
    fn default() -> Self {
        Self {
            algorithm: SplitAlgorithm::WorkGroup,
            block_size: BlockSize::from(128),
            grid_size: None,
            elements_per_lane: SPLIT_ELEMENTS_PER_LANE,
            prefix_scan: PrefixScan::default(),
        }
    }
}

/// Reads the bucket offsets from the scanned digit-major histogram.
///
/// The base of a digit's first tile (or lane) is the bucket's offset.
fn resolve_offsets(histogram: &[u32], stride: usize, len: usize, offsets: &mut PartitionOffsets) {
    let fanout = offsets.fanout() as usize;
    let raw = offsets.as_mut_slice();

    for (digit, offset) in raw.iter_mut().take(fanout).enumerate() {
        *offset = histogram[digit * stride];
    }
    raw[fanout] = len as u32;
}
