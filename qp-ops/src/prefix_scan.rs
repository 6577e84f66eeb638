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

//! Prefix scan (prefix sum) over arbitrarily long arrays.
//!
//! The scan uses a three-level scheme:
//!
//! 1. Each work-group scans a tile of `2 * block_size` elements in shared
//!    memory, and writes the tile's total into a block sums array.
//! 2. The block sums are scanned recursively with the same scheme, until they
//!    fit into a single tile.
//! 3. Each work-group adds the scanned block sum of its tile onto all elements
//!    of the tile.
//!
//! Each level is a separate kernel launch, because a tile can only observe the
//! totals of other tiles after their launch completes.
//!
//! The tile scan of step 1 is either the Blelloch tree scan or a warp-level
//! scan, selected by `ScanAlgorithm`. Both produce the same result.
//!
//! All additions are checked. An overflow aborts the scan with an
//! `IntegerOverflow` error instead of wrapping around.

mod block_scan;
mod warp_scan;

pub(crate) use block_scan::{checked_add, padded_index, padded_len, work_group_exclusive_scan};

use warp_scan::{warp_count, work_group_warp_scan};

use num_traits::{CheckedAdd, Zero};
use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem, LaunchableMutSlice, LaunchableSlice};
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, GridSize, Kernel, WorkGroup};
use qp_runtime::utils::{div_ceil, elapsed_millis};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use std::cmp;
use std::fmt::Debug;
use std::time::Instant;

use crate::constants::{DEFAULT_SCAN_MAX_LEN, SCAN_ELEMENTS_PER_LANE};
use crate::error::{check_fault, ErrorKind, Result};

/// Specifies that the implementing type can be summed by `PrefixScan`.
pub trait ScanValue: DeviceCopy + Debug + Default + PartialEq + CheckedAdd + Zero {}

impl<T> ScanValue for T where T: DeviceCopy + Debug + Default + PartialEq + CheckedAdd + Zero {}

/// Whether the prefix of an element includes the element itself.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ScanKind {
    /// `output[i] = input[0] + ... + input[i - 1]`
    Exclusive,

    /// `output[i] = input[0] + ... + input[i]`
    Inclusive,
}

/// The work-group scan used to scan a tile.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ScanAlgorithm {
    /// Work-efficient up-sweep and down-sweep over a tree in shared memory
    Blelloch,

    /// Per-lane serial scan followed by lock-step Kogge-Stone scans within
    /// and across warps
    Warp,
}

/// Computes prefix sums on an execution surface.
#[derive(Clone, Debug)]
pub struct PrefixScan {
    block_size: BlockSize,
    grid_size: Option<GridSize>,
    max_len: usize,
    algorithm: ScanAlgorithm,
}

impl PrefixScan {
    /// Creates a new prefix scan with `block_size` lanes per work-group.
    ///
    /// The block size must be a power of two.
    pub fn new(block_size: u32) -> Result<Self> {
        if !block_size.is_power_of_two() {
            Err(ErrorKind::InvalidArgument(
                "Prefix scan block size must be a power of two".to_string(),
            ))?;
        }

        Ok(Self {
            block_size: BlockSize::from(block_size),
            grid_size: None,
            max_len: DEFAULT_SCAN_MAX_LEN,
            algorithm: ScanAlgorithm::Blelloch,
        })
    }

    /// Selects the work-group scan algorithm.
    pub fn algorithm(mut self, algorithm: ScanAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Sets the maximum input length of a single invocation.
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Sets a fixed number of work-groups.
    ///
    /// By default, the scan launches one work-group per tile. With fewer
    /// work-groups, each group processes multiple tiles.
    pub fn grid_size(mut self, grid_size: u32) -> Self {
        self.grid_size = Some(GridSize::from(grid_size));
        self
    }

    /// Returns the number of elements scanned by one work-group at a time.
    pub fn tile_len(&self) -> usize {
        self.block_size.x as usize * SCAN_ELEMENTS_PER_LANE as usize
    }

    /// Computes the prefix sum of `input` into `output`.
    ///
    /// Returns the elapsed time in milliseconds.
    pub fn prefix_sum<T: ScanValue>(
        &self,
        surface: &dyn ExecutionSurface,
        input: &[T],
        output: &mut [T],
        kind: ScanKind,
    ) -> Result<f64> {
        if input.len() != output.len() {
            Err(ErrorKind::InvalidArgument(
                "Input and output lengths must be equal".to_string(),
            ))?;
        }
        self.validate(surface, input.len())?;

        let timer = Instant::now();
        self.scan(
            surface,
            input.as_launchable_slice(),
            output.as_launchable_mut_slice(),
            kind,
        )?;
        let elapsed = elapsed_millis(timer);

        debug!(
            len = input.len(),
            block_size = self.block_size.x,
            algorithm = ?self.algorithm,
            ?kind,
            elapsed_ms = elapsed,
            "Prefix scan finished"
        );

        Ok(elapsed)
    }

    /// Computes the prefix sum of `data` in place.
    ///
    /// Returns the elapsed time in milliseconds.
    pub fn prefix_sum_in_place<T: ScanValue>(
        &self,
        surface: &dyn ExecutionSurface,
        data: &mut [T],
        kind: ScanKind,
    ) -> Result<f64> {
        self.validate(surface, data.len())?;

        let timer = Instant::now();
        let view = data.as_launchable_mut_slice();

        // Each lane reads its elements before overwriting them, and tiles
        // don't overlap.
        self.scan(surface, unsafe { view.as_launchable_slice() }, view, kind)?;
        let elapsed = elapsed_millis(timer);

        debug!(
            len = data.len(),
            block_size = self.block_size.x,
            algorithm = ?self.algorithm,
            ?kind,
            elapsed_ms = elapsed,
            "Prefix scan finished"
        );

        Ok(elapsed)
    }

    fn validate(&self, surface: &dyn ExecutionSurface, len: usize) -> Result<()> {
        if self.algorithm == ScanAlgorithm::Warp {
            let warp_size = surface.device_limits().warp_size;
            if warp_size == 0 || self.block_size.x > warp_size.saturating_mul(warp_size) {
                Err(ErrorKind::InvalidArgument(format!(
                    "Warp scan requires a block size of at most warp size squared, got block {} and warp {}",
                    self.block_size.x, warp_size
                )))?;
            }
        }

        if len > self.max_len {
            Err(ErrorKind::CapacityExceeded(format!(
                "Prefix scan input of {} elements exceeds the maximum of {} elements",
                len, self.max_len
            )))?;
        }

        Ok(())
    }

    fn scan<T: ScanValue>(
        &self,
        surface: &dyn ExecutionSurface,
        input: LaunchableSlice<'_, T>,
        output: LaunchableMutSlice<'_, T>,
        kind: ScanKind,
    ) -> Result<()> {
        let len = input.len();
        if len == 0 {
            return Ok(());
        }

        let tile_len = self.tile_len();
        let num_tiles = div_ceil(len, tile_len);
        let grid_size = self.grid_size.unwrap_or_else(|| {
            let max_grid = surface.device_limits().max_grid_size as usize;
            GridSize::from(cmp::min(num_tiles, max_grid) as u32)
        });

        let fault = FaultFlag::new();
        let mut block_sums = vec![T::zero(); num_tiles];

        surface.launch(
            &TileScanKernel {
                input,
                output,
                block_sums: block_sums.as_launchable_mut_slice(),
                tile_len,
                kind,
                algorithm: self.algorithm,
                fault: &fault,
            },
            grid_size,
            self.block_size,
        )?;
        check_fault(&fault, "prefix scan")?;

        if num_tiles > 1 {
            let sums_view = block_sums.as_launchable_mut_slice();
            self.scan(
                surface,
                unsafe { sums_view.as_launchable_slice() },
                sums_view,
                ScanKind::Exclusive,
            )?;

            surface.launch(
                &UniformAddKernel {
                    data: output,
                    block_sums: block_sums.as_launchable_slice(),
                    tile_len,
                    fault: &fault,
                },
                grid_size,
                self.block_size,
            )?;
            check_fault(&fault, "prefix scan")?;
        }

        Ok(())
    }
}

impl Default for PrefixScan {
    fn default() -> Self {
        Self {
            block_size: BlockSize::from(256),
            grid_size: None,
            max_len: DEFAULT_SCAN_MAX_LEN,
            algorithm: ScanAlgorithm::Blelloch,
        }
    }
}

/// Scans each tile locally and records the tile totals.
struct TileScanKernel<'a, T> {
    input: LaunchableSlice<'a, T>,
    output: LaunchableMutSlice<'a, T>,
    block_sums: LaunchableMutSlice<'a, T>,
    tile_len: usize,
    kind: ScanKind,
    algorithm: ScanAlgorithm,
    fault: &'a FaultFlag,
}

impl<'a, T: ScanValue> Kernel for TileScanKernel<'a, T> {
    fn name(&self) -> &str {
        "tile_prefix_scan"
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let len = self.input.len();
        let block_size = group.block_size() as usize;
        let num_tiles = self.block_sums.len();

        // The Blelloch tree is stored at padded indices, the warp scan runs
        // on lane-contiguous runs.
        let padded = self.algorithm == ScanAlgorithm::Blelloch;
        let slot = |idx: usize| if padded { padded_index(idx) } else { idx };
        let scratch_len = if padded {
            padded_len(self.tile_len)
        } else {
            self.tile_len
        };
        let mut scratch = group.alloc_shared::<T>(scratch_len)?;

        let (mut lane_sums, mut warp_sums) = match self.algorithm {
            ScanAlgorithm::Blelloch => (Vec::new(), Vec::new()),
            ScanAlgorithm::Warp => {
                let warps = warp_count(block_size, group.limits().warp_size as usize);
                (
                    group.alloc_shared::<T>(block_size)?,
                    group.alloc_shared::<T>(warps)?,
                )
            }
        };

        for tile in (group.group_id() as usize..num_tiles).step_by(group.num_groups() as usize) {
            let tile_begin = tile * self.tile_len;

            for lane in group.lanes() {
                for idx in (lane as usize..self.tile_len).step_by(block_size) {
                    let gidx = tile_begin + idx;
                    scratch[slot(idx)] = if gidx < len {
                        unsafe { self.input.get_unchecked(gidx) }
                    } else {
                        T::zero()
                    };
                }
            }

            let total = match self.algorithm {
                ScanAlgorithm::Blelloch => {
                    work_group_exclusive_scan(group, &mut scratch, self.tile_len, self.fault)
                }
                ScanAlgorithm::Warp => work_group_warp_scan(
                    group,
                    &mut scratch,
                    &mut lane_sums,
                    &mut warp_sums,
                    self.fault,
                ),
            };
            unsafe { self.block_sums.set_unchecked(tile, total) };

            for lane in group.lanes() {
                for idx in (lane as usize..self.tile_len).step_by(block_size) {
                    let gidx = tile_begin + idx;
                    if gidx >= len {
                        break;
                    }

                    let prefix = scratch[slot(idx)];
                    let value = match self.kind {
                        ScanKind::Exclusive => prefix,
                        ScanKind::Inclusive => {
                            let item = unsafe { self.input.get_unchecked(gidx) };
                            checked_add(prefix, item, self.fault)
                        }
                    };
                    unsafe { self.output.set_unchecked(gidx, value) };
                }
            }

            group.barrier();
        }

        Ok(())
    }
}

/// Adds the scanned block sum of each tile onto the tile's elements.
struct UniformAddKernel<'a, T> {
    data: LaunchableMutSlice<'a, T>,
    block_sums: LaunchableSlice<'a, T>,
    tile_len: usize,
    fault: &'a FaultFlag,
}

impl<'a, T: ScanValue> Kernel for UniformAddKernel<'a, T> {
    fn name(&self) -> &str {
        "uniform_add"
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let len = self.data.len();
        let block_size = group.block_size() as usize;

        let num_tiles = self.block_sums.len();

        for tile in (group.group_id() as usize..num_tiles).step_by(group.num_groups() as usize) {
            // The first tile has a zero prefix.
            if tile == 0 {
                continue;
            }

            let base = unsafe { self.block_sums.get_unchecked(tile) };
            let tile_begin = tile * self.tile_len;
            let tile_end = cmp::min(tile_begin + self.tile_len, len);

            for lane in group.lanes() {
                for gidx in (tile_begin + lane as usize..tile_end).step_by(block_size) {
                    unsafe {
                        let value = self.data.get_unchecked(gidx);
                        self.data
                            .set_unchecked(gidx, checked_add(value, base, self.fault));
                    }
                }
            }
        }

        Ok(())
    }
}
