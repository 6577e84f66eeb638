// Copyright 2022 Clemens Lutz
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

//! Indexed data movement.
//!
//! `gather` reads `dst[i] = src[positions[i]]`, and `scatter` writes
//! `dst[positions[i]] = src[i]`. Both move the key and value streams of a
//! relation together.
//!
//! The work of a launch is distributed over all lanes of the grid. Each lane
//! either handles a contiguous run of elements, or every `grid * block`-th
//! element. The distribution only affects performance.
//!
//! Positions are bounds-checked by default. A checked launch fails with an
//! `OutOfBounds` error on the first invalid position. The unchecked variant
//! skips all checks and requires the caller to guarantee valid positions.
//! Scattering with duplicate positions is a data race in both variants.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem, LaunchableSlice};
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, GridSize, Kernel, WorkGroup};
use qp_runtime::utils::{div_ceil, elapsed_millis};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use std::cmp;
use std::convert::TryFrom;
use std::ops::Range;
use std::time::Instant;

use crate::constants::SCATTER_ELEMENTS_PER_LANE;
use crate::error::{ErrorKind, Result};
use crate::partition::{Relation, RelationMut, RelationMutView, RelationView};

/// Assignment of elements to lanes.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum WorkDistribution {
    /// Each lane handles a contiguous run of elements.
    Contiguous,

    /// Neighboring lanes handle neighboring elements, with a stride of the
    /// grid's lane count.
    Strided,
}

/// Whether positions are checked against the relation bounds.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BoundsCheck {
    Checked,
    Unchecked,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Direction {
    Gather,
    Scatter,
}

/// Gathers and scatters relations on an execution surface.
#[derive(Clone, Debug)]
pub struct GatherScatter {
    block_size: BlockSize,
    grid_size: Option<GridSize>,
    elements_per_lane: u32,
    distribution: WorkDistribution,
    bounds_check: BoundsCheck,
}

impl GatherScatter {
    /// Creates a new bounds-checked gather and scatter with `block_size` lanes
    /// per work-group.
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size: BlockSize::from(block_size),
            grid_size: None,
            elements_per_lane: SCATTER_ELEMENTS_PER_LANE,
            distribution: WorkDistribution::Strided,
            bounds_check: BoundsCheck::Checked,
        }
    }

    /// Sets a fixed number of work-groups.
    ///
    /// By default, the grid is sized so that each lane handles
    /// `elements_per_lane` elements.
    pub fn grid_size(mut self, grid_size: u32) -> Self {
        self.grid_size = Some(GridSize::from(grid_size));
        self
    }

    /// Sets the number of elements per lane used to size the default grid.
    pub fn elements_per_lane(mut self, elements_per_lane: u32) -> Self {
        self.elements_per_lane = cmp::max(elements_per_lane, 1);
        self
    }

    /// Sets the assignment of elements to lanes.
    pub fn distribution(mut self, distribution: WorkDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Enables bounds checks on all positions.
    pub fn checked(mut self) -> Self {
        self.bounds_check = BoundsCheck::Checked;
        self
    }

    /// Disables bounds checks on all positions.
    ///
    /// # Safety
    ///
    /// All positions passed to `gather` and `scatter` must be within the
    /// bounds of the indexed relation, and scatter positions must be unique.
    pub unsafe fn unchecked(mut self) -> Self {
        self.bounds_check = BoundsCheck::Unchecked;
        self
    }

    pub fn bounds_check(&self) -> BoundsCheck {
        self.bounds_check
    }

    /// Gathers `dst[i] = src[positions[i]]`.
    ///
    /// Returns the elapsed time in milliseconds.
    pub fn gather<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        src: Relation<'_, K, V>,
        positions: &[u32],
        mut dst: RelationMut<'_, K, V>,
    ) -> Result<f64>
    where
        K: DeviceCopy,
        V: DeviceCopy + Default,
    {
        self.validate(&src, positions, &dst)?;
        if positions.len() != dst.len() {
            Err(ErrorKind::InvalidArgument(
                "Gather requires one position per destination element".to_string(),
            ))?;
        }

        self.run(
            surface,
            Direction::Gather,
            src.as_view(),
            positions.as_launchable_slice(),
            dst.as_view(),
        )
    }

    /// Scatters `dst[positions[i]] = src[i]`.
    ///
    /// Returns the elapsed time in milliseconds.
    pub fn scatter<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        src: Relation<'_, K, V>,
        positions: &[u32],
        mut dst: RelationMut<'_, K, V>,
    ) -> Result<f64>
    where
        K: DeviceCopy,
        V: DeviceCopy + Default,
    {
        self.validate(&src, positions, &dst)?;
        if positions.len() != src.len() {
            Err(ErrorKind::InvalidArgument(
                "Scatter requires one position per source element".to_string(),
            ))?;
        }

        self.run(
            surface,
            Direction::Scatter,
            src.as_view(),
            positions.as_launchable_slice(),
            dst.as_view(),
        )
    }

    /// Scatters between launchable views, e.g., into a relation of a
    /// different layout.
    ///
    /// The caller validates the lengths.
    pub(crate) fn scatter_views<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        src: RelationView<'_, K, V>,
        positions: LaunchableSlice<'_, u32>,
        dst: RelationMutView<'_, K, V>,
    ) -> Result<f64>
    where
        K: DeviceCopy,
        V: DeviceCopy + Default,
    {
        debug_assert_eq!(src.len(), positions.len());

        self.run(surface, Direction::Scatter, src, positions, dst)
    }

    fn validate<K, V>(
        &self,
        src: &Relation<'_, K, V>,
        positions: &[u32],
        dst: &RelationMut<'_, K, V>,
    ) -> Result<()> {
        src.validate()?;
        dst.validate()?;

        if src.layout() != dst.layout() {
            Err(ErrorKind::InvalidArgument(format!(
                "Source layout {:?} differs from destination layout {:?}",
                src.layout(),
                dst.layout()
            )))?;
        }

        if u32::try_from(src.len()).is_err() || u32::try_from(dst.len()).is_err() {
            Err(ErrorKind::IntegerOverflow(
                "Relation length exceeds the 32-bit position range".to_string(),
            ))?;
        }

        if u32::try_from(positions.len()).is_err() {
            Err(ErrorKind::IntegerOverflow(
                "Position array exceeds the 32-bit range".to_string(),
            ))?;
        }

        Ok(())
    }

    fn run<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        direction: Direction,
        src: RelationView<'_, K, V>,
        positions: LaunchableSlice<'_, u32>,
        dst: RelationMutView<'_, K, V>,
    ) -> Result<f64>
    where
        K: DeviceCopy,
        V: DeviceCopy + Default,
    {
        let len = positions.len();
        if len == 0 {
            return Ok(0.0);
        }

        let grid_size = self.grid_size.unwrap_or_else(|| {
            let per_group = self.block_size.x as usize * self.elements_per_lane as usize;
            let max_grid = surface.device_limits().max_grid_size as usize;
            GridSize::from(cmp::min(div_ceil(len, per_group), max_grid) as u32)
        });

        let kernel = GatherScatterKernel {
            direction,
            src,
            positions,
            dst,
            distribution: self.distribution,
            bounds_check: self.bounds_check,
        };

        let timer = Instant::now();
        surface.launch(&kernel, grid_size, self.block_size)?;
        let elapsed = elapsed_millis(timer);

        debug!(
            ?direction,
            len,
            grid_size = grid_size.x,
            block_size = self.block_size.x,
            distribution = ?self.distribution,
            bounds_check = ?self.bounds_check,
            elapsed_ms = elapsed,
            "Data movement finished"
        );

        Ok(elapsed)
    }
}

impl Default for GatherScatter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Returns the index range handled by a lane and the step between its
/// elements.
pub(crate) fn lane_elements(
    distribution: WorkDistribution,
    global_lane_id: usize,
    global_lanes: usize,
    len: usize,
) -> (Range<usize>, usize) {
    match distribution {
        WorkDistribution::Contiguous => {
            let per_lane = div_ceil(len, global_lanes);
            let begin = cmp::min(global_lane_id * per_lane, len);
            let end = cmp::min(begin + per_lane, len);
            (begin..end, 1)
        }
        WorkDistribution::Strided => (cmp::min(global_lane_id, len)..len, global_lanes),
    }
}

struct GatherScatterKernel<'a, K, V> {
    direction: Direction,
    src: RelationView<'a, K, V>,
    positions: LaunchableSlice<'a, u32>,
    dst: RelationMutView<'a, K, V>,
    distribution: WorkDistribution,
    bounds_check: BoundsCheck,
}

impl<'a, K, V> Kernel for GatherScatterKernel<'a, K, V>
where
    K: DeviceCopy,
    V: DeviceCopy + Default,
{
    fn name(&self) -> &str {
        match self.direction {
            Direction::Gather => "gather",
            Direction::Scatter => "scatter",
        }
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let len = self.positions.len();
        let global_lanes = group.global_lanes();

        for lane in group.lanes() {
            let (range, step) =
                lane_elements(self.distribution, group.global_lane_id(lane), global_lanes, len);

            for i in range.step_by(step) {
                match self.bounds_check {
                    BoundsCheck::Checked => {
                        let pos = self.positions.get(i)? as usize;
                        match self.direction {
                            Direction::Gather => unsafe {
                                self.dst.write(i, self.src.tuple(pos)?)?
                            },
                            Direction::Scatter => unsafe {
                                self.dst.write(pos, self.src.tuple(i)?)?
                            },
                        }
                    }
                    BoundsCheck::Unchecked => unsafe {
                        let pos = self.positions.get_unchecked(i) as usize;
                        match self.direction {
                            Direction::Gather => {
                                self.dst.write_unchecked(i, self.src.tuple_unchecked(pos))
                            }
                            Direction::Scatter => {
                                self.dst.write_unchecked(pos, self.src.tuple_unchecked(i))
                            }
                        }
                    },
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_lanes_cover_all_elements() {
        let len = 103;
        let lanes = 8;

        let mut covered: Vec<usize> = (0..lanes)
            .flat_map(|lane| {
                let (range, step) = lane_elements(WorkDistribution::Contiguous, lane, lanes, len);
                range.step_by(step)
            })
            .collect();
        covered.sort();

        assert_eq!(covered, (0..len).collect::<Vec<_>>());
    }

    #[test]
    fn strided_lanes_cover_all_elements() {
        let len = 10;
        let lanes = 16;

        let mut covered: Vec<usize> = (0..lanes)
            .flat_map(|lane| {
                let (range, step) = lane_elements(WorkDistribution::Strided, lane, lanes, len);
                range.step_by(step)
            })
            .collect();
        covered.sort();

        assert_eq!(covered, (0..len).collect::<Vec<_>>());
    }
}
