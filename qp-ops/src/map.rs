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

//! Element-wise map.
//!
//! `map` computes `dst[i] = f(src[i])` for every tuple of a relation. The
//! function must be pure, as lanes apply it in an unspecified order. Lanes are
//! assigned to elements in the same way as in gather and scatter.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::memory::DeviceCopy;
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, GridSize, Kernel, WorkGroup};
use qp_runtime::utils::{div_ceil, elapsed_millis};
use tracing::debug;

use std::cmp;
use std::time::Instant;

use crate::constants::SCATTER_ELEMENTS_PER_LANE;
use crate::error::{ErrorKind, Result};
use crate::gather_scatter::{lane_elements, WorkDistribution};
use crate::partition::{Relation, RelationMut, RelationMutView, RelationView, Tuple};

/// Applies a function to each tuple of a relation on an execution surface.
#[derive(Clone, Debug)]
pub struct Map {
    block_size: BlockSize,
    grid_size: Option<GridSize>,
    elements_per_lane: u32,
    distribution: WorkDistribution,
}

impl Map {
    /// Creates a new map with `block_size` lanes per work-group.
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size: BlockSize::from(block_size),
            grid_size: None,
            elements_per_lane: SCATTER_ELEMENTS_PER_LANE,
            distribution: WorkDistribution::Strided,
        }
    }

    /// Sets a fixed number of work-groups.
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

    /// Computes `dst[i] = f(src[i])`.
    ///
    /// Key-only relations pass a default value into `f` and drop the value
    /// returned by `f`. Returns the elapsed time in milliseconds.
    pub fn map<K, V, F>(
        &self,
        surface: &dyn ExecutionSurface,
        f: &F,
        src: Relation<'_, K, V>,
        mut dst: RelationMut<'_, K, V>,
    ) -> Result<f64>
    where
        K: DeviceCopy,
        V: DeviceCopy + Default,
        F: Fn(Tuple<K, V>) -> Tuple<K, V> + Sync,
    {
        src.validate()?;
        dst.validate()?;

        if src.layout() != dst.layout() {
            Err(ErrorKind::InvalidArgument(format!(
                "Source layout {:?} differs from destination layout {:?}",
                src.layout(),
                dst.layout()
            )))?;
        }

        if src.len() != dst.len() {
            Err(ErrorKind::InvalidArgument(
                "Map destination length must be equal to source".to_string(),
            ))?;
        }

        self.run(surface, f, src.as_view(), dst.as_view())
    }

    /// Replaces each tuple of `data` by `f(tuple)`.
    ///
    /// Returns the elapsed time in milliseconds.
    pub fn map_in_place<K, V, F>(
        &self,
        surface: &dyn ExecutionSurface,
        f: &F,
        mut data: RelationMut<'_, K, V>,
    ) -> Result<f64>
    where
        K: DeviceCopy,
        V: DeviceCopy + Default,
        F: Fn(Tuple<K, V>) -> Tuple<K, V> + Sync,
    {
        data.validate()?;

        let dst = data.as_view();

        // Each element is read and then written by the same lane.
        let src = unsafe { dst.as_relation_view() };

        self.run(surface, f, src, dst)
    }

    fn run<K, V, F>(
        &self,
        surface: &dyn ExecutionSurface,
        f: &F,
        src: RelationView<'_, K, V>,
        dst: RelationMutView<'_, K, V>,
    ) -> Result<f64>
    where
        K: DeviceCopy,
        V: DeviceCopy + Default,
        F: Fn(Tuple<K, V>) -> Tuple<K, V> + Sync,
    {
        let len = src.len();
        if len == 0 {
            return Ok(0.0);
        }

        let grid_size = self.grid_size.unwrap_or_else(|| {
            let per_group = self.block_size.x as usize * self.elements_per_lane as usize;
            let max_grid = surface.device_limits().max_grid_size as usize;
            GridSize::from(cmp::min(div_ceil(len, per_group), max_grid) as u32)
        });

        let kernel = MapKernel {
            src,
            dst,
            f,
            distribution: self.distribution,
        };

        let timer = Instant::now();
        surface.launch(&kernel, grid_size, self.block_size)?;
        let elapsed = elapsed_millis(timer);

        debug!(
            len,
            grid_size = grid_size.x,
            block_size = self.block_size.x,
            distribution = ?self.distribution,
            elapsed_ms = elapsed,
            "Map finished"
        );

        Ok(elapsed)
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new(256)
    }
}

struct MapKernel<'a, K, V, F> {
    src: RelationView<'a, K, V>,
    dst: RelationMutView<'a, K, V>,
    f: &'a F,
    distribution: WorkDistribution,
}

impl<'a, K, V, F> Kernel for MapKernel<'a, K, V, F>
where
    K: DeviceCopy,
    V: DeviceCopy + Default,
    F: Fn(Tuple<K, V>) -> Tuple<K, V> + Sync,
{
    fn name(&self) -> &str {
        "map"
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let len = self.src.len();
        let global_lanes = group.global_lanes();

        for lane in group.lanes() {
            let (range, step) =
                lane_elements(self.distribution, group.global_lane_id(lane), global_lanes, len);

            for i in range.step_by(step) {
                unsafe {
                    let tuple = self.src.tuple_unchecked(i);
                    self.dst.write_unchecked(i, (self.f)(tuple));
                }
            }
        }

        Ok(())
    }
}
