// Copyright 2018-2022 Clemens Lutz
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

//! Nested-loop join.
//!
//! R is cut into tiles that fit into shared memory, and S into chunks of
//! `JOIN_PROBE_ELEMENTS_PER_LANE` tuples per lane. Each pair of an R tile and
//! an S chunk is a task. A work-group loads the task's R tile into shared
//! memory, and each lane compares its S tuples with all tuples of the tile.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::hw_info::DeviceLimits;
use qp_runtime::runtime::memory::DeviceCopy;
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, GridSize, Kernel, WorkGroup};
use qp_runtime::utils::{div_ceil, elapsed_millis};
use tracing::debug;

use std::cmp;
use std::mem::size_of;
use std::time::Instant;

use super::two_pass::{count_and_materialize, emit_task, lane_counts_len, OutputPass};
use super::{validate_inputs, JoinedTuple};
use crate::constants::JOIN_PROBE_ELEMENTS_PER_LANE;
use crate::error::{ErrorKind, Result};
use crate::partition::{RadixKey, Relation, RelationView, Tuple};

/// Nested-loop join on an execution surface.
#[derive(Clone, Debug)]
pub struct NestedLoopJoin {
    block_size: BlockSize,
    grid_size: Option<GridSize>,
    tile_len: Option<usize>,
}

impl NestedLoopJoin {
    /// Creates a new join with `block_size` lanes per work-group.
    ///
    /// The block size must be a power of two.
    pub fn new(block_size: u32) -> Result<Self> {
        if !block_size.is_power_of_two() {
            Err(ErrorKind::InvalidArgument(
                "Join block size must be a power of two".to_string(),
            ))?;
        }

        Ok(Self {
            block_size: BlockSize::from(block_size),
            grid_size: None,
            tile_len: None,
        })
    }

    /// Sets a fixed number of work-groups.
    pub fn grid_size(mut self, grid_size: u32) -> Self {
        self.grid_size = Some(GridSize::from(grid_size));
        self
    }

    /// Sets the number of R tuples per tile.
    ///
    /// By default, the tile fills the shared memory of a work-group.
    pub fn tile_len(mut self, tile_len: usize) -> Self {
        self.tile_len = Some(tile_len);
        self
    }

    /// Joins `r` and `s` on their keys.
    ///
    /// Accepts the same relations as `RadixJoin::join`, and returns the same
    /// result set.
    ///
    /// Returns the number of matches and the elapsed time in milliseconds.
    pub fn join<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        r: Relation<'_, K, V>,
        s: Relation<'_, K, V>,
        result: &mut Vec<JoinedTuple<K, V>>,
    ) -> Result<(usize, f64)>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
    {
        validate_inputs(&r, &s)?;
        let tile_len = self.resolve_tile_len::<K, V>(surface.device_limits())?;

        let timer = Instant::now();
        let r_tiles = div_ceil(r.len(), tile_len);
        let s_chunk_len = self.block_size.x as usize * JOIN_PROBE_ELEMENTS_PER_LANE;
        let s_chunks = div_ceil(s.len(), s_chunk_len);
        let num_tasks = r_tiles.checked_mul(s_chunks).ok_or_else(|| {
            ErrorKind::IntegerOverflow("Nested-loop join task count overflows".to_string())
        })?;

        let grid_size = self.grid_size.unwrap_or_else(|| {
            let max_grid = surface.device_limits().max_grid_size as usize;
            GridSize::from(cmp::min(cmp::max(num_tasks, 1), max_grid) as u32)
        });
        let fault = FaultFlag::new();
        let build_rel = r.as_view();
        let probe_rel = s.as_view();

        let result_len = count_and_materialize(
            surface,
            self.block_size,
            num_tasks,
            &fault,
            "nested-loop join",
            result,
            |pass| {
                surface.launch(
                    &NestedLoopKernel {
                        build_rel,
                        probe_rel,
                        tile_len,
                        s_chunk_len,
                        s_chunks,
                        num_tasks,
                        pass,
                        fault: &fault,
                    },
                    grid_size,
                    self.block_size,
                )?;
                Ok(())
            },
        )?;
        let elapsed = elapsed_millis(timer);

        debug!(
            r_len = r.len(),
            s_len = s.len(),
            tile_len,
            tasks = num_tasks,
            result_len,
            elapsed_ms = elapsed,
            "Nested-loop join finished"
        );

        Ok((result_len, elapsed))
    }

    fn resolve_tile_len<K, V>(&self, limits: &DeviceLimits) -> Result<usize> {
        let scan_bytes = lane_counts_len(self.block_size.x as usize) * size_of::<u64>();
        let fit = limits.shared_mem_per_block.saturating_sub(scan_bytes)
            / cmp::max(size_of::<Tuple<K, V>>(), 1);
        let tile_len = self.tile_len.unwrap_or(fit);

        if tile_len == 0 || tile_len > fit {
            Err(ErrorKind::InvalidArgument(format!(
                "Tile of {} tuples doesn't fit into the shared memory of {} bytes",
                tile_len, limits.shared_mem_per_block
            )))?;
        }

        Ok(tile_len)
    }
}

impl Default for NestedLoopJoin {
    fn default() -> Self {
        Self {
            block_size: BlockSize::from(128),
            grid_size: None,
            tile_len: None,
        }
    }
}

struct NestedLoopKernel<'a, K, V> {
    build_rel: RelationView<'a, K, V>,
    probe_rel: RelationView<'a, K, V>,
    tile_len: usize,
    s_chunk_len: usize,
    s_chunks: usize,
    num_tasks: usize,
    pass: OutputPass<'a, K, V>,
    fault: &'a FaultFlag,
}

impl<'a, K, V> Kernel for NestedLoopKernel<'a, K, V>
where
    K: RadixKey,
    V: DeviceCopy + Default,
{
    fn name(&self) -> &str {
        if self.pass.is_count() {
            "nested_loop_join_count"
        } else {
            "nested_loop_join_materialize"
        }
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let block_size = group.block_size() as usize;
        let r_len = self.build_rel.len();
        let s_len = self.probe_rel.len();

        let mut tile = group.alloc_shared::<Tuple<K, V>>(self.tile_len)?;
        let mut lane_counts = group.alloc_shared::<u64>(lane_counts_len(block_size))?;

        for task_id in (group.group_id() as usize..self.num_tasks).step_by(group.num_groups() as usize)
        {
            let r_begin = (task_id / self.s_chunks) * self.tile_len;
            let r_end = cmp::min(r_begin + self.tile_len, r_len);
            let s_begin = (task_id % self.s_chunks) * self.s_chunk_len;
            let s_end = cmp::min(s_begin + self.s_chunk_len, s_len);

            for lane in group.lanes() {
                for i in (lane as usize..r_end - r_begin).step_by(block_size) {
                    tile[i] = unsafe { self.build_rel.tuple_unchecked(r_begin + i) };
                }
            }
            group.barrier();

            let build = &tile[..r_end - r_begin];
            let probe_rel = self.probe_rel;
            emit_task(
                group,
                &mut lane_counts,
                &self.pass,
                task_id,
                self.fault,
                |lane, emit| {
                    for j in (s_begin + lane as usize..s_end).step_by(block_size) {
                        let probe_tuple = unsafe { probe_rel.tuple_unchecked(j) };
                        for entry in build.iter().filter(|entry| entry.key == probe_tuple.key) {
                            emit(JoinedTuple {
                                key: probe_tuple.key,
                                r_value: entry.value,
                                s_value: probe_tuple.value,
                            });
                        }
                    }
                },
            )?;
        }

        Ok(())
    }
}
