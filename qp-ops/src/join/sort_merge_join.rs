/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Sort-merge join.
//!
//! Both relations are radix-sorted by key. The sorted S is cut into chunks,
//! and each chunk is merged with the range of the sorted R that spans the
//! chunk's keys. Within a chunk, each lane merges a contiguous run of S
//! tuples. A lane locates the start of its run in R with a binary search, and
//! then advances through R and its run in lock-step.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem, LaunchableSlice};
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, GridSize, Kernel, WorkGroup};
use qp_runtime::utils::{div_ceil, elapsed_millis};
use tracing::debug;

use std::cmp;
use std::time::Instant;

use super::sorted::{lower_bound, sorted_by_key, upper_bound};
use super::two_pass::{count_and_materialize, emit_task, lane_counts_len, OutputPass};
use super::{validate_inputs, JoinedTuple};
use crate::constants::JOIN_PROBE_ELEMENTS_PER_LANE;
use crate::error::{ErrorKind, Result};
use crate::partition::{RadixKey, Relation, Tuple};

/// Sort-merge join on an execution surface.
#[derive(Clone, Debug)]
pub struct SortMergeJoin {
    block_size: BlockSize,
    grid_size: Option<GridSize>,
}

impl SortMergeJoin {
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
        })
    }

    /// Sets a fixed number of work-groups for the merge.
    pub fn grid_size(mut self, grid_size: u32) -> Self {
        self.grid_size = Some(GridSize::from(grid_size));
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

        let timer = Instant::now();
        result.clear();

        let result_len = if r.is_empty() || s.is_empty() {
            0
        } else {
            let sorted_r = sorted_by_key(surface, self.block_size, r)?;
            let sorted_s = sorted_by_key(surface, self.block_size, s)?;
            self.merge(surface, &sorted_r, &sorted_s, result)?
        };
        let elapsed = elapsed_millis(timer);

        debug!(
            r_len = r.len(),
            s_len = s.len(),
            result_len,
            elapsed_ms = elapsed,
            "Sort-merge join finished"
        );

        Ok((result_len, elapsed))
    }

    fn merge<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        r: &[Tuple<K, V>],
        s: &[Tuple<K, V>],
        result: &mut Vec<JoinedTuple<K, V>>,
    ) -> Result<usize>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
    {
        let chunk_len = self.block_size.x as usize * JOIN_PROBE_ELEMENTS_PER_LANE;
        let num_tasks = div_ceil(s.len(), chunk_len);
        let grid_size = self.grid_size.unwrap_or_else(|| {
            let max_grid = surface.device_limits().max_grid_size as usize;
            GridSize::from(cmp::min(num_tasks, max_grid) as u32)
        });
        let fault = FaultFlag::new();

        count_and_materialize(
            surface,
            self.block_size,
            num_tasks,
            &fault,
            "sort-merge join",
            result,
            |pass| {
                surface.launch(
                    &MergeKernel {
                        build_rel: r.as_launchable_slice(),
                        probe_rel: s.as_launchable_slice(),
                        chunk_len,
                        pass,
                        fault: &fault,
                    },
                    grid_size,
                    self.block_size,
                )?;
                Ok(())
            },
        )
    }
}

impl Default for SortMergeJoin {
    fn default() -> Self {
        Self {
            block_size: BlockSize::from(128),
            grid_size: None,
        }
    }
}

/// Merges one chunk of the sorted S with the sorted R per task.
struct MergeKernel<'a, K, V> {
    build_rel: LaunchableSlice<'a, Tuple<K, V>>,
    probe_rel: LaunchableSlice<'a, Tuple<K, V>>,
    chunk_len: usize,
    pass: OutputPass<'a, K, V>,
    fault: &'a FaultFlag,
}

impl<'a, K, V> Kernel for MergeKernel<'a, K, V>
where
    K: RadixKey,
    V: DeviceCopy + Default,
{
    fn name(&self) -> &str {
        if self.pass.is_count() {
            "sort_merge_join_count"
        } else {
            "sort_merge_join_materialize"
        }
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let block_size = group.block_size() as usize;
        let run_len = div_ceil(self.chunk_len, block_size);
        let r_len = self.build_rel.len();
        let s_len = self.probe_rel.len();
        let num_tasks = div_ceil(s_len, self.chunk_len);

        let build_rel = self.build_rel;
        let probe_rel = self.probe_rel;
        let r_key = |i: usize| unsafe { build_rel.get_unchecked(i).key };
        let mut lane_counts = group.alloc_shared::<u64>(lane_counts_len(block_size))?;

        for task_id in (group.group_id() as usize..num_tasks).step_by(group.num_groups() as usize) {
            let s_begin = task_id * self.chunk_len;
            let s_end = cmp::min(s_begin + self.chunk_len, s_len);

            // The R range that spans the keys of the chunk
            let first_key = unsafe { probe_rel.get_unchecked(s_begin).key };
            let last_key = unsafe { probe_rel.get_unchecked(s_end - 1).key };
            let r_begin = lower_bound(0..r_len, first_key, r_key);
            let r_end = upper_bound(r_begin..r_len, last_key, r_key);

            emit_task(
                group,
                &mut lane_counts,
                &self.pass,
                task_id,
                self.fault,
                |lane, emit| {
                    let run_begin = cmp::min(s_begin + lane as usize * run_len, s_end);
                    let run_end = cmp::min(run_begin + run_len, s_end);
                    if run_begin == run_end {
                        return;
                    }

                    let run_key = unsafe { probe_rel.get_unchecked(run_begin).key };
                    let mut cursor = lower_bound(r_begin..r_end, run_key, r_key);

                    for j in run_begin..run_end {
                        let probe_tuple = unsafe { probe_rel.get_unchecked(j) };
                        while cursor < r_end && r_key(cursor) < probe_tuple.key {
                            cursor += 1;
                        }

                        for k in cursor..r_end {
                            let entry = unsafe { build_rel.get_unchecked(k) };
                            if entry.key != probe_tuple.key {
                                break;
                            }
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
