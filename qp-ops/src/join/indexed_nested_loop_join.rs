/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Indexed nested-loop join.
//!
//! The index over R is a two-level, cache-sensitive search tree. The leaf
//! level is a key-sorted copy of R, cut into nodes of `node_len` tuples. The
//! inner level is a directory that holds the first key of each node, and is
//! small enough to fit into shared memory.
//!
//! Each work-group loads the directory into shared memory once. For each S
//! tuple, a lane searches the directory for the node that contains the first
//! matching R tuple, searches that node in global memory, and then scans the
//! run of equal keys.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::hw_info::DeviceLimits;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem, LaunchableMutSlice, LaunchableSlice};
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, GridSize, Kernel, WorkGroup};
use qp_runtime::utils::{div_ceil, elapsed_millis};
use tracing::debug;

use std::cmp;
use std::mem::size_of;
use std::time::Instant;

use super::sorted::{lower_bound, sorted_by_key};
use super::two_pass::{count_and_materialize, emit_task, lane_counts_len, OutputPass};
use super::{validate_inputs, JoinedTuple};
use crate::constants::JOIN_PROBE_ELEMENTS_PER_LANE;
use crate::error::{ErrorKind, Result};
use crate::partition::{RadixKey, Relation, RelationView, Tuple};

/// Indexed nested-loop join on an execution surface.
#[derive(Clone, Debug)]
pub struct IndexedNestedLoopJoin {
    block_size: BlockSize,
    grid_size: Option<GridSize>,
    node_len: Option<usize>,
}

impl IndexedNestedLoopJoin {
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
            node_len: None,
        })
    }

    /// Sets a fixed number of work-groups.
    pub fn grid_size(mut self, grid_size: u32) -> Self {
        self.grid_size = Some(GridSize::from(grid_size));
        self
    }

    /// Sets the minimum number of R tuples per index node.
    ///
    /// By default, a node holds one tuple per lane of a warp. Nodes grow
    /// beyond this length if the directory doesn't fit into shared memory.
    pub fn node_len(mut self, node_len: usize) -> Self {
        self.node_len = Some(cmp::max(node_len, 1));
        self
    }

    /// Joins `r` and `s` on their keys.
    ///
    /// Builds the index over `r`, and probes it with `s`. Accepts the same
    /// relations as `RadixJoin::join`, and returns the same result set.
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

        let (node_len, result_len) = if r.is_empty() || s.is_empty() {
            (0, 0)
        } else {
            self.build_and_probe(surface, r, s.as_view(), result)?
        };
        let elapsed = elapsed_millis(timer);

        debug!(
            r_len = r.len(),
            s_len = s.len(),
            node_len,
            result_len,
            elapsed_ms = elapsed,
            "Indexed nested-loop join finished"
        );

        Ok((result_len, elapsed))
    }

    /// Returns the node length, such that the directory fits into shared
    /// memory next to the lane counts.
    fn resolve_node_len<K>(&self, limits: &DeviceLimits, r_len: usize) -> Result<usize> {
        let scan_bytes = lane_counts_len(self.block_size.x as usize) * size_of::<u64>();
        let max_entries =
            limits.shared_mem_per_block.saturating_sub(scan_bytes) / cmp::max(size_of::<K>(), 1);

        if max_entries == 0 {
            Err(ErrorKind::InvalidArgument(format!(
                "Index directory doesn't fit into the shared memory of {} bytes",
                limits.shared_mem_per_block
            )))?;
        }

        let node_len = self
            .node_len
            .unwrap_or_else(|| cmp::max(limits.warp_size as usize, 1));
        Ok(cmp::max(node_len, div_ceil(r_len, max_entries)))
    }

    fn build_and_probe<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        r: Relation<'_, K, V>,
        s: RelationView<'_, K, V>,
        result: &mut Vec<JoinedTuple<K, V>>,
    ) -> Result<(usize, usize)>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
    {
        let limits = surface.device_limits();
        let max_grid = limits.max_grid_size as usize;
        let node_len = self.resolve_node_len::<K>(limits, r.len())?;

        let sorted = sorted_by_key(surface, self.block_size, r)?;
        let mut directory = vec![K::default(); div_ceil(sorted.len(), node_len)];
        let directory_len = directory.len();

        surface.launch(
            &DirectoryKernel {
                sorted: sorted.as_launchable_slice(),
                directory: directory.as_launchable_mut_slice(),
                node_len,
            },
            GridSize::from(cmp::min(
                div_ceil(directory_len, self.block_size.x as usize),
                max_grid,
            ) as u32),
            self.block_size,
        )?;

        let s_chunk_len = self.block_size.x as usize * JOIN_PROBE_ELEMENTS_PER_LANE;
        let num_tasks = div_ceil(s.len(), s_chunk_len);
        let grid_size = self
            .grid_size
            .unwrap_or_else(|| GridSize::from(cmp::min(num_tasks, max_grid) as u32));
        let fault = FaultFlag::new();

        let result_len = count_and_materialize(
            surface,
            self.block_size,
            num_tasks,
            &fault,
            "indexed nested-loop join",
            result,
            |pass| {
                surface.launch(
                    &IndexProbeKernel {
                        sorted: sorted.as_launchable_slice(),
                        directory: directory.as_launchable_slice(),
                        probe_rel: s,
                        node_len,
                        s_chunk_len,
                        pass,
                        fault: &fault,
                    },
                    grid_size,
                    self.block_size,
                )?;
                Ok(())
            },
        )?;

        Ok((node_len, result_len))
    }
}

impl Default for IndexedNestedLoopJoin {
    fn default() -> Self {
        Self {
            block_size: BlockSize::from(128),
            grid_size: None,
            node_len: None,
        }
    }
}

/// Writes the first key of each node into the directory.
struct DirectoryKernel<'a, K, V> {
    sorted: LaunchableSlice<'a, Tuple<K, V>>,
    directory: LaunchableMutSlice<'a, K>,
    node_len: usize,
}

impl<'a, K, V> Kernel for DirectoryKernel<'a, K, V>
where
    K: RadixKey,
    V: DeviceCopy,
{
    fn name(&self) -> &str {
        "index_directory"
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let global_lanes = group.global_lanes();

        for lane in group.lanes() {
            for node in (group.global_lane_id(lane)..self.directory.len()).step_by(global_lanes) {
                let first = self.sorted.get(node * self.node_len)?;
                unsafe { self.directory.set_unchecked(node, first.key) };
            }
        }

        Ok(())
    }
}

/// Probes the index with a chunk of S per task.
struct IndexProbeKernel<'a, K, V> {
    sorted: LaunchableSlice<'a, Tuple<K, V>>,
    directory: LaunchableSlice<'a, K>,
    probe_rel: RelationView<'a, K, V>,
    node_len: usize,
    s_chunk_len: usize,
    pass: OutputPass<'a, K, V>,
    fault: &'a FaultFlag,
}

impl<'a, K, V> Kernel for IndexProbeKernel<'a, K, V>
where
    K: RadixKey,
    V: DeviceCopy + Default,
{
    fn name(&self) -> &str {
        if self.pass.is_count() {
            "indexed_nested_loop_join_count"
        } else {
            "indexed_nested_loop_join_materialize"
        }
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let block_size = group.block_size() as usize;
        let dir_len = self.directory.len();
        let r_len = self.sorted.len();
        let s_len = self.probe_rel.len();
        let num_tasks = div_ceil(s_len, self.s_chunk_len);

        let mut directory = group.alloc_shared::<K>(dir_len)?;
        let mut lane_counts = group.alloc_shared::<u64>(lane_counts_len(block_size))?;

        for lane in group.lanes() {
            for i in (lane as usize..dir_len).step_by(block_size) {
                directory[i] = unsafe { self.directory.get_unchecked(i) };
            }
        }
        group.barrier();

        let sorted = self.sorted;
        let probe_rel = self.probe_rel;
        let node_len = self.node_len;
        let directory = &directory;

        for task_id in (group.group_id() as usize..num_tasks).step_by(group.num_groups() as usize) {
            let s_begin = task_id * self.s_chunk_len;
            let s_end = cmp::min(s_begin + self.s_chunk_len, s_len);

            emit_task(
                group,
                &mut lane_counts,
                &self.pass,
                task_id,
                self.fault,
                |lane, emit| {
                    for j in (s_begin + lane as usize..s_end).step_by(block_size) {
                        let probe_tuple = unsafe { probe_rel.tuple_unchecked(j) };
                        let key = probe_tuple.key;

                        // Node `node - 1` starts with a smaller key, and node
                        // `node` with an equal or larger key.
                        let node = lower_bound(0..dir_len, key, |i| directory[i]);
                        let search = if node == 0 {
                            0..0
                        } else {
                            (node - 1) * node_len + 1..cmp::min(node * node_len, r_len)
                        };

                        let first = lower_bound(search, key, |i| unsafe {
                            sorted.get_unchecked(i).key
                        });
                        for k in first..r_len {
                            let entry = unsafe { sorted.get_unchecked(k) };
                            if entry.key != key {
                                break;
                            }
                            emit(JoinedTuple {
                                key,
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
