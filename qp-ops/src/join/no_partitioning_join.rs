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

//! Hash join operator that doesn't partition data.
//!
//! The join builds one linear probing hash table over R in global memory. Lanes
//! claim slots with an atomic compare-and-swap, thus the build phase needs no
//! synchronization between work-groups. The table stores the index of each R
//! tuple.
//!
//! The probe phase assigns a contiguous chunk of S to each work-group. The
//! count pass writes the number of matches per work-group, and the
//! materialize pass writes the matches at the scanned offsets.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem, LaunchableMutSlice};
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, GridSize, Kernel, WorkGroup};
use qp_runtime::utils::{div_ceil, elapsed_millis, CachePadded};
use tracing::debug;

use std::cmp;
use std::convert::TryFrom;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use super::on_chip_table::{slot_count, slot_of, EMPTY_SLOT};
use super::{validate_inputs, HashingScheme, JoinedTuple};
use crate::error::{check_fault, ErrorKind, Result, FAULT_CAPACITY_EXCEEDED};
use crate::partition::{RadixKey, Relation, RelationView, Tuple};
use crate::prefix_scan::{
    padded_index, padded_len, work_group_exclusive_scan, PrefixScan, ScanKind,
};

/// Hash join with a single global hash table.
#[derive(Clone, Debug)]
pub struct NoPartitioningJoin {
    block_size: BlockSize,
    grid_size: Option<GridSize>,
}

impl NoPartitioningJoin {
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

    /// Sets a fixed number of work-groups.
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

        // Slots store R indices, and the largest index marks an empty slot.
        if u32::try_from(r.len()).map_or(true, |len| len == EMPTY_SLOT) {
            Err(ErrorKind::IntegerOverflow(
                "Build relation exceeds the 32-bit index range".to_string(),
            ))?;
        }

        let timer = Instant::now();
        result.clear();

        let result_len = if r.is_empty() || s.is_empty() {
            0
        } else {
            self.build_and_probe(surface, r.as_view(), s.as_view(), result)?
        };
        let elapsed = elapsed_millis(timer);

        debug!(
            r_len = r.len(),
            s_len = s.len(),
            block_size = self.block_size.x,
            result_len,
            elapsed_ms = elapsed,
            "No-partitioning join finished"
        );

        Ok((result_len, elapsed))
    }

    fn build_and_probe<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        r: RelationView<'_, K, V>,
        s: RelationView<'_, K, V>,
        result: &mut Vec<JoinedTuple<K, V>>,
    ) -> Result<usize>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
    {
        let grid_size = self.grid_size.unwrap_or_else(|| {
            let max_grid = surface.device_limits().max_grid_size as usize;
            let groups = div_ceil(cmp::max(r.len(), s.len()), self.block_size.x as usize);
            GridSize::from(cmp::min(groups, max_grid) as u32)
        });

        let table: Vec<AtomicU32> = (0..slot_count(HashingScheme::LinearProbing, r.len()))
            .map(|_| AtomicU32::new(EMPTY_SLOT))
            .collect();
        let fault = FaultFlag::new();

        surface.launch(
            &BuildKernel {
                build_rel: r,
                table: &table,
                fault: &fault,
            },
            grid_size,
            self.block_size,
        )?;
        check_fault(&fault, "no-partitioning join")?;

        let mut group_counts = vec![CachePadded::new(0_u64); grid_size.x as usize];
        surface.launch(
            &ProbeKernel {
                build_rel: r,
                probe_rel: s,
                table: &table,
                pass: ProbePass::Count {
                    counts: group_counts.as_launchable_mut_slice(),
                },
                fault: &fault,
            },
            grid_size,
            self.block_size,
        )?;
        check_fault(&fault, "no-partitioning join")?;

        let mut offsets: Vec<u64> = group_counts.iter().map(|count| count.value).collect();
        let last_count = offsets[offsets.len() - 1];
        PrefixScan::new(self.block_size.x)?.prefix_sum_in_place(
            surface,
            &mut offsets,
            ScanKind::Exclusive,
        )?;
        let total = offsets[offsets.len() - 1]
            .checked_add(last_count)
            .and_then(|total| usize::try_from(total).ok())
            .ok_or_else(|| {
                ErrorKind::IntegerOverflow("Join result size overflows".to_string())
            })?;

        result.resize(total, JoinedTuple::default());
        surface.launch(
            &ProbeKernel {
                build_rel: r,
                probe_rel: s,
                table: &table,
                pass: ProbePass::Materialize {
                    offsets: &offsets,
                    result: result.as_launchable_mut_slice(),
                },
                fault: &fault,
            },
            grid_size,
            self.block_size,
        )?;
        check_fault(&fault, "no-partitioning join")?;

        Ok(total)
    }
}

impl Default for NoPartitioningJoin {
    fn default() -> Self {
        Self {
            block_size: BlockSize::from(128),
            grid_size: None,
        }
    }
}

/// Inserts the index of each R tuple into the global hash table.
struct BuildKernel<'a, K, V> {
    build_rel: RelationView<'a, K, V>,
    table: &'a [AtomicU32],
    fault: &'a FaultFlag,
}

impl<'a, K, V> Kernel for BuildKernel<'a, K, V>
where
    K: RadixKey,
    V: DeviceCopy + Default,
{
    fn name(&self) -> &str {
        "no_partitioning_build"
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let mask = self.table.len() - 1;
        let global_lanes = group.global_lanes();

        for lane in group.lanes() {
            for i in (group.global_lane_id(lane)..self.build_rel.len()).step_by(global_lanes) {
                let key = unsafe { self.build_rel.key_unchecked(i) };
                let mut slot = slot_of(key, mask);
                let mut inserted = false;

                for _ in 0..self.table.len() {
                    let claimed = self.table[slot].compare_exchange(
                        EMPTY_SLOT,
                        i as u32,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    if claimed.is_ok() {
                        inserted = true;
                        break;
                    }
                    slot = (slot + 1) & mask;
                }

                if !inserted {
                    self.fault.raise(FAULT_CAPACITY_EXCEEDED);
                }
            }
        }

        Ok(())
    }
}

enum ProbePass<'a, K, V> {
    Count {
        counts: LaunchableMutSlice<'a, CachePadded<u64>>,
    },
    Materialize {
        offsets: &'a [u64],
        result: LaunchableMutSlice<'a, JoinedTuple<K, V>>,
    },
}

struct ProbeKernel<'a, K, V> {
    build_rel: RelationView<'a, K, V>,
    probe_rel: RelationView<'a, K, V>,
    table: &'a [AtomicU32],
    pass: ProbePass<'a, K, V>,
    fault: &'a FaultFlag,
}

impl<'a, K, V> ProbeKernel<'a, K, V>
where
    K: RadixKey,
    V: DeviceCopy + Default,
{
    /// Returns the S chunk of a work-group.
    fn chunk(&self, group: &WorkGroup<'_>) -> Range<usize> {
        let len = self.probe_rel.len();
        let chunk_len = div_ceil(len, group.num_groups() as usize);
        let begin = cmp::min(group.group_id() as usize * chunk_len, len);
        let end = cmp::min(begin + chunk_len, len);
        begin..end
    }

    /// Calls `on_match` with each R tuple that matches `key`.
    fn probe<F>(&self, key: K, mut on_match: F)
    where
        F: FnMut(Tuple<K, V>),
    {
        let mask = self.table.len() - 1;
        let mut slot = slot_of(key, mask);

        for _ in 0..self.table.len() {
            let index = self.table[slot].load(Ordering::Acquire);
            if index == EMPTY_SLOT {
                break;
            }

            let entry = unsafe { self.build_rel.tuple_unchecked(index as usize) };
            if entry.key == key {
                on_match(entry);
            }
            slot = (slot + 1) & mask;
        }
    }
}

impl<'a, K, V> Kernel for ProbeKernel<'a, K, V>
where
    K: RadixKey,
    V: DeviceCopy + Default,
{
    fn name(&self) -> &str {
        match self.pass {
            ProbePass::Count { .. } => "no_partitioning_count",
            ProbePass::Materialize { .. } => "no_partitioning_materialize",
        }
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let block_size = group.block_size() as usize;
        let chunk = self.chunk(group);
        let mut lane_counts = group.alloc_shared::<u64>(padded_len(block_size))?;

        for lane in group.lanes() {
            let mut matches = 0_u64;
            for j in (chunk.start + lane as usize..chunk.end).step_by(block_size) {
                let key = unsafe { self.probe_rel.key_unchecked(j) };
                self.probe(key, |_| matches += 1);
            }
            lane_counts[padded_index(lane as usize)] = matches;
        }

        let group_matches =
            work_group_exclusive_scan(group, &mut lane_counts, block_size, self.fault);

        match &self.pass {
            ProbePass::Count { counts } => unsafe {
                counts.set(group.group_id() as usize, CachePadded::new(group_matches))?
            },
            ProbePass::Materialize { offsets, result } => {
                let group_offset = offsets[group.group_id() as usize];

                for lane in group.lanes() {
                    let lane_offset = lane_counts[padded_index(lane as usize)];
                    let mut cursor = (group_offset + lane_offset) as usize;

                    for j in (chunk.start + lane as usize..chunk.end).step_by(block_size) {
                        let probe_tuple = unsafe { self.probe_rel.tuple_unchecked(j) };
                        let mut written = Ok(());

                        self.probe(probe_tuple.key, |entry| {
                            if written.is_ok() {
                                let joined = JoinedTuple {
                                    key: probe_tuple.key,
                                    r_value: entry.value,
                                    s_value: probe_tuple.value,
                                };
                                written = unsafe { result.set(cursor, joined) };
                            }
                            cursor += 1;
                        });
                        written?;
                    }
                }
            }
        }

        Ok(())
    }
}
