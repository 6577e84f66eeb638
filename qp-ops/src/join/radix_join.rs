/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Radix-partitioned hash join.
//!
//! The join partitions R and S with the same hash digit, such that matching
//! tuples end up in buckets with the same ID. Each pair of buckets is then
//! joined by a work-group: the group builds a hash table over the R bucket in
//! shared memory, and streams the S bucket through it.
//!
//! # Oversized buckets
//!
//! An R bucket must fit into the on-chip capacity of a work-group. Larger
//! buckets are partitioned again with the next higher hash bits, both for R
//! and S. Once the hash bits are exhausted, which happens with heavily
//! duplicated keys, the R bucket is built in chunks of the on-chip capacity,
//! and each chunk is probed with the whole S bucket.
//!
//! The resulting pairs of (sub-)buckets are the join's probe tasks. Work-groups
//! process the tasks in a grid-stride loop.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::hw_info::DeviceLimits;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem, LaunchableSlice};
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, GridSize, Kernel, WorkGroup};
use qp_runtime::utils::elapsed_millis;
use tracing::{debug, warn};

use std::cmp;
use std::ops::Range;
use std::time::Instant;

use super::on_chip_table::{max_capacity, probe_shared_bytes, OnChipTable};
use super::two_pass::{count_and_materialize, emit_task, lane_counts_len, OutputPass};
use super::{validate_inputs, HashingScheme, HtEntry, JoinedTuple};
use crate::error::{ErrorKind, Result, FAULT_CAPACITY_EXCEEDED};
use crate::partition::{
    HashDigit, PartitionOffsets, RadixKey, RadixPartitioner, Relation, RelationMut, SplitAlgorithm,
    MAX_RADIX_BITS,
};

/// A pair of R and S ranges within the partitioned relations.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
struct ProbeTask {
    r_begin: u32,
    r_end: u32,
    s_begin: u32,
    s_end: u32,
}

unsafe impl DeviceCopy for ProbeTask {}

impl ProbeTask {
    fn new(r: Range<usize>, s: Range<usize>) -> Self {
        Self {
            r_begin: r.start as u32,
            r_end: r.end as u32,
            s_begin: s.start as u32,
            s_end: s.end as u32,
        }
    }

    fn r_len(&self) -> usize {
        (self.r_end - self.r_begin) as usize
    }

    fn s_range(&self) -> Range<usize> {
        self.s_begin as usize..self.s_end as usize
    }
}

/// Radix-partitioned hash join on an execution surface.
#[derive(Clone, Debug)]
pub struct RadixJoin {
    radix_bits: u32,
    hashing_scheme: HashingScheme,
    block_size: BlockSize,
    grid_size: Option<GridSize>,
    split_algorithm: Option<SplitAlgorithm>,
    on_chip_capacity: Option<usize>,
}

impl RadixJoin {
    /// Creates a new radix join with `bucket_count` buckets.
    ///
    /// The bucket count and the block size must be powers of two.
    pub fn new(bucket_count: u32, hashing_scheme: HashingScheme, block_size: u32) -> Result<Self> {
        if !bucket_count.is_power_of_two() {
            Err(ErrorKind::InvalidArgument(
                "Bucket count must be a power of two".to_string(),
            ))?;
        }

        let radix_bits = bucket_count.trailing_zeros();
        if radix_bits > MAX_RADIX_BITS {
            Err(ErrorKind::InvalidArgument(format!(
                "Bucket count must be at most {}",
                1_u32 << MAX_RADIX_BITS
            )))?;
        }

        if !block_size.is_power_of_two() {
            Err(ErrorKind::InvalidArgument(
                "Join block size must be a power of two".to_string(),
            ))?;
        }

        Ok(Self {
            radix_bits,
            hashing_scheme,
            block_size: BlockSize::from(block_size),
            grid_size: None,
            split_algorithm: None,
            on_chip_capacity: None,
        })
    }

    /// Sets a fixed number of work-groups for partitioning and probing.
    pub fn grid_size(mut self, grid_size: u32) -> Self {
        self.grid_size = Some(GridSize::from(grid_size));
        self
    }

    /// Sets the split algorithm used to partition R and S.
    ///
    /// By default, `WorkGroup` is used if its counters fit into shared memory,
    /// and `WorkItem` otherwise.
    pub fn split_algorithm(mut self, split_algorithm: SplitAlgorithm) -> Self {
        self.split_algorithm = Some(split_algorithm);
        self
    }

    /// Sets the maximum number of R tuples per on-chip hash table.
    ///
    /// By default, the capacity is the largest power of two that fits into
    /// shared memory together with the hash table.
    pub fn on_chip_capacity(mut self, on_chip_capacity: usize) -> Self {
        self.on_chip_capacity = Some(on_chip_capacity);
        self
    }

    pub fn bucket_count(&self) -> u32 {
        1 << self.radix_bits
    }

    /// Joins `r` and `s` on their keys.
    ///
    /// Both relations must carry values, i.e., have an array-of-structures or
    /// structure-of-arrays layout. `result` is resized to the exact number of
    /// matches and filled with one `JoinedTuple` per match, in unspecified
    /// order.
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

        let limits = surface.device_limits();
        let capacity = self.capacity::<K, V>(limits)?;
        let partitioner = self.partitioner::<K, V>(limits)?;
        let timer = Instant::now();

        let digit = HashDigit::new(0, self.radix_bits)?;
        let mut r_part = partitioner.partition(surface, &digit, r)?;
        let mut s_part = partitioner.partition(surface, &digit, s)?;

        let mut tasks = Vec::new();
        for bucket in 0..self.bucket_count() {
            let r_range = r_part.offsets.range(bucket)?;
            let s_range = s_part.offsets.range(bucket)?;

            self.plan_bucket(
                surface,
                &partitioner,
                &mut r_part.relation,
                &mut s_part.relation,
                r_range,
                s_range,
                digit.next_level(),
                capacity,
                &mut tasks,
            )?;
        }

        let result_len = self.probe(
            surface,
            r_part.as_slice(),
            s_part.as_slice(),
            &tasks,
            capacity,
            result,
        )?;
        let elapsed = elapsed_millis(timer);

        debug!(
            r_len = r_part.len(),
            s_len = s_part.len(),
            buckets = self.bucket_count(),
            tasks = tasks.len(),
            capacity,
            scheme = ?self.hashing_scheme,
            result_len,
            elapsed_ms = elapsed,
            "Radix join finished"
        );

        Ok((result_len, elapsed))
    }

    fn capacity<K, V>(&self, limits: &DeviceLimits) -> Result<usize> {
        let capacity = self.on_chip_capacity.unwrap_or_else(|| {
            max_capacity::<K, V>(
                self.hashing_scheme,
                self.block_size.x,
                limits.shared_mem_per_block,
            )
        });

        if capacity == 0 {
            Err(ErrorKind::InvalidArgument(
                "On-chip hash table capacity must be at least one tuple".to_string(),
            ))?;
        }

        let fits = probe_shared_bytes::<K, V>(self.hashing_scheme, capacity, self.block_size.x)
            .map_or(false, |bytes| bytes <= limits.shared_mem_per_block);
        if !fits {
            Err(ErrorKind::InvalidArgument(format!(
                "On-chip capacity of {} tuples exceeds the shared memory of {} bytes",
                capacity, limits.shared_mem_per_block
            )))?;
        }

        Ok(capacity)
    }

    fn partitioner<K, V>(&self, limits: &DeviceLimits) -> Result<RadixPartitioner> {
        let algorithm = match self.split_algorithm {
            Some(algorithm) => algorithm,
            None => {
                let fits = RadixPartitioner::new(SplitAlgorithm::WorkGroup, self.block_size.x)?
                    .shared_mem_bytes::<K, V>(self.bucket_count())
                    .map_or(false, |bytes| bytes <= limits.shared_mem_per_block);

                if fits {
                    SplitAlgorithm::WorkGroup
                } else {
                    SplitAlgorithm::WorkItem
                }
            }
        };

        let partitioner = RadixPartitioner::new(algorithm, self.block_size.x)?;
        Ok(match self.grid_size {
            Some(grid_size) => partitioner.grid_size(grid_size.x),
            None => partitioner,
        })
    }

    /// Turns a pair of buckets into probe tasks.
    #[allow(clippy::too_many_arguments)]
    fn plan_bucket<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        partitioner: &RadixPartitioner,
        r: &mut [HtEntry<K, V>],
        s: &mut [HtEntry<K, V>],
        r_range: Range<usize>,
        s_range: Range<usize>,
        next_digit: Option<HashDigit>,
        capacity: usize,
        tasks: &mut Vec<ProbeTask>,
    ) -> Result<()>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
    {
        if r_range.is_empty() || s_range.is_empty() {
            return Ok(());
        }

        if r_range.len() <= capacity {
            tasks.push(ProbeTask::new(r_range, s_range));
            return Ok(());
        }

        match next_digit.filter(|digit| digit.radix_bits() > 0) {
            Some(digit) => {
                warn!(
                    r_len = r_range.len(),
                    capacity,
                    ignore_bits = digit.ignore_bits(),
                    "Bucket exceeds on-chip capacity, re-partitioning with the next hash bits"
                );

                let r_offsets = repartition(surface, partitioner, &digit, &mut r[r_range.clone()])?;
                let s_offsets = repartition(surface, partitioner, &digit, &mut s[s_range.clone()])?;

                for sub_bucket in 0..r_offsets.fanout() {
                    let sub_r = r_offsets.range(sub_bucket)?;
                    let sub_s = s_offsets.range(sub_bucket)?;

                    self.plan_bucket(
                        surface,
                        partitioner,
                        r,
                        s,
                        r_range.start + sub_r.start..r_range.start + sub_r.end,
                        s_range.start + sub_s.start..s_range.start + sub_s.end,
                        digit.next_level(),
                        capacity,
                        tasks,
                    )?;
                }
            }
            None => {
                warn!(
                    r_len = r_range.len(),
                    s_len = s_range.len(),
                    capacity,
                    "Hash bits exhausted, building bucket in chunks"
                );

                for begin in r_range.clone().step_by(capacity) {
                    let end = cmp::min(begin + capacity, r_range.end);
                    tasks.push(ProbeTask::new(begin..end, s_range.clone()));
                }
            }
        }

        Ok(())
    }

    /// Counts and materializes the matches of all tasks.
    fn probe<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        r: &[HtEntry<K, V>],
        s: &[HtEntry<K, V>],
        tasks: &[ProbeTask],
        capacity: usize,
        result: &mut Vec<JoinedTuple<K, V>>,
    ) -> Result<usize>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
    {
        let grid_size = self.grid_size.unwrap_or_else(|| {
            let max_grid = surface.device_limits().max_grid_size as usize;
            GridSize::from(cmp::min(cmp::max(tasks.len(), 1), max_grid) as u32)
        });
        let fault = FaultFlag::new();

        count_and_materialize(
            surface,
            self.block_size,
            tasks.len(),
            &fault,
            "radix join",
            result,
            |pass| {
                surface.launch(
                    &ProbeKernel {
                        build_rel: r.as_launchable_slice(),
                        probe_rel: s.as_launchable_slice(),
                        tasks: tasks.as_launchable_slice(),
                        hashing_scheme: self.hashing_scheme,
                        capacity,
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

impl Default for RadixJoin {
    fn default() -> Self {
        Self {
            radix_bits: 6,
            hashing_scheme: HashingScheme::default(),
            block_size: BlockSize::from(128),
            grid_size: None,
            split_algorithm: None,
            on_chip_capacity: None,
        }
    }
}

/// Partitions a bucket in place with the next hash digit.
fn repartition<K, V>(
    surface: &dyn ExecutionSurface,
    partitioner: &RadixPartitioner,
    digit: &HashDigit,
    bucket: &mut [HtEntry<K, V>],
) -> Result<PartitionOffsets>
where
    K: RadixKey,
    V: DeviceCopy + Default,
{
    let mut partitioned = vec![HtEntry::default(); bucket.len()];
    let mut offsets = PartitionOffsets::with_radix_bits(digit.radix_bits());

    partitioner.split(
        surface,
        digit,
        Relation::Aos(&*bucket),
        RelationMut::Aos(&mut partitioned),
        &mut offsets,
    )?;
    bucket.copy_from_slice(&partitioned);

    Ok(offsets)
}

/// Builds an on-chip hash table per task and probes it.
struct ProbeKernel<'a, K, V> {
    build_rel: LaunchableSlice<'a, HtEntry<K, V>>,
    probe_rel: LaunchableSlice<'a, HtEntry<K, V>>,
    tasks: LaunchableSlice<'a, ProbeTask>,
    hashing_scheme: HashingScheme,
    capacity: usize,
    pass: OutputPass<'a, K, V>,
    fault: &'a FaultFlag,
}

impl<'a, K, V> Kernel for ProbeKernel<'a, K, V>
where
    K: RadixKey,
    V: DeviceCopy + Default,
{
    fn name(&self) -> &str {
        if self.pass.is_count() {
            "radix_join_count"
        } else {
            "radix_join_materialize"
        }
    }

    fn execute(&self, group: &mut WorkGroup<'_>) -> RtResult<()> {
        let block_size = group.block_size() as usize;
        let num_tasks = self.tasks.len();

        let mut build = group.alloc_shared::<HtEntry<K, V>>(self.capacity)?;
        let mut table = OnChipTable::alloc(group, self.hashing_scheme, self.capacity)?;
        let mut lane_counts = group.alloc_shared::<u64>(lane_counts_len(block_size))?;

        for task_id in (group.group_id() as usize..num_tasks).step_by(group.num_groups() as usize) {
            let task = unsafe { self.tasks.get_unchecked(task_id) };
            let r_len = task.r_len();
            if r_len > self.capacity {
                self.fault.raise(FAULT_CAPACITY_EXCEEDED);
                continue;
            }

            table.clear(group);
            for lane in group.lanes() {
                for i in (lane as usize..r_len).step_by(block_size) {
                    build[i] = unsafe { self.build_rel.get_unchecked(task.r_begin as usize + i) };
                }
            }
            group.barrier();

            for lane in group.lanes() {
                for i in (lane as usize..r_len).step_by(block_size) {
                    if !table.insert(&build, i as u32) {
                        self.fault.raise(FAULT_CAPACITY_EXCEEDED);
                    }
                }
            }
            group.barrier();

            let s_range = task.s_range();
            let probe_rel = self.probe_rel;
            emit_task(
                group,
                &mut lane_counts,
                &self.pass,
                task_id,
                self.fault,
                |lane, emit| {
                    for j in (s_range.start + lane as usize..s_range.end).step_by(block_size) {
                        let probe_tuple = unsafe { probe_rel.get_unchecked(j) };
                        table.probe(&build, probe_tuple.key, |entry| {
                            emit(JoinedTuple {
                                key: probe_tuple.key,
                                r_value: entry.value,
                                s_value: probe_tuple.value,
                            })
                        });
                    }
                },
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Tuple;
    use qp_runtime::runtime::cpu::CpuSurface;

    #[test]
    fn bucket_count_must_be_power_of_two() {
        assert!(RadixJoin::new(3, HashingScheme::LinearProbing, 32).is_err());
        assert!(RadixJoin::new(1 << 13, HashingScheme::LinearProbing, 32).is_err());
        assert!(RadixJoin::new(1, HashingScheme::LinearProbing, 32).is_ok());
    }

    #[test]
    fn oversized_bucket_is_split_into_tasks() -> Result<()> {
        let surface = CpuSurface::sequential();
        let join = RadixJoin::new(1, HashingScheme::LinearProbing, 4)?;
        let partitioner = RadixPartitioner::new(SplitAlgorithm::WorkGroup, 4)?;

        let mut r: Vec<Tuple<u32, u32>> = (0..10)
            .map(|key| Tuple { key: 7, value: key })
            .collect();
        let mut s = vec![Tuple { key: 7, value: 0 }];
        let mut tasks = Vec::new();

        join.plan_bucket(&surface, &partitioner, &mut r, &mut s, 0..10, 0..1, None, 4, &mut tasks)?;

        assert_eq!(
            tasks,
            vec![
                ProbeTask::new(0..4, 0..1),
                ProbeTask::new(4..8, 0..1),
                ProbeTask::new(8..10, 0..1),
            ]
        );
        Ok(())
    }
}
