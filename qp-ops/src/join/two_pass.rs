/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Count and materialize passes of the join operators.
//!
//! A join splits its work into tasks. The count pass writes the number of
//! matches of each task, and an exclusive prefix scan over the counts yields
//! each task's output offset. The materialize pass then recounts the matches
//! per lane, scans the lane counts within the work-group, and writes each
//! lane's matches to its own output range.

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::fault::FaultFlag;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem, LaunchableMutSlice, LaunchableSlice};
use qp_runtime::runtime::surface::{BlockSize, ExecutionSurface, WorkGroup};

use std::convert::TryFrom;

use super::JoinedTuple;
use crate::error::{check_fault, ErrorKind, Result};
use crate::prefix_scan::{padded_index, padded_len, work_group_exclusive_scan, PrefixScan, ScanKind};

pub(crate) enum OutputPass<'a, K, V> {
    Count {
        counts: LaunchableMutSlice<'a, u64>,
    },
    Materialize {
        offsets: LaunchableSlice<'a, u64>,
        result: LaunchableMutSlice<'a, JoinedTuple<K, V>>,
    },
}

impl<'a, K, V> OutputPass<'a, K, V> {
    pub(crate) fn is_count(&self) -> bool {
        matches!(self, OutputPass::Count { .. })
    }
}

/// Returns the shared memory elements needed for the lane counts of a group.
pub(crate) fn lane_counts_len(block_size: usize) -> usize {
    padded_len(block_size)
}

/// Counts or writes the matches of one task.
///
/// `lane_matches` calls its emitter once per match of `lane`. It runs once per
/// lane in the count pass, and twice per lane in the materialize pass, and
/// must emit the same matches in the same order each time. `lane_counts` is
/// shared memory of `lane_counts_len(block_size)` elements.
pub(crate) fn emit_task<K, V, F>(
    group: &mut WorkGroup<'_>,
    lane_counts: &mut [u64],
    pass: &OutputPass<'_, K, V>,
    task_id: usize,
    fault: &FaultFlag,
    mut lane_matches: F,
) -> RtResult<()>
where
    K: DeviceCopy,
    V: DeviceCopy,
    F: FnMut(u32, &mut dyn FnMut(JoinedTuple<K, V>)),
{
    let block_size = group.block_size() as usize;

    for lane in group.lanes() {
        let mut matches = 0_u64;
        lane_matches(lane, &mut |_| matches += 1);
        lane_counts[padded_index(lane as usize)] = matches;
    }

    let task_matches = work_group_exclusive_scan(group, lane_counts, block_size, fault);

    match pass {
        OutputPass::Count { counts } => unsafe { counts.set(task_id, task_matches)? },
        OutputPass::Materialize { offsets, result } => {
            let task_offset = offsets.get(task_id)?;

            for lane in group.lanes() {
                let mut cursor = (task_offset + lane_counts[padded_index(lane as usize)]) as usize;
                let mut written = Ok(());

                lane_matches(lane, &mut |joined| {
                    if written.is_ok() {
                        written = unsafe { result.set(cursor, joined) };
                    }
                    cursor += 1;
                });
                written?;
            }
        }
    }

    group.barrier();
    Ok(())
}

/// Runs the count pass, sizes `result`, and runs the materialize pass.
///
/// `launch` launches the join's kernel for the given pass over `num_tasks`
/// tasks. Returns the number of matches.
pub(crate) fn count_and_materialize<K, V, L>(
    surface: &dyn ExecutionSurface,
    block_size: BlockSize,
    num_tasks: usize,
    fault: &FaultFlag,
    operator: &str,
    result: &mut Vec<JoinedTuple<K, V>>,
    mut launch: L,
) -> Result<usize>
where
    K: DeviceCopy + Default,
    V: DeviceCopy + Default,
    L: FnMut(OutputPass<'_, K, V>) -> Result<()>,
{
    result.clear();
    if num_tasks == 0 {
        return Ok(0);
    }

    let mut offsets = vec![0_u64; num_tasks];
    launch(OutputPass::Count {
        counts: offsets.as_launchable_mut_slice(),
    })?;
    check_fault(fault, operator)?;

    let last_count = offsets[num_tasks - 1];
    PrefixScan::new(block_size.x)?.prefix_sum_in_place(
        surface,
        &mut offsets,
        ScanKind::Exclusive,
    )?;
    let total = offsets[num_tasks - 1]
        .checked_add(last_count)
        .and_then(|total| usize::try_from(total).ok())
        .ok_or_else(|| ErrorKind::IntegerOverflow("Join result size overflows".to_string()))?;

    result.resize(total, JoinedTuple::default());
    launch(OutputPass::Materialize {
        offsets: offsets.as_launchable_slice(),
        result: result.as_launchable_mut_slice(),
    })?;
    check_fault(fault, operator)?;

    Ok(total)
}
