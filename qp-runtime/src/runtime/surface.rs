/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! The execution surface abstraction.
//!
//! An `ExecutionSurface` launches a `Kernel` on a one-dimensional grid of
//! work-groups. Each work-group runs `Kernel::execute` exactly once. Within
//! `execute`, the kernel iterates over its lanes in phases and calls
//! `WorkGroup::barrier` between phases. Lanes of one phase must not observe
//! shared memory writes of other lanes in the same phase.
//!
//! Work-groups of the same launch must not depend on each other. The end of a
//! launch is the only point at which the writes of all work-groups become
//! visible to each other.

use serde_derive::{Deserialize, Serialize};

use std::mem;
use std::ops::Range;

use super::hw_info::DeviceLimits;
use super::memory::DeviceCopy;
use crate::error::{ErrorKind, Result};

/// Number of work-groups in a launch.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct GridSize {
    pub x: u32,
}

impl From<u32> for GridSize {
    fn from(x: u32) -> Self {
        Self { x }
    }
}

/// Number of lanes in a work-group.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct BlockSize {
    pub x: u32,
}

impl From<u32> for BlockSize {
    fn from(x: u32) -> Self {
        Self { x }
    }
}

/// A data-parallel function that runs once per work-group.
pub trait Kernel: Sync {
    /// A human-readable name used for logging.
    fn name(&self) -> &str;

    /// Executes all lanes of one work-group.
    fn execute(&self, group: &mut WorkGroup<'_>) -> Result<()>;
}

/// The execution context of one work-group.
///
/// Tracks the shared memory allocated by the group, so that a kernel that
/// exceeds the device's scratch capacity fails the same way on every
/// back-end.
#[derive(Debug)]
pub struct WorkGroup<'l> {
    group_id: u32,
    grid_size: GridSize,
    block_size: BlockSize,
    limits: &'l DeviceLimits,
    shared_mem_used: usize,
}

impl<'l> WorkGroup<'l> {
    pub fn new(
        group_id: u32,
        grid_size: GridSize,
        block_size: BlockSize,
        limits: &'l DeviceLimits,
    ) -> Self {
        Self {
            group_id,
            grid_size,
            block_size,
            limits,
            shared_mem_used: 0,
        }
    }

    /// Returns the ID of this work-group within the grid.
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    /// Returns the number of work-groups in the launch.
    pub fn num_groups(&self) -> u32 {
        self.grid_size.x
    }

    /// Returns the number of lanes in this work-group.
    pub fn block_size(&self) -> u32 {
        self.block_size.x
    }

    /// Returns the lane IDs of this work-group.
    pub fn lanes(&self) -> Range<u32> {
        0..self.block_size.x
    }

    /// Returns the grid-wide ID of `lane`.
    pub fn global_lane_id(&self, lane: u32) -> usize {
        self.group_id as usize * self.block_size.x as usize + lane as usize
    }

    /// Returns the number of lanes in the whole grid.
    pub fn global_lanes(&self) -> usize {
        self.grid_size.x as usize * self.block_size.x as usize
    }

    /// Returns the hardware limits of the surface that runs this group.
    pub fn limits(&self) -> &DeviceLimits {
        self.limits
    }

    /// Separates two lock-step phases of the work-group.
    ///
    /// Lanes of a phase run to completion before the next phase starts, so
    /// the barrier only marks the phase boundary.
    pub fn barrier(&mut self) {}

    /// Returns the number of shared memory bytes allocated by the group.
    pub fn shared_mem_used(&self) -> usize {
        self.shared_mem_used
    }

    /// Returns the number of shared memory bytes still available.
    pub fn shared_mem_available(&self) -> usize {
        self.limits.shared_mem_per_block - self.shared_mem_used
    }

    /// Allocates `len` zero-initialized elements of shared memory.
    ///
    /// Shared memory lives until the end of `Kernel::execute`. Kernels that
    /// process multiple tiles should allocate once and reuse the buffer.
    pub fn alloc_shared<T: DeviceCopy + Default>(&mut self, len: usize) -> Result<Vec<T>> {
        let bytes = len
            .checked_mul(mem::size_of::<T>())
            .ok_or_else(|| ErrorKind::IntegerOverflow("Shared memory size overflows".into()))?;
        let requested = self.shared_mem_used + bytes;

        if requested > self.limits.shared_mem_per_block {
            Err(ErrorKind::SharedMemoryExceeded(
                requested,
                self.limits.shared_mem_per_block,
            ))?;
        }

        self.shared_mem_used = requested;
        Ok(vec![T::default(); len])
    }
}

/// An execution back-end that launches kernels.
pub trait ExecutionSurface: Sync {
    /// Returns the hardware limits of the surface.
    fn device_limits(&self) -> &DeviceLimits;

    /// Runs `kernel` on `grid_size` work-groups of `block_size` lanes each.
    ///
    /// Returns after all work-groups have finished. The first error returned
    /// by a work-group aborts the launch.
    fn launch(&self, kernel: &dyn Kernel, grid_size: GridSize, block_size: BlockSize)
        -> Result<()>;
}
