/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! A CPU back-end for the execution surface.
//!
//! Work-groups are distributed over a Rayon thread pool. The lanes of a
//! work-group run on the same thread, one lock-step phase after the other.
//! Shared memory is thus private to the thread that runs the group.

use once_cell::sync::OnceCell;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, trace, warn};

use super::hw_info::DeviceLimits;
use super::surface::{BlockSize, ExecutionSurface, GridSize, Kernel, WorkGroup};
use crate::error::Result;

enum Scheduler {
    Parallel(ThreadPool),
    Sequential,
}

/// Runs kernels on CPU threads.
pub struct CpuSurface {
    limits: DeviceLimits,
    scheduler: Scheduler,
}

static GLOBAL_SURFACE: OnceCell<CpuSurface> = OnceCell::new();

impl CpuSurface {
    /// Creates a surface backed by a dedicated pool of `threads` threads.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("qp-worker-{}", index))
            .build()?;

        debug!(threads = pool.current_num_threads(), "Created CPU surface");

        Ok(Self {
            limits: DeviceLimits::default(),
            scheduler: Scheduler::Parallel(pool),
        })
    }

    /// Creates a surface that runs all work-groups on the calling thread.
    ///
    /// Work-groups run in ascending order of their IDs.
    pub fn sequential() -> Self {
        Self {
            limits: DeviceLimits::default(),
            scheduler: Scheduler::Sequential,
        }
    }

    /// Returns a process-wide surface that uses all available cores.
    pub fn global() -> Result<&'static Self> {
        GLOBAL_SURFACE.get_or_try_init(|| Self::new(rayon::current_num_threads()))
    }

    /// Replaces the hardware limits enforced by the surface.
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Returns the number of worker threads.
    pub fn threads(&self) -> usize {
        match &self.scheduler {
            Scheduler::Parallel(pool) => pool.current_num_threads(),
            Scheduler::Sequential => 1,
        }
    }
}

impl ExecutionSurface for CpuSurface {
    fn device_limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn launch(
        &self,
        kernel: &dyn Kernel,
        grid_size: GridSize,
        block_size: BlockSize,
    ) -> Result<()> {
        self.limits.validate(grid_size, block_size)?;

        trace!(
            kernel = kernel.name(),
            grid_size = grid_size.x,
            block_size = block_size.x,
            "Launching kernel"
        );

        let limits = &self.limits;
        let run_group = |group_id: u32| -> Result<()> {
            let mut group = WorkGroup::new(group_id, grid_size, block_size, limits);
            kernel.execute(&mut group).map_err(|e| {
                warn!(kernel = kernel.name(), group_id, error = %e, "Work-group failed");
                e
            })
        };

        match &self.scheduler {
            Scheduler::Parallel(pool) => {
                pool.install(|| (0..grid_size.x).into_par_iter().try_for_each(run_group))
            }
            Scheduler::Sequential => (0..grid_size.x).try_for_each(run_group),
        }
    }
}
