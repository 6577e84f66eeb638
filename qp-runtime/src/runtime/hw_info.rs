/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

use serde_derive::{Deserialize, Serialize};

use std::fmt;

use super::surface::{BlockSize, GridSize};
use crate::error::{ErrorKind, Result};

/// Hardware limits of an execution surface.
///
/// Kernels query the limits to size their tiles, and the surface validates
/// each launch against them.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct DeviceLimits {
    /// Maximum number of lanes per work-group
    pub max_block_size: u32,

    /// Maximum number of work-groups per launch
    pub max_grid_size: u32,

    /// Scratch memory per work-group in bytes
    pub shared_mem_per_block: usize,

    /// Number of lanes that execute in lock-step
    pub warp_size: u32,
}

impl DeviceLimits {
    /// Returns limits that mirror a typical discrete GPU.
    ///
    /// The CPU back-end enforces the same limits, so that kernels tuned on the
    /// CPU remain launchable on a device.
    pub fn gpu_like() -> Self {
        Self {
            max_block_size: 1024,
            max_grid_size: i32::max_value() as u32,
            shared_mem_per_block: 48 * 1024,
            warp_size: 32,
        }
    }

    /// Checks that a launch configuration does not exceed the limits.
    pub fn validate(&self, grid_size: GridSize, block_size: BlockSize) -> Result<()> {
        if grid_size.x == 0 || block_size.x == 0 {
            Err(ErrorKind::InvalidArgument(format!(
                "Launch dimensions must be non-zero, got grid {} and block {}",
                grid_size.x, block_size.x
            )))?;
        }

        if block_size.x > self.max_block_size {
            Err(ErrorKind::InvalidArgument(format!(
                "Block size {} exceeds the maximum of {}",
                block_size.x, self.max_block_size
            )))?;
        }

        if grid_size.x > self.max_grid_size {
            Err(ErrorKind::InvalidArgument(format!(
                "Grid size {} exceeds the maximum of {}",
                grid_size.x, self.max_grid_size
            )))?;
        }

        Ok(())
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::gpu_like()
    }
}

impl fmt::Display for DeviceLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Max block size: {}", self.max_block_size)?;
        writeln!(f, "Max grid size: {}", self.max_grid_size)?;
        writeln!(f, "Shared memory: {} KiB", self.shared_mem_per_block / 1024)?;
        write!(f, "Warp size: {}", self.warp_size)
    }
}
