/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2021-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Least-significant-digit radix sort.
//!
//! Each pass splits the relation by the next `SORT_BITS` key bits, starting
//! with the least significant bits. Because the split is stable, the relation
//! is sorted by all bits processed so far after each pass. Passes alternate
//! between the data and the scratch buffer.

use qp_runtime::runtime::memory::DeviceCopy;
use qp_runtime::runtime::surface::ExecutionSurface;
use qp_runtime::utils::{div_ceil, elapsed_millis};
use tracing::debug;

use std::cmp;
use std::time::Instant;

use crate::constants::SORT_BITS;
use crate::error::{ErrorKind, Result};
use crate::partition::{
    PartitionOffsets, RadixDigit, RadixKey, RadixPartitioner, RelationMut, SplitAlgorithm,
};

/// Sorts relations by key on an execution surface.
#[derive(Clone, Debug)]
pub struct RadixSort {
    partitioner: RadixPartitioner,
}

impl RadixSort {
    /// Creates a new radix sort that uses `algorithm` for its passes.
    pub fn new(algorithm: SplitAlgorithm, block_size: u32) -> Result<Self> {
        Ok(Self {
            partitioner: RadixPartitioner::new(algorithm, block_size)?,
        })
    }

    /// Sets a fixed number of work-groups per pass.
    pub fn grid_size(mut self, grid_size: u32) -> Self {
        self.partitioner = self.partitioner.grid_size(grid_size);
        self
    }

    /// Returns the number of passes needed to sort `key_bits` bits.
    pub fn passes(key_bits: u32) -> u32 {
        cmp::max(1, div_ceil(key_bits, SORT_BITS))
    }

    /// Sorts `data` in ascending key order.
    ///
    /// Only the lowest `key_bits` bits of the key are compared. Signed keys
    /// must be sorted with the full key width, because their sign is the
    /// highest bit. Tuples with equal keys keep their input order.
    ///
    /// `scratch` must have the same layout and length as `data`. Its contents
    /// are overwritten. The sorted result is always returned in `data`.
    ///
    /// Returns the elapsed time in milliseconds.
    pub fn sort<K, V>(
        &self,
        surface: &dyn ExecutionSurface,
        mut data: RelationMut<'_, K, V>,
        mut scratch: RelationMut<'_, K, V>,
        key_bits: u32,
    ) -> Result<f64>
    where
        K: RadixKey,
        V: DeviceCopy + Default,
    {
        if key_bits > K::BITS {
            Err(ErrorKind::InvalidArgument(format!(
                "Key bits ({}) exceed the key width of {} bits",
                key_bits,
                K::BITS
            )))?;
        }

        if data.layout() != scratch.layout() || data.len() != scratch.len() {
            Err(ErrorKind::InvalidArgument(
                "Scratch buffer must have the same layout and length as the data".to_string(),
            ))?;
        }

        let timer = Instant::now();
        let passes = Self::passes(key_bits);
        let mut offsets = PartitionOffsets::with_radix_bits(SORT_BITS);
        let mut result_in_data = true;

        for pass in 0..passes {
            let digit = RadixDigit::pass(pass, SORT_BITS)?;

            if result_in_data {
                self.partitioner.split(
                    surface,
                    &digit,
                    data.as_relation(),
                    scratch.reborrow(),
                    &mut offsets,
                )?;
            } else {
                self.partitioner.split(
                    surface,
                    &digit,
                    scratch.as_relation(),
                    data.reborrow(),
                    &mut offsets,
                )?;
            }

            result_in_data = !result_in_data;
        }

        if !result_in_data {
            data.copy_from(scratch.as_relation())?;
        }

        let elapsed = elapsed_millis(timer);
        debug!(
            len = data.len(),
            key_bits,
            passes,
            algorithm = ?self.partitioner.algorithm(),
            elapsed_ms = elapsed,
            "Radix sort finished"
        );

        Ok(elapsed)
    }
}

impl Default for RadixSort {
    fn default() -> Self {
        Self {
            partitioner: RadixPartitioner::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_cover_key_bits() {
        assert_eq!(RadixSort::passes(0), 1);
        assert_eq!(RadixSort::passes(4), 1);
        assert_eq!(RadixSort::passes(5), 2);
        assert_eq!(RadixSort::passes(32), 8);
        assert_eq!(RadixSort::passes(64), 16);
    }
}
