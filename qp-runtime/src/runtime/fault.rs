/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Device-side fault reporting.
//!
//! A kernel cannot return an error from the lane that detects it. Instead, the
//! lane raises a fault code on a shared `FaultFlag`, and the host inspects the
//! flag after the launch completes. The first fault wins, later faults are
//! dropped.

use std::sync::atomic::{AtomicU32, Ordering};

/// Fault code of a flag that has not been raised.
pub const NO_FAULT: u32 = 0;

/// A sticky first-writer-wins fault code in global memory.
#[derive(Debug, Default)]
pub struct FaultFlag {
    code: AtomicU32,
}

impl FaultFlag {
    /// Creates a flag that is not raised.
    pub fn new() -> Self {
        Self {
            code: AtomicU32::new(NO_FAULT),
        }
    }

    /// Raises `code` unless another fault was raised before.
    ///
    /// Returns `true` if this call set the flag.
    pub fn raise(&self, code: u32) -> bool {
        debug_assert_ne!(code, NO_FAULT);

        self.code
            .compare_exchange(NO_FAULT, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` if a fault was raised.
    pub fn is_raised(&self) -> bool {
        self.code.load(Ordering::Acquire) != NO_FAULT
    }

    /// Returns the code of the first raised fault, if any.
    pub fn check(&self) -> Option<u32> {
        match self.code.load(Ordering::Acquire) {
            NO_FAULT => None,
            code => Some(code),
        }
    }

    /// Clears the flag for reuse in the next launch.
    pub fn reset(&mut self) {
        *self.code.get_mut() = NO_FAULT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn first_fault_wins() {
        let flag = FaultFlag::new();
        assert_eq!(flag.check(), None);

        assert!(flag.raise(3));
        assert!(!flag.raise(5));
        assert_eq!(flag.check(), Some(3));
    }

    #[test]
    fn concurrent_raise_keeps_one_code() {
        let flag = FaultFlag::new();
        let winners = (1..=64_u32).into_par_iter().filter(|&c| flag.raise(c)).count();

        assert_eq!(winners, 1);
        assert!(flag.is_raised());
    }

    #[test]
    fn reset_clears_fault() {
        let mut flag = FaultFlag::new();
        flag.raise(1);
        flag.reset();

        assert!(!flag.is_raised());
    }
}
