/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2020-2022, Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

mod cache_padded;

pub use cache_padded::CachePadded;

use num_traits::PrimInt;

use std::time::Instant;

/// Divides `dividend` by `divisor`, rounding up.
pub fn div_ceil<T: PrimInt>(dividend: T, divisor: T) -> T {
    let quotient = dividend / divisor;
    if dividend % divisor == T::zero() {
        quotient
    } else {
        quotient + T::one()
    }
}

/// Returns the time elapsed since `start` in milliseconds.
pub fn elapsed_millis(start: Instant) -> f64 {
    let duration = start.elapsed();
    duration.as_secs() as f64 * 1000.0 + f64::from(duration.subsec_nanos()) / 1_000_000.0
}
