/*
 * Copyright 2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use qp_runtime::runtime::memory::DeviceCopy;

use std::fmt::Debug;
use std::hash::Hash;

/// Specifies that the implementing type can be used as a partitioning, sort,
/// or join key.
///
/// The key is mapped to an unsigned bit pattern that preserves the key order.
/// Unsigned keys map to themselves. Signed keys flip the sign bit, so that
/// negative keys sort before positive keys.
pub trait RadixKey: DeviceCopy + Debug + Default + Eq + Hash + Ord {
    /// Number of significant bits of the key.
    const BITS: u32;

    /// Returns the order-preserving unsigned representation of the key.
    fn to_radix_bits(self) -> u64;
}

impl RadixKey for u32 {
    const BITS: u32 = 32;

    fn to_radix_bits(self) -> u64 {
        u64::from(self)
    }
}

impl RadixKey for u64 {
    const BITS: u32 = 64;

    fn to_radix_bits(self) -> u64 {
        self
    }
}

impl RadixKey for i32 {
    const BITS: u32 = 32;

    fn to_radix_bits(self) -> u64 {
        u64::from(self as u32 ^ (1 << 31))
    }
}

impl RadixKey for i64 {
    const BITS: u32 = 64;

    fn to_radix_bits(self) -> u64 {
        self as u64 ^ (1 << 63)
    }
}
