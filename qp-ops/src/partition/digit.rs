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

use super::{fanout, RadixKey};
use crate::error::{ErrorKind, Result};

/// Largest supported number of radix bits per split.
///
/// A split keeps one counter per bucket and lane in shared memory, which
/// bounds the fanout.
pub const MAX_RADIX_BITS: u32 = 12;

/// Maps a key to its bucket.
///
/// The split kernels call `digit` once per element in the histogram phase and
/// once per element in the scatter phase. Both calls must return the same
/// bucket, and the bucket must be less than `fanout()`. A digit outside of the
/// fanout aborts the split with an `InvalidArgument` error.
pub trait DigitFn<K>: Sync {
    /// Returns the number of buckets.
    fn fanout(&self) -> u32;

    /// Returns the bucket of `key`.
    fn digit(&self, key: K) -> u32;
}

/// Selects `radix_bits` bits of the key, starting at bit `shift`.
///
/// Used by radix sort with 4-bit digits, least-significant digit first.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RadixDigit {
    shift: u32,
    radix_bits: u32,
}

impl RadixDigit {
    pub fn new(shift: u32, radix_bits: u32) -> Result<Self> {
        if radix_bits == 0 || radix_bits > MAX_RADIX_BITS {
            Err(ErrorKind::InvalidArgument(format!(
                "Radix bits must be between 1 and {}",
                MAX_RADIX_BITS
            )))?;
        }

        if shift >= 64 {
            Err(ErrorKind::InvalidArgument(
                "Digit shift exceeds the key width".to_string(),
            ))?;
        }

        Ok(Self { shift, radix_bits })
    }

    /// Returns the digit of the given sort pass.
    pub fn pass(pass: u32, radix_bits: u32) -> Result<Self> {
        Self::new(pass * radix_bits, radix_bits)
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn radix_bits(&self) -> u32 {
        self.radix_bits
    }
}

impl<K: RadixKey> DigitFn<K> for RadixDigit {
    fn fanout(&self) -> u32 {
        fanout(self.radix_bits)
    }

    fn digit(&self, key: K) -> u32 {
        let mask = (1_u64 << self.radix_bits) - 1;
        ((key.to_radix_bits() >> self.shift) & mask) as u32
    }
}

/// Selects `radix_bits` bits of the key's hash, after ignoring the lowest
/// `ignore_bits` bits.
///
/// Used by the radix join. Equal keys always map to the same bucket. A bucket
/// that is too large can be partitioned again with `next_level()`, which
/// selects the next higher hash bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HashDigit {
    ignore_bits: u32,
    radix_bits: u32,
}

impl HashDigit {
    pub fn new(ignore_bits: u32, radix_bits: u32) -> Result<Self> {
        if radix_bits > MAX_RADIX_BITS {
            Err(ErrorKind::InvalidArgument(format!(
                "Radix bits must be at most {}",
                MAX_RADIX_BITS
            )))?;
        }

        if ignore_bits + radix_bits > 64 {
            Err(ErrorKind::InvalidArgument(
                "Hash bits exceed the 64-bit hash width".to_string(),
            ))?;
        }

        Ok(Self {
            ignore_bits,
            radix_bits,
        })
    }

    /// Returns the digit function for the next partitioning level.
    ///
    /// Returns `None` if the hash bits are exhausted.
    pub fn next_level(&self) -> Option<Self> {
        if self.radix_bits == 0 {
            return None;
        }

        Self::new(self.ignore_bits + self.radix_bits, self.radix_bits).ok()
    }

    pub fn ignore_bits(&self) -> u32 {
        self.ignore_bits
    }

    pub fn radix_bits(&self) -> u32 {
        self.radix_bits
    }
}

impl<K: RadixKey> DigitFn<K> for HashDigit {
    fn fanout(&self) -> u32 {
        fanout(self.radix_bits)
    }

    fn digit(&self, key: K) -> u32 {
        let mask = (1_u64 << self.radix_bits) - 1;
        let hash = hash_key(key).checked_shr(self.ignore_bits).unwrap_or(0);
        (hash & mask) as u32
    }
}

/// Hashes a key with the 64-bit MurmurHash3 finalizer.
///
/// The finalizer is a bijection, so distinct keys never collide in the full
/// 64-bit hash.
pub fn hash_key<K: RadixKey>(key: K) -> u64 {
    let mut h = key.to_radix_bits();
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radix_digit_selects_nibbles() {
        let key = 0xabcd_u32;

        let digits: Vec<u32> = (0..4)
            .map(|pass| DigitFn::<u32>::digit(&RadixDigit::pass(pass, 4).unwrap(), key))
            .collect();
        assert_eq!(digits, vec![0xd, 0xc, 0xb, 0xa]);
    }

    #[test]
    fn hash_digit_levels_are_disjoint() {
        let first = HashDigit::new(0, 8).unwrap();
        let second = first.next_level().unwrap();
        assert_eq!(second.ignore_bits(), 8);

        let key = 12345_u64;
        let hash = hash_key(key);
        assert_eq!(DigitFn::<u64>::digit(&first, key) as u64, hash & 0xff);
        assert_eq!(DigitFn::<u64>::digit(&second, key) as u64, (hash >> 8) & 0xff);
    }

    #[test]
    fn hash_bits_are_exhausted() {
        let last = HashDigit::new(56, 8).unwrap();
        assert!(last.next_level().is_none());
        assert!(HashDigit::new(60, 8).is_err());
    }
}
