// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Radix partitioning, also known as split.
//!
//! A split moves every element of a relation into the bucket selected by a
//! digit function. The output is contiguous: all elements of bucket `b` lie in
//! `offsets.range(b)`. All split algorithms are stable, i.e., elements within a
//! bucket keep their relative input order.

mod digit;
mod partitioned_relation;
mod radix_key;
pub mod radix_partition;
mod relation;
mod split_kernels;

pub use digit::{hash_key, DigitFn, HashDigit, RadixDigit, MAX_RADIX_BITS};
pub use partitioned_relation::{PartitionOffsets, PartitionedRelation};
pub use radix_key::RadixKey;
pub use radix_partition::{RadixPartitioner, SplitAlgorithm};
pub use relation::{DataLayout, Relation, RelationMut, Tuple};

pub(crate) use relation::{RelationMutView, RelationView};

/// Compute the fanout (i.e., the number of partitions) from the number of radix
/// bits.
pub(crate) fn fanout(radix_bits: u32) -> u32 {
    1 << radix_bits
}
