/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Equi-join operators.
//!
//! All joins compute `R ⋈ S` on the key and materialize one `JoinedTuple` per
//! matching pair. The output is sized with two passes: a count pass
//! determines the number of matches per task, an exclusive prefix scan turns
//! the counts into output offsets, and a materialize pass writes the results.
//! The order of the result set is unspecified.
//!
//! The hash joins are the fastest for large inputs. The nested-loop join needs
//! no hashing or sorting and suits small inputs. The indexed nested-loop join
//! and the sort-merge join operate on key-sorted copies of their inputs.

mod hashing_scheme;
pub mod indexed_nested_loop_join;
pub mod nested_loop_join;
pub mod no_partitioning_join;
mod on_chip_table;
pub mod radix_join;
pub mod sort_merge_join;
mod sorted;
mod two_pass;

pub use hashing_scheme::HashingScheme;
pub use indexed_nested_loop_join::IndexedNestedLoopJoin;
pub use nested_loop_join::NestedLoopJoin;
pub use no_partitioning_join::NoPartitioningJoin;
pub use radix_join::RadixJoin;
pub use sort_merge_join::SortMergeJoin;

use qp_runtime::runtime::memory::DeviceCopy;

use crate::error::{ErrorKind, Result};
use crate::partition::{DataLayout, Relation};

/// A hash table entry.
pub type HtEntry<K, V> = crate::partition::Tuple<K, V>;

/// A matching pair of an R tuple and an S tuple.
#[derive(Copy, Clone, Default, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(C)]
pub struct JoinedTuple<K, V> {
    pub key: K,
    pub r_value: V,
    pub s_value: V,
}

unsafe impl<K, V> DeviceCopy for JoinedTuple<K, V>
where
    K: DeviceCopy,
    V: DeviceCopy,
{
}

/// Checks that both join inputs are well-formed and carry values.
fn validate_inputs<K, V>(r: &Relation<'_, K, V>, s: &Relation<'_, K, V>) -> Result<()> {
    for (name, relation) in [("R", r), ("S", s)].iter() {
        relation.validate()?;
        if relation.layout() == DataLayout::KeyOnly {
            Err(ErrorKind::InvalidArgument(format!(
                "Relation {} has no values; use the Aos or Soa layout",
                name
            )))?;
        }
    }

    Ok(())
}
