/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2019-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Definitions of hashing schemes for on-chip hash tables.

use serde_derive::{Deserialize, Serialize};

/// Specifies the hashing scheme used in hash table insert and probe operations.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum HashingScheme {
    /// Linear probing scheme.
    ///
    /// Linear probing makes no assumptions about the join key distribution.
    /// The table has `capacity * 100 / JOIN_HT_LOAD_FACTOR_PERCENT` slots,
    /// rounded up to a power of two.
    LinearProbing,

    /// Bucket chaining scheme.
    ///
    /// Bucket chaining makes no assumptions about the join key distribution.
    /// Each slot heads a chain of build tuples that is linked through a `next`
    /// array.
    BucketChaining,
}

impl Default for HashingScheme {
    fn default() -> Self {
        HashingScheme::LinearProbing
    }
}
