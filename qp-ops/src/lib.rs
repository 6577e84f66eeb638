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

//! # The Query Processing Primitives Library
//!
//! `qp-ops` is a collection of data-parallel building blocks for relational
//! operators. All primitives are written once against the work-group model of
//! `qp-runtime` and run on any `ExecutionSurface`. Currently it includes:
//!
//! - Map
//! - Prefix scan (exclusive and inclusive, Blelloch and warp-level)
//! - Gather and scatter
//! - Split, i.e., stable radix partitioning by an arbitrary digit function
//! - LSD radix sort
//! - Hash join (radix-partitioned and no-partitioning)
//! - Nested-loop, indexed nested-loop, and sort-merge join
//!
//! The primitives share one backbone: histogram, prefix sum, and
//! scatter-by-offset. Each primitive is a pure transform from caller-allocated
//! input buffers to caller-allocated output buffers, and returns the elapsed
//! time in milliseconds.
//!
//! # Data layouts
//!
//! Relations are passed as `Relation` and `RelationMut`, which support a
//! key-only layout, an array-of-structures layout of `Tuple`s, and a
//! structure-of-arrays layout. The layout only affects how many streams are
//! moved per element; digit extraction and offset computation are the same
//! for all layouts.
//!
//! # Tuning parameters
//!
//! Several tuning parameters are defined as constant values. These affect
//! the performance and should be adjusted if necessary.
//!
//! The tuning parameters are set in the `build.rs` file, which exports them to
//! Rust.
//!
//! ## Number of banks
//!
//! `LOG2_NUM_BANKS` defines the number of shared memory banks. Shared memory
//! indices of the scan tree are padded by `idx >> LOG2_NUM_BANKS` to avoid
//! bank conflicts.
//!
//! ## Scan elements per lane
//!
//! `SCAN_ELEMENTS_PER_LANE` defines the number of elements each lane loads
//! into the Blelloch scan tree. A tile thus covers `2 * block_size` elements.
//!
//! ## Sort bits
//!
//! `SORT_BITS` defines the digit width of a radix sort pass. The default of 4
//! bits results in 16 buckets per pass.
//!
//! ## Split elements per lane
//!
//! `SPLIT_ELEMENTS_PER_LANE` defines the number of contiguous elements each
//! lane counts and moves in a split tile. Larger tiles require fewer global
//! histogram entries, but increase the per-tile shared memory of the reorder
//! variant.
//!
//! ## Scatter elements per lane
//!
//! `SCATTER_ELEMENTS_PER_LANE` defines the default work per lane of gather
//! and scatter.
//!
//! ## Join hash table load factor
//!
//! `JOIN_HT_LOAD_FACTOR_PERCENT` defines the fill factor of the linear
//! probing hash tables used by the hash joins.
//!
//! ## Join probe elements per lane
//!
//! `JOIN_PROBE_ELEMENTS_PER_LANE` defines the number of S tuples per lane in
//! a task of the nested-loop, indexed nested-loop, and sort-merge joins.
//!
//! ## Maximum scan length
//!
//! `DEFAULT_SCAN_MAX_LEN` defines the largest input of a single prefix scan
//! invocation. Larger inputs must be chunked by the caller.

pub mod error;
pub mod gather_scatter;
pub mod join;
pub mod map;
pub mod partition;
pub mod prefix_scan;
pub mod radix_sort;

#[allow(dead_code)]
pub(crate) mod constants {
    include!(concat!(env!("OUT_DIR"), "/constants.rs"));
}

pub use constants::{DEFAULT_SCAN_MAX_LEN, LOG2_NUM_BANKS, SORT_BITS};
