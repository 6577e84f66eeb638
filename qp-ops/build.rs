/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

use std::env;
use std::fs;
use std::path::Path;

fn main() {
    // Number of shared memory banks
    let log2_num_banks = 5;

    // Elements loaded per lane by the Blelloch tile scan. The up-sweep tree
    // has two leaves per lane.
    let scan_elements_per_lane = 2;

    // Number of key bits consumed per radix sort pass
    let sort_bits = 4;

    // Elements per lane in a split tile
    let split_elements_per_lane = 4;

    // Elements per lane in gather and scatter
    let scatter_elements_per_lane = 8;

    // Hash table fill factor in percent
    let join_ht_load_factor_percent = 50;

    // Probe tuples per lane in a task of the nested-loop and sort-based joins
    let join_probe_elements_per_lane = 4;

    // Largest input accepted by a single prefix scan invocation
    let default_scan_max_len: u64 = 1 << 31;

    let out_dir = env::var("OUT_DIR").unwrap();
    let constants_path = Path::new(&out_dir).join("constants.rs");

    let constants = format!(
        "pub const LOG2_NUM_BANKS: u32 = {};\n\
         pub const SCAN_ELEMENTS_PER_LANE: u32 = {};\n\
         pub const SORT_BITS: u32 = {};\n\
         pub const SPLIT_ELEMENTS_PER_LANE: u32 = {};\n\
         pub const SCATTER_ELEMENTS_PER_LANE: u32 = {};\n\
         pub const JOIN_HT_LOAD_FACTOR_PERCENT: usize = {};\n\
         pub const JOIN_PROBE_ELEMENTS_PER_LANE: usize = {};\n\
         pub const DEFAULT_SCAN_MAX_LEN: usize = {};\n",
        log2_num_banks,
        scan_elements_per_lane,
        sort_bits,
        split_elements_per_lane,
        scatter_elements_per_lane,
        join_ht_load_factor_percent,
        join_probe_elements_per_lane,
        default_scan_max_len
    );

    fs::write(&constants_path, constants).expect("Couldn't write constants.rs");

    println!("cargo:rerun-if-changed=build.rs");
}
