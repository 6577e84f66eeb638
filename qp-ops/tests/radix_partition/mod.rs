/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

#![allow(dead_code)]

use itertools::Itertools;
use once_cell::sync::Lazy;
use qp_ops::partition::{DigitFn, PartitionOffsets, Tuple};
use qp_runtime::runtime::cpu::CpuSurface;
use rand::distributions::uniform::SampleUniform;
use rand::{thread_rng, Rng};
use std::collections::hash_map::{Entry, HashMap};
use std::error::Error;
use std::fmt::Debug;
use std::hash::Hash;
use std::result::Result;

/// A small pool shared by all tests of a test binary.
pub static SURFACE: Lazy<CpuSurface> =
    Lazy::new(|| CpuSurface::new(4).expect("Failed to create the CPU surface"));

/// Fills `keys` with uniformly distributed values in `[low, high)`.
pub fn gen_uniform<K>(keys: &mut [K], low: K, high: K) -> Result<(), Box<dyn Error>>
where
    K: Copy + SampleUniform,
{
    let mut rng = thread_rng();
    keys.iter_mut().for_each(|k| *k = rng.gen_range(low, high));
    Ok(())
}

/// Pairs each key with its input position.
///
/// The position tag lets validators check stability.
pub fn tag_positions<K: Copy>(keys: &[K]) -> Vec<Tuple<K, u32>> {
    keys.iter()
        .enumerate()
        .map(|(i, &key)| Tuple {
            key,
            value: i as u32,
        })
        .collect()
}

pub fn tuple_loss_or_duplicates<K, V, D>(
    _digit_fn: &D,
    input: &[Tuple<K, V>],
    output: &[Tuple<K, V>],
    _offsets: &PartitionOffsets,
) -> Result<(), Box<dyn Error>>
where
    K: Copy + Debug + Eq + Hash,
    V: Copy + Debug + Eq + Hash,
    D: DigitFn<K>,
{
    assert_eq!(input.len(), output.len(), "Output length differs from input");

    let mut original_tuples: HashMap<Tuple<K, V>, usize> = HashMap::new();
    input
        .iter()
        .for_each(|&tuple| *original_tuples.entry(tuple).or_insert(0) += 1);

    output.iter().for_each(|&tuple| match original_tuples.entry(tuple) {
        Entry::Occupied(mut entry) => {
            assert!(*entry.get() > 0, "Duplicate tuple: {:?}", tuple);
            *entry.get_mut() -= 1;
        }
        Entry::Vacant(_) => panic!("Invalid tuple: {:?}", tuple),
    });

    original_tuples.iter().for_each(|(tuple, &remaining)| {
        assert_eq!(remaining, 0, "Tuple {:?} is missing from the output", tuple);
    });

    Ok(())
}

pub fn verify_partitions<K, V, D>(
    digit_fn: &D,
    _input: &[Tuple<K, V>],
    output: &[Tuple<K, V>],
    offsets: &PartitionOffsets,
) -> Result<(), Box<dyn Error>>
where
    K: Copy + Debug,
    D: DigitFn<K>,
{
    assert_eq!(offsets.fanout(), digit_fn.fanout());
    assert_eq!(offsets.len(), output.len(), "Last offset differs from length");

    for partition_id in 0..offsets.fanout() {
        let range = offsets.range(partition_id)?;
        assert!(range.start <= range.end, "Offsets are not monotone");

        for (i, tuple) in output[range.clone()].iter().enumerate() {
            let dst_partition = digit_fn.digit(tuple.key);
            assert_eq!(
                dst_partition,
                partition_id,
                "Wrong partitioning detected at position {}: key {:?} in partition {}; expected partition {}",
                range.start + i,
                tuple.key,
                partition_id,
                dst_partition
            );
        }
    }

    Ok(())
}

/// Checks that the position tags increase within each partition.
pub fn verify_stability<K, D>(
    _digit_fn: &D,
    _input: &[Tuple<K, u32>],
    output: &[Tuple<K, u32>],
    offsets: &PartitionOffsets,
) -> Result<(), Box<dyn Error>>
where
    D: DigitFn<K>,
{
    for partition_id in 0..offsets.fanout() {
        let range = offsets.range(partition_id)?;

        output[range]
            .iter()
            .tuple_windows()
            .for_each(|(first, second)| {
                assert!(
                    first.value < second.value,
                    "Tuple at input position {} overtook tuple at input position {} in partition {}",
                    second.value,
                    first.value,
                    partition_id
                );
            });
    }

    Ok(())
}

/// Checks the counts of each partition against a sequential histogram.
pub fn verify_histogram<K, V, D>(
    digit_fn: &D,
    input: &[Tuple<K, V>],
    _output: &[Tuple<K, V>],
    offsets: &PartitionOffsets,
) -> Result<(), Box<dyn Error>>
where
    K: Copy,
    D: DigitFn<K>,
{
    let mut expected = vec![0_usize; digit_fn.fanout() as usize];
    input
        .iter()
        .for_each(|tuple| expected[digit_fn.digit(tuple.key) as usize] += 1);

    assert_eq!(offsets.counts(), expected);

    Ok(())
}
