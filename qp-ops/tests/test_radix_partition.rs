/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

pub mod radix_partition;

use itertools::izip;
use proptest::prelude::*;
use qp_ops::error::ErrorKind;
use qp_ops::partition::{
    DataLayout, DigitFn, HashDigit, PartitionOffsets, RadixDigit, RadixKey, RadixPartitioner,
    Relation, RelationMut, SplitAlgorithm, Tuple,
};
use radix_partition::{
    gen_uniform, tag_positions, tuple_loss_or_duplicates, verify_histogram, verify_partitions,
    verify_stability, SURFACE,
};
use std::error::Error;
use std::result::Result;

const BLOCK_SIZE: u32 = 128;

fn run_split<K, D, KeyGenFn, ValidatorFn>(
    tuples: usize,
    key_gen: Box<KeyGenFn>,
    digit_fn: D,
    algorithm: SplitAlgorithm,
    layout: DataLayout,
    mut validator: Box<ValidatorFn>,
) -> Result<(), Box<dyn Error>>
where
    K: RadixKey,
    D: DigitFn<K>,
    KeyGenFn: FnOnce(&mut [K]) -> Result<(), Box<dyn Error>>,
    ValidatorFn: FnMut(
        &D,
        &[Tuple<K, u32>],
        &[Tuple<K, u32>],
        &PartitionOffsets,
    ) -> Result<(), Box<dyn Error>>,
{
    let mut keys = vec![K::default(); tuples];
    key_gen(keys.as_mut_slice())?;

    let mut input = tag_positions(&keys);
    let partitioner = RadixPartitioner::new(algorithm, BLOCK_SIZE)?;
    let mut offsets = PartitionOffsets::new(digit_fn.fanout());

    let output = match layout {
        DataLayout::Aos => {
            let mut output = vec![Tuple::default(); tuples];
            partitioner.split(
                &*SURFACE,
                &digit_fn,
                Relation::Aos(&input),
                RelationMut::Aos(&mut output),
                &mut offsets,
            )?;
            output
        }
        DataLayout::Soa => {
            let values: Vec<u32> = input.iter().map(|tuple| tuple.value).collect();
            let mut out_keys = vec![K::default(); tuples];
            let mut out_values = vec![0_u32; tuples];
            partitioner.split(
                &*SURFACE,
                &digit_fn,
                Relation::Soa(&keys, &values),
                RelationMut::Soa(&mut out_keys, &mut out_values),
                &mut offsets,
            )?;

            izip!(out_keys, out_values)
                .map(|(key, value)| Tuple { key, value })
                .collect()
        }
        DataLayout::KeyOnly => {
            let mut out_keys = vec![K::default(); tuples];
            partitioner.split(
                &*SURFACE,
                &digit_fn,
                Relation::<K, u32>::KeyOnly(&keys),
                RelationMut::KeyOnly(&mut out_keys),
                &mut offsets,
            )?;

            input.iter_mut().for_each(|tuple| tuple.value = 0);
            out_keys
                .into_iter()
                .map(|key| Tuple { key, value: 0 })
                .collect()
        }
    };

    validator(&digit_fn, &input, &output, &offsets)
}

const ALGORITHMS: [SplitAlgorithm; 4] = [
    SplitAlgorithm::WorkItem,
    SplitAlgorithm::WorkGroup,
    SplitAlgorithm::WorkGroupReorder,
    SplitAlgorithm::Single,
];

#[test]
fn tuple_loss_or_duplicates_u32_4_bits() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            10_000,
            Box::new(|keys: &mut [u32]| gen_uniform(keys, 0, 1 << 20)),
            RadixDigit::new(0, 4)?,
            algorithm,
            DataLayout::Aos,
            Box::new(tuple_loss_or_duplicates),
        )?;
    }

    Ok(())
}

#[test]
fn verify_partitions_u32_4_bits() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            10_000,
            Box::new(|keys: &mut [u32]| gen_uniform(keys, 0, 1 << 20)),
            RadixDigit::new(0, 4)?,
            algorithm,
            DataLayout::Aos,
            Box::new(verify_partitions),
        )?;
    }

    Ok(())
}

#[test]
fn verify_partitions_u64_6_bits_shifted() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            7_777,
            Box::new(|keys: &mut [u64]| gen_uniform(keys, 0, 1 << 40)),
            RadixDigit::new(12, 6)?,
            algorithm,
            DataLayout::Aos,
            Box::new(verify_partitions),
        )?;
    }

    Ok(())
}

#[test]
fn verify_histogram_non_power_two() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            12_345,
            Box::new(|keys: &mut [u32]| gen_uniform(keys, 0, 1 << 20)),
            RadixDigit::new(0, 5)?,
            algorithm,
            DataLayout::Aos,
            Box::new(verify_histogram),
        )?;
    }

    Ok(())
}

#[test]
fn verify_stability_u32_4_bits() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            10_000,
            Box::new(|keys: &mut [u32]| gen_uniform(keys, 0, 64)),
            RadixDigit::new(0, 4)?,
            algorithm,
            DataLayout::Aos,
            Box::new(verify_stability),
        )?;
    }

    Ok(())
}

#[test]
fn verify_stability_soa_layout() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            5_000,
            Box::new(|keys: &mut [i64]| gen_uniform(keys, -1000, 1000)),
            RadixDigit::new(0, 3)?,
            algorithm,
            DataLayout::Soa,
            Box::new(|digit_fn: &_, input: &_, output: &_, offsets: &_| {
                tuple_loss_or_duplicates(digit_fn, input, output, offsets)?;
                verify_partitions(digit_fn, input, output, offsets)?;
                verify_stability(digit_fn, input, output, offsets)
            }),
        )?;
    }

    Ok(())
}

#[test]
fn verify_partitions_key_only_layout() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            5_000,
            Box::new(|keys: &mut [i32]| gen_uniform(keys, i32::min_value(), i32::max_value())),
            RadixDigit::new(28, 4)?,
            algorithm,
            DataLayout::KeyOnly,
            Box::new(|digit_fn: &_, input: &_, output: &_, offsets: &_| {
                tuple_loss_or_duplicates(digit_fn, input, output, offsets)?;
                verify_partitions(digit_fn, input, output, offsets)
            }),
        )?;
    }

    Ok(())
}

#[test]
fn verify_partitions_hash_digit() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            8_192,
            Box::new(|keys: &mut [u64]| gen_uniform(keys, 0, 1 << 20)),
            HashDigit::new(0, 5)?,
            algorithm,
            DataLayout::Aos,
            Box::new(|digit_fn: &_, input: &_, output: &_, offsets: &_| {
                tuple_loss_or_duplicates(digit_fn, input, output, offsets)?;
                verify_partitions(digit_fn, input, output, offsets)
            }),
        )?;
    }

    Ok(())
}

#[test]
fn verify_partitions_single_bucket() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            1_000,
            Box::new(|keys: &mut [u32]| gen_uniform(keys, 0, 1 << 20)),
            HashDigit::new(0, 0)?,
            algorithm,
            DataLayout::Aos,
            Box::new(|digit_fn: &_, input: &_, output: &_, offsets: &PartitionOffsets| {
                assert_eq!(offsets.as_slice(), &[0, 1_000]);
                verify_stability(digit_fn, input, output, offsets)
            }),
        )?;
    }

    Ok(())
}

#[test]
fn empty_input_yields_zero_offsets() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        run_split(
            0,
            Box::new(|_: &mut [u32]| Ok(())),
            RadixDigit::new(0, 4)?,
            algorithm,
            DataLayout::Aos,
            Box::new(|_: &_, _: &_, output: &[Tuple<u32, u32>], offsets: &PartitionOffsets| {
                assert!(output.is_empty());
                assert_eq!(offsets.as_slice(), &[0; 17][..]);
                Ok(())
            }),
        )?;
    }

    Ok(())
}

#[test]
fn partition_returns_indexable_buckets() -> Result<(), Box<dyn Error>> {
    let keys: Vec<u32> = vec![3, 0, 7, 4, 1, 5, 2, 6];
    let digit = RadixDigit::new(0, 2)?;

    let partitioned = RadixPartitioner::default().partition(
        &*SURFACE,
        &digit,
        Relation::<u32, u32>::KeyOnly(&keys),
    )?;

    assert_eq!(partitioned.fanout(), 4);
    assert_eq!(partitioned.offsets().counts(), vec![2, 2, 2, 2]);

    let bucket_keys: Vec<Vec<u32>> = partitioned
        .partitions()
        .map(|bucket| bucket.iter().map(|tuple| tuple.key).collect())
        .collect();
    assert_eq!(
        bucket_keys,
        vec![vec![0, 4], vec![1, 5], vec![2, 6], vec![3, 7]]
    );
    assert_eq!(partitioned[3].len(), 2);

    Ok(())
}

/// Maps every key to a bucket beyond its fanout.
struct BrokenDigit;

impl DigitFn<u32> for BrokenDigit {
    fn fanout(&self) -> u32 {
        4
    }

    fn digit(&self, key: u32) -> u32 {
        if key == 42 {
            4
        } else {
            key % 4
        }
    }
}

#[test]
fn digit_out_of_range_is_invalid_argument() -> Result<(), Box<dyn Error>> {
    for &algorithm in ALGORITHMS.iter() {
        let keys: Vec<u32> = (0..1_000).collect();
        let input = tag_positions(&keys);
        let mut output = vec![Tuple::default(); input.len()];
        let mut offsets = PartitionOffsets::new(4);

        let result = RadixPartitioner::new(algorithm, BLOCK_SIZE)?.split(
            &*SURFACE,
            &BrokenDigit,
            Relation::Aos(&input),
            RelationMut::Aos(&mut output),
            &mut offsets,
        );

        match result {
            Err(e) => match e.kind() {
                ErrorKind::InvalidArgument(_) => {}
                other => panic!("{:?}: unexpected error {}", algorithm, other),
            },
            Ok(_) => panic!("{:?}: out-of-range digit was not detected", algorithm),
        }
    }

    Ok(())
}

#[test]
fn mismatched_offsets_are_rejected() -> Result<(), Box<dyn Error>> {
    let keys: Vec<u32> = (0..100).collect();
    let mut out_keys = vec![0; keys.len()];
    let mut offsets = PartitionOffsets::new(8);

    let result = RadixPartitioner::default().split(
        &*SURFACE,
        &RadixDigit::new(0, 4)?,
        Relation::<u32, u32>::KeyOnly(&keys),
        RelationMut::KeyOnly(&mut out_keys),
        &mut offsets,
    );

    assert!(matches!(
        result.as_ref().map_err(|e| e.kind()),
        Err(ErrorKind::InvalidArgument(_))
    ));

    Ok(())
}

#[test]
fn tile_split_beyond_shared_memory_is_rejected() -> Result<(), Box<dyn Error>> {
    let keys: Vec<u32> = (0..10_000).collect();
    let input = tag_positions(&keys);
    let digit = RadixDigit::new(0, 10)?;

    let mut output = vec![Tuple::default(); input.len()];
    let mut offsets = PartitionOffsets::new(DigitFn::<u32>::fanout(&digit));
    let result = RadixPartitioner::new(SplitAlgorithm::WorkGroup, 1024)?.split(
        &*SURFACE,
        &digit,
        Relation::Aos(&input),
        RelationMut::Aos(&mut output),
        &mut offsets,
    );
    assert!(matches!(
        result.as_ref().map_err(|e| e.kind()),
        Err(ErrorKind::InvalidArgument(_))
    ));

    RadixPartitioner::new(SplitAlgorithm::WorkItem, 1024)?.split(
        &*SURFACE,
        &digit,
        Relation::Aos(&input),
        RelationMut::Aos(&mut output),
        &mut offsets,
    )?;
    verify_partitions(&digit, &input, &output, &offsets)?;
    verify_stability(&digit, &input, &output, &offsets)
}

#[test]
fn non_power_of_two_block_is_rejected() {
    assert!(RadixPartitioner::new(SplitAlgorithm::WorkGroup, 100).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn split_is_a_stable_partition(
        keys in prop::collection::vec(any::<u32>(), 0..3_000),
        radix_bits in 1_u32..7,
        shift in 0_u32..26,
        algorithm_id in 0_usize..4,
    ) {
        let algorithm = ALGORITHMS[algorithm_id];
        run_split(
            keys.len(),
            Box::new(|dst: &mut [u32]| {
                dst.copy_from_slice(&keys);
                Ok(())
            }),
            RadixDigit::new(shift, radix_bits).unwrap(),
            algorithm,
            DataLayout::Aos,
            Box::new(|digit_fn: &_, input: &_, output: &_, offsets: &_| {
                tuple_loss_or_duplicates(digit_fn, input, output, offsets)?;
                verify_histogram(digit_fn, input, output, offsets)?;
                verify_partitions(digit_fn, input, output, offsets)?;
                verify_stability(digit_fn, input, output, offsets)
            }),
        ).unwrap();
    }
}
