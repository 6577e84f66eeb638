/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2020-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

pub mod join_reference;
pub mod radix_partition;

use itertools::iproduct;
use join_reference::{gen_primary_foreign_key, gen_skewed, reference_join, run_join};
use once_cell::sync::Lazy;
use proptest::prelude::*;
use qp_ops::error::ErrorKind;
use qp_ops::join::{HashingScheme, JoinedTuple, NoPartitioningJoin, RadixJoin};
use qp_ops::partition::{DataLayout, RadixPartitioner, Relation, SplitAlgorithm, Tuple};
use qp_runtime::runtime::cpu::CpuSurface;
use qp_runtime::runtime::hw_info::DeviceLimits;
use qp_runtime::runtime::surface::ExecutionSurface;
use radix_partition::SURFACE;
use rand::{thread_rng, Rng};
use std::error::Error;
use std::result::Result;

const SCHEMES: [HashingScheme; 2] = [HashingScheme::LinearProbing, HashingScheme::BucketChaining];

#[test]
fn join_of_small_example() -> Result<(), Box<dyn Error>> {
    let (a, b, c, x, y) = (10, 20, 30, 100, 200);
    let r: Vec<Tuple<u32, u32>> = vec![
        Tuple { key: 1, value: a },
        Tuple { key: 2, value: b },
        Tuple { key: 2, value: c },
    ];
    let s: Vec<Tuple<u32, u32>> = vec![Tuple { key: 2, value: x }, Tuple { key: 3, value: y }];
    let expected = vec![
        JoinedTuple {
            key: 2,
            r_value: b,
            s_value: x,
        },
        JoinedTuple {
            key: 2,
            r_value: c,
            s_value: x,
        },
    ];

    for &scheme in SCHEMES.iter() {
        let mut result = Vec::new();
        let (result_len, _) = RadixJoin::new(2, scheme, 128)?.join(
            &*SURFACE,
            Relation::Aos(&r),
            Relation::Aos(&s),
            &mut result,
        )?;

        result.sort();
        assert_eq!(result_len, 2);
        assert_eq!(result, expected, "{:?}", scheme);
    }

    let mut result = Vec::new();
    NoPartitioningJoin::default().join(
        &*SURFACE,
        Relation::Aos(&r),
        Relation::Aos(&s),
        &mut result,
    )?;
    result.sort();
    assert_eq!(result, expected);

    Ok(())
}

#[test]
fn join_is_independent_of_bucket_count() -> Result<(), Box<dyn Error>> {
    let (r, s) = gen_primary_foreign_key(3_000, 10_000);

    for (&bucket_count, &scheme) in iproduct!([1, 2, 16, 256, 4096].iter(), SCHEMES.iter()) {
        run_join(&r, &s, DataLayout::Aos, DataLayout::Aos, |r, s, result| {
            RadixJoin::new(bucket_count, scheme, 128)?.join(&*SURFACE, r, s, result)
        })?;
    }

    Ok(())
}

#[test]
fn join_of_soa_relations() -> Result<(), Box<dyn Error>> {
    let (r, s) = gen_primary_foreign_key(2_000, 4_000);

    for &(r_layout, s_layout) in [
        (DataLayout::Soa, DataLayout::Soa),
        (DataLayout::Aos, DataLayout::Soa),
        (DataLayout::Soa, DataLayout::Aos),
    ]
    .iter()
    {
        run_join(&r, &s, r_layout, s_layout, |r, s, result| {
            RadixJoin::new(32, HashingScheme::LinearProbing, 64)?.join(&*SURFACE, r, s, result)
        })?;
    }

    Ok(())
}

#[test]
fn join_with_every_split_algorithm() -> Result<(), Box<dyn Error>> {
    let (r, s) = gen_primary_foreign_key(2_500, 2_500);

    for &algorithm in [
        SplitAlgorithm::WorkItem,
        SplitAlgorithm::WorkGroup,
        SplitAlgorithm::WorkGroupReorder,
        SplitAlgorithm::Single,
    ]
    .iter()
    {
        run_join(&r, &s, DataLayout::Aos, DataLayout::Aos, |r, s, result| {
            RadixJoin::new(64, HashingScheme::BucketChaining, 128)?
                .split_algorithm(algorithm)
                .join(&*SURFACE, r, s, result)
        })?;
    }

    Ok(())
}

#[test]
fn oversized_buckets_are_partitioned_recursively() -> Result<(), Box<dyn Error>> {
    let (r, s) = gen_primary_foreign_key(5_000, 8_000);

    for &scheme in SCHEMES.iter() {
        run_join(&r, &s, DataLayout::Aos, DataLayout::Aos, |r, s, result| {
            RadixJoin::new(4, scheme, 32)?
                .on_chip_capacity(16)
                .join(&*SURFACE, r, s, result)
        })?;
    }

    Ok(())
}

#[test]
fn single_bucket_is_built_in_chunks() -> Result<(), Box<dyn Error>> {
    let r = gen_skewed(3_000, 500);
    let s = gen_skewed(2_000, 700);

    for &scheme in SCHEMES.iter() {
        run_join(&r, &s, DataLayout::Aos, DataLayout::Aos, |r, s, result| {
            RadixJoin::new(1, scheme, 64)?
                .on_chip_capacity(128)
                .join(&*SURFACE, r, s, result)
        })?;
    }

    Ok(())
}

/// A surface with a fraction of the usual shared memory per work-group.
static SMALL_SURFACE: Lazy<CpuSurface> = Lazy::new(|| {
    CpuSurface::sequential().with_limits(DeviceLimits {
        shared_mem_per_block: 4096,
        ..DeviceLimits::default()
    })
});

#[test]
fn join_with_reduced_shared_memory() -> Result<(), Box<dyn Error>> {
    let (r, s) = gen_primary_foreign_key(3_000, 6_000);
    let limits = SMALL_SURFACE.device_limits();

    for (&bucket_count, &scheme) in iproduct!([16, 64].iter(), SCHEMES.iter()) {
        // The work-group split doesn't fit, so the join must fall back to
        // the work-item split.
        let work_group_bytes = RadixPartitioner::new(SplitAlgorithm::WorkGroup, 128)?
            .shared_mem_bytes::<u64, u64>(bucket_count);
        assert!(work_group_bytes.map_or(true, |bytes| bytes > limits.shared_mem_per_block));

        run_join(&r, &s, DataLayout::Aos, DataLayout::Soa, |r, s, result| {
            RadixJoin::new(bucket_count, scheme, 128)?.join(&*SMALL_SURFACE, r, s, result)
        })?;
    }

    Ok(())
}

#[test]
fn heavy_duplicates_exhaust_hash_bits() -> Result<(), Box<dyn Error>> {
    let r: Vec<Tuple<u64, u64>> = (0..2_000).map(|i| Tuple { key: 7, value: i }).collect();
    let s: Vec<Tuple<u64, u64>> = (0..50)
        .map(|i| Tuple {
            key: if i % 5 == 0 { 8 } else { 7 },
            value: i,
        })
        .collect();

    for &scheme in SCHEMES.iter() {
        run_join(&r, &s, DataLayout::Aos, DataLayout::Aos, |r, s, result| {
            RadixJoin::new(4096, scheme, 128)?
                .on_chip_capacity(256)
                .join(&*SURFACE, r, s, result)
        })?;
    }

    Ok(())
}

#[test]
fn join_with_signed_keys() -> Result<(), Box<dyn Error>> {
    let mut rng = thread_rng();
    let r: Vec<Tuple<i32, i64>> = (0..3_000)
        .map(|i| Tuple {
            key: rng.gen_range(-1_000, 1_000),
            value: i,
        })
        .collect();
    let s: Vec<Tuple<i32, i64>> = (0..3_000)
        .map(|i| Tuple {
            key: rng.gen_range(-1_000, 1_000),
            value: -i,
        })
        .collect();

    let mut radix_result = Vec::new();
    RadixJoin::new(16, HashingScheme::LinearProbing, 128)?.join(
        &*SURFACE,
        Relation::Aos(&r),
        Relation::Aos(&s),
        &mut radix_result,
    )?;
    radix_result.sort();

    let mut np_result = Vec::new();
    NoPartitioningJoin::new(64)?.join(
        &*SURFACE,
        Relation::Aos(&r),
        Relation::Aos(&s),
        &mut np_result,
    )?;
    np_result.sort();

    let expected = reference_join(&r, &s);
    assert_eq!(radix_result, expected);
    assert_eq!(np_result, expected);

    Ok(())
}

#[test]
fn no_partitioning_join_matches_reference() -> Result<(), Box<dyn Error>> {
    let (r, s) = gen_primary_foreign_key(4_000, 9_000);

    for &grid_size in [1, 7, 64].iter() {
        run_join(&r, &s, DataLayout::Aos, DataLayout::Soa, |r, s, result| {
            NoPartitioningJoin::new(128)?
                .grid_size(grid_size)
                .join(&*SURFACE, r, s, result)
        })?;
    }

    let r = gen_skewed(2_000, 100);
    let s = gen_skewed(2_000, 150);
    run_join(&r, &s, DataLayout::Soa, DataLayout::Aos, |r, s, result| {
        NoPartitioningJoin::default().join(&*SURFACE, r, s, result)
    })
}

#[test]
fn join_of_empty_relations() -> Result<(), Box<dyn Error>> {
    let (r, _) = gen_primary_foreign_key(100, 0);
    let empty: Vec<Tuple<u64, u64>> = Vec::new();

    for (build, probe) in [(&r, &empty), (&empty, &r), (&empty, &empty)].iter() {
        let mut result = vec![JoinedTuple::default(); 3];
        let (result_len, _) = RadixJoin::default().join(
            &*SURFACE,
            Relation::Aos(build.as_slice()),
            Relation::Aos(probe.as_slice()),
            &mut result,
        )?;
        assert_eq!(result_len, 0);
        assert!(result.is_empty());

        let mut result = vec![JoinedTuple::default(); 3];
        let (result_len, _) = NoPartitioningJoin::default().join(
            &*SURFACE,
            Relation::Aos(build.as_slice()),
            Relation::Aos(probe.as_slice()),
            &mut result,
        )?;
        assert_eq!(result_len, 0);
        assert!(result.is_empty());
    }

    Ok(())
}

#[test]
fn key_only_relations_are_rejected() {
    let keys: Vec<u32> = (0..10).collect();
    let tuples: Vec<Tuple<u32, u32>> = keys.iter().map(|&key| Tuple { key, value: key }).collect();
    let mut result = Vec::new();

    let radix = RadixJoin::default().join(
        &*SURFACE,
        Relation::KeyOnly(&keys),
        Relation::Aos(&tuples),
        &mut result,
    );
    assert!(matches!(
        radix.as_ref().map_err(|e| e.kind()),
        Err(ErrorKind::InvalidArgument(_))
    ));

    let no_partitioning = NoPartitioningJoin::default().join(
        &*SURFACE,
        Relation::Aos(&tuples),
        Relation::KeyOnly(&keys),
        &mut result,
    );
    assert!(matches!(
        no_partitioning.as_ref().map_err(|e| e.kind()),
        Err(ErrorKind::InvalidArgument(_))
    ));
}

#[test]
fn invalid_configurations_are_rejected() {
    assert!(RadixJoin::new(3, HashingScheme::LinearProbing, 128).is_err());
    assert!(RadixJoin::new(8192, HashingScheme::LinearProbing, 128).is_err());
    assert!(RadixJoin::new(8, HashingScheme::LinearProbing, 100).is_err());
    assert!(NoPartitioningJoin::new(48).is_err());

    let tuples: Vec<Tuple<u64, u64>> = (0..10).map(|key| Tuple { key, value: key }).collect();
    let mut result = Vec::new();

    for &capacity in [0, 1 << 20].iter() {
        let join = RadixJoin::new(2, HashingScheme::LinearProbing, 128)
            .map(|join| join.on_chip_capacity(capacity))
            .and_then(|join| {
                join.join(
                    &*SURFACE,
                    Relation::Aos(&tuples),
                    Relation::Aos(&tuples),
                    &mut result,
                )
            });

        assert!(
            matches!(
                join.as_ref().map_err(|e| e.kind()),
                Err(ErrorKind::InvalidArgument(_))
            ),
            "Capacity {} was accepted",
            capacity
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn join_matches_reference(
        r_keys in prop::collection::vec(0_u64..64, 0..600),
        s_keys in prop::collection::vec(0_u64..64, 0..600),
        log2_buckets in 0_u32..6,
        capacity in 1_usize..64,
        scheme_id in 0_usize..2,
    ) {
        let to_tuples = |keys: &[u64]| -> Vec<Tuple<u64, u64>> {
            keys.iter()
                .enumerate()
                .map(|(i, &key)| Tuple { key, value: i as u64 })
                .collect()
        };
        let r = to_tuples(&r_keys);
        let s = to_tuples(&s_keys);

        let mut result = Vec::new();
        RadixJoin::new(1 << log2_buckets, SCHEMES[scheme_id], 32)
            .unwrap()
            .on_chip_capacity(capacity)
            .join(&*SURFACE, Relation::Aos(&r), Relation::Aos(&s), &mut result)
            .unwrap();
        result.sort();

        prop_assert_eq!(result, reference_join(&r, &s));
    }
}
