// Copyright 2021-2022 Clemens Lutz
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

use itertools::{iproduct, izip};
use once_cell::sync::Lazy;
use qp_ops::error::ErrorKind;
use qp_ops::gather_scatter::{BoundsCheck, GatherScatter, WorkDistribution};
use qp_ops::partition::{DataLayout, Relation, RelationMut, Tuple};
use qp_runtime::runtime::cpu::CpuSurface;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use std::error::Error;

static SURFACE: Lazy<CpuSurface> =
    Lazy::new(|| CpuSurface::new(4).expect("Failed to create the CPU surface"));

const DISTRIBUTIONS: [WorkDistribution; 2] =
    [WorkDistribution::Contiguous, WorkDistribution::Strided];

const LAYOUTS: [DataLayout; 3] = [DataLayout::KeyOnly, DataLayout::Aos, DataLayout::Soa];

fn random_permutation(len: usize) -> Vec<u32> {
    let mut positions: Vec<u32> = (0..len as u32).collect();
    positions.shuffle(&mut thread_rng());
    positions
}

/// Moves `tuples` through `op` in the given layout and returns the result as
/// tuples.
fn run_data_movement<OpFn>(
    tuples: &[Tuple<u64, i32>],
    dst_len: usize,
    layout: DataLayout,
    op: OpFn,
) -> Result<Vec<Tuple<u64, i32>>, Box<dyn Error>>
where
    OpFn: FnOnce(Relation<'_, u64, i32>, RelationMut<'_, u64, i32>) -> qp_ops::error::Result<f64>,
{
    let output = match layout {
        DataLayout::Aos => {
            let mut dst = vec![Tuple::default(); dst_len];
            op(Relation::Aos(tuples), RelationMut::Aos(&mut dst))?;
            dst
        }
        DataLayout::Soa => {
            let keys: Vec<u64> = tuples.iter().map(|t| t.key).collect();
            let values: Vec<i32> = tuples.iter().map(|t| t.value).collect();
            let mut dst_keys = vec![0; dst_len];
            let mut dst_values = vec![0; dst_len];
            op(
                Relation::Soa(&keys, &values),
                RelationMut::Soa(&mut dst_keys, &mut dst_values),
            )?;

            izip!(dst_keys, dst_values)
                .map(|(key, value)| Tuple { key, value })
                .collect()
        }
        DataLayout::KeyOnly => {
            let keys: Vec<u64> = tuples.iter().map(|t| t.key).collect();
            let mut dst_keys = vec![0; dst_len];
            op(Relation::KeyOnly(&keys), RelationMut::KeyOnly(&mut dst_keys))?;

            dst_keys
                .into_iter()
                .map(|key| Tuple { key, value: 0 })
                .collect()
        }
    };

    Ok(output)
}

fn gen_tuples(len: usize, layout: DataLayout) -> Vec<Tuple<u64, i32>> {
    let mut rng = thread_rng();
    (0..len)
        .map(|_| Tuple {
            key: rng.gen_range(0, 1 << 40),
            value: if layout == DataLayout::KeyOnly {
                0
            } else {
                rng.gen()
            },
        })
        .collect()
}

#[test]
fn gather_follows_positions() -> Result<(), Box<dyn Error>> {
    for (&layout, &distribution) in iproduct!(LAYOUTS.iter(), DISTRIBUTIONS.iter()) {
        let src = gen_tuples(5_000, layout);
        let positions: Vec<u32> = (0..3_000).map(|_| thread_rng().gen_range(0, 5_000)).collect();
        let engine = GatherScatter::new(128).distribution(distribution);

        let dst = run_data_movement(&src, positions.len(), layout, |s, d| {
            engine.gather(&*SURFACE, s, &positions, d)
        })?;

        for (i, (&pos, tuple)) in positions.iter().zip(dst.iter()).enumerate() {
            assert_eq!(
                *tuple, src[pos as usize],
                "{:?}/{:?}: wrong tuple at position {}",
                layout, distribution, i
            );
        }
    }

    Ok(())
}

#[test]
fn scatter_follows_positions() -> Result<(), Box<dyn Error>> {
    for (&layout, &distribution) in iproduct!(LAYOUTS.iter(), DISTRIBUTIONS.iter()) {
        let src = gen_tuples(4_321, layout);
        let positions = random_permutation(src.len());
        let engine = GatherScatter::new(64).distribution(distribution);

        let dst = run_data_movement(&src, src.len(), layout, |s, d| {
            engine.scatter(&*SURFACE, s, &positions, d)
        })?;

        for (tuple, &pos) in src.iter().zip(positions.iter()) {
            assert_eq!(dst[pos as usize], *tuple, "{:?}/{:?}", layout, distribution);
        }
    }

    Ok(())
}

#[test]
fn scatter_then_gather_restores_input() -> Result<(), Box<dyn Error>> {
    for &layout in LAYOUTS.iter() {
        let src = gen_tuples(10_000, layout);
        let positions = random_permutation(src.len());
        let engine = GatherScatter::default();

        let scattered = run_data_movement(&src, src.len(), layout, |s, d| {
            engine.scatter(&*SURFACE, s, &positions, d)
        })?;
        let restored = run_data_movement(&scattered, src.len(), layout, |s, d| {
            engine.gather(&*SURFACE, s, &positions, d)
        })?;

        assert_eq!(restored, src, "{:?}", layout);
    }

    Ok(())
}

#[test]
fn unchecked_matches_checked() -> Result<(), Box<dyn Error>> {
    let src = gen_tuples(2_048, DataLayout::Aos);
    let positions = random_permutation(src.len());

    let checked = GatherScatter::new(256);
    let unchecked = unsafe { GatherScatter::new(256).unchecked() };
    assert_eq!(checked.bounds_check(), BoundsCheck::Checked);
    assert_eq!(unchecked.bounds_check(), BoundsCheck::Unchecked);

    let mut checked_dst = vec![Tuple::default(); src.len()];
    let mut unchecked_dst = vec![Tuple::default(); src.len()];
    checked.gather(
        &*SURFACE,
        Relation::Aos(&src),
        &positions,
        RelationMut::Aos(&mut checked_dst),
    )?;
    unchecked.gather(
        &*SURFACE,
        Relation::Aos(&src),
        &positions,
        RelationMut::Aos(&mut unchecked_dst),
    )?;

    assert_eq!(checked_dst, unchecked_dst);
    Ok(())
}

#[test]
fn fixed_grid_size_covers_all_elements() -> Result<(), Box<dyn Error>> {
    let src = gen_tuples(9_999, DataLayout::Aos);
    let positions = random_permutation(src.len());

    for &grid_size in [1, 3, 100].iter() {
        let engine = GatherScatter::new(32)
            .grid_size(grid_size)
            .elements_per_lane(1);
        let dst = run_data_movement(&src, src.len(), DataLayout::Aos, |s, d| {
            engine.gather(&*SURFACE, s, &positions, d)
        })?;

        for (i, &pos) in positions.iter().enumerate() {
            assert_eq!(dst[i], src[pos as usize], "grid size {}", grid_size);
        }
    }

    Ok(())
}

#[test]
fn gather_out_of_bounds_is_reported() {
    let src: Vec<u32> = (0..100).collect();
    let mut dst = vec![0; 10];
    let mut positions: Vec<u32> = (0..10).collect();
    positions[7] = 100;

    let result = GatherScatter::default().gather(
        &*SURFACE,
        Relation::<u32, u32>::KeyOnly(&src),
        &positions,
        RelationMut::KeyOnly(&mut dst),
    );

    assert!(matches!(
        result.as_ref().map_err(|e| e.kind()),
        Err(ErrorKind::OutOfBounds(_))
    ));
}

#[test]
fn scatter_out_of_bounds_is_reported() {
    let src: Vec<Tuple<u32, u32>> = (0..10).map(|i| Tuple { key: i, value: i }).collect();
    let mut dst = vec![Tuple::default(); 10];
    let mut positions: Vec<u32> = (0..10).rev().collect();
    positions[0] = u32::max_value();

    let result = GatherScatter::default().scatter(
        &*SURFACE,
        Relation::Aos(&src),
        &positions,
        RelationMut::Aos(&mut dst),
    );

    assert!(matches!(
        result.as_ref().map_err(|e| e.kind()),
        Err(ErrorKind::OutOfBounds(_))
    ));
}

#[test]
fn mismatched_layouts_are_rejected() {
    let src: Vec<u32> = (0..10).collect();
    let mut dst_keys = vec![0_u32; 10];
    let mut dst_values = vec![0_u32; 10];
    let positions: Vec<u32> = (0..10).collect();

    let result = GatherScatter::default().gather(
        &*SURFACE,
        Relation::KeyOnly(&src),
        &positions,
        RelationMut::Soa(&mut dst_keys, &mut dst_values),
    );

    assert!(matches!(
        result.as_ref().map_err(|e| e.kind()),
        Err(ErrorKind::InvalidArgument(_))
    ));
}

#[test]
fn mismatched_position_count_is_rejected() {
    let src: Vec<u32> = (0..10).collect();
    let mut dst = vec![0_u32; 10];
    let positions: Vec<u32> = (0..5).collect();

    let result = GatherScatter::default().scatter(
        &*SURFACE,
        Relation::<u32, u32>::KeyOnly(&src),
        &positions,
        RelationMut::KeyOnly(&mut dst),
    );

    assert!(matches!(
        result.as_ref().map_err(|e| e.kind()),
        Err(ErrorKind::InvalidArgument(_))
    ));
}
