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

use qp_ops::error::Result as OpResult;
use qp_ops::join::JoinedTuple;
use qp_ops::partition::{DataLayout, RadixKey, Relation, Tuple};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::error::Error;
use std::result::Result;

pub type JoinResult<K, V> = Vec<JoinedTuple<K, V>>;

/// Computes the join result with a sequential hash join.
pub fn reference_join<K, V>(r: &[Tuple<K, V>], s: &[Tuple<K, V>]) -> JoinResult<K, V>
where
    K: RadixKey,
    V: Copy + Ord,
{
    let mut build: HashMap<K, Vec<V>> = HashMap::new();
    r.iter()
        .for_each(|tuple| build.entry(tuple.key).or_default().push(tuple.value));

    let mut result: JoinResult<K, V> = s
        .iter()
        .flat_map(|probe| {
            build
                .get(&probe.key)
                .into_iter()
                .flatten()
                .map(move |&r_value| JoinedTuple {
                    key: probe.key,
                    r_value,
                    s_value: probe.value,
                })
        })
        .collect();
    result.sort();
    result
}

pub fn as_relation<'a>(
    tuples: &'a [Tuple<u64, u64>],
    columns: &'a (Vec<u64>, Vec<u64>),
    layout: DataLayout,
) -> Relation<'a, u64, u64> {
    match layout {
        DataLayout::Soa => Relation::Soa(&columns.0, &columns.1),
        _ => Relation::Aos(tuples),
    }
}

/// Runs `join` on `r` and `s` in the given layouts, and compares the result
/// with the sequential reference.
pub fn run_join<JoinFn>(
    r: &[Tuple<u64, u64>],
    s: &[Tuple<u64, u64>],
    r_layout: DataLayout,
    s_layout: DataLayout,
    join: JoinFn,
) -> Result<(), Box<dyn Error>>
where
    JoinFn: FnOnce(
        Relation<'_, u64, u64>,
        Relation<'_, u64, u64>,
        &mut JoinResult<u64, u64>,
    ) -> OpResult<(usize, f64)>,
{
    let r_columns: (Vec<u64>, Vec<u64>) = r.iter().map(|t| (t.key, t.value)).unzip();
    let s_columns: (Vec<u64>, Vec<u64>) = s.iter().map(|t| (t.key, t.value)).unzip();

    let mut result = Vec::new();
    let (result_len, _elapsed) = join(
        as_relation(r, &r_columns, r_layout),
        as_relation(s, &s_columns, s_layout),
        &mut result,
    )?;

    assert_eq!(result_len, result.len());

    result.sort();
    let expected = reference_join(r, s);
    assert_eq!(result.len(), expected.len(), "Wrong number of matches");
    assert_eq!(result, expected);

    Ok(())
}

/// Generates a build relation with unique keys and a probe relation of which
/// about half of the tuples find a match.
pub fn gen_primary_foreign_key(
    r_len: usize,
    s_len: usize,
) -> (Vec<Tuple<u64, u64>>, Vec<Tuple<u64, u64>>) {
    let mut rng = thread_rng();

    let mut keys: Vec<u64> = (0..r_len as u64).collect();
    keys.shuffle(&mut rng);
    let r = keys
        .into_iter()
        .map(|key| Tuple {
            key,
            value: rng.gen(),
        })
        .collect();

    let s = (0..s_len)
        .map(|_| Tuple {
            key: rng.gen_range(0, 2 * r_len as u64 + 1),
            value: rng.gen(),
        })
        .collect();

    (r, s)
}

/// Generates tuples with keys drawn uniformly from `distinct_keys` values.
pub fn gen_skewed(len: usize, distinct_keys: u64) -> Vec<Tuple<u64, u64>> {
    let mut rng = thread_rng();
    (0..len)
        .map(|i| Tuple {
            key: rng.gen_range(0, distinct_keys),
            value: i as u64,
        })
        .collect()
}
