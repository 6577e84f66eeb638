/*
 * Copyright 2019-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use super::{fanout, Tuple};
use crate::error::{ErrorKind, Result};

use std::ops::{Index, Range};

/// Bucket boundaries of a partitioned relation.
///
/// # Layout
///
/// The offsets hold `fanout + 1` entries. Entry `b` is the first position of
/// bucket `b`, and the last entry is the total number of elements:
///
/// ```ignore
/// 0 = offset[0] <= offset[1] <= ... <= offset[fanout] = len
/// ```
///
/// Bucket `b` thus spans `offset[b]..offset[b + 1]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionOffsets {
    offsets: Vec<u32>,
}

impl PartitionOffsets {
    /// Creates offsets for `fanout` empty buckets.
    pub fn new(fanout: u32) -> Self {
        Self {
            offsets: vec![0; fanout as usize + 1],
        }
    }

    /// Creates offsets for `2^radix_bits` empty buckets.
    pub fn with_radix_bits(radix_bits: u32) -> Self {
        Self::new(fanout(radix_bits))
    }

    /// Returns the number of buckets.
    pub fn fanout(&self) -> u32 {
        (self.offsets.len() - 1) as u32
    }

    /// Returns the total number of elements in all buckets.
    pub fn len(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the first position of the requested bucket.
    pub fn offset(&self, partition_id: u32) -> Result<usize> {
        self.check_id(partition_id)?;
        Ok(self.offsets[partition_id as usize] as usize)
    }

    /// Returns the length of the requested bucket.
    pub fn partition_len(&self, partition_id: u32) -> Result<usize> {
        Ok(self.range(partition_id)?.len())
    }

    /// Returns the positions spanned by the requested bucket.
    pub fn range(&self, partition_id: u32) -> Result<Range<usize>> {
        self.check_id(partition_id)?;
        let id = partition_id as usize;

        Ok(self.offsets[id] as usize..self.offsets[id + 1] as usize)
    }

    /// Returns the number of elements per bucket.
    pub fn counts(&self) -> Vec<usize> {
        self.offsets
            .windows(2)
            .map(|w| (w[1] - w[0]) as usize)
            .collect()
    }

    /// Returns the raw boundaries, including the total length as last entry.
    pub fn as_slice(&self) -> &[u32] {
        &self.offsets
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u32] {
        &mut self.offsets
    }

    fn check_id(&self, partition_id: u32) -> Result<()> {
        if partition_id >= self.fanout() {
            Err(ErrorKind::InvalidArgument("Invalid partition ID".to_string()))?;
        }

        Ok(())
    }
}

/// A relation that is partitioned into contiguous buckets.
///
/// The relation is stored as `Tuple<K, V>`s, together with the bucket
/// boundaries.
#[derive(Clone, Debug)]
pub struct PartitionedRelation<K, V> {
    pub(crate) relation: Vec<Tuple<K, V>>,
    pub(crate) offsets: PartitionOffsets,
}

impl<K: Copy + Default, V: Copy + Default> PartitionedRelation<K, V> {
    /// Creates a new partitioned relation with `len` default tuples and
    /// `fanout` buckets.
    pub fn new(len: usize, fanout: u32) -> Self {
        Self {
            relation: vec![Tuple::default(); len],
            offsets: PartitionOffsets::new(fanout),
        }
    }
}

impl<K, V> PartitionedRelation<K, V> {
    /// Returns the number of tuples in the relation.
    pub fn len(&self) -> usize {
        self.relation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relation.is_empty()
    }

    /// Returns the number of buckets.
    pub fn fanout(&self) -> u32 {
        self.offsets.fanout()
    }

    /// Returns the bucket boundaries.
    pub fn offsets(&self) -> &PartitionOffsets {
        &self.offsets
    }

    /// Returns the length of the requested bucket.
    pub fn partition_len(&self, partition_id: u32) -> Result<usize> {
        self.offsets.partition_len(partition_id)
    }

    /// Returns the tuples of the requested bucket.
    pub fn partition(&self, partition_id: u32) -> Result<&[Tuple<K, V>]> {
        let range = self.offsets.range(partition_id)?;
        Ok(&self.relation[range])
    }

    /// Returns all tuples, ordered by bucket.
    pub fn as_slice(&self) -> &[Tuple<K, V>] {
        &self.relation
    }

    /// Returns an iterator over all buckets in ascending bucket order.
    pub fn partitions(&self) -> impl Iterator<Item = &[Tuple<K, V>]> + '_ {
        self.offsets
            .as_slice()
            .windows(2)
            .map(move |w| &self.relation[w[0] as usize..w[1] as usize])
    }
}

/// Returns the specified partition as a subslice of the relation.
impl<K, V> Index<u32> for PartitionedRelation<K, V> {
    type Output = [Tuple<K, V>];

    fn index(&self, partition_id: u32) -> &Self::Output {
        match self.partition(partition_id) {
            Ok(partition) => partition,
            Err(_) => panic!("Invalid partition ID"),
        }
    }
}
