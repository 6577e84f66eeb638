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

use qp_runtime::error::Result as RtResult;
use qp_runtime::runtime::memory::{DeviceCopy, LaunchableMem, LaunchableMutSlice, LaunchableSlice};
use serde_derive::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};

/// A key-value tuple.
///
/// Relations in the array-of-structures layout are stored as a collection of
/// `Tuple<K, V>`.
#[derive(Copy, Clone, Default, Debug, Eq, Hash, PartialEq)]
#[repr(C)]
pub struct Tuple<Key: Sized, Value: Sized> {
    pub key: Key,
    pub value: Value,
}

unsafe impl<K, V> DeviceCopy for Tuple<K, V>
where
    K: DeviceCopy,
    V: DeviceCopy,
{
}

/// Physical layout of a relation.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DataLayout {
    /// Only keys, without a payload.
    KeyOnly,

    /// An array of `(key, value)` tuples.
    Aos,

    /// A key array and a value array of equal length.
    Soa,
}

/// A read-only relation in one of the supported layouts.
#[derive(Debug)]
pub enum Relation<'a, K, V> {
    KeyOnly(&'a [K]),
    Aos(&'a [Tuple<K, V>]),
    Soa(&'a [K], &'a [V]),
}

// Manual impls avoid the `K: Clone, V: Clone` bounds of derive.
impl<'a, K, V> Clone for Relation<'a, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, K, V> Copy for Relation<'a, K, V> {}

/// A writable relation in one of the supported layouts.
#[derive(Debug)]
pub enum RelationMut<'a, K, V> {
    KeyOnly(&'a mut [K]),
    Aos(&'a mut [Tuple<K, V>]),
    Soa(&'a mut [K], &'a mut [V]),
}

impl<'a, K, V> Relation<'a, K, V> {
    /// Returns the number of elements in the relation.
    pub fn len(&self) -> usize {
        match self {
            Relation::KeyOnly(keys) => keys.len(),
            Relation::Aos(tuples) => tuples.len(),
            Relation::Soa(keys, _) => keys.len(),
        }
    }

    /// Returns `true` if the relation has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the physical layout.
    pub fn layout(&self) -> DataLayout {
        match self {
            Relation::KeyOnly(_) => DataLayout::KeyOnly,
            Relation::Aos(_) => DataLayout::Aos,
            Relation::Soa(..) => DataLayout::Soa,
        }
    }

    /// Checks that the key and value streams have equal length.
    pub fn validate(&self) -> Result<()> {
        if let Relation::Soa(keys, values) = self {
            if keys.len() != values.len() {
                Err(ErrorKind::InvalidArgument(format!(
                    "Key and value columns have different lengths ({} vs. {})",
                    keys.len(),
                    values.len()
                )))?;
            }
        }

        Ok(())
    }

    pub(crate) fn as_view(&self) -> RelationView<'a, K, V> {
        match *self {
            Relation::KeyOnly(keys) => RelationView::KeyOnly(keys.as_launchable_slice()),
            Relation::Aos(tuples) => RelationView::Aos(tuples.as_launchable_slice()),
            Relation::Soa(keys, values) => {
                RelationView::Soa(keys.as_launchable_slice(), values.as_launchable_slice())
            }
        }
    }
}

impl<'a, K, V> RelationMut<'a, K, V> {
    /// Returns the number of elements in the relation.
    pub fn len(&self) -> usize {
        match self {
            RelationMut::KeyOnly(keys) => keys.len(),
            RelationMut::Aos(tuples) => tuples.len(),
            RelationMut::Soa(keys, _) => keys.len(),
        }
    }

    /// Returns `true` if the relation has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the physical layout.
    pub fn layout(&self) -> DataLayout {
        match self {
            RelationMut::KeyOnly(_) => DataLayout::KeyOnly,
            RelationMut::Aos(_) => DataLayout::Aos,
            RelationMut::Soa(..) => DataLayout::Soa,
        }
    }

    /// Checks that the key and value streams have equal length.
    pub fn validate(&self) -> Result<()> {
        self.as_relation().validate()
    }

    /// Reborrows the relation as read-only.
    pub fn as_relation(&self) -> Relation<'_, K, V> {
        match self {
            RelationMut::KeyOnly(keys) => Relation::KeyOnly(keys),
            RelationMut::Aos(tuples) => Relation::Aos(tuples),
            RelationMut::Soa(keys, values) => Relation::Soa(keys, values),
        }
    }

    /// Reborrows the relation for a shorter lifetime.
    pub fn reborrow(&mut self) -> RelationMut<'_, K, V> {
        match self {
            RelationMut::KeyOnly(keys) => RelationMut::KeyOnly(keys),
            RelationMut::Aos(tuples) => RelationMut::Aos(tuples),
            RelationMut::Soa(keys, values) => RelationMut::Soa(keys, values),
        }
    }

    /// Copies all elements from `src`, which must have the same layout and
    /// length.
    pub fn copy_from(&mut self, src: Relation<'_, K, V>) -> Result<()>
    where
        K: Copy,
        V: Copy,
    {
        if self.len() != src.len() {
            Err(ErrorKind::InvalidArgument(
                "Copy destination length must be equal to source".to_string(),
            ))?;
        }

        match (self, src) {
            (RelationMut::KeyOnly(dst), Relation::KeyOnly(src)) => dst.copy_from_slice(src),
            (RelationMut::Aos(dst), Relation::Aos(src)) => dst.copy_from_slice(src),
            (RelationMut::Soa(dst_keys, dst_values), Relation::Soa(src_keys, src_values)) => {
                dst_keys.copy_from_slice(src_keys);
                dst_values.copy_from_slice(src_values);
            }
            _ => Err(ErrorKind::InvalidArgument(
                "Copy source and destination have different layouts".to_string(),
            ))?,
        }

        Ok(())
    }

    pub(crate) fn as_view(&mut self) -> RelationMutView<'_, K, V> {
        match self {
            RelationMut::KeyOnly(keys) => RelationMutView::KeyOnly(keys.as_launchable_mut_slice()),
            RelationMut::Aos(tuples) => RelationMutView::Aos(tuples.as_launchable_mut_slice()),
            RelationMut::Soa(keys, values) => RelationMutView::Soa(
                keys.as_launchable_mut_slice(),
                values.as_launchable_mut_slice(),
            ),
        }
    }
}

/// A launchable read-only view of a relation.
///
/// Key-only relations yield tuples with a default value.
#[derive(Debug)]
pub(crate) enum RelationView<'a, K, V> {
    KeyOnly(LaunchableSlice<'a, K>),
    Aos(LaunchableSlice<'a, Tuple<K, V>>),
    Soa(LaunchableSlice<'a, K>, LaunchableSlice<'a, V>),
}

impl<'a, K, V> Clone for RelationView<'a, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, K, V> Copy for RelationView<'a, K, V> {}

impl<'a, K, V> RelationView<'a, K, V>
where
    K: DeviceCopy,
    V: DeviceCopy + Default,
{
    pub(crate) fn len(&self) -> usize {
        match self {
            RelationView::KeyOnly(keys) => keys.len(),
            RelationView::Aos(tuples) => tuples.len(),
            RelationView::Soa(keys, _) => keys.len(),
        }
    }

    /// Reads the key at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len()`.
    pub(crate) unsafe fn key_unchecked(&self, index: usize) -> K {
        match self {
            RelationView::KeyOnly(keys) => keys.get_unchecked(index),
            RelationView::Aos(tuples) => tuples.get_unchecked(index).key,
            RelationView::Soa(keys, _) => keys.get_unchecked(index),
        }
    }

    /// Reads the element at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len()`.
    pub(crate) unsafe fn tuple_unchecked(&self, index: usize) -> Tuple<K, V> {
        match self {
            RelationView::KeyOnly(keys) => Tuple {
                key: keys.get_unchecked(index),
                value: V::default(),
            },
            RelationView::Aos(tuples) => tuples.get_unchecked(index),
            RelationView::Soa(keys, values) => Tuple {
                key: keys.get_unchecked(index),
                value: values.get_unchecked(index),
            },
        }
    }

    /// Reads the element at `index`.
    pub(crate) fn tuple(&self, index: usize) -> RtResult<Tuple<K, V>> {
        match self {
            RelationView::KeyOnly(keys) => Ok(Tuple {
                key: keys.get(index)?,
                value: V::default(),
            }),
            RelationView::Aos(tuples) => tuples.get(index),
            RelationView::Soa(keys, values) => Ok(Tuple {
                key: keys.get(index)?,
                value: values.get(index)?,
            }),
        }
    }
}

/// A launchable writable view of a relation.
///
/// Writes to key-only relations drop the value.
#[derive(Debug)]
pub(crate) enum RelationMutView<'a, K, V> {
    KeyOnly(LaunchableMutSlice<'a, K>),
    Aos(LaunchableMutSlice<'a, Tuple<K, V>>),
    Soa(LaunchableMutSlice<'a, K>, LaunchableMutSlice<'a, V>),
}

impl<'a, K, V> Clone for RelationMutView<'a, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, K, V> Copy for RelationMutView<'a, K, V> {}

impl<'a, K, V> RelationMutView<'a, K, V>
where
    K: DeviceCopy,
    V: DeviceCopy + Default,
{
    pub(crate) fn len(&self) -> usize {
        match self {
            RelationMutView::KeyOnly(keys) => keys.len(),
            RelationMutView::Aos(tuples) => tuples.len(),
            RelationMutView::Soa(keys, _) => keys.len(),
        }
    }

    /// Returns a read-only view of the same memory.
    ///
    /// # Safety
    ///
    /// Reads through the returned view must not race with writes through
    /// `self`.
    pub(crate) unsafe fn as_relation_view(&self) -> RelationView<'a, K, V> {
        match self {
            RelationMutView::KeyOnly(keys) => RelationView::KeyOnly(keys.as_launchable_slice()),
            RelationMutView::Aos(tuples) => RelationView::Aos(tuples.as_launchable_slice()),
            RelationMutView::Soa(keys, values) => {
                RelationView::Soa(keys.as_launchable_slice(), values.as_launchable_slice())
            }
        }
    }

    /// Writes `tuple` at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len()`, and no other lane may access `index`
    /// during the launch.
    pub(crate) unsafe fn write_unchecked(&self, index: usize, tuple: Tuple<K, V>) {
        match self {
            RelationMutView::KeyOnly(keys) => keys.set_unchecked(index, tuple.key),
            RelationMutView::Aos(tuples) => tuples.set_unchecked(index, tuple),
            RelationMutView::Soa(keys, values) => {
                keys.set_unchecked(index, tuple.key);
                values.set_unchecked(index, tuple.value);
            }
        }
    }

    /// Writes `tuple` at `index`.
    ///
    /// # Safety
    ///
    /// No other lane may access `index` during the launch.
    pub(crate) unsafe fn write(&self, index: usize, tuple: Tuple<K, V>) -> RtResult<()> {
        match self {
            RelationMutView::KeyOnly(keys) => keys.set(index, tuple.key),
            RelationMutView::Aos(tuples) => tuples.set(index, tuple),
            RelationMutView::Soa(keys, values) => {
                keys.set(index, tuple.key)?;
                values.set(index, tuple.value)
            }
        }
    }
}
