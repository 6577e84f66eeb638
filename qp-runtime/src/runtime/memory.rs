/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Global memory views that can be passed into a kernel launch.
//!
//! A kernel receives its buffers as `LaunchableSlice` and `LaunchableMutSlice`
//! views. These are `Copy` so that every work-group and every lane holds its
//! own handle to the same global memory, as on a GPU. Reads and writes come in
//! a bounds-checked and an unchecked flavor.
//!
//! Concurrent writes to the same index by different lanes are data races. The
//! kernels guarantee disjoint write sets per launch, which is why the mutating
//! accessors are `unsafe`.

use std::marker::PhantomData;
use std::ops::Range;

use crate::error::{ErrorKind, Result};

/// Marks a type as safe to copy into and out of global memory.
///
/// # Safety
///
/// The type must not contain references or pointers to host-owned data, as the
/// value might be copied by the device without running any destructors.
pub unsafe trait DeviceCopy: Copy + Send + Sync + 'static {}

macro_rules! impl_device_copy {
    ($($t:ty),*) => {
        $(
            unsafe impl DeviceCopy for $t {}
        )*
    }
}

impl_device_copy!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, ()
);

unsafe impl<T: DeviceCopy, U: DeviceCopy> DeviceCopy for (T, U) {}

/// A read-only view of global memory that can be launched in a kernel.
#[derive(Debug)]
pub struct LaunchableSlice<'a, T> {
    ptr: *const T,
    len: usize,
    _marker: PhantomData<&'a [T]>,
}

impl<'a, T> Clone for LaunchableSlice<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for LaunchableSlice<'a, T> {}

unsafe impl<'a, T: Sync> Send for LaunchableSlice<'a, T> {}
unsafe impl<'a, T: Sync> Sync for LaunchableSlice<'a, T> {}

impl<'a, T: DeviceCopy> LaunchableSlice<'a, T> {
    /// Returns the length of the slice.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the slice has a length of zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the value at `index`, returning an error if the index is out of
    /// bounds.
    pub fn get(&self, index: usize) -> Result<T> {
        if index >= self.len {
            Err(ErrorKind::OutOfBounds(format!(
                "Read at index {} of a slice with length {}",
                index, self.len
            )))?;
        }

        Ok(unsafe { self.get_unchecked(index) })
    }

    /// Reads the value at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len()`.
    pub unsafe fn get_unchecked(&self, index: usize) -> T {
        self.ptr.add(index).read()
    }

    /// Returns a view of the sub-range `range`.
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.len {
            Err(ErrorKind::OutOfBounds(format!(
                "Range {:?} exceeds slice with length {}",
                range, self.len
            )))?;
        }

        Ok(Self {
            ptr: unsafe { self.ptr.add(range.start) },
            len: range.end - range.start,
            _marker: PhantomData,
        })
    }

    /// Returns a regular `slice`.
    ///
    /// # Safety
    ///
    /// No lane may write to the underlying memory while the returned slice is
    /// alive.
    pub unsafe fn as_slice(&self) -> &'a [T] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// A writable view of global memory that can be launched in a kernel.
#[derive(Debug)]
pub struct LaunchableMutSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T> Clone for LaunchableMutSlice<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for LaunchableMutSlice<'a, T> {}

unsafe impl<'a, T: Send> Send for LaunchableMutSlice<'a, T> {}
unsafe impl<'a, T: Send + Sync> Sync for LaunchableMutSlice<'a, T> {}

impl<'a, T: DeviceCopy> LaunchableMutSlice<'a, T> {
    /// Returns the length of the slice.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the slice has a length of zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the value at `index`, returning an error if the index is out of
    /// bounds.
    ///
    /// # Safety
    ///
    /// No other lane may concurrently write to `index`.
    pub unsafe fn get(&self, index: usize) -> Result<T> {
        if index >= self.len {
            Err(ErrorKind::OutOfBounds(format!(
                "Read at index {} of a slice with length {}",
                index, self.len
            )))?;
        }

        Ok(self.get_unchecked(index))
    }

    /// Reads the value at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len()`, and no other lane may concurrently
    /// write to `index`.
    pub unsafe fn get_unchecked(&self, index: usize) -> T {
        self.ptr.add(index).read()
    }

    /// Writes `value` at `index`, returning an error if the index is out of
    /// bounds.
    ///
    /// # Safety
    ///
    /// No other lane may concurrently access `index`.
    pub unsafe fn set(&self, index: usize, value: T) -> Result<()> {
        if index >= self.len {
            Err(ErrorKind::OutOfBounds(format!(
                "Write at index {} of a slice with length {}",
                index, self.len
            )))?;
        }

        self.set_unchecked(index, value);
        Ok(())
    }

    /// Writes `value` at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len()`, and no other lane may concurrently
    /// access `index`.
    pub unsafe fn set_unchecked(&self, index: usize, value: T) {
        self.ptr.add(index).write(value)
    }

    /// Returns a view of the sub-range `range`.
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.len {
            Err(ErrorKind::OutOfBounds(format!(
                "Range {:?} exceeds slice with length {}",
                range, self.len
            )))?;
        }

        Ok(Self {
            ptr: unsafe { self.ptr.add(range.start) },
            len: range.end - range.start,
            _marker: PhantomData,
        })
    }

    /// Returns a read-only view of the same memory.
    ///
    /// # Safety
    ///
    /// Reads through the returned view must not race with writes through
    /// `self`.
    pub unsafe fn as_launchable_slice(&self) -> LaunchableSlice<'a, T> {
        LaunchableSlice {
            ptr: self.ptr as *const T,
            len: self.len,
            _marker: PhantomData,
        }
    }

    /// Returns a regular mutable `slice`.
    ///
    /// # Safety
    ///
    /// The returned slice must be the only access path to the memory while it
    /// is alive.
    pub unsafe fn as_mut_slice(&self) -> &'a mut [T] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// Memory that can be launched in a kernel.
///
/// By implementing `LaunchableMem` for a type, you specify that the memory can
/// be accessed by all work-groups of a kernel launch.
pub trait LaunchableMem {
    /// The type of elements stored in the memory range.
    type Item;

    /// Returns a launchable read-only view of the memory.
    fn as_launchable_slice(&self) -> LaunchableSlice<'_, Self::Item>;

    /// Returns a launchable writable view of the memory.
    fn as_launchable_mut_slice(&mut self) -> LaunchableMutSlice<'_, Self::Item>;
}

impl<T> LaunchableMem for [T] {
    type Item = T;

    fn as_launchable_slice(&self) -> LaunchableSlice<'_, T> {
        LaunchableSlice {
            ptr: self.as_ptr(),
            len: self.len(),
            _marker: PhantomData,
        }
    }

    fn as_launchable_mut_slice(&mut self) -> LaunchableMutSlice<'_, T> {
        LaunchableMutSlice {
            ptr: self.as_mut_ptr(),
            len: self.len(),
            _marker: PhantomData,
        }
    }
}

impl<T> LaunchableMem for Vec<T> {
    type Item = T;

    fn as_launchable_slice(&self) -> LaunchableSlice<'_, T> {
        self.as_slice().as_launchable_slice()
    }

    fn as_launchable_mut_slice(&mut self) -> LaunchableMutSlice<'_, T> {
        self.as_mut_slice().as_launchable_mut_slice()
    }
}
