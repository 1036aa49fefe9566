// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Cell types used at the driver's seams.

use core::cell::{Cell, UnsafeCell};
use core::ptr;

/// A `Cell` around an `Option`, for fields that may be unset.
pub struct OptionalCell<T: Copy> {
    value: Cell<Option<T>>,
}

impl<T: Copy> OptionalCell<T> {
    /// Create an empty cell (contains just `None`).
    pub const fn empty() -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(None),
        }
    }

    /// Update the stored value.
    pub fn set(&self, val: T) {
        self.value.set(Some(val));
    }

    /// Call a closure on the value if the value exists.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(T) -> R,
    {
        self.value.get().map(closure)
    }
}

/// An `UnsafeCell` whose contents are accessed with volatile reads and
/// writes, for memory that hardware reads or writes behind the compiler's
/// back.
#[repr(transparent)]
pub struct VolatileCell<T: Copy> {
    value: UnsafeCell<T>,
}

impl<T: Copy> VolatileCell<T> {
    pub const fn new(value: T) -> VolatileCell<T> {
        VolatileCell {
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> T {
        unsafe { ptr::read_volatile(self.value.get()) }
    }

    #[inline]
    pub fn set(&self, value: T) {
        unsafe { ptr::write_volatile(self.value.get(), value) }
    }
}
