// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Shared helper types for the driver.

pub mod cells;
pub mod static_ref;

pub use cells::{OptionalCell, VolatileCell};
pub use static_ref::StaticRef;
