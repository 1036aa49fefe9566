// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Device-mode driver for the NXP Transdimension USB 2.0 controller.
//!
//! The Transdimension (ChipIdea) controller appears as `USB0`/`USB1` on
//! LPC18xx/LPC43xx parts and as the OTG controllers on i.MX RT10xx parts.
//! In device mode it executes transfers described by a table of queue heads
//! and transfer descriptors that lives in DMA-reachable memory: software
//! fills in a descriptor, links it into the endpoint's queue head, and
//! *primes* the endpoint; the controller walks the table on its own and
//! raises an interrupt when the transfer completes, stalls, or errors.
//!
//! Each queue head is assigned a single transfer descriptor, so one
//! transfer is in flight per endpoint slot at a time. The hardware supports
//! descriptor chaining, but a chain buys little at this layer and
//! complicates the completion accounting considerably.
//!
//! The driver itself is one [`UsbDevice`](usbdev::UsbDevice) object per
//! physical port, holding the port's register block and its
//! [`EndpointTable`](descriptors::EndpointTable). The generic device stack
//! sits above it behind the two traits in [`hil`]: the stack implements
//! [`hil::Client`] to receive bus events and transfer completions, and
//! drives the controller through [`hil::DeviceController`].
//!
//! Isochronous endpoints and host mode are not supported.

#![no_std]

pub mod descriptors;
pub mod hil;
pub mod registers;
pub mod usbdev;
pub mod utilities;

pub use crate::usbdev::{PortVariant, UsbDevice};
