// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interface between the controller driver and the generic device stack.

use crate::utilities::VolatileCell;

/// Direction of an endpoint or transfer, from the host's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// USB transfer types, encoded as in an endpoint descriptor's
/// `bmAttributes` (and in the hardware's endpoint type fields).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// An endpoint number plus direction.
///
/// Two different bit positions are derived from an address, and they must
/// never be conflated: the *slot index* (`2 * number + direction`) locates
/// the endpoint's queue head and descriptor in the table, while the
/// *status bit* (`number`, plus 16 for IN) locates the endpoint in the
/// `ENDPTPRIME`/`ENDPTFLUSH`/`ENDPTCOMPLETE` registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    number: u8,
    direction: TransferDirection,
}

impl EndpointAddress {
    pub const fn new(number: u8, direction: TransferDirection) -> EndpointAddress {
        EndpointAddress { number, direction }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Index of this endpoint's queue head and transfer descriptor in the
    /// endpoint table.
    pub fn slot_index(&self) -> usize {
        2 * self.number as usize
            + match self.direction {
                TransferDirection::Out => 0,
                TransferDirection::In => 1,
            }
    }

    pub(crate) fn from_slot_index(slot: usize) -> EndpointAddress {
        EndpointAddress {
            number: (slot / 2) as u8,
            direction: if slot % 2 == 0 {
                TransferDirection::Out
            } else {
                TransferDirection::In
            },
        }
    }

    /// Bit position of this endpoint in the per-slot status registers
    /// (`ENDPTPRIME`, `ENDPTFLUSH`, `ENDPTSTAT`, `ENDPTCOMPLETE`).
    pub(crate) fn status_bit(&self) -> u32 {
        self.number as u32
            + match self.direction {
                TransferDirection::Out => 0,
                TransferDirection::In => 16,
            }
    }
}

/// The subset of an endpoint descriptor this driver acts on.
#[derive(Clone, Copy, Debug)]
pub struct EndpointConfig {
    pub address: EndpointAddress,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

/// Outcome of a completed transfer, delivered with
/// [`Client::transfer_complete`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferResult {
    Success,
    /// A transaction or data-buffer error was flagged on the descriptor.
    Failed,
    /// The endpoint halted (stalled) during the transfer.
    Stalled,
}

/// Errors returned synchronously by controller operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The request asks for something the driver does not implement
    /// (isochronous endpoints, in particular).
    Unsupported,
    /// The request exceeds a hardware limit: endpoint number beyond the
    /// port variant's range, or a transfer longer than the descriptor's
    /// byte counter can hold.
    ResourceExceeded,
    /// A bounded wait on hardware state expired.
    Timeout,
    /// The controller raised an error interrupt the driver cannot
    /// attribute or recover; a bus reset is the only in-band remedy.
    ControllerFault,
}

/// Events the driver delivers to the device stack above it.
///
/// All callbacks run in the controller's interrupt context, from within
/// [`DeviceController::service_interrupt`].
pub trait Client {
    /// A bus reset was received and the controller re-initialized.
    fn bus_reset(&self);

    /// The bus was suspended. Not delivered before the device has been
    /// assigned an address.
    fn suspended(&self);

    /// Start-of-frame received.
    fn start_of_frame(&self);

    /// A setup packet arrived on the control endpoint. `setup` is the raw
    /// 8-byte packet as latched by the hardware.
    fn setup_received(&self, setup: &[u8; 8]);

    /// A primed transfer finished. `transferred` is the number of bytes
    /// actually moved, which may be short of the submitted length.
    fn transfer_complete(&self, endpoint: EndpointAddress, transferred: u16, result: TransferResult);
}

/// Operations the device stack calls into the controller driver.
///
/// Transfer outcomes are never returned synchronously: a successful
/// [`submit_transfer`](Self::submit_transfer) only hands the buffer to
/// hardware, and the result arrives later through
/// [`Client::transfer_complete`]. Completion order across different
/// endpoints need not match submission order.
pub trait DeviceController<'a> {
    fn set_client(&self, client: &'a dyn Client);

    /// Bring the controller out of reset, configure device mode, publish
    /// the endpoint table, enable the interrupt set, and start running.
    fn initialize(&self);

    fn enable_interrupts(&self);

    fn disable_interrupts(&self);

    /// Assign the device address. Completes the control status stage (a
    /// zero-length IN transfer) before the address takes effect.
    fn set_address(&self, addr: u8) -> Result<(), ErrorCode>;

    /// Nothing to do at this layer; configuration is a stack concern.
    fn set_configuration(&self, value: u8);

    /// Remote wakeup signaling is not implemented.
    fn remote_wakeup(&self);

    fn open_endpoint(&self, config: &EndpointConfig) -> Result<(), ErrorCode>;

    /// Halt one direction of an endpoint. Fails with `ResourceExceeded` if
    /// the endpoint number is beyond the port's range.
    fn stall(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode>;

    /// Un-halt one direction of an endpoint, resynchronizing its data
    /// toggle. Fails with `ResourceExceeded` if the endpoint number is
    /// beyond the port's range.
    fn clear_stall(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode>;

    /// Queue a transfer of `len` bytes through `buffer` and prime the
    /// endpoint. The buffer must stay allocated until the completion event
    /// for this endpoint arrives; `None` submits a zero-length transfer.
    fn submit_transfer(
        &self,
        endpoint: EndpointAddress,
        buffer: Option<&'a [VolatileCell<u8>]>,
        len: u16,
    ) -> Result<(), ErrorCode>;

    /// Translate pending interrupt status into client events. Safe to call
    /// on a shared interrupt line; returns immediately if nothing is
    /// pending. An unattributable error interrupt is reported as
    /// `Err(ControllerFault)` after all other pending work is handled.
    fn service_interrupt(&self) -> Result<(), ErrorCode>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_index_and_status_bit_are_consistent() {
        for number in 0..6u8 {
            for direction in [TransferDirection::Out, TransferDirection::In] {
                let addr = EndpointAddress::new(number, direction);
                let slot = addr.slot_index();

                assert_eq!(slot, 2 * number as usize + (direction == TransferDirection::In) as usize);
                assert_eq!(
                    addr.status_bit(),
                    number as u32 + if direction == TransferDirection::In { 16 } else { 0 }
                );
                assert_eq!(EndpointAddress::from_slot_index(slot), addr);
            }
        }
    }

    #[test]
    fn control_endpoint_slots() {
        assert_eq!(
            EndpointAddress::new(0, TransferDirection::Out).slot_index(),
            0
        );
        assert_eq!(
            EndpointAddress::new(0, TransferDirection::In).slot_index(),
            1
        );
        assert_eq!(
            EndpointAddress::new(0, TransferDirection::In).status_bit(),
            16
        );
    }
}
