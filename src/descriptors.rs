// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! The DMA-shared endpoint table: queue heads and transfer descriptors.
//!
//! The controller and the driver communicate through a single statically
//! allocated [`EndpointTable`] whose base address is programmed into
//! `ENDPTLISTADDR`. Every word the hardware may read or write is stored in
//! an [`InMemoryRegister`] so all accesses are volatile; field layout is
//! expressed with `register_bitfields!` accessors over plain `u32` words.
//!
//! Ownership of a table slot follows a strict handoff: software may write a
//! descriptor only while the slot is not primed, and may read completion
//! state only through [`TransferDescriptor::observe_completion`] after the
//! slot's `ENDPTCOMPLETE` bit has been seen. In between, the slot belongs
//! to the hardware.

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::registers::InMemoryRegister;

use crate::hil::TransferResult;

/// Endpoint slots in the table: two (OUT then IN) per endpoint number, for
/// the six endpoint numbers of the larger controller variant.
pub const QH_COUNT: usize = 12;

/// Slot of the control OUT queue head.
pub(crate) const CONTROL_OUT_SLOT: usize = 0;
/// Slot of the control IN queue head.
pub(crate) const CONTROL_IN_SLOT: usize = 1;

/// "No next descriptor" sentinel for descriptor link pointers.
pub(crate) const TD_NEXT_TERMINATE: u32 = 0x1;

const PAGE_SIZE: u32 = 4096;

/// Largest transfer the 15-bit remaining-byte counter can describe.
pub(crate) const MAX_TRANSFER_BYTES: u16 = 0x7fff;

register_bitfields![u32,
    /// Transfer descriptor token (word 1).
    pub TOKEN [
        /// Transaction Error
        XACT_ERR OFFSET(3) NUMBITS(1) [],
        /// Data Buffer Error
        BUFFER_ERR OFFSET(5) NUMBITS(1) [],
        /// Halted
        HALTED OFFSET(6) NUMBITS(1) [],
        /// Active; set by software, cleared by hardware at completion
        ACTIVE OFFSET(7) NUMBITS(1) [],
        /// Interrupt On Complete
        IOC OFFSET(15) NUMBITS(1) [],
        /// Total Bytes: remaining byte count, decremented by hardware
        TOTAL_BYTES OFFSET(16) NUMBITS(15) []
    ],
    /// Queue head capabilities/characteristics (word 0).
    pub CAPS [
        /// Interrupt On Setup (control OUT only)
        INT_ON_SETUP OFFSET(15) NUMBITS(1) [],
        /// Maximum packet length of the endpoint
        MAX_PACKET_SIZE OFFSET(16) NUMBITS(11) [],
        /// Zero Length Termination select
        ZERO_LENGTH_TERMINATION OFFSET(29) NUMBITS(1) [],
        /// Transactions per transfer descriptor; must be 0 for
        /// non-isochronous endpoints
        MULT OFFSET(30) NUMBITS(2) []
    ]
];

#[inline]
fn next_page(addr: u32) -> u32 {
    // The DMA engine's pointers are modular; a buffer in the top page of
    // the 32-bit space wraps rather than overflows.
    (addr & !(PAGE_SIZE - 1)).wrapping_add(PAGE_SIZE)
}

/// One hardware DMA transfer descriptor (dTD), 32 bytes.
///
/// Word 7 is ignored by the hardware; the driver uses it to remember the
/// originally requested length so the transferred count can be computed at
/// completion.
#[repr(C, align(32))]
pub struct TransferDescriptor {
    next: InMemoryRegister<u32>,
    token: InMemoryRegister<u32, TOKEN::Register>,
    buffers: [InMemoryRegister<u32>; 5],
    expected_bytes: InMemoryRegister<u32>,
}

impl TransferDescriptor {
    pub(crate) const fn new() -> TransferDescriptor {
        TransferDescriptor {
            next: InMemoryRegister::new(0),
            token: InMemoryRegister::new(0),
            buffers: [
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
            ],
            expected_bytes: InMemoryRegister::new(0),
        }
    }

    /// The physical address hardware uses to reach this descriptor.
    pub(crate) fn address(&self) -> u32 {
        self as *const TransferDescriptor as usize as u32
    }

    pub(crate) fn clear(&self) {
        self.next.set(0);
        self.token.set(0);
        for buffer in self.buffers.iter() {
            buffer.set(0);
        }
        self.expected_bytes.set(0);
    }

    /// Rebuild this descriptor for a fresh transfer of `len` bytes.
    ///
    /// The remaining-byte counter and the private requested-byte word both
    /// start at `len`; hardware decrements only the former. `buffer` is the
    /// address of the first byte; the remaining page pointers are derived
    /// by stepping to each following 4 KiB boundary so the DMA engine can
    /// cross pages mid-transfer.
    ///
    /// Must only be called while the slot is not primed.
    pub(crate) fn reinitialize(&self, buffer: Option<u32>, len: u16) {
        self.next.set(TD_NEXT_TERMINATE);
        self.token
            .write(TOKEN::ACTIVE::SET + TOKEN::TOTAL_BYTES.val(len as u32));
        self.expected_bytes.set(len as u32);

        match buffer {
            Some(addr) => {
                self.buffers[0].set(addr);
                for i in 1..self.buffers.len() {
                    self.buffers[i].set(next_page(self.buffers[i - 1].get()));
                }
            }
            None => {
                for buffer in self.buffers.iter() {
                    buffer.set(0);
                }
            }
        }
    }

    pub(crate) fn set_interrupt_on_complete(&self) {
        self.token.modify(TOKEN::IOC::SET);
    }

    /// Read back the hardware-written completion state of this descriptor.
    ///
    /// Returns the number of bytes actually transferred (requested minus
    /// remaining) and the outcome: halted means the endpoint stalled, and
    /// takes precedence over the transaction/buffer error bits.
    ///
    /// Must only be called after the slot's completion bit was observed.
    pub(crate) fn observe_completion(&self) -> (u16, TransferResult) {
        let token = self.token.extract();

        let result = if token.is_set(TOKEN::HALTED) {
            TransferResult::Stalled
        } else if token.is_set(TOKEN::XACT_ERR) || token.is_set(TOKEN::BUFFER_ERR) {
            TransferResult::Failed
        } else {
            TransferResult::Success
        };

        let remaining = token.read(TOKEN::TOTAL_BYTES);
        let transferred = self.expected_bytes.get().saturating_sub(remaining);

        (transferred as u16, result)
    }
}

#[cfg(test)]
impl TransferDescriptor {
    /// Test hook standing in for the DMA engine: retire the descriptor
    /// with the given remaining count and error state.
    pub(crate) fn hardware_complete(
        &self,
        remaining: u16,
        halted: bool,
        xact_err: bool,
        buffer_err: bool,
    ) {
        self.token.modify(
            TOKEN::ACTIVE::CLEAR
                + TOKEN::TOTAL_BYTES.val(remaining as u32)
                + TOKEN::HALTED.val(halted as u32)
                + TOKEN::XACT_ERR.val(xact_err as u32)
                + TOKEN::BUFFER_ERR.val(buffer_err as u32),
        );
    }

    pub(crate) fn buffer_pointer(&self, i: usize) -> u32 {
        self.buffers[i].get()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.token.is_set(TOKEN::ACTIVE)
    }
}

/// One hardware queue head (dQH), 64 bytes.
///
/// Words 2..9 are the transfer overlay: the controller's working copy of
/// the current descriptor. Software touches only the overlay's `next` word,
/// to link in a freshly built descriptor before priming.
#[repr(C, align(64))]
pub struct QueueHead {
    caps: InMemoryRegister<u32, CAPS::Register>,
    current: InMemoryRegister<u32>,
    overlay_next: InMemoryRegister<u32>,
    overlay_token: InMemoryRegister<u32, TOKEN::Register>,
    overlay_buffers: [InMemoryRegister<u32>; 5],
    overlay_reserved: InMemoryRegister<u32>,
    setup: [InMemoryRegister<u32>; 2],
    _reserved: [u32; 4],
}

impl QueueHead {
    pub(crate) const fn new() -> QueueHead {
        QueueHead {
            caps: InMemoryRegister::new(0),
            current: InMemoryRegister::new(0),
            overlay_next: InMemoryRegister::new(0),
            overlay_token: InMemoryRegister::new(0),
            overlay_buffers: [
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
            ],
            overlay_reserved: InMemoryRegister::new(0),
            setup: [InMemoryRegister::new(0), InMemoryRegister::new(0)],
            _reserved: [0; 4],
        }
    }

    pub(crate) fn clear(&self) {
        self.caps.set(0);
        self.current.set(0);
        self.overlay_next.set(0);
        self.overlay_token.set(0);
        for buffer in self.overlay_buffers.iter() {
            buffer.set(0);
        }
        self.overlay_reserved.set(0);
        for word in self.setup.iter() {
            word.set(0);
        }
    }

    pub(crate) fn configure(&self, max_packet_size: u16, zero_length_termination: bool) {
        self.caps.write(
            CAPS::MAX_PACKET_SIZE.val(max_packet_size as u32)
                + CAPS::ZERO_LENGTH_TERMINATION.val(zero_length_termination as u32),
        );
    }

    pub(crate) fn set_interrupt_on_setup(&self) {
        self.caps.modify(CAPS::INT_ON_SETUP::SET);
    }

    pub(crate) fn set_overlay_next(&self, addr: u32) {
        self.overlay_next.set(addr);
    }

    /// Copy out the setup packet the hardware latched into this queue head
    /// (control OUT only).
    pub(crate) fn setup_packet(&self) -> [u8; 8] {
        let lo = self.setup[0].get().to_le_bytes();
        let hi = self.setup[1].get().to_le_bytes();
        [lo[0], lo[1], lo[2], lo[3], hi[0], hi[1], hi[2], hi[3]]
    }
}

#[cfg(test)]
impl QueueHead {
    pub(crate) fn latch_setup_packet(&self, packet: &[u8; 8]) {
        self.setup[0].set(u32::from_le_bytes([
            packet[0], packet[1], packet[2], packet[3],
        ]));
        self.setup[1].set(u32::from_le_bytes([
            packet[4], packet[5], packet[6], packet[7],
        ]));
    }

    pub(crate) fn max_packet_size(&self) -> u32 {
        self.caps.read(CAPS::MAX_PACKET_SIZE)
    }

    pub(crate) fn zero_length_termination(&self) -> bool {
        self.caps.is_set(CAPS::ZERO_LENGTH_TERMINATION)
    }

    pub(crate) fn interrupt_on_setup(&self) -> bool {
        self.caps.is_set(CAPS::INT_ON_SETUP)
    }

    pub(crate) fn overlay_next(&self) -> u32 {
        self.overlay_next.get()
    }

    pub(crate) fn is_cleared(&self) -> bool {
        self.caps.get() == 0 && self.current.get() == 0 && self.overlay_next.get() == 0
    }
}

/// The endpoint table shared with the controller's DMA engine.
///
/// The whole table must be 2 KiB aligned; queue heads fall on 64-byte and
/// transfer descriptors on 32-byte boundaries. Slots 0 and 1 are
/// permanently the control endpoint's OUT and IN halves.
#[repr(C, align(2048))]
pub struct EndpointTable {
    qh: [QueueHead; QH_COUNT],
    td: [TransferDescriptor; QH_COUNT],
}

// The table is written by at most one execution context at a time (the
// driver serializes against its own interrupt, see the crate docs) and
// every shared word is accessed volatilely.
unsafe impl Sync for EndpointTable {}

impl EndpointTable {
    pub const fn new() -> EndpointTable {
        EndpointTable {
            qh: [
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
                QueueHead::new(),
            ],
            td: [
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
                TransferDescriptor::new(),
            ],
        }
    }

    /// The address programmed into `ENDPTLISTADDR`.
    pub(crate) fn base_address(&self) -> u32 {
        self as *const EndpointTable as usize as u32
    }

    pub(crate) fn queue_head(&self, slot: usize) -> &QueueHead {
        &self.qh[slot]
    }

    pub(crate) fn descriptor(&self, slot: usize) -> &TransferDescriptor {
        &self.td[slot]
    }

    pub(crate) fn clear(&self) {
        for qh in self.qh.iter() {
            qh.clear();
        }
        for td in self.td.iter() {
            td.clear();
        }
    }
}

// Layout is hardware-defined; catch drift at compile time.
const _: () = assert!(core::mem::size_of::<TransferDescriptor>() == 32);
const _: () = assert!(core::mem::size_of::<QueueHead>() == 64);
const _: () = assert!(core::mem::align_of::<EndpointTable>() == 2048);
const _: () = assert!(core::mem::size_of::<EndpointTable>() % 32 == 0);
