// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Register map for the Transdimension USB controller.
//!
//! The layout is shared between the LPC18xx/43xx and i.MX RT10xx
//! instantiations; the device-controller operational registers start at
//! offset 0x140. Status registers (`USBSTS`, `ENDPTSETUPSTAT`,
//! `ENDPTCOMPLETE`, `ENDPTNAK`) are write-1-to-clear: reading a value and
//! writing it straight back acknowledges exactly the bits that were set.

use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

use crate::utilities::StaticRef;

register_structs! {
    pub UsbRegisters {
        /// ID and hardware parameter registers (i.MX RT10xx only).
        (0x000 => _reserved0),
        /// Capability Registers Length
        (0x100 => pub(crate) caplength: ReadOnly<u8>),
        (0x101 => _reserved1),
        /// Host Controller Interface Version
        (0x102 => pub(crate) hciversion: ReadOnly<u16>),
        /// Host Controller Structural Parameters
        (0x104 => pub(crate) hcsparams: ReadOnly<u32>),
        /// Host Controller Capability Parameters
        (0x108 => pub(crate) hccparams: ReadOnly<u32>),
        (0x10c => _reserved2),
        /// Device Controller Interface Version
        (0x120 => pub(crate) dciversion: ReadOnly<u16>),
        (0x122 => _reserved3),
        /// Device Controller Capability Parameters
        (0x124 => pub(crate) dccparams: ReadOnly<u32>),
        (0x128 => _reserved4),
        /// USB Command
        (0x140 => pub(crate) usbcmd: ReadWrite<u32, USBCMD::Register>),
        /// USB Status
        (0x144 => pub(crate) usbsts: ReadWrite<u32, USBSTS::Register>),
        /// Interrupt Enable (same bit positions as `USBSTS`)
        (0x148 => pub(crate) usbintr: ReadWrite<u32, USBSTS::Register>),
        /// USB Frame Index
        (0x14c => pub(crate) frindex: ReadWrite<u32>),
        (0x150 => _reserved5),
        /// Device Address
        (0x154 => pub(crate) deviceaddr: ReadWrite<u32, DEVICEADDR::Register>),
        /// Endpoint List Address; must be 2 KiB aligned
        (0x158 => pub(crate) endptlistaddr: ReadWrite<u32>),
        (0x15c => _reserved6),
        /// Programmable Burst Size
        (0x160 => pub(crate) burstsize: ReadWrite<u32>),
        /// TX FIFO Fill Tuning
        (0x164 => pub(crate) txfilltuning: ReadWrite<u32>),
        (0x168 => _reserved7),
        /// Endpoint NAK
        (0x178 => pub(crate) endptnak: ReadWrite<u32>),
        /// Endpoint NAK Enable
        (0x17c => pub(crate) endptnaken: ReadWrite<u32>),
        (0x180 => _reserved8),
        /// Port Status and Control
        (0x184 => pub(crate) portsc1: ReadWrite<u32, PORTSC1::Register>),
        (0x188 => _reserved9),
        /// On-The-Go Status and Control
        (0x1a4 => pub(crate) otgsc: ReadWrite<u32, OTGSC::Register>),
        /// USB Mode
        (0x1a8 => pub(crate) usbmode: ReadWrite<u32, USBMODE::Register>),
        /// Endpoint Setup Status, one bit per endpoint number
        (0x1ac => pub(crate) endptsetupstat: ReadWrite<u32>),
        /// Endpoint Prime, one bit per endpoint slot
        (0x1b0 => pub(crate) endptprime: ReadWrite<u32>),
        /// Endpoint Flush, one bit per endpoint slot
        (0x1b4 => pub(crate) endptflush: ReadWrite<u32>),
        /// Endpoint Status, one bit per endpoint slot
        (0x1b8 => pub(crate) endptstat: ReadOnly<u32>),
        /// Endpoint Complete, one bit per endpoint slot
        (0x1bc => pub(crate) endptcomplete: ReadWrite<u32>),
        /// Endpoint Control 0-7; OUT in the low half, IN in the high half
        (0x1c0 => pub(crate) endptctrl: [ReadWrite<u32, ENDPTCTRL::Register>; 8]),
        (0x1e0 => @END),
    }
}

register_bitfields![u32,
    pub USBCMD [
        /// Run/Stop
        RS OFFSET(0) NUMBITS(1) [],
        /// Controller Reset
        RST OFFSET(1) NUMBITS(1) [],
        /// Setup Tripwire
        SUTW OFFSET(13) NUMBITS(1) [],
        /// Add dTD Tripwire
        ATDTW OFFSET(14) NUMBITS(1) [],
        /// Interrupt Threshold Control; 0 issues interrupts immediately
        ITC OFFSET(16) NUMBITS(8) []
    ],
    pub USBSTS [
        /// USB (transfer) Interrupt
        UI OFFSET(0) NUMBITS(1) [],
        /// USB Error Interrupt
        UEI OFFSET(1) NUMBITS(1) [],
        /// Port Change Interrupt
        PCI OFFSET(2) NUMBITS(1) [],
        /// USB Reset Received
        URI OFFSET(6) NUMBITS(1) [],
        /// Start of Frame Received
        SRI OFFSET(7) NUMBITS(1) [],
        /// Device Controller Suspend
        SLI OFFSET(8) NUMBITS(1) [],
        /// NAK Interrupt
        NAKI OFFSET(16) NUMBITS(1) []
    ],
    pub DEVICEADDR [
        /// Device Address Advance: stage the address until the next IN
        /// transaction's status stage completes
        USBADRA OFFSET(24) NUMBITS(1) [],
        /// Device Address
        USBADR OFFSET(25) NUMBITS(7) []
    ],
    pub PORTSC1 [
        /// Current Connect Status
        CCS OFFSET(0) NUMBITS(1) [],
        /// Force Port Resume
        FPR OFFSET(6) NUMBITS(1) [],
        /// Suspend
        SUSP OFFSET(7) NUMBITS(1) [],
        /// Port Force Full Speed Connect
        PFSC OFFSET(24) NUMBITS(1) []
    ],
    pub OTGSC [
        /// VBUS Discharge
        VD OFFSET(0) NUMBITS(1) [],
        /// VBUS Charge
        VC OFFSET(1) NUMBITS(1) [],
        /// OTG Termination; must be set in device mode
        OT OFFSET(3) NUMBITS(1) [],
        /// Data Pulsing
        DP OFFSET(4) NUMBITS(1) [],
        /// ID Pull-up
        IDPU OFFSET(5) NUMBITS(1) [],
        /// USB ID: 0 = A device, 1 = B device
        ID OFFSET(8) NUMBITS(1) [],
        /// A VBUS Valid
        AVV OFFSET(9) NUMBITS(1) [],
        /// A Session Valid
        ASV OFFSET(10) NUMBITS(1) [],
        /// B Session Valid
        BSV OFFSET(11) NUMBITS(1) [],
        /// B Session End
        BSE OFFSET(12) NUMBITS(1) []
    ],
    pub USBMODE [
        /// Controller Mode; writable only once after reset
        CM OFFSET(0) NUMBITS(2) [
            Idle = 0,
            Device = 2,
            Host = 3
        ],
        /// Setup Lockout Mode Off
        SLOM OFFSET(3) NUMBITS(1) [],
        /// Stream Disable
        SDIS OFFSET(4) NUMBITS(1) []
    ],
    pub ENDPTCTRL [
        /// RX (OUT) Stall
        RXS OFFSET(0) NUMBITS(1) [],
        /// RX (OUT) Endpoint Type
        RXT OFFSET(2) NUMBITS(2) [
            Control = 0,
            Isochronous = 1,
            Bulk = 2,
            Interrupt = 3
        ],
        /// RX Data Toggle Inhibit (test only)
        RXI OFFSET(5) NUMBITS(1) [],
        /// RX Data Toggle Reset
        RXR OFFSET(6) NUMBITS(1) [],
        /// RX Endpoint Enable
        RXE OFFSET(7) NUMBITS(1) [],
        /// TX (IN) Stall
        TXS OFFSET(16) NUMBITS(1) [],
        /// TX (IN) Endpoint Type
        TXT OFFSET(18) NUMBITS(2) [
            Control = 0,
            Isochronous = 1,
            Bulk = 2,
            Interrupt = 3
        ],
        /// TX Data Toggle Inhibit (test only)
        TXI OFFSET(21) NUMBITS(1) [],
        /// TX Data Toggle Reset
        TXR OFFSET(22) NUMBITS(1) [],
        /// TX Endpoint Enable
        TXE OFFSET(23) NUMBITS(1) []
    ]
];

/// USB0 register base on LPC18xx/43xx.
pub const USB0_BASE: StaticRef<UsbRegisters> =
    unsafe { StaticRef::new(0x4000_6000 as *const UsbRegisters) };

/// USB1 register base on LPC18xx/43xx.
pub const USB1_BASE: StaticRef<UsbRegisters> =
    unsafe { StaticRef::new(0x4000_7000 as *const UsbRegisters) };
