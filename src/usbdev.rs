// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Device-mode driver for one Transdimension controller port.
//!
//! One [`UsbDevice`] is constructed per physical port, owning the port's
//! register block and endpoint table; there is no process-wide state. The
//! platform must serialize calls into the driver against the controller's
//! interrupt (mask the line around mainline submissions); the driver does
//! not lock.

use log::{debug, warn};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::LocalRegisterCopy;

use crate::descriptors::{
    EndpointTable, CONTROL_IN_SLOT, CONTROL_OUT_SLOT, MAX_TRANSFER_BYTES, QH_COUNT,
    TD_NEXT_TERMINATE,
};
use crate::hil::{
    Client, DeviceController, EndpointAddress, EndpointConfig, ErrorCode, TransferDirection,
    TransferType,
};
use crate::registers::{
    UsbRegisters, DEVICEADDR, ENDPTCTRL, OTGSC, PORTSC1, USBCMD, USBMODE, USBSTS,
};
use crate::utilities::{OptionalCell, StaticRef, VolatileCell};

/// Max packet size of the control endpoint (full speed).
pub const CONTROL_MAX_PACKET_SIZE: u16 = 64;

/// Bound on the setup-lockout wait in `submit_transfer`. The hardware
/// clears `ENDPTSETUPSTAT` as soon as the latched packet is drained, so
/// hitting this bound means the controller is wedged.
const SETUP_LOCKOUT_SPINS: u32 = 5_000_000;

/// Which port of the chip this instance drives. The two instantiations
/// differ only in how many non-control endpoint numbers they implement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortVariant {
    Usb0,
    Usb1,
}

impl PortVariant {
    /// Highest usable non-control endpoint number.
    fn nonzero_endpoints(self) -> u8 {
        match self {
            PortVariant::Usb0 => 5,
            PortVariant::Usb1 => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            PortVariant::Usb0 => "usb0",
            PortVariant::Usb1 => "usb1",
        }
    }
}

pub struct UsbDevice<'a> {
    registers: StaticRef<UsbRegisters>,
    table: &'a EndpointTable,
    variant: PortVariant,
    client: OptionalCell<&'a dyn Client>,
}

impl<'a> UsbDevice<'a> {
    pub const fn new(
        registers: StaticRef<UsbRegisters>,
        table: &'a EndpointTable,
        variant: PortVariant,
    ) -> UsbDevice<'a> {
        UsbDevice {
            registers,
            table,
            variant,
            client: OptionalCell::empty(),
        }
    }

    /// Re-initialize endpoint state after a bus reset, leaving the control
    /// endpoint's queue heads ready for the next setup packet.
    fn handle_bus_reset(&self) {
        // Every endpoint type field resets to "control". An enabled
        // direction whose unconfigured partner is left at control type
        // corrupts the enabled direction's data-PID tracking, so park all
        // non-control endpoints at bulk until they are opened.
        for number in 1..=self.variant.nonzero_endpoints() as usize {
            self.registers.endptctrl[number]
                .write(ENDPTCTRL::RXT::Bulk + ENDPTCTRL::TXT::Bulk);
        }

        self.registers.endptnak.set(self.registers.endptnak.get());
        self.registers.endptnaken.set(0);
        self.registers.usbsts.set(self.registers.usbsts.get());
        self.registers
            .endptsetupstat
            .set(self.registers.endptsetupstat.get());
        self.registers
            .endptcomplete
            .set(self.registers.endptcomplete.get());

        // No slot may be mid-flight while the table is wiped: wait out any
        // priming still in progress, then flush every endpoint. Hardware
        // bounds both waits.
        while self.registers.endptprime.get() != 0 {}
        self.registers.endptflush.set(0xffff_ffff);
        while self.registers.endptflush.get() != 0 {}

        self.table.clear();

        for slot in [CONTROL_OUT_SLOT, CONTROL_IN_SLOT] {
            let qh = self.table.queue_head(slot);
            qh.configure(CONTROL_MAX_PACKET_SIZE, true);
            qh.set_overlay_next(TD_NEXT_TERMINATE);
        }
        self.table
            .queue_head(CONTROL_OUT_SLOT)
            .set_interrupt_on_setup();
    }

    /// Setup lockout: a control response must not be primed while a setup
    /// packet is still latched.
    fn wait_setup_lockout(&self) -> Result<(), ErrorCode> {
        for _ in 0..SETUP_LOCKOUT_SPINS {
            if self.registers.endptsetupstat.get() & 0b1 == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        warn!("{}: setup packet latched past wait bound", self.variant.name());
        Err(ErrorCode::Timeout)
    }

    fn handle_transfer_interrupt(&self) {
        let complete = self.registers.endptcomplete.get();
        self.registers.endptcomplete.set(complete);

        if self.registers.endptsetupstat.get() != 0 {
            self.registers
                .endptsetupstat
                .set(self.registers.endptsetupstat.get());

            let setup = self.table.queue_head(CONTROL_OUT_SLOT).setup_packet();
            self.client.map(|client| client.setup_received(&setup));
        }

        if complete == 0 {
            return;
        }
        for slot in 0..QH_COUNT {
            let endpoint = EndpointAddress::from_slot_index(slot);
            if complete & (1 << endpoint.status_bit()) == 0 {
                continue;
            }

            // Stalled and errored descriptors set their completion bit
            // too; the token tells the outcomes apart.
            let (transferred, result) = self.table.descriptor(slot).observe_completion();
            self.client
                .map(|client| client.transfer_complete(endpoint, transferred, result));
        }
    }
}

impl<'a> DeviceController<'a> for UsbDevice<'a> {
    fn set_client(&self, client: &'a dyn Client) {
        self.client.set(client);
    }

    fn initialize(&self) {
        self.table.clear();

        // Controller reset; hardware clears the bit when it is done.
        self.registers.usbcmd.modify(USBCMD::RST::SET);
        while self.registers.usbcmd.is_set(USBCMD::RST) {}

        // Device mode must be selected right after reset, and OTG
        // termination enabled for it.
        self.registers.usbmode.write(USBMODE::CM::Device);
        self.registers.otgsc.write(OTGSC::VD::SET + OTGSC::OT::SET);

        self.registers.endptlistaddr.set(self.table.base_address());

        // Ack anything stale before unmasking.
        self.registers.usbsts.set(self.registers.usbsts.get());
        self.enable_interrupts();

        // Zero interrupt threshold (no coalescing delay), then run.
        self.registers.usbcmd.modify(USBCMD::ITC.val(0));
        self.registers.usbcmd.modify(USBCMD::RS::SET);

        debug!("{}: device mode, endpoint table published", self.variant.name());
    }

    fn enable_interrupts(&self) {
        self.registers.usbintr.write(
            USBSTS::UI::SET
                + USBSTS::UEI::SET
                + USBSTS::PCI::SET
                + USBSTS::URI::SET
                + USBSTS::SRI::SET
                + USBSTS::SLI::SET,
        );
    }

    fn disable_interrupts(&self) {
        self.registers.usbintr.set(0);
    }

    fn set_address(&self, addr: u8) -> Result<(), ErrorCode> {
        // The status stage still runs under the old address; the advance
        // bit defers the switch until that IN transaction completes.
        self.submit_transfer(EndpointAddress::new(0, TransferDirection::In), None, 0)?;

        self.registers
            .deviceaddr
            .write(DEVICEADDR::USBADR.val(addr as u32) + DEVICEADDR::USBADRA::SET);
        Ok(())
    }

    fn set_configuration(&self, _value: u8) {}

    fn remote_wakeup(&self) {}

    fn open_endpoint(&self, config: &EndpointConfig) -> Result<(), ErrorCode> {
        if config.transfer_type == TransferType::Isochronous {
            return Err(ErrorCode::Unsupported);
        }

        let number = config.address.number();
        if number > self.variant.nonzero_endpoints() {
            return Err(ErrorCode::ResourceExceeded);
        }

        let qh = self.table.queue_head(config.address.slot_index());
        qh.clear();
        qh.configure(config.max_packet_size, true);
        qh.set_overlay_next(TD_NEXT_TERMINATE);

        let ctrl = &self.registers.endptctrl[number as usize];
        match config.address.direction() {
            TransferDirection::Out => ctrl.modify(
                ENDPTCTRL::RXT.val(config.transfer_type as u32)
                    + ENDPTCTRL::RXR::SET
                    + ENDPTCTRL::RXE::SET,
            ),
            TransferDirection::In => ctrl.modify(
                ENDPTCTRL::TXT.val(config.transfer_type as u32)
                    + ENDPTCTRL::TXR::SET
                    + ENDPTCTRL::TXE::SET,
            ),
        }

        debug!(
            "{}: opened endpoint {} {:?}, {:?}, max packet {}",
            self.variant.name(),
            number,
            config.address.direction(),
            config.transfer_type,
            config.max_packet_size
        );
        Ok(())
    }

    fn stall(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        if endpoint.number() > self.variant.nonzero_endpoints() {
            return Err(ErrorCode::ResourceExceeded);
        }

        let ctrl = &self.registers.endptctrl[endpoint.number() as usize];
        match endpoint.direction() {
            TransferDirection::Out => ctrl.modify(ENDPTCTRL::RXS::SET),
            TransferDirection::In => ctrl.modify(ENDPTCTRL::TXS::SET),
        }
        Ok(())
    }

    fn clear_stall(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        if endpoint.number() > self.variant.nonzero_endpoints() {
            return Err(ErrorCode::ResourceExceeded);
        }

        // The data toggle must resynchronize whenever a stall clears.
        let ctrl = &self.registers.endptctrl[endpoint.number() as usize];
        match endpoint.direction() {
            TransferDirection::Out => {
                ctrl.modify(ENDPTCTRL::RXR::SET);
                ctrl.modify(ENDPTCTRL::RXS::CLEAR);
            }
            TransferDirection::In => {
                ctrl.modify(ENDPTCTRL::TXR::SET);
                ctrl.modify(ENDPTCTRL::TXS::CLEAR);
            }
        }
        Ok(())
    }

    fn submit_transfer(
        &self,
        endpoint: EndpointAddress,
        buffer: Option<&'a [VolatileCell<u8>]>,
        len: u16,
    ) -> Result<(), ErrorCode> {
        if endpoint.number() > self.variant.nonzero_endpoints() {
            return Err(ErrorCode::ResourceExceeded);
        }
        if len > MAX_TRANSFER_BYTES {
            return Err(ErrorCode::ResourceExceeded);
        }
        let buffer_addr = match buffer {
            Some(buffer) => {
                if len as usize > buffer.len() {
                    return Err(ErrorCode::ResourceExceeded);
                }
                Some(buffer.as_ptr() as usize as u32)
            }
            None => {
                if len != 0 {
                    return Err(ErrorCode::ResourceExceeded);
                }
                None
            }
        };

        if endpoint.number() == 0 {
            self.wait_setup_lockout()?;
        }

        let slot = endpoint.slot_index();
        let td = self.table.descriptor(slot);
        td.reinitialize(buffer_addr, len);
        td.set_interrupt_on_complete();
        self.table.queue_head(slot).set_overlay_next(td.address());

        // Sole handoff point: the slot belongs to the controller from here
        // until its completion bit is observed.
        self.registers.endptprime.set(1 << endpoint.status_bit());
        Ok(())
    }

    fn service_interrupt(&self) -> Result<(), ErrorCode> {
        let pending = self.registers.usbsts.get() & self.registers.usbintr.get();
        // Ack in the same pass as the read, so a re-entry cannot see (and
        // double-process) the same bits.
        self.registers.usbsts.set(pending);

        if pending == 0 {
            // Spurious or shared-line invocation.
            return Ok(());
        }
        let pending: LocalRegisterCopy<u32, USBSTS::Register> = LocalRegisterCopy::new(pending);

        if pending.is_set(USBSTS::URI) {
            self.handle_bus_reset();
            debug!("{}: bus reset", self.variant.name());
            self.client.map(|client| client.bus_reset());
        }

        if pending.is_set(USBSTS::SLI) {
            // Hosts may idle the bus around enumeration; suspends before
            // an address is assigned are noise.
            if self.registers.portsc1.is_set(PORTSC1::SUSP)
                && self.registers.deviceaddr.read(DEVICEADDR::USBADR) != 0
            {
                self.client.map(|client| client.suspended());
            }
        }

        if pending.is_set(USBSTS::UI) {
            self.handle_transfer_interrupt();
        }

        if pending.is_set(USBSTS::SRI) {
            self.client.map(|client| client.start_of_frame());
        }

        // NAKI needs no service; no NAK rate-limiting policy exists yet.

        if pending.is_set(USBSTS::UEI) {
            warn!("{}: unattributable error interrupt", self.variant.name());
            return Err(ErrorCode::ControllerFault);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    use super::*;
    use crate::hil::TransferResult;

    fn fake_registers() -> StaticRef<UsbRegisters> {
        let words: Box<[u32]> = std::vec![0u32; 0x1e0 / 4].into_boxed_slice();
        let ptr = Box::leak(words).as_ptr() as *const UsbRegisters;
        unsafe { StaticRef::new(ptr) }
    }

    fn fake_table() -> &'static EndpointTable {
        Box::leak(Box::new(EndpointTable::new()))
    }

    fn fake_buffer(len: usize) -> &'static [VolatileCell<u8>] {
        Box::leak(
            (0..len)
                .map(|_| VolatileCell::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        )
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        BusReset,
        Suspended,
        StartOfFrame,
        Setup([u8; 8]),
        TransferComplete(EndpointAddress, u16, TransferResult),
    }

    struct EventLog {
        events: RefCell<Vec<Event>>,
    }

    impl EventLog {
        fn new() -> &'static EventLog {
            Box::leak(Box::new(EventLog {
                events: RefCell::new(Vec::new()),
            }))
        }

        fn take(&self) -> Vec<Event> {
            self.events.borrow_mut().split_off(0)
        }
    }

    impl Client for EventLog {
        fn bus_reset(&self) {
            self.events.borrow_mut().push(Event::BusReset);
        }
        fn suspended(&self) {
            self.events.borrow_mut().push(Event::Suspended);
        }
        fn start_of_frame(&self) {
            self.events.borrow_mut().push(Event::StartOfFrame);
        }
        fn setup_received(&self, setup: &[u8; 8]) {
            self.events.borrow_mut().push(Event::Setup(*setup));
        }
        fn transfer_complete(
            &self,
            endpoint: EndpointAddress,
            transferred: u16,
            result: TransferResult,
        ) {
            self.events
                .borrow_mut()
                .push(Event::TransferComplete(endpoint, transferred, result));
        }
    }

    struct RegsPtr(*const UsbRegisters);
    unsafe impl Send for RegsPtr {}

    /// Plays the controller's part in the hardware-bounded waits: clears
    /// the reset command bit and drains the flush register.
    fn with_controller_model<R>(regs: StaticRef<UsbRegisters>, test: impl FnOnce() -> R) -> R {
        let stop = Arc::new(AtomicBool::new(false));
        let model_stop = stop.clone();
        let ptr = RegsPtr(&*regs as *const UsbRegisters);
        let model = thread::spawn(move || {
            // Move the Send wrapper itself, not its raw-pointer field.
            let ptr = ptr;
            let RegsPtr(ptr) = ptr;
            let regs = unsafe { &*ptr };
            while !model_stop.load(Ordering::Relaxed) {
                if regs.usbcmd.is_set(USBCMD::RST) {
                    regs.usbcmd.modify(USBCMD::RST::CLEAR);
                }
                if regs.endptflush.get() != 0 {
                    regs.endptflush.set(0);
                }
                thread::yield_now();
            }
        });

        let result = test();
        stop.store(true, Ordering::Relaxed);
        model.join().unwrap();
        result
    }

    fn out_ep(number: u8) -> EndpointAddress {
        EndpointAddress::new(number, TransferDirection::Out)
    }

    fn in_ep(number: u8) -> EndpointAddress {
        EndpointAddress::new(number, TransferDirection::In)
    }

    fn bulk_config(address: EndpointAddress, max_packet_size: u16) -> EndpointConfig {
        EndpointConfig {
            address,
            transfer_type: TransferType::Bulk,
            max_packet_size,
        }
    }

    #[test]
    fn initialize_configures_device_mode() {
        let regs = fake_registers();
        let table = fake_table();
        let dev = UsbDevice::new(regs, table, PortVariant::Usb0);

        with_controller_model(regs, || dev.initialize());

        assert!(!regs.usbcmd.is_set(USBCMD::RST));
        assert_eq!(regs.usbmode.read(USBMODE::CM), 2);
        assert!(regs.otgsc.is_set(OTGSC::OT));
        assert!(regs.otgsc.is_set(OTGSC::VD));
        assert_eq!(regs.endptlistaddr.get(), table.base_address());
        for field in [USBSTS::UI, USBSTS::UEI, USBSTS::PCI, USBSTS::URI, USBSTS::SRI, USBSTS::SLI]
        {
            assert!(regs.usbintr.is_set(field));
        }
        assert_eq!(regs.usbcmd.read(USBCMD::ITC), 0);
        assert!(regs.usbcmd.is_set(USBCMD::RS));
    }

    #[test]
    fn bus_reset_reinitializes_control_endpoints() {
        let regs = fake_registers();
        let table = fake_table();
        let dev = UsbDevice::new(regs, table, PortVariant::Usb0);
        let log = EventLog::new();
        dev.set_client(log);

        // Leave residue in a non-control slot to check the wipe.
        table.queue_head(4).configure(512, true);

        dev.enable_interrupts();
        regs.usbsts.write(USBSTS::URI::SET);
        with_controller_model(regs, || dev.service_interrupt()).unwrap();

        assert_eq!(log.take(), std::vec![Event::BusReset]);

        for slot in [0, 1] {
            let qh = table.queue_head(slot);
            assert_eq!(qh.max_packet_size(), CONTROL_MAX_PACKET_SIZE as u32);
            assert!(qh.zero_length_termination());
            assert_eq!(qh.overlay_next(), TD_NEXT_TERMINATE);
        }
        assert!(table.queue_head(0).interrupt_on_setup());
        assert!(!table.queue_head(1).interrupt_on_setup());
        for slot in 2..QH_COUNT {
            assert!(table.queue_head(slot).is_cleared());
        }

        // Unopened endpoints parked at bulk, both directions.
        for number in 1..=5 {
            assert_eq!(regs.endptctrl[number].read(ENDPTCTRL::RXT), 2);
            assert_eq!(regs.endptctrl[number].read(ENDPTCTRL::TXT), 2);
        }
    }

    #[test]
    fn bus_reset_respects_variant_endpoint_count() {
        let regs = fake_registers();
        let dev = UsbDevice::new(regs, fake_table(), PortVariant::Usb1);

        dev.enable_interrupts();
        regs.usbsts.write(USBSTS::URI::SET);
        with_controller_model(regs, || dev.service_interrupt()).unwrap();

        for number in 1..=3 {
            assert_eq!(regs.endptctrl[number].read(ENDPTCTRL::RXT), 2);
        }
        assert_eq!(regs.endptctrl[4].get(), 0);
        assert_eq!(regs.endptctrl[5].get(), 0);
    }

    #[test]
    fn open_endpoint_rejects_isochronous() {
        let dev = UsbDevice::new(fake_registers(), fake_table(), PortVariant::Usb0);

        let config = EndpointConfig {
            address: out_ep(2),
            transfer_type: TransferType::Isochronous,
            max_packet_size: 64,
        };
        assert_eq!(dev.open_endpoint(&config), Err(ErrorCode::Unsupported));
    }

    #[test]
    fn open_endpoint_enforces_variant_limits() {
        let dev0 = UsbDevice::new(fake_registers(), fake_table(), PortVariant::Usb0);
        assert!(dev0.open_endpoint(&bulk_config(out_ep(5), 64)).is_ok());
        assert_eq!(
            dev0.open_endpoint(&bulk_config(out_ep(6), 64)),
            Err(ErrorCode::ResourceExceeded)
        );

        let dev1 = UsbDevice::new(fake_registers(), fake_table(), PortVariant::Usb1);
        assert!(dev1.open_endpoint(&bulk_config(out_ep(3), 64)).is_ok());
        assert_eq!(
            dev1.open_endpoint(&bulk_config(out_ep(4), 64)),
            Err(ErrorCode::ResourceExceeded)
        );
    }

    #[test]
    fn open_endpoint_programs_control_register_and_queue_head() {
        let regs = fake_registers();
        let table = fake_table();
        let dev = UsbDevice::new(regs, table, PortVariant::Usb0);

        dev.open_endpoint(&bulk_config(out_ep(2), 64)).unwrap();

        let ctrl = &regs.endptctrl[2];
        assert!(ctrl.is_set(ENDPTCTRL::RXE));
        assert!(ctrl.is_set(ENDPTCTRL::RXR));
        assert_eq!(ctrl.read(ENDPTCTRL::RXT), 2);
        assert!(!ctrl.is_set(ENDPTCTRL::TXE));

        let qh = table.queue_head(out_ep(2).slot_index());
        assert_eq!(qh.max_packet_size(), 64);
        assert!(qh.zero_length_termination());
        assert_eq!(qh.overlay_next(), TD_NEXT_TERMINATE);
    }

    #[test]
    fn stall_and_clear_stall_manage_toggle() {
        let regs = fake_registers();
        let dev = UsbDevice::new(regs, fake_table(), PortVariant::Usb0);

        dev.stall(in_ep(2)).unwrap();
        assert!(regs.endptctrl[2].is_set(ENDPTCTRL::TXS));

        dev.clear_stall(in_ep(2)).unwrap();
        assert!(!regs.endptctrl[2].is_set(ENDPTCTRL::TXS));
        // Toggle reset must be pulsed along with the clear.
        assert!(regs.endptctrl[2].is_set(ENDPTCTRL::TXR));
    }

    #[test]
    fn submit_transfer_builds_and_primes() {
        let regs = fake_registers();
        let table = fake_table();
        let dev = UsbDevice::new(regs, table, PortVariant::Usb0);
        dev.open_endpoint(&bulk_config(out_ep(2), 64)).unwrap();

        let buffer = fake_buffer(130);
        dev.submit_transfer(out_ep(2), Some(buffer), 130).unwrap();

        assert_eq!(regs.endptprime.get(), 1 << 2);
        let slot = out_ep(2).slot_index();
        let td = table.descriptor(slot);
        assert!(td.is_active());
        assert_eq!(td.buffer_pointer(0), buffer.as_ptr() as usize as u32);
        assert_eq!(table.queue_head(slot).overlay_next(), td.address());
    }

    #[test]
    fn out_of_range_endpoints_are_rejected_not_indexed() {
        let dev0 = UsbDevice::new(fake_registers(), fake_table(), PortVariant::Usb0);
        assert_eq!(
            dev0.submit_transfer(out_ep(6), None, 0),
            Err(ErrorCode::ResourceExceeded)
        );
        assert_eq!(dev0.stall(out_ep(8)), Err(ErrorCode::ResourceExceeded));
        assert_eq!(
            dev0.clear_stall(in_ep(16)),
            Err(ErrorCode::ResourceExceeded)
        );

        let dev1 = UsbDevice::new(fake_registers(), fake_table(), PortVariant::Usb1);
        assert_eq!(
            dev1.submit_transfer(in_ep(4), None, 0),
            Err(ErrorCode::ResourceExceeded)
        );
        assert!(dev1.stall(in_ep(3)).is_ok());
    }

    #[test]
    fn submit_transfer_rejects_oversized_requests() {
        let dev = UsbDevice::new(fake_registers(), fake_table(), PortVariant::Usb0);

        let buffer = fake_buffer(16);
        assert_eq!(
            dev.submit_transfer(out_ep(2), Some(buffer), 17),
            Err(ErrorCode::ResourceExceeded)
        );
        assert_eq!(
            dev.submit_transfer(out_ep(2), None, 1),
            Err(ErrorCode::ResourceExceeded)
        );
        assert_eq!(
            dev.submit_transfer(out_ep(2), Some(fake_buffer(0x8000)), 0x8000),
            Err(ErrorCode::ResourceExceeded)
        );
    }

    #[test]
    fn completed_transfer_emits_single_success_event() {
        let regs = fake_registers();
        let table = fake_table();
        let dev = UsbDevice::new(regs, table, PortVariant::Usb0);
        let log = EventLog::new();
        dev.set_client(log);
        dev.enable_interrupts();

        dev.open_endpoint(&bulk_config(out_ep(2), 64)).unwrap();
        dev.submit_transfer(out_ep(2), Some(fake_buffer(130)), 130)
            .unwrap();

        // Controller's side: take the descriptor, move all 130 bytes,
        // retire it, raise the transfer interrupt.
        regs.endptprime.set(0);
        table
            .descriptor(out_ep(2).slot_index())
            .hardware_complete(0, false, false, false);
        regs.endptcomplete.set(1 << 2);
        regs.usbsts.write(USBSTS::UI::SET);

        dev.service_interrupt().unwrap();

        assert_eq!(
            log.take(),
            std::vec![Event::TransferComplete(
                out_ep(2),
                130,
                TransferResult::Success
            )]
        );
    }

    #[test]
    fn stalled_and_failed_completions_are_classified() {
        let regs = fake_registers();
        let table = fake_table();
        let dev = UsbDevice::new(regs, table, PortVariant::Usb0);
        let log = EventLog::new();
        dev.set_client(log);
        dev.enable_interrupts();

        dev.open_endpoint(&bulk_config(out_ep(1), 64)).unwrap();
        dev.open_endpoint(&bulk_config(in_ep(2), 64)).unwrap();
        dev.submit_transfer(out_ep(1), Some(fake_buffer(64)), 64)
            .unwrap();
        dev.submit_transfer(in_ep(2), Some(fake_buffer(64)), 64)
            .unwrap();

        regs.endptprime.set(0);
        table
            .descriptor(out_ep(1).slot_index())
            .hardware_complete(64, true, false, false);
        table
            .descriptor(in_ep(2).slot_index())
            .hardware_complete(40, false, true, false);
        regs.endptcomplete
            .set(1 << out_ep(1).status_bit() | 1 << in_ep(2).status_bit());
        regs.usbsts.write(USBSTS::UI::SET);

        dev.service_interrupt().unwrap();

        assert_eq!(
            log.take(),
            std::vec![
                Event::TransferComplete(out_ep(1), 0, TransferResult::Stalled),
                Event::TransferComplete(in_ep(2), 24, TransferResult::Failed),
            ]
        );
    }

    #[test]
    fn setup_packet_is_delivered_before_completions() {
        let regs = fake_registers();
        let table = fake_table();
        let dev = UsbDevice::new(regs, table, PortVariant::Usb0);
        let log = EventLog::new();
        dev.set_client(log);
        dev.enable_interrupts();

        let packet = [0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00];
        table.queue_head(0).latch_setup_packet(&packet);
        regs.endptsetupstat.set(1);

        dev.open_endpoint(&bulk_config(in_ep(1), 64)).unwrap();
        dev.submit_transfer(in_ep(1), Some(fake_buffer(8)), 8)
            .unwrap();
        regs.endptprime.set(0);
        table
            .descriptor(in_ep(1).slot_index())
            .hardware_complete(0, false, false, false);
        regs.endptcomplete.set(1 << in_ep(1).status_bit());
        regs.usbsts.write(USBSTS::UI::SET);

        dev.service_interrupt().unwrap();

        assert_eq!(
            log.take(),
            std::vec![
                Event::Setup(packet),
                Event::TransferComplete(in_ep(1), 8, TransferResult::Success),
            ]
        );
    }

    #[test]
    fn submission_waits_for_latched_setup_packet() {
        let regs = fake_registers();
        let dev = UsbDevice::new(regs, fake_table(), PortVariant::Usb0);

        regs.endptsetupstat.set(1);

        // Model the hardware draining the setup packet a little later,
        // recording whether anything was primed before it did.
        let prime_before_clear = Arc::new(AtomicU32::new(u32::MAX));
        let seen = prime_before_clear.clone();
        let ptr = RegsPtr(&*regs as *const UsbRegisters);
        let model = thread::spawn(move || {
            let ptr = ptr;
            let RegsPtr(ptr) = ptr;
            let regs = unsafe { &*ptr };
            thread::sleep(Duration::from_millis(2));
            seen.store(regs.endptprime.get(), Ordering::SeqCst);
            regs.endptsetupstat.set(0);
        });

        dev.submit_transfer(in_ep(0), None, 0).unwrap();
        model.join().unwrap();

        // Nothing primed while the packet was latched; primed afterward.
        assert_eq!(prime_before_clear.load(Ordering::SeqCst), 0);
        assert_eq!(regs.endptprime.get(), 1 << 16);
    }

    #[test]
    fn submission_times_out_if_setup_never_drains() {
        let regs = fake_registers();
        let dev = UsbDevice::new(regs, fake_table(), PortVariant::Usb0);

        regs.endptsetupstat.set(1);

        assert_eq!(
            dev.submit_transfer(in_ep(0), None, 0),
            Err(ErrorCode::Timeout)
        );
        assert_eq!(regs.endptprime.get(), 0);
    }

    #[test]
    fn set_address_sends_status_stage_first() {
        let regs = fake_registers();
        let dev = UsbDevice::new(regs, fake_table(), PortVariant::Usb0);

        dev.set_address(5).unwrap();

        assert_eq!(regs.endptprime.get(), 1 << 16);
        assert_eq!(regs.deviceaddr.read(DEVICEADDR::USBADR), 5);
        assert!(regs.deviceaddr.is_set(DEVICEADDR::USBADRA));
    }

    #[test]
    fn suspend_is_ignored_before_address_assignment() {
        let regs = fake_registers();
        let dev = UsbDevice::new(regs, fake_table(), PortVariant::Usb0);
        let log = EventLog::new();
        dev.set_client(log);
        dev.enable_interrupts();

        regs.portsc1.write(PORTSC1::SUSP::SET);
        regs.usbsts.write(USBSTS::SLI::SET);
        dev.service_interrupt().unwrap();
        assert_eq!(log.take(), Vec::new());

        regs.deviceaddr.write(DEVICEADDR::USBADR.val(9));
        regs.usbsts.write(USBSTS::SLI::SET);
        dev.service_interrupt().unwrap();
        assert_eq!(log.take(), std::vec![Event::Suspended]);
    }

    #[test]
    fn start_of_frame_signals_client() {
        let regs = fake_registers();
        let dev = UsbDevice::new(regs, fake_table(), PortVariant::Usb0);
        let log = EventLog::new();
        dev.set_client(log);
        dev.enable_interrupts();

        regs.usbsts.write(USBSTS::SRI::SET);
        dev.service_interrupt().unwrap();

        assert_eq!(log.take(), std::vec![Event::StartOfFrame]);
    }

    #[test]
    fn spurious_invocations_are_no_ops() {
        let regs = fake_registers();
        let dev = UsbDevice::new(regs, fake_table(), PortVariant::Usb0);
        let log = EventLog::new();
        dev.set_client(log);

        // Nothing pending at all.
        dev.enable_interrupts();
        dev.service_interrupt().unwrap();

        // Status set but the source is masked.
        dev.disable_interrupts();
        regs.usbsts.write(USBSTS::SRI::SET);
        dev.service_interrupt().unwrap();

        assert_eq!(log.take(), Vec::new());
    }

    #[test]
    fn error_interrupt_reports_controller_fault() {
        let regs = fake_registers();
        let dev = UsbDevice::new(regs, fake_table(), PortVariant::Usb0);
        let log = EventLog::new();
        dev.set_client(log);
        dev.enable_interrupts();

        // Pending work is still translated before the fault is reported.
        regs.usbsts.write(USBSTS::UEI::SET + USBSTS::SRI::SET);
        assert_eq!(dev.service_interrupt(), Err(ErrorCode::ControllerFault));
        assert_eq!(log.take(), std::vec![Event::StartOfFrame]);
    }
}
