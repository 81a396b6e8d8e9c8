//! Revision-agnostic driver core
//!
//! Everything the two macrocell revisions share lives here, generic over
//! the packet-memory [`Layout`]. The revision modules wrap this in their
//! public driver types and add what genuinely differs: connect/disconnect
//! and the charge detector.
//!
//! The driver keeps no shadow state. Endpoint status, buffer indices and
//! the allocator's high-water mark are all re-derived from the register
//! file and the descriptor table, so the hardware is the single source of
//! truth across resets.

use core::marker::PhantomData;

use crate::pma::{rx_count_field, Layout, Pma};
use crate::{epr, ral, serial, EpType, Event, UsbPeripheral, EP_COUNT};
use usb_device::endpoint::EndpointAddress;
use usb_device::{UsbDirection, UsbError};

fn index_of(addr: EndpointAddress) -> u8 {
    addr.index() as u8 & 0x07
}

pub struct Driver<P, L> {
    peripherals: P,
    _layout: PhantomData<L>,
}

impl<P: UsbPeripheral, L: Layout> Driver<P, L> {
    pub fn new(peripherals: P) -> Self {
        Driver {
            peripherals,
            _layout: PhantomData,
        }
    }

    pub fn peripherals(&self) -> &P {
        &self.peripherals
    }

    pub fn regs(&self) -> &ral::usb::RegisterBlock {
        // Safety: pointer validity is promised by the UsbPeripheral impl.
        unsafe { &*(self.peripherals.registers() as *const ral::usb::RegisterBlock) }
    }

    fn pma(&self) -> Pma<L> {
        // Safety: pointer and capacity come from the UsbPeripheral impl.
        unsafe { Pma::new(self.peripherals.packet_memory(), P::PMA_SIZE) }
    }

    /// Ungate, pulse the RCC reset, wake the transceiver, unmask events
    pub fn power_on(&self) {
        self.peripherals.enable_clock();
        self.peripherals.assert_reset();
        self.peripherals.release_reset();
        // Leave power-down first; force-reset stays held through t_STARTUP
        ral::write_reg!(ral::usb, self.regs(), CNTR, FRES: 1, PDWN: 0);
        self.peripherals.startup_delay();
        ral::write_reg!(ral::usb, self.regs(), CNTR,
            CTRM: 1, RESETM: 1, SOFM: 1, ESOFM: 1, ERRM: 1, SUSPM: 1, WKUPM: 1);
    }

    /// Hold the peripheral in RCC reset and gate its clock off
    ///
    /// The caller has already removed the host-visible pull-up.
    pub fn power_off(&self) {
        self.peripherals.assert_reset();
        self.peripherals.disable_clock();
    }

    pub fn is_powered(&self) -> bool {
        self.peripherals.clock_enabled()
    }

    /// Pulse the macrocell's own force-reset bit
    pub fn force_reset(&self) {
        ral::modify_reg!(ral::usb, self.regs(), CNTR, FRES: 1);
        ral::modify_reg!(ral::usb, self.regs(), CNTR, FRES: 0);
    }

    pub fn set_address(&self, address: u8) {
        ral::write_reg!(ral::usb, self.regs(), DADDR, EF: 1, ADD: address as u32);
        debug!("usb: address {}", address);
    }

    pub fn frame_number(&self) -> u16 {
        ral::read_reg!(ral::usb, self.regs(), FNR, FN) as u16
    }

    pub fn serial_number_descriptor(&self, buffer: &mut [u8]) -> usize {
        serial::descriptor(self.peripherals.unique_id(), buffer)
    }

    pub fn ep_config(
        &self,
        addr: EndpointAddress,
        kind: EpType,
        size: u16,
    ) -> usb_device::Result<()> {
        let index = index_of(addr);
        let ep = self.regs().ep(index);
        let pma = self.pma();
        // PMA cells are 16-bit
        let size = (size + 1) & !1;

        let type_bits = match kind {
            EpType::Control => epr::TYPE_CONTROL,
            EpType::Isochronous => epr::TYPE_ISO,
            EpType::Bulk => epr::TYPE_BULK,
            EpType::DoubleBufferedBulk => epr::TYPE_BULK | epr::KIND,
            EpType::Interrupt => epr::TYPE_INTERRUPT,
        };
        // Committed before the slots are funded; stays committed on failure
        ep.write(type_bits | index as u32);

        let double = matches!(kind, EpType::Isochronous | EpType::DoubleBufferedBulk);

        if addr.direction() == UsbDirection::In || kind == EpType::Control {
            let tx = pma
                .allocate(size)
                .ok_or(UsbError::EndpointMemoryOverflow)?;
            pma.set_slot(index, 0, tx, 0);
            if double {
                let tx1 = pma
                    .allocate(size)
                    .ok_or(UsbError::EndpointMemoryOverflow)?;
                pma.set_slot(index, 1, tx1, 0);
                epr::dtx_unstall(ep);
            } else {
                epr::tx_unstall(ep);
            }
        }

        if addr.direction() == UsbDirection::Out {
            let (field, size) = rx_count_field(size);
            let rx = pma
                .allocate(size)
                .ok_or(UsbError::EndpointMemoryOverflow)?;
            pma.set_slot(index, 1, rx, field);
            if double {
                let rx0 = pma
                    .allocate(size)
                    .ok_or(UsbError::EndpointMemoryOverflow)?;
                pma.set_slot(index, 0, rx0, field);
                epr::drx_unstall(ep);
            } else {
                epr::rx_unstall(ep);
            }
        }

        debug!("usb: ep{} configured, {} bytes", index, size);
        Ok(())
    }

    pub fn ep_deconfig(&self, index: u8) {
        let index = index & 0x07;
        let ep = self.regs().ep(index);
        // Writing the toggle and status fields back as read zeroes them,
        // while the invariant fields and flags are written as zero
        ep.write(ep.read() & !epr::EPREG_MASK);
        let pma = self.pma();
        pma.set_slot(index, 0, 0, 0);
        pma.set_slot(index, 1, 0, 0);
    }

    fn drain(&self, index: u8, slot: usize, buffer: &mut [u8]) -> usize {
        let pma = self.pma();
        let count = pma.slot_count(index, slot);
        let read = pma.read_packet(
            pma.slot_addr(index, slot),
            buffer,
            (count & 0x3FF) as usize,
        );
        // Keep the capacity bits, drop the received count
        pma.set_slot_count(index, slot, count & !0x3FF);
        read
    }

    pub fn ep_read(&self, addr: EndpointAddress, buffer: &mut [u8]) -> usb_device::Result<usize> {
        const DOUBLE_READY: u32 = epr::RX_VALID | epr::TYPE_BULK | epr::KIND;
        const ISO_READY: u32 = epr::RX_VALID | epr::TYPE_ISO;
        const BULK_PENDING: u32 = epr::RX_NAK | epr::TYPE_BULK;
        const CONTROL_PENDING: u32 = epr::RX_NAK | epr::TYPE_CONTROL;
        const INTERRUPT_PENDING: u32 = epr::RX_NAK | epr::TYPE_INTERRUPT;

        let index = index_of(addr);
        let ep = self.regs().ep(index);
        let value = ep.read();
        match value & (epr::STAT_RX | epr::T_FIELD | epr::KIND) {
            DOUBLE_READY => {
                // If the software index has caught up with the hardware's,
                // step past the buffer the hardware is (or will be)
                // filling; draining it now could hand out a torn packet.
                let rendezvous = value & (epr::DTOG_RX | epr::SWBUF_RX);
                if rendezvous == 0 || rendezvous == (epr::DTOG_RX | epr::SWBUF_RX) {
                    epr::flip_swbuf(ep, epr::SWBUF_RX);
                }
                let slot = if ep.read() & epr::SWBUF_RX != 0 { 1 } else { 0 };
                Ok(self.drain(index, slot, buffer))
            }
            ISO_READY => {
                // Hardware owns the buffer its toggle points at
                let slot = if value & epr::DTOG_RX != 0 { 0 } else { 1 };
                Ok(self.drain(index, slot, buffer))
            }
            BULK_PENDING | CONTROL_PENDING | INTERRUPT_PENDING => {
                let read = self.drain(index, 1, buffer);
                epr::rx_valid(ep);
                Ok(read)
            }
            _ => {
                warn!("usb: ep{} read while not ready", index);
                Err(UsbError::InvalidState)
            }
        }
    }

    pub fn ep_write(&self, addr: EndpointAddress, buffer: &[u8]) -> usb_device::Result<usize> {
        const DOUBLE_READY: u32 = epr::TX_VALID | epr::TYPE_BULK | epr::KIND;
        const ISO_READY: u32 = epr::TX_VALID | epr::TYPE_ISO;
        const BULK_IDLE: u32 = epr::TX_NAK | epr::TYPE_BULK;
        const CONTROL_IDLE: u32 = epr::TX_NAK | epr::TYPE_CONTROL;
        const INTERRUPT_IDLE: u32 = epr::TX_NAK | epr::TYPE_INTERRUPT;

        let index = index_of(addr);
        let ep = self.regs().ep(index);
        let pma = self.pma();
        let value = ep.read();
        match value & (epr::STAT_TX | epr::T_FIELD | epr::KIND) {
            DOUBLE_READY => {
                let slot = if value & epr::SWBUF_TX != 0 { 1 } else { 0 };
                pma.write_packet(pma.slot_addr(index, slot), buffer);
                pma.set_slot_count(index, slot, buffer.len() as u16);
                // Hand the buffer over; the hardware drains on its own
                // schedule, status stays VALID
                epr::flip_swbuf(ep, epr::SWBUF_TX);
                Ok(buffer.len())
            }
            ISO_READY => {
                let slot = if value & epr::DTOG_TX != 0 { 0 } else { 1 };
                pma.write_packet(pma.slot_addr(index, slot), buffer);
                pma.set_slot_count(index, slot, buffer.len() as u16);
                Ok(buffer.len())
            }
            BULK_IDLE | CONTROL_IDLE | INTERRUPT_IDLE => {
                pma.write_packet(pma.slot_addr(index, 0), buffer);
                pma.set_slot_count(index, 0, buffer.len() as u16);
                epr::tx_valid(ep);
                Ok(buffer.len())
            }
            _ => {
                warn!("usb: ep{} write while busy", index);
                Err(UsbError::InvalidState)
            }
        }
    }

    pub fn ep_stall(&self, addr: EndpointAddress, stall: bool) {
        let ep = self.regs().ep(index_of(addr));
        let value = ep.read();
        // Isochronous endpoints have no handshake to stall
        if value & epr::T_FIELD == epr::TYPE_ISO {
            return;
        }
        let double = value & (epr::T_FIELD | epr::KIND) == (epr::TYPE_BULK | epr::KIND);
        if addr.direction() == UsbDirection::In {
            if value & epr::STAT_TX == epr::TX_DIS {
                return;
            }
            if stall {
                epr::tx_stall(ep);
            } else if double {
                epr::dtx_unstall(ep);
            } else {
                epr::tx_unstall(ep);
            }
        } else {
            if value & epr::STAT_RX == epr::RX_DIS {
                return;
            }
            if stall {
                epr::rx_stall(ep);
            } else if double {
                epr::drx_unstall(ep);
            } else {
                epr::rx_unstall(ep);
            }
        }
    }

    pub fn ep_is_stalled(&self, addr: EndpointAddress) -> bool {
        let value = self.regs().ep(index_of(addr)).read();
        if addr.direction() == UsbDirection::In {
            value & epr::STAT_TX == epr::TX_STALL
        } else {
            value & epr::STAT_RX == epr::RX_STALL
        }
    }

    /// Decode at most one pending cause and clear its flags
    pub fn poll_event(&self) -> Option<Event> {
        use crate::ral::usb::ISTR;

        let istr = ral::read_reg!(ral::usb, self.regs(), ISTR);
        let index = (istr & ISTR::EP_ID::mask) as u8;

        if istr & ISTR::CTR::mask != 0 {
            // The global CTR flag follows the per-endpoint flag; clearing
            // the latter is the acknowledgement
            let ep = self.regs().ep(index);
            let value = ep.read();
            if value & epr::CTR_TX != 0 {
                ep.write(value & (epr::EPREG_MASK ^ epr::CTR_TX));
                let addr = EndpointAddress::from_parts(index as usize, UsbDirection::In);
                Some(Event::TxComplete(addr))
            } else {
                ep.write(value & (epr::EPREG_MASK ^ epr::CTR_RX));
                let addr = EndpointAddress::from_parts(index as usize, UsbDirection::Out);
                Some(if ep.read() & epr::SETUP != 0 {
                    Event::SetupReceived(addr)
                } else {
                    Event::RxComplete(addr)
                })
            }
        } else if istr & ISTR::RESET::mask != 0 {
            ral::modify_reg!(ral::usb, self.regs(), ISTR, |istr| istr
                & !ISTR::RESET::mask);
            // Hardware dropped every endpoint; make the table agree before
            // the callback rebuilds endpoint 0
            ral::write_reg!(ral::usb, self.regs(), BTABLE, BTABLE: 0);
            for index in 0..EP_COUNT {
                self.ep_deconfig(index);
            }
            debug!("usb: bus reset");
            Some(Event::Reset)
        } else if istr & ISTR::SOF::mask != 0 {
            ral::modify_reg!(ral::usb, self.regs(), ISTR, |istr| istr & !ISTR::SOF::mask);
            Some(Event::Sof)
        } else if istr & ISTR::WKUP::mask != 0 {
            ral::modify_reg!(ral::usb, self.regs(), CNTR, FSUSP: 0);
            ral::modify_reg!(ral::usb, self.regs(), ISTR, |istr| istr & !ISTR::WKUP::mask);
            Some(Event::Wakeup)
        } else if istr & ISTR::SUSP::mask != 0 {
            ral::modify_reg!(ral::usb, self.regs(), CNTR, FSUSP: 1);
            ral::modify_reg!(ral::usb, self.regs(), ISTR, |istr| istr & !ISTR::SUSP::mask);
            Some(Event::Suspend)
        } else if istr & ISTR::ESOF::mask != 0 {
            ral::modify_reg!(ral::usb, self.regs(), ISTR, |istr| istr & !ISTR::ESOF::mask);
            Some(Event::SofMissed)
        } else if istr & ISTR::ERR::mask != 0 {
            ral::modify_reg!(ral::usb, self.regs(), ISTR, |istr| istr & !ISTR::ERR::mask);
            Some(Event::Error)
        } else {
            None
        }
    }
}
