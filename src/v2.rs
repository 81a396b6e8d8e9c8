//! Driver for revision 2 of the macrocell
//!
//! The reworked device-only USB block found on STM32F0x2 and STM32L0xx
//! parts: 1 Kbyte of contiguous packet memory, an internal DP pull-up, and
//! a battery-charge detector. [`UsbDriver::connect`] walks the detector's
//! ladder — data-contact detect, then primary detection, then secondary —
//! and classifies the far end before the pull-up goes up.

use crate::driver::Driver;
use crate::pma::Dense;
use crate::{ral, EpType, Event, HwCaps, PortType, UsbDriver, UsbPeripheral};
use usb_device::endpoint::EndpointAddress;

/// A revision-2 driver
pub struct Usb<P> {
    driver: Driver<P, Dense>,
}

impl<P: UsbPeripheral> Usb<P> {
    pub fn new(peripherals: P) -> Self {
        Usb {
            driver: Driver::new(peripherals),
        }
    }
}

impl<P: UsbPeripheral> UsbDriver for Usb<P> {
    const CAPS: HwCaps = HwCaps::BATTERY_CHARGING;

    fn enable(&mut self, enable: bool) {
        if enable {
            self.driver.power_on();
        } else if self.driver.is_powered() {
            // Drop the pull-up before the clock goes away
            ral::write_reg!(ral::usb, self.driver.regs(), BCDR, 0);
            self.driver.power_off();
        }
    }

    fn reset(&mut self) {
        self.driver.force_reset();
    }

    fn connect(&mut self, connect: bool) -> PortType {
        let regs = self.driver.regs();
        // Data-contact detect first; the rest of the ladder is meaningless
        // until the data lines touch
        ral::write_reg!(ral::usb, regs, BCDR, BCDEN: 1, DCDEN: 1);
        let port = if ral::read_reg!(ral::usb, regs, BCDR, DCDET == 1) {
            ral::write_reg!(ral::usb, regs, BCDR, BCDEN: 1, PDEN: 1);
            if ral::read_reg!(ral::usb, regs, BCDR, PS2DET == 1) {
                PortType::Unknown
            } else if ral::read_reg!(ral::usb, regs, BCDR, PDET == 1) {
                ral::write_reg!(ral::usb, regs, BCDR, BCDEN: 1, SDEN: 1);
                if ral::read_reg!(ral::usb, regs, BCDR, SDET == 1) {
                    PortType::DedicatedCharging
                } else {
                    PortType::ChargingDownstream
                }
            } else {
                PortType::StandardDownstream
            }
        } else {
            PortType::NoHost
        };
        // Detector off; pull-up as requested
        if connect {
            ral::write_reg!(ral::usb, regs, BCDR, DPPU: 1);
        } else {
            ral::write_reg!(ral::usb, regs, BCDR, 0);
        }
        port
    }

    fn set_address(&mut self, address: u8) {
        self.driver.set_address(address);
    }

    fn ep_config(
        &mut self,
        addr: EndpointAddress,
        kind: EpType,
        size: u16,
    ) -> usb_device::Result<()> {
        self.driver.ep_config(addr, kind, size)
    }

    fn ep_deconfig(&mut self, index: u8) {
        self.driver.ep_deconfig(index);
    }

    fn ep_read(&mut self, addr: EndpointAddress, buffer: &mut [u8]) -> usb_device::Result<usize> {
        self.driver.ep_read(addr, buffer)
    }

    fn ep_write(&mut self, addr: EndpointAddress, buffer: &[u8]) -> usb_device::Result<usize> {
        self.driver.ep_write(addr, buffer)
    }

    fn ep_stall(&mut self, addr: EndpointAddress, stall: bool) {
        self.driver.ep_stall(addr, stall);
    }

    fn ep_is_stalled(&self, addr: EndpointAddress) -> bool {
        self.driver.ep_is_stalled(addr)
    }

    fn poll(&mut self, callback: impl FnOnce(&mut Self, Event))
    where
        Self: Sized,
    {
        if let Some(event) = self.driver.poll_event() {
            callback(self, event);
        }
    }

    fn frame_number(&self) -> u16 {
        self.driver.frame_number()
    }

    fn serial_number_descriptor(&self, buffer: &mut [u8]) -> usize {
        self.driver.serial_number_descriptor(buffer)
    }
}

#[cfg(test)]
mod test {
    use super::Usb;
    use crate::sim::{Bench, FakePeripheral};
    use crate::{EpType, Event, HwCaps, PortType, UsbDriver};
    use usb_device::endpoint::EndpointAddress;
    use usb_device::UsbDirection;

    fn usb(bench: &Bench) -> Usb<FakePeripheral<'_, 1024>> {
        Usb::new(FakePeripheral(bench))
    }

    #[test]
    fn connect_classifies_then_pulls_up() {
        assert!(Usb::<FakePeripheral<'_, 1024>>::CAPS.contains(HwCaps::BATTERY_CHARGING));

        let bench = Bench::new();
        let mut usb = usb(&bench);
        // The bench's detector never reports contact
        assert_eq!(usb.connect(true), PortType::NoHost);
        assert_eq!(bench.regs.BCDR.read(), 1 << 15, "pull-up on, detector off");

        assert_eq!(usb.connect(false), PortType::NoHost);
        assert_eq!(bench.regs.BCDR.read(), 0);
    }

    #[test]
    fn disable_forces_disconnect() {
        let bench = Bench::new();
        let mut usb = usb(&bench);
        usb.enable(true);
        usb.connect(true);
        assert_ne!(bench.regs.BCDR.read(), 0);

        usb.enable(false);
        assert_eq!(bench.regs.BCDR.read(), 0);
        assert!(!bench.clock.get());

        let resets = bench.resets.get();
        usb.enable(false);
        assert_eq!(bench.resets.get(), resets, "second disable is a no-op");
    }

    #[test]
    fn packet_cells_are_contiguous() {
        let bench = Bench::new();
        let mut usb = usb(&bench);
        let ep = EndpointAddress::from_parts(1, UsbDirection::In);
        usb.ep_config(ep, EpType::Bulk, 8).unwrap();

        assert_eq!(usb.ep_write(ep, &[0x12, 0x34, 0x56]), Ok(3));
        let pma = unsafe { &*bench.pma.get() };
        assert_eq!(&pma[1016..1020], &[0x12, 0x34, 0x56, 0x00]);
    }

    #[test]
    fn poll_calls_back_at_most_once() {
        use crate::ral::usb::ISTR;

        let bench = Bench::new();
        let mut usb = usb(&bench);

        let mut seen = None;
        usb.poll(|_, event| seen = Some(event));
        assert_eq!(seen, None);

        bench.regs.ISTR.write(ISTR::SOF::mask | ISTR::ERR::mask);
        usb.poll(|_, event| seen = Some(event));
        assert_eq!(seen, Some(Event::Sof));
        bench.regs.ISTR.write(ISTR::ERR::mask);
        usb.poll(|_, event| seen = Some(event));
        assert_eq!(seen, Some(Event::Error));
    }
}
