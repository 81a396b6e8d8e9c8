//! Driver for revision 1 of the macrocell
//!
//! The original device-only USB block, as found on STM32F103 and
//! STM32L1xx parts: 512 bytes of packet memory exposed to the CPU as one
//! 16-bit half-word per 32-bit row, no charge detector, and no internal
//! DP pull-up — the integration supplies one through [`DpPullUp`] (the
//! SYSCFG PMC bit on parts that route it there, a GPIO-switched resistor
//! elsewhere).

use crate::driver::Driver;
use crate::pma::Sparse;
use crate::{EpType, Event, HwCaps, PortType, UsbDriver, UsbPeripheral};
use usb_device::endpoint::EndpointAddress;

/// Control over the external 1.5 kΩ pull-up on DP
pub trait DpPullUp {
    /// Drive (`true`) or release (`false`) the pull-up
    fn dp_pull_up(&self, enable: bool);
}

/// A revision-1 driver
pub struct Usb<P> {
    driver: Driver<P, Sparse>,
}

impl<P: UsbPeripheral + DpPullUp> Usb<P> {
    pub fn new(peripherals: P) -> Self {
        Usb {
            driver: Driver::new(peripherals),
        }
    }
}

impl<P: UsbPeripheral + DpPullUp> UsbDriver for Usb<P> {
    const CAPS: HwCaps = HwCaps::empty();

    fn enable(&mut self, enable: bool) {
        if enable {
            self.driver.power_on();
        } else if self.driver.is_powered() {
            self.driver.peripherals().dp_pull_up(false);
            self.driver.power_off();
        }
    }

    fn reset(&mut self) {
        self.driver.force_reset();
    }

    /// No charge detector on this revision; always reports
    /// [`PortType::Unknown`]
    fn connect(&mut self, connect: bool) -> PortType {
        self.driver.peripherals().dp_pull_up(connect);
        PortType::Unknown
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
    use crate::{EpType, HwCaps, PortType, UsbDriver};
    use usb_device::endpoint::EndpointAddress;
    use usb_device::UsbDirection;

    fn usb(bench: &Bench) -> Usb<FakePeripheral<'_, 512>> {
        Usb::new(FakePeripheral(bench))
    }

    fn pma_byte(bench: &Bench, offset: usize) -> u8 {
        unsafe { (*bench.pma.get())[offset] }
    }

    #[test]
    fn no_charge_detection() {
        assert_eq!(Usb::<FakePeripheral<'_, 512>>::CAPS, HwCaps::empty());

        let bench = Bench::new();
        let mut usb = usb(&bench);
        assert_eq!(usb.connect(true), PortType::Unknown);
        assert!(bench.pullup.get());
        assert_eq!(usb.connect(false), PortType::Unknown);
        assert!(!bench.pullup.get());
    }

    #[test]
    fn disable_releases_the_pull_up() {
        let bench = Bench::new();
        let mut usb = usb(&bench);
        usb.enable(true);
        usb.connect(true);

        usb.enable(false);
        assert!(!bench.pullup.get());
        assert!(!bench.clock.get());

        // Already off: nothing happens
        bench.pullup.set(true);
        usb.enable(false);
        assert!(bench.pullup.get());
    }

    #[test]
    fn descriptor_rows_are_sixteen_bytes_apart() {
        let bench = Bench::new();
        let mut usb = usb(&bench);
        usb.ep_config(
            EndpointAddress::from_parts(1, UsbDirection::Out),
            EpType::Bulk,
            64,
        )
        .unwrap();

        // Entry 1, RX pair: address row at CPU offset 16 + 8, count at + 12
        let addr = 512 - 64;
        assert_eq!(pma_byte(&bench, 24), (addr & 0xFF) as u8);
        assert_eq!(pma_byte(&bench, 25), (addr >> 8) as u8);
        assert_eq!(pma_byte(&bench, 28), 0x00);
        assert_eq!(pma_byte(&bench, 29), 0x84);
    }

    #[test]
    fn packet_cells_are_doubled_and_padded() {
        let bench = Bench::new();
        let mut usb = usb(&bench);
        let ep = EndpointAddress::from_parts(2, UsbDirection::In);
        usb.ep_config(ep, EpType::Bulk, 8).unwrap();

        assert_eq!(usb.ep_write(ep, &[0x5A, 0xA5, 0x3C]), Ok(3));
        // Buffer sits at PMA address 504, CPU offset 1008; cells four
        // bytes apart, odd tail zero-padded
        assert_eq!(pma_byte(&bench, 1008), 0x5A);
        assert_eq!(pma_byte(&bench, 1009), 0xA5);
        assert_eq!(pma_byte(&bench, 1012), 0x3C);
        assert_eq!(pma_byte(&bench, 1013), 0x00);
    }
}
