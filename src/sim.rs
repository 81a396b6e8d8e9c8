//! In-memory hardware stand-ins for the unit tests
//!
//! The register file and packet memory live in ordinary memory, and the
//! drivers run against them unmodified. The helpers below play the
//! hardware's half of the protocol — completing transfers, advancing data
//! toggles, raising sticky flags — through [`Epr::force`], so the tests
//! name toggle and buffer-index flags per the aliasing table documented in
//! [`crate::epr`] instead of poking raw bits.
//!
//! [`Epr::force`]: crate::epr::Epr::force

use crate::ral::usb::RegisterBlock;
use crate::{epr, UsbPeripheral};
use core::cell::{Cell, UnsafeCell};

pub struct Bench {
    pub regs: RegisterBlock,
    pub pma: UnsafeCell<[u8; 2048]>,
    pub clock: Cell<bool>,
    pub resets: Cell<u32>,
    pub pullup: Cell<bool>,
}

impl Bench {
    pub fn new() -> Self {
        Bench {
            regs: RegisterBlock::new(),
            pma: UnsafeCell::new([0; 2048]),
            clock: Cell::new(false),
            resets: Cell::new(0),
            pullup: Cell::new(false),
        }
    }

    /// Hardware finished transmitting: status falls back to NAK, the data
    /// toggle advances, the sticky flag goes up
    pub fn complete_tx(&self, index: u8) {
        let ep = self.regs.ep(index);
        let value = (ep.read() & !epr::STAT_TX) | epr::TX_NAK;
        ep.force((value ^ epr::DTOG_TX) | epr::CTR_TX);
    }

    /// Hardware finished receiving into a single-buffer endpoint
    pub fn complete_rx(&self, index: u8) {
        let ep = self.regs.ep(index);
        let value = (ep.read() & !epr::STAT_RX) | epr::RX_NAK;
        ep.force((value ^ epr::DTOG_RX) | epr::CTR_RX);
    }

    /// Hardware's RX buffer index advances (double-buffer/iso completion)
    pub fn flip_dtog_rx(&self, index: u8) {
        let ep = self.regs.ep(index);
        ep.force(ep.read() ^ epr::DTOG_RX);
    }

    /// Hardware's TX buffer index advances
    pub fn flip_dtog_tx(&self, index: u8) {
        let ep = self.regs.ep(index);
        ep.force(ep.read() ^ epr::DTOG_TX);
    }
}

/// A [`UsbPeripheral`] over a [`Bench`], with `N` bytes of PMA capacity
pub struct FakePeripheral<'a, const N: u16>(pub &'a Bench);

unsafe impl<const N: u16> UsbPeripheral for FakePeripheral<'_, N> {
    const PMA_SIZE: u16 = N;

    fn registers(&self) -> *const () {
        &self.0.regs as *const _ as *const ()
    }

    fn packet_memory(&self) -> *mut () {
        self.0.pma.get() as *mut ()
    }

    fn unique_id(&self) -> [u32; 3] {
        [0, 0, 0]
    }

    fn clock_enabled(&self) -> bool {
        self.0.clock.get()
    }

    fn enable_clock(&self) {
        self.0.clock.set(true);
    }

    fn disable_clock(&self) {
        self.0.clock.set(false);
    }

    fn assert_reset(&self) {
        self.0.resets.set(self.0.resets.get() + 1);
    }

    fn release_reset(&self) {}

    fn startup_delay(&self) {}
}

impl<const N: u16> crate::v1::DpPullUp for FakePeripheral<'_, N> {
    fn dp_pull_up(&self, enable: bool) {
        self.0.pullup.set(enable);
    }
}
