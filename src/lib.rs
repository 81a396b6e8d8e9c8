//! A USB device driver for STM32 microcontrollers
//!
//! `stm32-usbfs` drives the device-only full-speed USB macrocell found on
//! STM32 parts: endpoint configuration, packet-memory management, buffered
//! transfers (including hardware double buffering), stall control, and
//! interrupt-event decoding. The two incompatible revisions of the macrocell
//! are covered by [`v1`] and [`v2`]; both expose the same [`UsbDriver`]
//! contract, so everything above this layer is revision-agnostic.
//!
//! To interface the library, you must define a safe implementation of
//! [`UsbPeripheral`]. See the trait documentation for more information.
//!
//! This crate stops at the driver contract. USB enumeration, control-transfer
//! sequencing, and descriptor content belong to the device stack built on
//! top of it.
//!
//! # Example
//!
//! A [`UsbPeripheral`] implementation for a part with the revision-2
//! macrocell, using raw addresses from the reference manual. A register
//! access layer works just as well; the trait only asks for the base
//! pointers and the RCC hooks.
//!
//! ```no_run
//! use stm32_usbfs::{v2, Event, UsbDriver, UsbPeripheral};
//!
//! const RCC_APB1ENR: *mut u32 = 0x4002_1038 as _;
//! const RCC_APB1RSTR: *mut u32 = 0x4002_1028 as _;
//! const USB_EN: u32 = 1 << 23;
//!
//! struct Peripherals;
//!
//! unsafe impl UsbPeripheral for Peripherals {
//!     const PMA_SIZE: u16 = 1024;
//!     fn registers(&self) -> *const () {
//!         0x4000_5C00 as _
//!     }
//!     fn packet_memory(&self) -> *mut () {
//!         0x4000_6000 as _
//!     }
//!     fn unique_id(&self) -> [u32; 3] {
//!         let uid = 0x1FF8_0050 as *const u32;
//!         unsafe { [uid.read(), uid.add(1).read(), uid.add(5).read()] }
//!     }
//!     fn clock_enabled(&self) -> bool {
//!         unsafe { RCC_APB1ENR.read_volatile() & USB_EN != 0 }
//!     }
//!     fn enable_clock(&self) {
//!         unsafe { RCC_APB1ENR.write_volatile(RCC_APB1ENR.read_volatile() | USB_EN) }
//!     }
//!     fn disable_clock(&self) {
//!         unsafe { RCC_APB1ENR.write_volatile(RCC_APB1ENR.read_volatile() & !USB_EN) }
//!     }
//!     fn assert_reset(&self) {
//!         unsafe { RCC_APB1RSTR.write_volatile(RCC_APB1RSTR.read_volatile() | USB_EN) }
//!     }
//!     fn release_reset(&self) {
//!         unsafe { RCC_APB1RSTR.write_volatile(RCC_APB1RSTR.read_volatile() & !USB_EN) }
//!     }
//! }
//!
//! let mut usb = v2::Usb::new(Peripherals);
//! usb.enable(true);
//! usb.connect(true);
//!
//! // From the USB interrupt handler (or a polling loop):
//! usb.poll(|usb, event| match event {
//!     Event::Reset => { /* endpoints are already deconfigured; rebuild EP0 */ }
//!     Event::RxComplete(ep) => { /* usb.ep_read(ep, ..) */ }
//!     _ => {}
//! });
//! ```

#![no_std]

#[macro_use]
mod log;

mod driver;
mod epr;
mod pma;
mod ral;
mod serial;
#[cfg(test)]
mod sim;

pub mod v1;
pub mod v2;

use usb_device::endpoint::EndpointAddress;

/// Eight bidirectional physical endpoints
const EP_COUNT: u8 = 8;

/// A type that owns one USB macrocell instance
///
/// An implementation of `UsbPeripheral` supplies the base pointers of the
/// endpoint register file and the dedicated packet memory, plus the few RCC
/// operations the driver needs for power control. The driver never touches
/// anything outside these.
///
/// # Safety
///
/// `UsbPeripheral` should only be implemented on a type that owns the
/// macrocell's register block and packet memory. The returned pointers are
/// assumed to be valid for the whole lifetime of the driver, and will be
/// cast to register definitions. The RCC hooks must operate on the bits
/// belonging to this instance and nothing else.
pub unsafe trait UsbPeripheral {
    /// Packet-memory capacity, in bytes of PMA address space
    ///
    /// 1024 for the revision-2 macrocell, 512 for revision 1.
    const PMA_SIZE: u16;

    /// Returns the address of the endpoint register file
    fn registers(&self) -> *const ();

    /// Returns the CPU-visible base address of the packet memory
    fn packet_memory(&self) -> *mut ();

    /// Returns the three factory unique-ID words mixed into the serial
    /// number descriptor
    ///
    /// These are the words at byte offsets `0x00`, `0x04` and `0x14` of the
    /// part's unique-ID region.
    fn unique_id(&self) -> [u32; 3];

    /// Returns `true` while the peripheral clock is ungated
    fn clock_enabled(&self) -> bool;

    /// Ungate the peripheral clock
    fn enable_clock(&self);

    /// Gate the peripheral clock off
    fn disable_clock(&self);

    /// Assert the peripheral's RCC reset line
    fn assert_reset(&self);

    /// Release the peripheral's RCC reset line
    fn release_reset(&self);

    /// Busy-wait for the transceiver's t_STARTUP after power-down is
    /// released
    ///
    /// The default covers 1 µs at core clocks up to 72 MHz. Override it if
    /// you have a timer to spare or run faster than that.
    fn startup_delay(&self) {
        cortex_m::asm::delay(72);
    }
}

/// Transfer type requested for an endpoint
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum EpType {
    /// Bidirectional control endpoint; both directions are configured at
    /// once, through the OUT address
    Control,
    /// Isochronous endpoint; always double-buffered by the hardware
    Isochronous,
    /// Single-buffered bulk endpoint
    Bulk,
    /// Bulk endpoint with hardware ping-pong buffering
    DoubleBufferedBulk,
    /// Interrupt endpoint
    Interrupt,
}

/// One decoded interrupt cause
///
/// [`UsbDriver::poll`] reports at most one of these per call, after clearing
/// the matching hardware flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Event {
    /// Bus reset. All eight endpoints have already been deconfigured; the
    /// callback is expected to rebuild endpoint 0.
    Reset,
    /// Start of frame
    Sof,
    /// An expected start of frame did not arrive
    SofMissed,
    /// Bus went idle; the macrocell has been put in suspend
    Suspend,
    /// Bus activity resumed
    Wakeup,
    /// Transaction error noticed by the hardware. Informational; recovery
    /// already happened on the wire.
    Error,
    /// An OUT endpoint holds a packet ready to be read
    RxComplete(EndpointAddress),
    /// An IN endpoint finished transmitting
    TxComplete(EndpointAddress),
    /// An OUT endpoint received a SETUP packet
    SetupReceived(EndpointAddress),
}

/// Charge-port classification per USB Battery Charging 1.2
///
/// Returned by [`UsbDriver::connect`]. Only the revision-2 macrocell has
/// the charge detector; [`v1`] always reports [`PortType::Unknown`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum PortType {
    /// Detection unsupported, or the far end looks like a PS/2 or
    /// proprietary port
    Unknown,
    /// Standard downstream port: data, 500 mA class current
    StandardDownstream,
    /// Charging downstream port: data plus high current
    ChargingDownstream,
    /// Dedicated charging port: current only, no data
    DedicatedCharging,
    /// No data-line contact detected
    NoHost,
}

bitflags::bitflags! {
    /// Hardware capabilities advertised by a driver implementation
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct HwCaps: u8 {
        /// `connect` runs battery-charge detection before attaching
        const BATTERY_CHARGING = 1 << 0;
    }
}

/// The operations a macrocell revision provides to the device stack
///
/// Pick the implementation matching your part once, at startup; the
/// revisions are not interchangeable at runtime.
///
/// All operations assume a single execution context: the driver holds no
/// locks, and the read-toggle-write sequences on the endpoint registers are
/// not atomic. If configuration or stall calls can preempt [`poll`], mask
/// the USB interrupt around them.
///
/// [`poll`]: UsbDriver::poll
pub trait UsbDriver {
    /// What this revision's hardware can do
    const CAPS: HwCaps;

    /// Power the peripheral up (`true`) or down (`false`)
    ///
    /// Powering up ungates the clock, pulses the RCC reset, wakes the
    /// transceiver and unmasks the interrupt set [`poll`](UsbDriver::poll)
    /// decodes. Powering down forces a disconnect, holds the peripheral in
    /// reset and gates the clock; it is a no-op if the peripheral was not
    /// enabled.
    fn enable(&mut self, enable: bool);

    /// Pulse the macrocell's force-reset bit
    ///
    /// Synchronous; returns as soon as the bit is released.
    fn reset(&mut self);

    /// Present (`true`) or remove (`false`) the device to the host
    ///
    /// Returns the charge-port classification when the hardware supports it
    /// ([`HwCaps::BATTERY_CHARGING`]); [`PortType::Unknown`] otherwise.
    fn connect(&mut self, connect: bool) -> PortType;

    /// Assign the device address
    ///
    /// Must only be called once the zero-length status stage of the
    /// SET_ADDRESS transfer has completed; sequencing is owned by the
    /// enumeration layer.
    fn set_address(&mut self, address: u8);

    /// Configure an endpoint: commit its transfer type and allocate its
    /// packet-memory slot(s)
    ///
    /// Control endpoints are configured through their OUT address and get
    /// both directions. Isochronous and double-buffered bulk endpoints get
    /// two slots per direction.
    ///
    /// On `Err(EndpointMemoryOverflow)` the packet memory is exhausted.
    /// The type bits have been committed to the endpoint register by then;
    /// there is no rollback, and callers must not assume one.
    fn ep_config(
        &mut self,
        addr: EndpointAddress,
        kind: EpType,
        size: u16,
    ) -> usb_device::Result<()>;

    /// Deconfigure a physical endpoint, both directions
    ///
    /// Returns the endpoint register to DISABLED and zeroes its descriptor
    /// slots, which is the only way packet memory comes back.
    fn ep_deconfig(&mut self, index: u8);

    /// Read a received packet from the OUT side of `addr`
    ///
    /// Copies at most `buffer.len()` bytes and returns the count. Fails
    /// with `InvalidState` when no packet is pending; retry after the next
    /// [`Event::RxComplete`], not in a loop.
    fn ep_read(&mut self, addr: EndpointAddress, buffer: &mut [u8]) -> usb_device::Result<usize>;

    /// Queue `buffer` for transmission on the IN side of `addr`
    ///
    /// Fails with `InvalidState` while a previous write is still pending.
    fn ep_write(&mut self, addr: EndpointAddress, buffer: &[u8]) -> usb_device::Result<usize>;

    /// Set or clear the STALL handshake for one direction of an endpoint
    ///
    /// Isochronous endpoints cannot stall, and disabled endpoints cannot
    /// change state; both cases are silent no-ops. Clearing a stall also
    /// clears the data toggle, per the protocol.
    fn ep_stall(&mut self, addr: EndpointAddress, stall: bool);

    /// Whether the given direction of an endpoint is currently stalled
    fn ep_is_stalled(&self, addr: EndpointAddress) -> bool;

    /// Decode at most one pending interrupt cause
    ///
    /// Clears exactly the hardware flags belonging to the decoded cause and
    /// hands the event to `callback` together with the driver, so the
    /// callback can issue reads and writes. Returns without calling back
    /// when nothing is pending. Call this once per USB interrupt, from a
    /// single context.
    fn poll(&mut self, callback: impl FnOnce(&mut Self, Event))
    where
        Self: Sized;

    /// The current 11-bit bus frame number
    fn frame_number(&self) -> u16;

    /// Write the device's serial-number string descriptor into `buffer`
    ///
    /// The serial is derived from the factory unique ID and is stable
    /// across resets. Always writes exactly 18 bytes and returns 18;
    /// `buffer` must be at least that large.
    fn serial_number_descriptor(&self, buffer: &mut [u8]) -> usize;
}
