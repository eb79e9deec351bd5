#![no_std]
#![warn(missing_docs)]

//! `flexcan-core` provides the small set of abstractions the platform
//! independent [`flexcan`] driver consumes from its environment:
//!
//! - [`Registers`]: read/write access to the FlexCAN register file, addressed
//!   through the [`Register`] enumeration,
//! - [`InterruptControl`]: enabling, disabling and prioritizing the message
//!   interrupt line of one controller,
//! - [`Dependencies`]: clock gating and pin multiplexing of one controller.
//!
//! Traits from this crate are not supposed to be implemented by the
//! application developer; implementations should be provided by target HALs.
//! Integrators are responsible for soundness of the implementations and for
//! conforming to their respective safety prerequisites.
//!
//! [`flexcan`]: <https://docs.rs/crate/flexcan/>

use core::marker::PhantomData;
use vcell::VolatileCell;

/// Number of message buffers implemented by the peripheral
pub const MAILBOX_COUNT: usize = 16;

/// Number of entries of the Rx FIFO identifier filter table
pub const ID_FILTER_COUNT: usize = 32;

/// Named 32-bit registers of a FlexCAN peripheral
///
/// Indexed variants address one element of a register array. The index is
/// not range checked here; the driver never produces indices outside of
/// [`MAILBOX_COUNT`] (mailboxes, individual masks) or [`ID_FILTER_COUNT`]
/// (identifier filter table).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Register {
    /// Module Configuration Register
    Mcr,
    /// Control 1 Register (bit timing, operating modes)
    Ctrl1,
    /// Error Counter Register
    Ecr,
    /// Error and Status 1 Register
    Esr1,
    /// Interrupt Masks 1 Register
    Imask1,
    /// Interrupt Flags 1 Register (write one to clear)
    Iflag1,
    /// Control 2 Register
    Ctrl2,
    /// Rx FIFO Global Mask Register
    Rxfgmask,
    /// Rx FIFO Information Register
    Rxfir,
    /// Control and status word of message buffer `n`
    MailboxControl(usize),
    /// Identifier word of message buffer `n`
    MailboxId(usize),
    /// First payload word of message buffer `n` (bytes 0 to 3, big endian)
    MailboxWord0(usize),
    /// Second payload word of message buffer `n` (bytes 4 to 7, big endian)
    MailboxWord1(usize),
    /// Rx FIFO identifier filter table element `n`
    IdFilter(usize),
    /// Rx individual mask `n`
    RxIndividualMask(usize),
}

impl Register {
    /// Byte offset of the register from the peripheral base address
    pub const fn offset(self) -> usize {
        match self {
            Self::Mcr => 0x00,
            Self::Ctrl1 => 0x04,
            Self::Ecr => 0x1C,
            Self::Esr1 => 0x20,
            Self::Imask1 => 0x28,
            Self::Iflag1 => 0x30,
            Self::Ctrl2 => 0x34,
            Self::Rxfgmask => 0x48,
            Self::Rxfir => 0x4C,
            Self::MailboxControl(n) => 0x80 + n * 16,
            Self::MailboxId(n) => 0x84 + n * 16,
            Self::MailboxWord0(n) => 0x88 + n * 16,
            Self::MailboxWord1(n) => 0x8C + n * 16,
            Self::IdFilter(n) => 0xE0 + n * 4,
            Self::RxIndividualMask(n) => 0x880 + n * 4,
        }
    }
}

/// Access to the register file of one FlexCAN peripheral
///
/// Every `read` and `write` is a single bus operation from the point of view
/// of the driver.
pub trait Registers {
    /// Reads the current value of `register`
    fn read(&self, register: Register) -> u32;
    /// Writes `value` to `register`
    fn write(&self, register: Register, value: u32);
    /// Read-modify-write of `register`
    fn modify<F: FnOnce(u32) -> u32>(&self, register: Register, f: F) {
        let value = self.read(register);
        self.write(register, f(value));
    }
}

impl<T: Registers + ?Sized> Registers for &T {
    fn read(&self, register: Register) -> u32 {
        T::read(self, register)
    }

    fn write(&self, register: Register, value: u32) {
        T::write(self, register, value)
    }
}

/// Trait representing FlexCAN peripheral identity
///
/// Types implementing this trait are expected to be used as marker types
/// identifying a specific instance of the peripheral available on the
/// platform (as there might be more than one).
///
/// # Safety
/// `CanId::ADDRESS` points to the start of a valid FlexCAN register block.
///
/// # Examples
/// ```no_run
/// use flexcan_core::CanId;
///
/// pub enum Can0 {}
///
/// unsafe impl CanId for Can0 {
///     const ADDRESS: *const () = 0x4002_4000 as *const _;
/// }
///
/// pub enum Can1 {}
///
/// unsafe impl CanId for Can1 {
///     const ADDRESS: *const () = 0x400A_4000 as *const _;
/// }
/// ```
pub unsafe trait CanId {
    /// Static address of the register block of the peripheral
    const ADDRESS: *const ();
}

/// Memory mapped register file of the peripheral identified by `Id`
pub struct Mmio<Id> {
    _id: PhantomData<Id>,
}

impl<Id: CanId> Mmio<Id> {
    /// # Safety
    /// The caller must own the peripheral referenced by `Id` and must not
    /// construct more than one instance per peripheral. The register block
    /// has to be clocked before any access goes through the returned value.
    pub const unsafe fn new() -> Self {
        Self { _id: PhantomData }
    }

    fn cell(&self, register: Register) -> &VolatileCell<u32> {
        // Safety: `Id::ADDRESS` is the base of a valid register block and all
        // offsets produced by `Register::offset` are word aligned and within it.
        unsafe {
            &*((Id::ADDRESS as *const u8).add(register.offset()) as *const VolatileCell<u32>)
        }
    }
}

// Safety: the register block is only accessed through volatile single word
// operations and `Mmio::new` guarantees a single owner.
unsafe impl<Id> Sync for Mmio<Id> {}

impl<Id: CanId> Registers for Mmio<Id> {
    fn read(&self, register: Register) -> u32 {
        self.cell(register).get()
    }

    fn write(&self, register: Register, value: u32) {
        self.cell(register).set(value)
    }
}

/// Control over the message interrupt line of one FlexCAN peripheral
///
/// The driver masks the line around every read-modify-write of state shared
/// with its interrupt handler, so these operations have to be cheap and must
/// not touch other interrupt lines.
///
/// # Safety
/// - `disable` must guarantee that the handler of this line does not run
///   until the next `enable`
/// - `is_enabled` must reflect the state set by the last `enable`/`disable`
///
/// Masking this line excludes only this line's handler. Exclusion between
/// foreground callers is the driver user's obligation, see `Can::new`.
pub unsafe trait InterruptControl {
    /// Sets the priority of the line (0 is the highest priority)
    fn set_priority(&self, priority: u8);
    /// Unmasks the line
    fn enable(&self);
    /// Masks the line
    fn disable(&self);
    /// `true` if the line is currently unmasked
    fn is_enabled(&self) -> bool;
}

unsafe impl<T: InterruptControl + ?Sized> InterruptControl for &T {
    fn set_priority(&self, priority: u8) {
        T::set_priority(self, priority)
    }

    fn enable(&self) {
        T::enable(self)
    }

    fn disable(&self) {
        T::disable(self)
    }

    fn is_enabled(&self) -> bool {
        T::is_enabled(self)
    }
}

/// Electrical and multiplexing options of the CAN pins
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinConfig {
    /// Route TX through the alternate pin of the controller
    pub alternate_tx: bool,
    /// TX pin is open drain instead of push-pull
    pub tx_open_drain: bool,
    /// Route RX through the alternate pin of the controller
    pub alternate_rx: bool,
    /// Enable the internal pull-up of the RX pin
    pub rx_pull_up: bool,
}

/// Platform services required by one FlexCAN peripheral
///
/// # Safety
/// While the driver owns a [`Dependencies`] implementor
/// - the clock selected by [`Self::enable_clock`] must not change
/// - the pins configured by [`Self::configure_pins`] must not be
///   reconfigured by other code
pub unsafe trait Dependencies {
    /// `true` if the controller has an alternate TX pin broken out
    fn has_alternate_tx_pin(&self) -> bool;
    /// `true` if the controller has an alternate RX pin broken out
    fn has_alternate_rx_pin(&self) -> bool;
    /// Routes the peripheral to its pins. Only called with combinations
    /// allowed by [`Self::has_alternate_tx_pin`] and
    /// [`Self::has_alternate_rx_pin`].
    fn configure_pins(&self, pins: &PinConfig);
    /// Gates the peripheral clock on and enables the oscillator clock feeding
    /// the protocol engine
    fn enable_clock(&self);
}

unsafe impl<T: Dependencies + ?Sized> Dependencies for &T {
    fn has_alternate_tx_pin(&self) -> bool {
        T::has_alternate_tx_pin(self)
    }

    fn has_alternate_rx_pin(&self) -> bool {
        T::has_alternate_rx_pin(self)
    }

    fn configure_pins(&self, pins: &PinConfig) {
        T::configure_pins(self, pins)
    }

    fn enable_clock(&self) {
        T::enable_clock(self)
    }
}
