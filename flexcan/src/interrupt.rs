//! Interrupt flags and state shared with the interrupt handler

use bitfield::bitfield;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use flexcan_core::InterruptControl;

bitfield! {
    /// A set of message buffer interrupts, as laid out in `IMASK1` and
    /// `IFLAG1`.
    ///
    /// With the Rx FIFO enabled, flags 5 to 7 are repurposed for the FIFO.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct InterruptSet(u32);
    impl Debug;

    /// Message buffer 15 completed a transmission
    pub tx_mailbox, set_tx_mailbox: 15;
    /// Rx FIFO overflowed and a frame was lost
    pub rx_fifo_overflow, set_rx_fifo_overflow: 7;
    /// Rx FIFO holds five frames, it is almost full
    pub rx_fifo_warning, set_rx_fifo_warning: 6;
    /// A frame is available at the Rx FIFO output
    pub rx_fifo_available, set_rx_fifo_available: 5;
}

impl InterruptSet {
    /// Wraps a raw `IFLAG1`/`IMASK1` value
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw register value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Interrupts serviced by the driver
    pub fn serviced() -> Self {
        let mut set = Self(0);
        set.set_tx_mailbox(true);
        set.set_rx_fifo_overflow(true);
        set.set_rx_fifo_warning(true);
        set.set_rx_fifo_available(true);
        set
    }
}

bitflags! {
    /// Sticky Rx FIFO conditions latched by the interrupt handler
    ///
    /// The flags are never cleared while the controller runs; a new `begin`
    /// starts with an empty set.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct RxFifoFlags: u8 {
        /// The FIFO held five frames at some point
        const WARNING = 1 << 0;
        /// The FIFO overflowed and the hardware dropped frames
        const OVERFLOW = 1 << 1;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for RxFifoFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "RxFifoFlags({=u8:#x})", self.bits())
    }
}

/// State owned jointly by the foreground and the interrupt handler of one
/// controller
///
/// Exclusion relies on the interrupt line: the foreground masks it around
/// every access through [`Shared::lock`], the handler accesses the state
/// through [`Shared::with_irq`] and cannot be preempted by the foreground.
pub(crate) struct Shared<T> {
    inner: UnsafeCell<T>,
}

// Safety: access is serialized by masking the interrupt line, see `lock`
// and `with_irq`.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    /// Runs `f` with the interrupt line masked, restoring the previous
    /// masking state afterwards.
    ///
    /// Must not be called from the interrupt handler of the same line.
    pub fn lock<I: InterruptControl, R>(&self, irq: &I, f: impl FnOnce(&mut T) -> R) -> R {
        let was_enabled = irq.is_enabled();
        irq.disable();
        // Safety: the handler cannot run while the line is masked, and
        // `Can::new` requires a single foreground context.
        let result = f(unsafe { &mut *self.inner.get() });
        if was_enabled {
            irq.enable();
        }
        result
    }

    /// Runs `f` from the interrupt handler
    ///
    /// # Safety
    /// Only callable from the handler of the line guarding this state, and
    /// never re-entrantly.
    pub unsafe fn with_irq<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut *self.inner.get())
    }
}
