//! Controller driver
//!
//! [`Can`] owns the register file, the interrupt line and the platform
//! dependencies of one FlexCAN peripheral. The controller is stopped until
//! [`Can::begin`] succeeds; [`Can::end`] stops it again and releases the
//! queues.
//!
//! Data frames go out through message buffer 15, backed by a software
//! transmit queue that the interrupt handler drains. Remote frames are
//! written straight into one of the message buffers between the Rx FIFO and
//! message buffer 15 and are not queued. Received frames are moved from the
//! Rx FIFO into a software receive queue by the interrupt handler.

use crate::config::{BitTimingErrors, CanConfig};
use crate::filter::{FilterErrors, FilterTable, PrimaryFilter, SecondaryFilter};
use crate::interrupt::{InterruptSet, RxFifoFlags, Shared};
use crate::message::Frame;
use crate::queue::{Capacities, DefaultCapacities, FrameQueue};
use crate::reg::{
    fltconf, Ctrl1, Ctrl2, Ecr, Esr1, MailboxCode, MailboxControl, Mcr, RX_FIFO_OUTPUT,
    TX_ARBITRATION_START_DELAY, TX_MAILBOX,
};
use bitflags::bitflags;
use flexcan_core::{Dependencies, InterruptControl, Register, Registers, MAILBOX_COUNT};

/// Transmit error count reported while the controller is bus-off
pub const BUS_OFF_TRANSMIT_ERROR_COUNT: u32 = 256;

/// `IDHIT` field of `RXFIR`
const RXFIR_IDHIT_MASK: u32 = 0x1FF;

bitflags! {
    /// Problems reported by [`Can::begin`]
    ///
    /// Bits 0 to 11 mirror [`BitTimingErrors`], bits 12 to 15 mirror
    /// [`FilterErrors`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BeginErrors: u32 {
        /// See [`BitTimingErrors::PRESCALER_IS_ZERO`]
        const PRESCALER_IS_ZERO = 1 << 0;
        /// See [`BitTimingErrors::PRESCALER_IS_GREATER_THAN_256`]
        const PRESCALER_IS_GREATER_THAN_256 = 1 << 1;
        /// See [`BitTimingErrors::PROPAGATION_SEGMENT_IS_ZERO`]
        const PROPAGATION_SEGMENT_IS_ZERO = 1 << 2;
        /// See [`BitTimingErrors::PROPAGATION_SEGMENT_IS_GREATER_THAN_8`]
        const PROPAGATION_SEGMENT_IS_GREATER_THAN_8 = 1 << 3;
        /// See [`BitTimingErrors::PHASE_SEGMENT_1_IS_ZERO`]
        const PHASE_SEGMENT_1_IS_ZERO = 1 << 4;
        /// See [`BitTimingErrors::PHASE_SEGMENT_1_IS_GREATER_THAN_8`]
        const PHASE_SEGMENT_1_IS_GREATER_THAN_8 = 1 << 5;
        /// See [`BitTimingErrors::PHASE_SEGMENT_2_IS_LOWER_THAN_2`]
        const PHASE_SEGMENT_2_IS_LOWER_THAN_2 = 1 << 6;
        /// See [`BitTimingErrors::PHASE_SEGMENT_2_IS_GREATER_THAN_8`]
        const PHASE_SEGMENT_2_IS_GREATER_THAN_8 = 1 << 7;
        /// See [`BitTimingErrors::RJW_IS_ZERO`]
        const RJW_IS_ZERO = 1 << 8;
        /// See [`BitTimingErrors::RJW_IS_GREATER_THAN_4`]
        const RJW_IS_GREATER_THAN_4 = 1 << 9;
        /// See [`BitTimingErrors::RJW_IS_GREATER_THAN_PHASE_SEGMENT_2`]
        const RJW_IS_GREATER_THAN_PHASE_SEGMENT_2 = 1 << 10;
        /// See [`BitTimingErrors::PHASE_SEGMENT_1_IS_1_AND_TRIPLE_SAMPLING`]
        const PHASE_SEGMENT_1_IS_1_AND_TRIPLE_SAMPLING = 1 << 11;
        /// See [`FilterErrors::TOO_MANY_PRIMARY_FILTERS`]
        const TOO_MANY_PRIMARY_FILTERS = 1 << 12;
        /// See [`FilterErrors::NOT_CONFORMING_PRIMARY_FILTER`]
        const NOT_CONFORMING_PRIMARY_FILTER = 1 << 13;
        /// See [`FilterErrors::TOO_MANY_SECONDARY_FILTERS`]
        const TOO_MANY_SECONDARY_FILTERS = 1 << 14;
        /// See [`FilterErrors::NOT_CONFORMING_SECONDARY_FILTER`]
        const NOT_CONFORMING_SECONDARY_FILTER = 1 << 15;
        /// The alternate TX pin was requested but this controller has none
        const NO_ALTERNATE_TX_PIN = 1 << 16;
        /// The alternate RX pin was requested but this controller has none
        const NO_ALTERNATE_RX_PIN = 1 << 17;
        /// The bit timing does not reach the requested bitrate within the
        /// solver tolerance
        const BIT_CONFIGURATION = 1 << 18;
    }
}

impl BeginErrors {
    /// `true` if the controller was left stopped. Filter errors alone are
    /// not fatal: the controller runs with the filters that fit.
    pub fn is_fatal(&self) -> bool {
        let filters = Self::from(FilterErrors::all());
        !self.difference(filters).is_empty()
    }
}

impl From<BitTimingErrors> for BeginErrors {
    fn from(errors: BitTimingErrors) -> Self {
        Self::from_bits_retain(errors.bits())
    }
}

impl From<FilterErrors> for BeginErrors {
    fn from(errors: FilterErrors) -> Self {
        Self::from_bits_retain(errors.bits())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BeginErrors {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "BeginErrors({=u32:#x})", self.bits())
    }
}

/// Fault confinement state of the controller
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerState {
    /// Normal operation
    ErrorActive,
    /// One of the error counters exceeded 127
    ErrorPassive,
    /// The transmit error counter exceeded 255, the controller no longer
    /// takes part in bus activity
    BusOff,
}

/// The controller is stopped
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NotRunning;

impl embedded_can::Error for NotRunning {
    fn kind(&self) -> embedded_can::ErrorKind {
        embedded_can::ErrorKind::Other
    }
}

/// Observer of the filter index of every dispatched frame
pub type FilterMatchObserver = fn(u8);

/// State that only exists while the controller runs
struct Running<C: Capacities> {
    rx: FrameQueue<C::RxQueue>,
    tx: FrameQueue<C::TxQueue>,
    rx_fifo_flags: RxFifoFlags,
    filters: FilterTable,
}

/// Driver of one FlexCAN controller
///
/// All operations take `&self` so the driver can live in a `static` shared
/// with the interrupt handler, which has to call [`Can::on_interrupt`].
///
/// State shared with the handler is guarded by masking the controller's
/// message interrupt line only. Other interrupts stay live, see the safety
/// contract of [`Can::new`].
pub struct Can<R, I, D, C: Capacities = DefaultCapacities> {
    registers: R,
    interrupt: I,
    dependencies: D,
    state: Shared<Option<Running<C>>>,
}

impl<R: Registers, I: InterruptControl, D: Dependencies, C: Capacities> Can<R, I, D, C> {
    /// Creates a stopped driver
    ///
    /// # Safety
    /// Every call into the returned driver other than
    /// [`on_interrupt`](Can::on_interrupt) must come from one execution
    /// context that cannot preempt itself. Calling the driver both from the
    /// main loop and from another interrupt handler, or from several
    /// threads, lets two callers hold the queues at the same time.
    ///
    /// ```compile_fail,E0133
    /// # use flexcan::core::{Dependencies, InterruptControl, PinConfig, Register, Registers};
    /// # struct Regs;
    /// # impl Registers for Regs {
    /// #     fn read(&self, _: Register) -> u32 { 0 }
    /// #     fn write(&self, _: Register, _: u32) {}
    /// # }
    /// # struct Irq;
    /// # unsafe impl InterruptControl for Irq {
    /// #     fn set_priority(&self, _: u8) {}
    /// #     fn enable(&self) {}
    /// #     fn disable(&self) {}
    /// #     fn is_enabled(&self) -> bool { false }
    /// # }
    /// # struct Deps;
    /// # unsafe impl Dependencies for Deps {
    /// #     fn has_alternate_tx_pin(&self) -> bool { true }
    /// #     fn has_alternate_rx_pin(&self) -> bool { true }
    /// #     fn configure_pins(&self, _: &PinConfig) {}
    /// #     fn enable_clock(&self) {}
    /// # }
    /// // creating a driver is an unsafe operation
    /// static CAN0: flexcan::Can<Regs, Irq, Deps> = flexcan::Can::new(Regs, Irq, Deps);
    /// ```
    pub const unsafe fn new(registers: R, interrupt: I, dependencies: D) -> Self {
        Self {
            registers,
            interrupt,
            dependencies,
            state: Shared::new(None),
        }
    }

    /// Configures and starts the controller.
    ///
    /// A running controller is stopped first. Every problem found is
    /// reported in the returned set; an empty set means the configuration
    /// was fully accepted. Bit timing and pin problems are detected before
    /// anything is written and leave the controller stopped. Filter problems
    /// are reported but the controller is started with the filters that fit,
    /// see [`FilterTable::compile`].
    pub fn begin(
        &self,
        config: &CanConfig,
        primary: &[PrimaryFilter],
        secondary: &[SecondaryFilter],
    ) -> BeginErrors {
        self.end();

        let mut errors = BeginErrors::from(config.timing.consistency());
        if !config.timing.is_valid {
            errors |= BeginErrors::BIT_CONFIGURATION;
        }
        if config.pins.alternate_tx && !self.dependencies.has_alternate_tx_pin() {
            errors |= BeginErrors::NO_ALTERNATE_TX_PIN;
        }
        if config.pins.alternate_rx && !self.dependencies.has_alternate_rx_pin() {
            errors |= BeginErrors::NO_ALTERNATE_RX_PIN;
        }
        let filters = FilterTable::compile(config.filters, primary, secondary);
        errors |= BeginErrors::from(filters.errors());
        if errors.is_fatal() {
            #[cfg(feature = "defmt")]
            defmt::warn!("configuration rejected: {}", errors);
            return errors;
        }

        self.dependencies.configure_pins(&config.pins);
        self.dependencies.enable_clock();
        self.reset_into_freeze();
        self.configure(config, &filters);
        self.leave_freeze();

        self.state.lock(&self.interrupt, |state| {
            *state = Some(Running {
                rx: FrameQueue::new(),
                tx: FrameQueue::new(),
                rx_fifo_flags: RxFifoFlags::empty(),
                filters,
            })
        });
        self.interrupt.set_priority(config.interrupt_priority);
        self.interrupt.enable();
        self.registers
            .write(Register::Imask1, InterruptSet::serviced().bits());

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "started at {} bit/s, {}",
            config.timing.actual_bit_rate().to_Hz(),
            errors
        );
        errors
    }

    /// Stops the controller and drops queued frames. Does nothing if the
    /// controller is stopped.
    pub fn end(&self) {
        if !self.is_running() {
            return;
        }
        self.interrupt.disable();
        self.modify_mcr(|mcr| mcr.set_halt(true));
        while !self.mcr().frz_ack() {}
        self.state.lock(&self.interrupt, |state| *state = None);
        #[cfg(feature = "defmt")]
        defmt::debug!("stopped");
    }

    /// `true` between a successful [`Self::begin`] and [`Self::end`]
    pub fn is_running(&self) -> bool {
        self.state.lock(&self.interrupt, |state| state.is_some())
    }

    /// Sends `frame` or queues it for transmission.
    ///
    /// Returns `false` if the controller is stopped, the transmit queue is
    /// full, or, for a remote frame, no message buffer is free. Remote frames
    /// are never queued.
    pub fn send(&self, frame: &Frame) -> bool {
        self.state.lock(&self.interrupt, |state| {
            let Some(running) = state.as_mut() else {
                return false;
            };
            if frame.is_remote_frame() {
                let first = running.filters.configuration().primary_capacity();
                match (first..TX_MAILBOX)
                    .find(|&mailbox| MailboxCode::is_available_for_tx(self.mailbox_code(mailbox)))
                {
                    Some(mailbox) => {
                        self.write_mailbox(frame, mailbox);
                        true
                    }
                    None => false,
                }
            } else if running.tx.is_empty()
                && self.mailbox_code(TX_MAILBOX) == MailboxCode::TxInactive as u8
            {
                // The queue has priority over new frames while it is not empty
                self.write_mailbox(frame, TX_MAILBOX);
                true
            } else {
                running.tx.push(*frame).is_ok()
            }
        })
    }

    /// Takes the oldest received frame
    pub fn receive(&self) -> Option<Frame> {
        self.state
            .lock(&self.interrupt, |state| state.as_mut()?.rx.pop())
    }

    /// `true` if [`Self::receive`] would return a frame
    pub fn available(&self) -> bool {
        self.query(false, |running| !running.rx.is_empty())
    }

    /// Takes the oldest received frame and hands it to the callback of the
    /// filter that accepted it. `observer`, if any, is called with the filter
    /// index first.
    ///
    /// Returns `false` if no frame was received. Callbacks run with the
    /// interrupt enabled and may use the driver.
    pub fn dispatch_received(&self, observer: Option<FilterMatchObserver>) -> bool {
        let received = self.state.lock(&self.interrupt, |state| {
            let running = state.as_mut()?;
            let frame = running.rx.pop()?;
            let callback = running
                .filters
                .callbacks()
                .get(usize::from(frame.filter_index()))
                .copied()
                .flatten();
            Some((frame, callback))
        });
        let Some((frame, callback)) = received else {
            return false;
        };
        if let Some(observer) = observer {
            observer(frame.filter_index());
        }
        if let Some(callback) = callback {
            callback(&frame);
        }
        true
    }

    /// Capacity of the receive queue, 0 while stopped
    pub fn receive_queue_size(&self) -> usize {
        self.query(0, |running| running.rx.capacity())
    }

    /// Number of frames in the receive queue
    pub fn receive_queue_count(&self) -> usize {
        self.query(0, |running| running.rx.len())
    }

    /// Highest receive queue length, `receive_queue_size() + 1` once a frame
    /// was lost because the queue was full
    pub fn receive_queue_peak_count(&self) -> usize {
        self.query(0, |running| running.rx.peak_count())
    }

    /// Capacity of the transmit queue, 0 while stopped
    pub fn transmit_queue_size(&self) -> usize {
        self.query(0, |running| running.tx.capacity())
    }

    /// Number of data frames waiting for message buffer 15
    pub fn transmit_queue_count(&self) -> usize {
        self.query(0, |running| running.tx.len())
    }

    /// Highest transmit queue length, `transmit_queue_size() + 1` once a
    /// frame was rejected because the queue was full
    pub fn transmit_queue_peak_count(&self) -> usize {
        self.query(0, |running| running.tx.peak_count())
    }

    /// Rx FIFO conditions seen since [`Self::begin`]
    pub fn rx_fifo_flags(&self) -> RxFifoFlags {
        self.query(RxFifoFlags::empty(), |running| running.rx_fifo_flags)
    }

    /// Fault confinement state
    pub fn controller_state(&self) -> ControllerState {
        match Esr1::from_bits(self.registers.read(Register::Esr1)).fltconf() {
            fltconf::ERROR_ACTIVE => ControllerState::ErrorActive,
            fltconf::ERROR_PASSIVE => ControllerState::ErrorPassive,
            _ => ControllerState::BusOff,
        }
    }

    /// Receive error counter
    pub fn receive_error_counter(&self) -> u32 {
        Ecr::from_bits(self.registers.read(Register::Ecr))
            .rx_err_counter()
            .into()
    }

    /// Transmit error counter. The hardware counter is meaningless while bus
    /// off, [`BUS_OFF_TRANSMIT_ERROR_COUNT`] is reported instead.
    pub fn transmit_error_counter(&self) -> u32 {
        if self.controller_state() == ControllerState::BusOff {
            return BUS_OFF_TRANSMIT_ERROR_COUNT;
        }
        Ecr::from_bits(self.registers.read(Register::Ecr))
            .tx_err_counter()
            .into()
    }

    /// Services the message interrupt
    ///
    /// Moves a received frame into the receive queue, latches the Rx FIFO
    /// warning and overflow conditions and refills message buffer 15 from
    /// the transmit queue, then acknowledges the flags it saw.
    ///
    /// # Safety
    /// Must only be called from the handler of the interrupt line passed to
    /// [`Self::new`], and that handler must not preempt itself.
    pub unsafe fn on_interrupt(&self) {
        let status = InterruptSet::from_bits(self.registers.read(Register::Iflag1));
        self.state.with_irq(|state| {
            let Some(running) = state.as_mut() else {
                return;
            };
            if status.rx_fifo_available() {
                let frame = self.read_rx_fifo(&running.filters);
                // A full queue records the loss in its peak count
                let _ = running.rx.push(frame);
            }
            if status.rx_fifo_warning() {
                running.rx_fifo_flags |= RxFifoFlags::WARNING;
            }
            if status.rx_fifo_overflow() {
                running.rx_fifo_flags |= RxFifoFlags::OVERFLOW;
            }
            if status.tx_mailbox()
                && self.mailbox_code(TX_MAILBOX) == MailboxCode::TxInactive as u8
            {
                if let Some(frame) = running.tx.pop() {
                    self.write_mailbox(&frame, TX_MAILBOX);
                }
            }
        });
        self.registers.write(Register::Iflag1, status.bits());
    }

    fn query<T>(&self, stopped: T, f: impl FnOnce(&Running<C>) -> T) -> T {
        self.state
            .lock(&self.interrupt, |state| state.as_ref().map_or(stopped, f))
    }

    fn mcr(&self) -> Mcr {
        Mcr::from_bits(self.registers.read(Register::Mcr))
    }

    fn modify_mcr(&self, f: impl FnOnce(&mut Mcr)) {
        self.registers.modify(Register::Mcr, |bits| {
            let mut mcr = Mcr::from_bits(bits);
            f(&mut mcr);
            mcr.bits()
        });
    }

    /// Selects the oscillator clock, enables the module and soft resets it
    /// into freeze mode
    fn reset_into_freeze(&self) {
        self.registers.modify(Register::Ctrl1, |bits| {
            let mut ctrl1 = Ctrl1::from_bits(bits);
            ctrl1.set_clk_src(false);
            ctrl1.bits()
        });

        let mut mcr = Mcr::default();
        mcr.set_frz(true);
        mcr.set_supv(true);
        mcr.set_maxmb((MAILBOX_COUNT - 1) as u8);
        self.registers.write(Register::Mcr, mcr.bits());
        while self.mcr().lpm_ack() {}

        self.modify_mcr(|mcr| mcr.set_soft_rst(true));
        while self.mcr().soft_rst() {}
        while !self.mcr().frz_ack() {}
    }

    /// Writes modes, bit timing, filters and message buffers. The module has
    /// to be frozen.
    fn configure(&self, config: &CanConfig, filters: &FilterTable) {
        self.modify_mcr(|mcr| {
            mcr.set_srx_dis(!config.self_reception);
            mcr.set_fen(true);
            mcr.set_irmq(true);
        });

        let mut ctrl1 = Ctrl1::default();
        ctrl1.set_timing(&config.timing);
        ctrl1.set_lpb(config.loopback);
        ctrl1.set_lom(config.listen_only);
        self.registers.write(Register::Ctrl1, ctrl1.bits());

        let mut ctrl2 = Ctrl2::default();
        ctrl2.set_rffn(config.filters.rffn() as u8);
        ctrl2.set_tasd(TX_ARBITRATION_START_DELAY as u8);
        ctrl2.set_mrp(false);
        ctrl2.set_rrs(true);
        ctrl2.set_eacen(true);
        self.registers.write(Register::Ctrl2, ctrl2.bits());

        for (index, &mask) in filters.masks().iter().enumerate() {
            self.registers
                .write(Register::RxIndividualMask(index), mask);
        }
        for (index, &acceptance) in filters.acceptances().iter().enumerate() {
            self.registers.write(Register::IdFilter(index), acceptance);
        }
        self.registers
            .write(Register::Rxfgmask, filters.global_mask());

        let mut inactive = MailboxControl::default();
        inactive.set_code(MailboxCode::TxInactive as u8);
        for mailbox in config.filters.primary_capacity()..MAILBOX_COUNT {
            self.registers
                .write(Register::RxIndividualMask(mailbox), 0);
            self.registers
                .write(Register::MailboxControl(mailbox), inactive.bits());
        }
    }

    fn leave_freeze(&self) {
        self.modify_mcr(|mcr| mcr.set_halt(false));
        while self.mcr().frz_ack() {}
        while self.mcr().not_rdy() {}
    }

    fn mailbox_code(&self, mailbox: usize) -> u8 {
        MailboxControl::from_bits(self.registers.read(Register::MailboxControl(mailbox))).code()
    }

    fn write_mailbox(&self, frame: &Frame, mailbox: usize) {
        let mut control = MailboxControl::default();
        control.set_code(MailboxCode::TxInactive as u8);
        self.registers
            .write(Register::MailboxControl(mailbox), control.bits());

        let [word0, word1] = frame.data_words();
        self.registers
            .write(Register::MailboxId(mailbox), frame.id_word());
        self.registers.write(Register::MailboxWord0(mailbox), word0);
        self.registers.write(Register::MailboxWord1(mailbox), word1);

        control.set_code(MailboxCode::TxOnce as u8);
        control.set_dlc(frame.len() as u8);
        control.set_rtr(frame.is_remote_frame());
        control.set_ide(frame.is_extended());
        control.set_srr(frame.is_extended());
        self.registers
            .write(Register::MailboxControl(mailbox), control.bits());
    }

    fn read_rx_fifo(&self, filters: &FilterTable) -> Frame {
        let control =
            MailboxControl::from_bits(self.registers.read(Register::MailboxControl(RX_FIFO_OUTPUT)));
        let id = self.registers.read(Register::MailboxId(RX_FIFO_OUTPUT));
        let words = [
            self.registers.read(Register::MailboxWord0(RX_FIFO_OUTPUT)),
            self.registers.read(Register::MailboxWord1(RX_FIFO_OUTPUT)),
        ];
        let mut frame = Frame::from_mailbox(control.ide(), control.rtr(), control.dlc(), id, words);
        let hit = self.registers.read(Register::Rxfir) & RXFIR_IDHIT_MASK;
        frame.set_filter_index(filters.remap_hit(hit as u8));
        frame
    }
}

impl<R, I, D, C> embedded_can::nb::Can for Can<R, I, D, C>
where
    R: Registers,
    I: InterruptControl,
    D: Dependencies,
    C: Capacities,
{
    type Frame = Frame;
    type Error = NotRunning;

    /// Never replaces a pending frame, so `Ok` always holds `None`
    fn transmit(&mut self, frame: &Frame) -> nb::Result<Option<Frame>, NotRunning> {
        if !self.is_running() {
            return Err(nb::Error::Other(NotRunning));
        }
        if self.send(frame) {
            Ok(None)
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    fn receive(&mut self) -> nb::Result<Frame, NotRunning> {
        if !self.is_running() {
            return Err(nb::Error::Other(NotRunning));
        }
        Can::receive(self).ok_or(nb::Error::WouldBlock)
    }
}
