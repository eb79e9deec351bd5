//! Simulated peripheral used by the driver tests

use crate::message::Frame;
use crate::reg::{MailboxCode, MailboxControl, Mcr};
use core::cell::Cell;
use flexcan_core::{Dependencies, InterruptControl, PinConfig, Register, Registers};

const REGISTER_FILE_WORDS: usize = 0x8C0 / 4;

const LPM_ACK: u32 = 1 << 20;
const FRZ_ACK: u32 = 1 << 24;
const NOT_RDY: u32 = 1 << 27;

/// Register file acknowledging mode requests immediately
///
/// - freeze is acknowledged while both `FRZ` and `HALT` are set
/// - a soft reset completes on the write requesting it and leaves the module
///   halted
/// - `IFLAG1` is write-one-to-clear
pub struct MockFlexcan {
    words: [Cell<u32>; REGISTER_FILE_WORDS],
}

impl Default for MockFlexcan {
    fn default() -> Self {
        Self {
            words: core::array::from_fn(|_| Cell::new(0)),
        }
    }
}

impl MockFlexcan {
    fn cell(&self, register: Register) -> &Cell<u32> {
        &self.words[register.offset() / 4]
    }

    /// Stores a value bypassing the simulated side effects
    pub fn poke(&self, register: Register, value: u32) {
        self.cell(register).set(value)
    }

    /// Raises `IFLAG1` bits
    pub fn raise(&self, flags: u32) {
        let cell = self.cell(Register::Iflag1);
        cell.set(cell.get() | flags);
    }

    /// Places `frame` at the Rx FIFO output as accepted by filter `hit`
    pub fn inject_rx(&self, frame: &Frame, hit: u32) {
        let mut cs = MailboxControl::default();
        cs.set_code(MailboxCode::RxFull as u8);
        cs.set_ide(frame.is_extended());
        cs.set_srr(frame.is_extended());
        cs.set_rtr(frame.is_remote_frame());
        cs.set_dlc(frame.len() as u8);
        let [word0, word1] = frame.data_words();
        self.poke(Register::MailboxControl(0), cs.bits());
        self.poke(Register::MailboxId(0), frame.id_word());
        self.poke(Register::MailboxWord0(0), word0);
        self.poke(Register::MailboxWord1(0), word1);
        self.poke(Register::Rxfir, hit);
        self.raise(1 << 5);
    }

    /// Completes the transmission pending in `mailbox`
    pub fn complete_tx(&self, mailbox: usize) {
        let mut cs = self.mailbox_control(mailbox);
        cs.set_code(MailboxCode::TxInactive as u8);
        self.poke(Register::MailboxControl(mailbox), cs.bits());
        self.raise(1 << mailbox);
    }

    pub fn mailbox_control(&self, mailbox: usize) -> MailboxControl {
        MailboxControl::from_bits(self.read(Register::MailboxControl(mailbox)))
    }

    pub fn mcr(&self) -> Mcr {
        Mcr::from_bits(self.read(Register::Mcr))
    }

    fn write_mcr(&self, value: u32) {
        let mut mcr = Mcr::from_bits(value & !(LPM_ACK | FRZ_ACK | NOT_RDY));
        if mcr.soft_rst() {
            mcr.set_soft_rst(false);
            mcr.set_frz(true);
            mcr.set_halt(true);
        }
        let mut bits = mcr.bits();
        if mcr.frz() && mcr.halt() {
            bits |= FRZ_ACK | NOT_RDY;
        }
        if mcr.mdis() {
            bits |= LPM_ACK | NOT_RDY;
        }
        self.poke(Register::Mcr, bits);
    }
}

impl Registers for MockFlexcan {
    fn read(&self, register: Register) -> u32 {
        self.cell(register).get()
    }

    fn write(&self, register: Register, value: u32) {
        match register {
            Register::Mcr => self.write_mcr(value),
            Register::Iflag1 => {
                let cell = self.cell(register);
                cell.set(cell.get() & !value);
            }
            _ => self.poke(register, value),
        }
    }
}

#[derive(Default)]
pub struct MockIrq {
    pub enabled: Cell<bool>,
    pub priority: Cell<Option<u8>>,
}

unsafe impl InterruptControl for MockIrq {
    fn set_priority(&self, priority: u8) {
        self.priority.set(Some(priority))
    }

    fn enable(&self) {
        self.enabled.set(true)
    }

    fn disable(&self) {
        self.enabled.set(false)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.get()
    }
}

#[derive(Default)]
pub struct MockDeps {
    pub alternate_tx: bool,
    pub alternate_rx: bool,
    pub pins: Cell<Option<PinConfig>>,
    pub clock_enabled: Cell<bool>,
}

unsafe impl Dependencies for MockDeps {
    fn has_alternate_tx_pin(&self) -> bool {
        self.alternate_tx
    }

    fn has_alternate_rx_pin(&self) -> bool {
        self.alternate_rx
    }

    fn configure_pins(&self, pins: &PinConfig) {
        self.pins.set(Some(*pins))
    }

    fn enable_clock(&self) {
        self.clock_enabled.set(true)
    }
}
