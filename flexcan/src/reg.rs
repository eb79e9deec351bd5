//! Field layouts of the registers the driver touches

use bitfield::bitfield;

/// Message buffer used for queued data frame transmission
pub(crate) const TX_MAILBOX: usize = 15;

/// Message buffer the Rx FIFO output is read from
pub(crate) const RX_FIFO_OUTPUT: usize = 0;

/// Transmit wait time after arbitration used by the driver
pub(crate) const TX_ARBITRATION_START_DELAY: u32 = 0x16;

bitfield! {
    /// Module Configuration Register
    #[derive(Copy, Clone, Default)]
    pub struct Mcr(u32);
    impl Debug;

    /// Module disable
    pub mdis, set_mdis: 31;
    /// Freeze enable
    pub frz, set_frz: 30;
    /// Rx FIFO enable
    pub fen, set_fen: 29;
    /// Halt, requests freeze mode
    pub halt, set_halt: 28;
    /// Module not ready (disabled, frozen or stopped)
    pub not_rdy, _: 27;
    /// Soft reset, self clearing
    pub soft_rst, set_soft_rst: 25;
    /// Freeze mode acknowledge
    pub frz_ack, _: 24;
    /// Supervisor mode
    pub supv, set_supv: 23;
    /// Low power mode acknowledge
    pub lpm_ack, _: 20;
    /// Self reception disable
    pub srx_dis, set_srx_dis: 17;
    /// Individual Rx masking and queue enable
    pub irmq, set_irmq: 16;
    /// Index of the last message buffer in use
    pub u8, maxmb, set_maxmb: 6, 0;
}

bitfield! {
    /// Control 1 Register
    ///
    /// Timing fields hold their value minus one, see [`Ctrl1::set_timing`].
    #[derive(Copy, Clone, Default)]
    pub struct Ctrl1(u32);
    impl Debug;

    /// Prescaler division factor minus one
    pub u8, presdiv, set_presdiv: 31, 24;
    /// Resync jump width minus one
    pub u8, rjw, set_rjw: 23, 22;
    /// Phase segment 1 minus one
    pub u8, pseg1, set_pseg1: 21, 19;
    /// Phase segment 2 minus one
    pub u8, pseg2, set_pseg2: 18, 16;
    /// Protocol engine clocked from the peripheral clock instead of the
    /// oscillator
    pub clk_src, set_clk_src: 13;
    /// Loop back mode
    pub lpb, set_lpb: 12;
    /// Triple sampling
    pub smp, set_smp: 7;
    /// Listen only mode
    pub lom, set_lom: 3;
    /// Propagation segment minus one
    pub u8, propseg, set_propseg: 2, 0;
}

impl Ctrl1 {
    /// Programs the bit timing fields from the segment lengths in time quanta
    pub fn set_timing(&mut self, timing: &crate::config::BitTiming) {
        self.set_presdiv(timing.prescaler.saturating_sub(1) as u8);
        self.set_rjw(timing.resync_jump_width.saturating_sub(1));
        self.set_pseg1(timing.phase_segment_1.saturating_sub(1));
        self.set_pseg2(timing.phase_segment_2.saturating_sub(1));
        self.set_propseg(timing.propagation_segment.saturating_sub(1));
        self.set_smp(timing.triple_sampling);
    }
}

bitfield! {
    /// Control 2 Register
    #[derive(Copy, Clone, Default)]
    pub struct Ctrl2(u32);
    impl Debug;

    /// Number of Rx FIFO filters, see
    /// [`FilterConfiguration::rffn`](crate::filter::FilterConfiguration::rffn)
    pub u8, rffn, set_rffn: 27, 24;
    /// Tx arbitration start delay
    pub u8, tasd, set_tasd: 23, 19;
    /// Mailboxes reception priority, `false` checks the Rx FIFO first
    pub mrp, set_mrp: 18;
    /// Remote request storing
    pub rrs, set_rrs: 17;
    /// Entire frame arbitration field comparison enable for Rx mailboxes
    pub eacen, set_eacen: 16;
}

bitfield! {
    /// Error Counter Register
    #[derive(Copy, Clone)]
    pub struct Ecr(u32);
    impl Debug;

    /// Receive error counter
    pub u8, rx_err_counter, _: 15, 8;
    /// Transmit error counter
    pub u8, tx_err_counter, _: 7, 0;
}

bitfield! {
    /// Error and Status 1 Register
    #[derive(Copy, Clone)]
    pub struct Esr1(u32);
    impl Debug;

    /// Fault confinement state
    pub u8, fltconf, _: 5, 4;
}

bitfield! {
    /// Control and status word of a message buffer
    #[derive(Copy, Clone, Default)]
    pub struct MailboxControl(u32);
    impl Debug;

    /// Message buffer code, see [`MailboxCode`]
    pub u8, code, set_code: 27, 24;
    /// Substitute remote request
    pub srr, set_srr: 22;
    /// Extended identifier
    pub ide, set_ide: 21;
    /// Remote transmission request
    pub rtr, set_rtr: 20;
    /// Data length code
    pub u8, dlc, set_dlc: 19, 16;
}

macro_rules! raw_bits {
    ($($register:ident),*) => {
        $(
            impl $register {
                /// Wraps a raw register value
                pub const fn from_bits(bits: u32) -> Self {
                    Self(bits)
                }

                /// Raw register value
                pub const fn bits(self) -> u32 {
                    self.0
                }
            }
        )*
    };
}

raw_bits!(Mcr, Ctrl1, Ctrl2, Ecr, Esr1, MailboxControl);

/// Message buffer codes used by the driver
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MailboxCode {
    /// Rx buffer empty
    RxEmpty = 0x4,
    /// Rx buffer holding an unread frame
    RxFull = 0x2,
    /// Rx buffer overwritten before being read
    RxOverrun = 0x6,
    /// Tx buffer not participating in arbitration
    TxInactive = 0x8,
    /// Tx buffer scheduled for one transmission
    TxOnce = 0xC,
}

impl MailboxCode {
    /// `true` if a mailbox reporting `code` can be claimed for a new
    /// transmission. Mailboxes left in a receive state are reclaimed too.
    pub fn is_available_for_tx(code: u8) -> bool {
        [Self::TxInactive, Self::RxEmpty, Self::RxFull, Self::RxOverrun]
            .iter()
            .any(|&c| c as u8 == code)
    }
}

/// Fault confinement state as reported in [`Esr1::fltconf`]
pub(crate) mod fltconf {
    pub const ERROR_ACTIVE: u8 = 0;
    pub const ERROR_PASSIVE: u8 = 1;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BitTiming;
    use fugit::RateExtU32;

    #[test]
    fn timing_fields_are_stored_minus_one() {
        let timing = BitTiming::new(500.kHz());
        let mut ctrl1 = Ctrl1::default();
        ctrl1.set_timing(&timing);
        assert_eq!(ctrl1.presdiv() as u16 + 1, timing.prescaler);
        assert_eq!(ctrl1.pseg2() + 1, timing.phase_segment_2);
        assert_eq!(ctrl1.rjw() + 1, timing.resync_jump_width);
        assert_eq!(ctrl1.0 & 0xFF00, 0);
    }

    #[test]
    fn raw_values_pass_through() {
        let esr1 = Esr1::from_bits(0x0000_0020);
        assert_eq!(esr1.fltconf(), 2);
        assert_eq!(esr1.bits(), 0x20);
        let mut mcr = Mcr::from_bits(0);
        mcr.set_maxmb(15);
        mcr.set_fen(true);
        assert_eq!(mcr.bits(), 0x2000_000F);
        assert_eq!(Ecr::from_bits(0x8A05).tx_err_counter(), 5);
    }

    #[test]
    fn mailbox_control_layout() {
        let mut cs = MailboxControl(0);
        cs.set_code(MailboxCode::TxOnce as u8);
        cs.set_dlc(8);
        cs.set_ide(true);
        cs.set_srr(true);
        assert_eq!(cs.0, 0x0C68_0000);
    }

    #[test]
    fn only_inactive_and_receive_codes_are_claimable() {
        for code in [0x8, 0x4, 0x2, 0x6] {
            assert!(MailboxCode::is_available_for_tx(code));
        }
        for code in [0x0, 0xC, 0xA, 0xE] {
            assert!(!MailboxCode::is_available_for_tx(code));
        }
    }
}
