//! CAN bus configuration

pub use crate::filter::FilterConfiguration;
pub use flexcan_core::PinConfig;
use bitflags::bitflags;
use core::cmp::Ordering;
use fugit::{HertzU32, RateExtU32};

/// Oscillator clock feeding the protocol engine
pub const CAN_CLOCK: HertzU32 = HertzU32::from_raw(16_000_000);

/// Tolerance used by [`BitTiming::new`], in parts per million
pub const DEFAULT_TOLERANCE_PPM: u32 = 1000;

const MIN_PRESCALER: u32 = 1;
const MAX_PRESCALER: u32 = 256;
const MIN_TIME_QUANTA: u32 = 5;
const MAX_TIME_QUANTA: u32 = 25;
const MAX_SEGMENT: u8 = 8;
const MAX_RJW: u8 = 4;
const TRIPLE_SAMPLING_MAX_BITRATE: u32 = 125_000;
const PPM: u128 = 1_000_000;

/// Configuration for the CAN bus
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanConfig {
    /// Bit timing parameters
    pub timing: BitTiming,
    /// The controller only listens: no acknowledge, no error frames and no
    /// transmission
    pub listen_only: bool,
    /// Frames sent by this controller are received as well
    pub self_reception: bool,
    /// Internal loop back, the transmitted stream is fed back to the receiver
    pub loopback: bool,
    /// Split of the Rx FIFO filter table between primary and secondary
    /// filters
    pub filters: FilterConfiguration,
    /// Pin multiplexing and electrical options
    pub pins: PinConfig,
    /// Priority of the message interrupt (0 is the highest priority)
    pub interrupt_priority: u8,
}

impl CanConfig {
    /// Create an instance
    ///
    /// Bit timing is solved for `bitrate` with [`DEFAULT_TOLERANCE_PPM`], all
    /// other settings come pre-populated with default values.
    pub fn new(bitrate: HertzU32) -> Self {
        Self::with_timing(BitTiming::new(bitrate))
    }

    /// Create an instance from already computed (or hand-edited) timing
    pub fn with_timing(timing: BitTiming) -> Self {
        Self {
            timing,
            listen_only: false,
            self_reception: false,
            loopback: false,
            filters: FilterConfiguration::default(),
            pins: PinConfig::default(),
            interrupt_priority: 64,
        }
    }
}

bitflags! {
    /// Violations reported by [`BitTiming::consistency`]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BitTimingErrors: u32 {
        /// Prescaler must be at least 1
        const PRESCALER_IS_ZERO = 1 << 0;
        /// Prescaler must be at most 256
        const PRESCALER_IS_GREATER_THAN_256 = 1 << 1;
        /// Propagation segment must be at least 1
        const PROPAGATION_SEGMENT_IS_ZERO = 1 << 2;
        /// Propagation segment must be at most 8
        const PROPAGATION_SEGMENT_IS_GREATER_THAN_8 = 1 << 3;
        /// Phase segment 1 must be at least 1
        const PHASE_SEGMENT_1_IS_ZERO = 1 << 4;
        /// Phase segment 1 must be at most 8
        const PHASE_SEGMENT_1_IS_GREATER_THAN_8 = 1 << 5;
        /// Phase segment 2 must be at least 2
        const PHASE_SEGMENT_2_IS_LOWER_THAN_2 = 1 << 6;
        /// Phase segment 2 must be at most 8
        const PHASE_SEGMENT_2_IS_GREATER_THAN_8 = 1 << 7;
        /// Resynchronization jump width must be at least 1
        const RJW_IS_ZERO = 1 << 8;
        /// Resynchronization jump width must be at most 4
        const RJW_IS_GREATER_THAN_4 = 1 << 9;
        /// Resynchronization jump width must not exceed phase segment 2
        const RJW_IS_GREATER_THAN_PHASE_SEGMENT_2 = 1 << 10;
        /// Triple sampling needs phase segment 1 of at least 2
        const PHASE_SEGMENT_1_IS_1_AND_TRIPLE_SAMPLING = 1 << 11;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BitTimingErrors {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "BitTimingErrors({=u32:#x})", self.bits())
    }
}

/// Bit-timing parameters
///
/// A bit time consists of a synchronization segment of one time quantum,
/// the propagation segment, phase segment 1 (sample point at its end) and
/// phase segment 2. The time quantum is `prescaler` periods of `can_clock`.
///
/// This struct expects *real* values, the extra subtractions expected by the
/// HW register are handled by the driver. Fields are public so a solved
/// configuration can be adjusted by hand; [`Self::consistency`] validates
/// the result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitTiming {
    /// Clock the time quanta are derived from
    pub can_clock: HertzU32,
    /// Requested bitrate
    pub bitrate: HertzU32,
    /// Clock divider, 1..=256
    pub prescaler: u16,
    /// Propagation segment, 1..=8 time quanta
    pub propagation_segment: u8,
    /// Phase segment 1, 1..=8 time quanta
    pub phase_segment_1: u8,
    /// Phase segment 2, 2..=8 time quanta
    pub phase_segment_2: u8,
    /// Resynchronization jump width, 1..=4 time quanta, at most
    /// `phase_segment_2`
    pub resync_jump_width: u8,
    /// Sample three times around the sample point instead of once
    pub triple_sampling: bool,
    /// The solver found a configuration within the requested tolerance
    pub is_valid: bool,
}

impl BitTiming {
    /// Solve for `bitrate` from the 16 MHz oscillator, accepting
    /// [`DEFAULT_TOLERANCE_PPM`] deviation
    pub fn new(bitrate: HertzU32) -> Self {
        Self::with_tolerance(bitrate, DEFAULT_TOLERANCE_PPM)
    }

    /// Solve for `bitrate` from the 16 MHz oscillator, accepting
    /// `tolerance_ppm` deviation
    pub fn with_tolerance(bitrate: HertzU32, tolerance_ppm: u32) -> Self {
        Self::solve(CAN_CLOCK, bitrate, tolerance_ppm)
    }

    /// Searches every prescaler and time quanta count for the timing closest
    /// to `bitrate`.
    ///
    /// Candidates are ordered by
    /// 1. smallest deviation from `bitrate`
    /// 2. sample point closest to 87.5 %
    /// 3. smallest prescaler
    ///
    /// The returned timing always has its fields within the hardware ranges.
    /// It is marked invalid when the best candidate deviates by more than
    /// `tolerance_ppm`.
    pub fn solve(can_clock: HertzU32, bitrate: HertzU32, tolerance_ppm: u32) -> Self {
        let clock = can_clock.to_Hz();
        let rate = bitrate.to_Hz();
        let mut best: Option<Candidate> = None;
        if rate > 0 {
            for time_quanta in MIN_TIME_QUANTA..=MAX_TIME_QUANTA {
                let ideal = u64::from(clock) / (u64::from(rate) * u64::from(time_quanta));
                for prescaler in [ideal, ideal + 1] {
                    let prescaler =
                        prescaler.clamp(MIN_PRESCALER.into(), MAX_PRESCALER.into()) as u32;
                    let candidate = Candidate::new(clock, rate, prescaler, time_quanta);
                    best = match best {
                        Some(current) if candidate.cmp(&current) != Ordering::Less => {
                            Some(current)
                        }
                        _ => Some(candidate),
                    };
                }
            }
        }
        let mut timing = match best {
            Some(best) => Self::from_split(can_clock, bitrate, best.prescaler, best.time_quanta),
            None => Self::from_split(can_clock, bitrate, MAX_PRESCALER, MAX_TIME_QUANTA),
        };
        timing.is_valid = rate > 0 && timing.within_tolerance(tolerance_ppm);
        timing
    }

    /// Distributes `time_quanta` over the segments
    fn from_split(
        can_clock: HertzU32,
        bitrate: HertzU32,
        prescaler: u32,
        time_quanta: u32,
    ) -> Self {
        let (propagation, phase_1, phase_2) = segment_split(time_quanta);
        Self {
            can_clock,
            bitrate,
            prescaler: prescaler as u16,
            propagation_segment: propagation,
            phase_segment_1: phase_1,
            phase_segment_2: phase_2,
            resync_jump_width: phase_2.min(MAX_RJW),
            triple_sampling: bitrate.to_Hz() <= TRIPLE_SAMPLING_MAX_BITRATE && phase_1 >= 2,
            is_valid: false,
        }
    }

    /// Returns the number of time quanta that make up one bit time
    pub fn time_quanta_per_bit(&self) -> u32 {
        1 + u32::from(self.propagation_segment)
            + u32::from(self.phase_segment_1)
            + u32::from(self.phase_segment_2)
    }

    /// Bitrate produced by the current fields (rounded down)
    pub fn actual_bit_rate(&self) -> HertzU32 {
        let divider = u32::from(self.prescaler) * self.time_quanta_per_bit();
        if divider == 0 {
            return 0.Hz();
        }
        (self.can_clock.to_Hz() / divider).Hz()
    }

    /// `true` if the current fields produce exactly the requested bitrate
    pub fn is_exact(&self) -> bool {
        self.deviation().map_or(false, |(diff, _)| diff == 0)
    }

    /// Distance between actual and requested bitrate, in parts per million
    /// of the requested bitrate (rounded down, saturating)
    pub fn ppm_error(&self) -> u32 {
        match self.deviation() {
            Some((diff, nominal)) => u32::try_from(diff * PPM / nominal).unwrap_or(u32::MAX),
            None => u32::MAX,
        }
    }

    /// Position of the sample point from the bit start, in percent of the bit
    /// time, rounded down
    pub fn sample_point_percent(&self) -> u32 {
        let sample_point = 1 + u32::from(self.propagation_segment) + u32::from(self.phase_segment_1);
        100 * sample_point / self.time_quanta_per_bit()
    }

    /// Validates the fields against the hardware ranges; an empty set means
    /// the timing can be programmed. This does not check
    /// [`Self::is_valid`], which only reflects the tolerance of the solver.
    pub fn consistency(&self) -> BitTimingErrors {
        let mut errors = BitTimingErrors::empty();
        if self.prescaler == 0 {
            errors |= BitTimingErrors::PRESCALER_IS_ZERO;
        } else if u32::from(self.prescaler) > MAX_PRESCALER {
            errors |= BitTimingErrors::PRESCALER_IS_GREATER_THAN_256;
        }
        if self.propagation_segment == 0 {
            errors |= BitTimingErrors::PROPAGATION_SEGMENT_IS_ZERO;
        } else if self.propagation_segment > MAX_SEGMENT {
            errors |= BitTimingErrors::PROPAGATION_SEGMENT_IS_GREATER_THAN_8;
        }
        if self.phase_segment_1 == 0 {
            errors |= BitTimingErrors::PHASE_SEGMENT_1_IS_ZERO;
        } else if self.phase_segment_1 > MAX_SEGMENT {
            errors |= BitTimingErrors::PHASE_SEGMENT_1_IS_GREATER_THAN_8;
        } else if self.phase_segment_1 == 1 && self.triple_sampling {
            errors |= BitTimingErrors::PHASE_SEGMENT_1_IS_1_AND_TRIPLE_SAMPLING;
        }
        if self.phase_segment_2 < 2 {
            errors |= BitTimingErrors::PHASE_SEGMENT_2_IS_LOWER_THAN_2;
        } else if self.phase_segment_2 > MAX_SEGMENT {
            errors |= BitTimingErrors::PHASE_SEGMENT_2_IS_GREATER_THAN_8;
        }
        if self.resync_jump_width == 0 {
            errors |= BitTimingErrors::RJW_IS_ZERO;
        } else if self.resync_jump_width > MAX_RJW {
            errors |= BitTimingErrors::RJW_IS_GREATER_THAN_4;
        }
        if self.resync_jump_width > self.phase_segment_2 {
            errors |= BitTimingErrors::RJW_IS_GREATER_THAN_PHASE_SEGMENT_2;
        }
        errors
    }

    /// `|can_clock - nominal|` and `nominal`, where `nominal` is the clock
    /// frequency the current fields would need to hit the requested bitrate
    fn deviation(&self) -> Option<(u128, u128)> {
        let nominal = u128::from(self.prescaler)
            * u128::from(self.time_quanta_per_bit())
            * u128::from(self.bitrate.to_Hz());
        if nominal == 0 {
            return None;
        }
        Some((u128::from(self.can_clock.to_Hz()).abs_diff(nominal), nominal))
    }

    fn within_tolerance(&self, tolerance_ppm: u32) -> bool {
        self.deviation()
            .map_or(false, |(diff, nominal)| diff * PPM <= nominal * u128::from(tolerance_ppm))
    }
}

/// Splits a bit time into (propagation, phase 1, phase 2) segments.
///
/// Phase segment 2 takes about two sevenths of the bit time, the remainder
/// after the synchronization segment is shared between phase segment 1 and
/// the propagation segment. Every count in `5..=25` maps into the hardware
/// ranges.
fn segment_split(time_quanta: u32) -> (u8, u8, u8) {
    let phase_2 = 1 + 2 * time_quanta / 7;
    let residual = time_quanta - phase_2 - 1;
    let phase_1 = residual / 2;
    let propagation = residual - phase_1;
    (propagation as u8, phase_1 as u8, phase_2 as u8)
}

/// Solver candidate with its ordering keys as exact fractions
#[derive(Copy, Clone)]
struct Candidate {
    prescaler: u32,
    time_quanta: u32,
    /// Deviation is `diff / nominal`
    diff: u128,
    nominal: u128,
    /// Distance of the sample point from 7/8 is `sp_distance / (8 * time_quanta)`
    sp_distance: u128,
}

impl Candidate {
    fn new(clock: u32, rate: u32, prescaler: u32, time_quanta: u32) -> Self {
        let nominal = u128::from(prescaler) * u128::from(time_quanta) * u128::from(rate);
        let (propagation, phase_1, _) = segment_split(time_quanta);
        let sample_point = 1 + u128::from(propagation) + u128::from(phase_1);
        Self {
            prescaler,
            time_quanta,
            diff: u128::from(clock).abs_diff(nominal),
            nominal,
            sp_distance: (8 * sample_point).abs_diff(7 * u128::from(time_quanta)),
        }
    }

    fn cmp(&self, other: &Self) -> Ordering {
        (self.diff * other.nominal)
            .cmp(&(other.diff * self.nominal))
            .then_with(|| {
                let own = self.sp_distance * u128::from(other.time_quanta);
                let theirs = other.sp_distance * u128::from(self.time_quanta);
                own.cmp(&theirs)
            })
            .then_with(|| self.prescaler.cmp(&other.prescaler))
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use std::vec::Vec;

    #[test]
    fn exact_500_kbit() {
        let timing = BitTiming::with_tolerance(500.kHz(), 0);
        assert!(timing.is_valid);
        assert!(timing.is_exact());
        assert_eq!(timing.ppm_error(), 0);
        assert_eq!(timing.prescaler, 2);
        assert_eq!(timing.time_quanta_per_bit(), 16);
        assert_eq!(timing.actual_bit_rate(), 500.kHz::<1, 1>());
        assert!(timing.consistency().is_empty());
    }

    #[test]
    fn default_timing_at_125_kbit_uses_triple_sampling() {
        let timing = BitTiming::new(125.kHz());
        assert!(timing.is_valid && timing.is_exact());
        assert!(timing.triple_sampling);
        assert!(timing.phase_segment_1 >= 2);
        assert!(timing.consistency().is_empty());
    }

    #[test]
    fn inexact_rate_is_valid_within_tolerance_only() {
        // 16 MHz / 727 kbit/s is 22.008 quanta; best is 22 quanta, ~375 ppm
        let loose = BitTiming::new(727.kHz());
        assert!(loose.is_valid);
        assert!(!loose.is_exact());
        assert!(loose.ppm_error() > 0 && loose.ppm_error() <= DEFAULT_TOLERANCE_PPM);

        let strict = BitTiming::with_tolerance(727.kHz(), 0);
        assert!(!strict.is_valid);
        assert_eq!(strict.prescaler, loose.prescaler);
        assert_eq!(strict.time_quanta_per_bit(), loose.time_quanta_per_bit());
    }

    #[test]
    fn unreachable_rates_are_marked_invalid_but_in_range() {
        for rate in [0_u32, 1, 100, 2_000, 5_000_000, 20_000_000] {
            let timing = BitTiming::with_tolerance(rate.Hz(), 1000);
            assert!(!timing.is_valid, "rate {rate}");
            assert!(timing.consistency().is_empty(), "rate {rate}");
        }
    }

    #[test]
    fn tie_break_prefers_sample_point_then_prescaler() {
        // 1 Mbit/s: 16 quanta (prescaler 1) and 8 quanta (prescaler 2) are both
        // exact; 16 quanta have the later sample point.
        let timing = BitTiming::with_tolerance(1.MHz(), 0);
        assert_eq!((timing.prescaler, timing.time_quanta_per_bit()), (1, 16));

        let a = Candidate::new(16_000_000, 250_000, 4, 16);
        let b = Candidate::new(16_000_000, 250_000, 8, 8);
        assert_eq!(a.cmp(&b), Ordering::Less);
        let c = Candidate::new(16_000_000, 100_000, 8, 20);
        let d = Candidate::new(16_000_000, 100_000, 10, 16);
        assert_eq!(c.cmp(&c), Ordering::Equal);
        assert_eq!(c.cmp(&d), d.cmp(&c).reverse());

        // both exact with 16 quanta: only the prescaler differs
        let e = Candidate::new(16_000_000, 1_000_000, 1, 16);
        let f = Candidate::new(16_000_000, 500_000, 2, 16);
        assert_eq!((e.diff, f.diff), (0, 0));
        assert_eq!(e.sp_distance, f.sp_distance);
        assert_eq!(e.cmp(&f), Ordering::Less);
        assert_eq!(f.cmp(&e), Ordering::Greater);
    }

    #[test]
    fn sample_point_is_rounded_down() {
        let mut timing = BitTiming::new(500.kHz());
        timing.propagation_segment = 5;
        timing.phase_segment_1 = 5;
        timing.phase_segment_2 = 5;
        // 11 / 16 = 68.75 %
        assert_eq!(timing.sample_point_percent(), 68);
        timing.propagation_segment = 1;
        timing.phase_segment_1 = 1;
        timing.phase_segment_2 = 2;
        // 3 / 5 = 60 %
        assert_eq!(timing.sample_point_percent(), 60);
        timing.propagation_segment = 8;
        timing.phase_segment_1 = 8;
        timing.phase_segment_2 = 2;
        // 17 / 19 = 89.47 %
        assert_eq!(timing.sample_point_percent(), 89);
    }

    #[test]
    fn every_split_is_in_range() {
        for time_quanta in MIN_TIME_QUANTA..=MAX_TIME_QUANTA {
            let (propagation, phase_1, phase_2) = segment_split(time_quanta);
            assert!((1..=8).contains(&propagation));
            assert!((1..=8).contains(&phase_1));
            assert!((2..=8).contains(&phase_2));
            assert_eq!(1 + u32::from(propagation + phase_1 + phase_2), time_quanta);
        }
    }

    #[test]
    fn consistency_flags_each_violation() {
        let mut timing = BitTiming::new(250.kHz());
        timing.prescaler = 0;
        timing.propagation_segment = 9;
        timing.phase_segment_1 = 0;
        timing.phase_segment_2 = 1;
        timing.resync_jump_width = 5;
        assert_eq!(
            timing.consistency(),
            BitTimingErrors::PRESCALER_IS_ZERO
                | BitTimingErrors::PROPAGATION_SEGMENT_IS_GREATER_THAN_8
                | BitTimingErrors::PHASE_SEGMENT_1_IS_ZERO
                | BitTimingErrors::PHASE_SEGMENT_2_IS_LOWER_THAN_2
                | BitTimingErrors::RJW_IS_GREATER_THAN_4
                | BitTimingErrors::RJW_IS_GREATER_THAN_PHASE_SEGMENT_2
        );

        let mut timing = BitTiming::new(250.kHz());
        timing.prescaler = 257;
        timing.phase_segment_1 = 1;
        timing.triple_sampling = true;
        timing.resync_jump_width = 0;
        assert_eq!(
            timing.consistency(),
            BitTimingErrors::PRESCALER_IS_GREATER_THAN_256
                | BitTimingErrors::PHASE_SEGMENT_1_IS_1_AND_TRIPLE_SAMPLING
                | BitTimingErrors::RJW_IS_ZERO
        );
    }

    #[test]
    fn solver_never_exceeds_tolerance() {
        for rate in (10_000..2_000_000).step_by(997) {
            for tolerance in [0, 100, 1000, 10_000] {
                let timing = BitTiming::with_tolerance(rate.Hz(), tolerance);
                assert!(timing.consistency().is_empty());
                let percent = timing.sample_point_percent();
                assert!(percent <= 100);
                if timing.is_valid {
                    assert!(timing.ppm_error() <= tolerance, "rate {rate}");
                }
            }
        }
    }

    #[test]
    fn exact_rates_match_exhaustive_enumeration() {
        let clock = CAN_CLOCK.to_Hz();
        let mut exact: Vec<u32> = Vec::new();
        for prescaler in MIN_PRESCALER..=MAX_PRESCALER {
            for time_quanta in MIN_TIME_QUANTA..=MAX_TIME_QUANTA {
                let rate = clock / prescaler / time_quanta;
                if rate * prescaler * time_quanta == clock {
                    exact.push(rate);
                }
            }
        }
        exact.sort_unstable();
        exact.dedup();

        for &rate in &exact {
            let timing = BitTiming::with_tolerance(rate.Hz(), 0);
            assert!(timing.is_valid && timing.is_exact(), "rate {rate}");
        }
        for rate in 1_000..=200_000 {
            let timing = BitTiming::with_tolerance(rate.Hz(), 0);
            let expected = exact.binary_search(&rate).is_ok();
            assert_eq!(timing.is_exact(), expected, "rate {rate}");
            assert_eq!(timing.is_valid, expected, "rate {rate}");
        }
    }
}
