//! Rx FIFO acceptance filters
//!
//! The Rx FIFO is matched against a table of up to 32 acceptance values.
//! The first entries of the table have an individual mask each (*primary*
//! filters), the remaining ones share the Rx FIFO global mask (*secondary*
//! filters). How the table is split is selected by a
//! [`FilterConfiguration`].
//!
//! Mask and acceptance values use the peripheral's format A layout:
//!
//! | bit    | meaning                           |
//! |--------|-----------------------------------|
//! | 31     | remote transmission request       |
//! | 30     | extended identifier               |
//! | 29..19 | standard identifier               |
//! | 29..1  | extended identifier               |
//! | 0      | unused                            |
use crate::message::Frame;
use bitflags::bitflags;
use flexcan_core::ID_FILTER_COUNT;

/// Handler invoked by [`dispatch_received`] for frames accepted by the
/// filter it is attached to
///
/// [`dispatch_received`]: crate::bus::Can::dispatch_received
pub type Callback = fn(&Frame);

/// Largest number of primary filters of any [`FilterConfiguration`]
pub const MAX_PRIMARY_FILTERS: usize = 14;

const RTR_BIT: u32 = 1 << 31;
const IDE_BIT: u32 = 1 << 30;
const STANDARD_SHIFT: u32 = 19;
const EXTENDED_SHIFT: u32 = 1;
const STANDARD_MAX: u32 = 0x7FF;
const EXTENDED_MAX: u32 = 0x1FFF_FFFF;

/// Global mask used as soon as at least one secondary filter exists: every
/// bit but the unused bit 0 is compared.
pub const SECONDARY_MASK: u32 = !1;

/// Split of the Rx FIFO filter table
///
/// | variant         | primary | secondary | Rx FIFO mailboxes |
/// |-----------------|---------|-----------|-------------------|
/// | `Filters8_0`    | 8       | 0         | 0 ..= 7           |
/// | `Filters10_6`   | 10      | 6         | 0 ..= 9           |
/// | `Filters12_12`  | 12      | 12        | 0 ..= 11          |
/// | `Filters14_18`  | 14      | 18        | 0 ..= 13          |
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterConfiguration {
    /// 8 primary filters, no secondary filter
    Filters8_0,
    /// 10 primary filters, 6 secondary filters
    Filters10_6,
    /// 12 primary filters, 12 secondary filters
    #[default]
    Filters12_12,
    /// 14 primary filters, 18 secondary filters
    Filters14_18,
}

impl FilterConfiguration {
    /// Value of the `RFFN` field selecting this split
    pub fn rffn(self) -> u32 {
        match self {
            Self::Filters8_0 => 0,
            Self::Filters10_6 => 1,
            Self::Filters12_12 => 2,
            Self::Filters14_18 => 3,
        }
    }

    /// Number of filters with an individual mask. This is also the number of
    /// mailboxes occupied by the Rx FIFO and its filter table.
    pub fn primary_capacity(self) -> usize {
        8 + 2 * self.rffn() as usize
    }

    /// Number of filters sharing the global mask
    pub fn secondary_capacity(self) -> usize {
        6 * self.rffn() as usize
    }

    /// Size of the filter table
    pub fn total_capacity(self) -> usize {
        8 + 8 * self.rffn() as usize
    }
}

/// Selects data or remote frames
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameKind {
    /// Data frames
    Data,
    /// Remote transmission requests
    Remote,
}

/// Selects the identifier format
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameFormat {
    /// 11-bit identifiers
    Standard,
    /// 29-bit identifiers
    Extended,
}

impl FrameFormat {
    fn max_identifier(self) -> u32 {
        match self {
            Self::Standard => STANDARD_MAX,
            Self::Extended => EXTENDED_MAX,
        }
    }

    fn shift(self) -> u32 {
        match self {
            Self::Standard => STANDARD_SHIFT,
            Self::Extended => EXTENDED_SHIFT,
        }
    }
}

/// Mask with both the RTR and IDE bits compared
fn pack_mask(format: FrameFormat, mask: u32) -> u32 {
    RTR_BIT | IDE_BIT | ((mask & format.max_identifier()) << format.shift())
}

/// Returns the packed acceptance value and whether it conforms: mask and
/// acceptance fit the identifier width and acceptance bits are a subset of
/// the mask bits.
fn pack_acceptance(kind: FrameKind, format: FrameFormat, mask: u32, acceptance: u32) -> (u32, bool) {
    let max = format.max_identifier();
    let conforming = acceptance <= max && mask <= max && (mask & acceptance) == acceptance;
    let packed = match kind {
        FrameKind::Remote => RTR_BIT,
        FrameKind::Data => 0,
    } | match format {
        FrameFormat::Extended => IDE_BIT,
        FrameFormat::Standard => 0,
    } | ((acceptance & max) << format.shift());
    (packed, conforming)
}

/// Filter with an individual mask
#[derive(Copy, Clone, Debug)]
pub struct PrimaryFilter {
    mask: u32,
    acceptance: u32,
    conforming: bool,
    callback: Option<Callback>,
}

impl Default for PrimaryFilter {
    fn default() -> Self {
        Self::any()
    }
}

impl PrimaryFilter {
    /// Accepts every frame
    pub fn any() -> Self {
        Self {
            mask: 0,
            acceptance: 0,
            conforming: true,
            callback: None,
        }
    }

    /// Accepts every frame of the given kind and format, whatever its
    /// identifier
    pub fn kind(kind: FrameKind, format: FrameFormat) -> Self {
        let (acceptance, conforming) = pack_acceptance(kind, format, format.max_identifier(), 0);
        Self {
            mask: pack_mask(format, 0),
            acceptance,
            conforming,
            callback: None,
        }
    }

    /// Accepts frames of the given kind and format with exactly `identifier`
    pub fn identifier(kind: FrameKind, format: FrameFormat, identifier: u32) -> Self {
        let max = format.max_identifier();
        let (acceptance, conforming) = pack_acceptance(kind, format, max, identifier);
        Self {
            mask: pack_mask(format, max),
            acceptance,
            conforming,
            callback: None,
        }
    }

    /// Accepts frames of the given kind and format whose identifier bits
    /// selected by `mask` equal `acceptance`. `acceptance` must not have bits
    /// outside of `mask`.
    pub fn masked(kind: FrameKind, format: FrameFormat, mask: u32, acceptance: u32) -> Self {
        let (packed, conforming) = pack_acceptance(kind, format, mask, acceptance);
        Self {
            mask: pack_mask(format, mask),
            acceptance: packed,
            conforming,
            callback: None,
        }
    }

    /// Attaches `callback` to the filter
    pub fn with_callback(self, callback: Callback) -> Self {
        Self {
            callback: Some(callback),
            ..self
        }
    }

    /// Packed individual mask
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Packed acceptance value
    pub fn acceptance(&self) -> u32 {
        self.acceptance
    }

    /// `false` if the rule could not be represented faithfully
    pub fn is_conforming(&self) -> bool {
        self.conforming
    }

    /// Attached callback
    pub fn callback(&self) -> Option<Callback> {
        self.callback
    }
}

/// Filter sharing the global mask with the other secondary filters
#[derive(Copy, Clone, Debug)]
pub struct SecondaryFilter {
    acceptance: u32,
    conforming: bool,
    callback: Option<Callback>,
}

impl SecondaryFilter {
    /// Accepts frames of the given kind and format with exactly `identifier`
    pub fn identifier(kind: FrameKind, format: FrameFormat, identifier: u32) -> Self {
        let (acceptance, conforming) =
            pack_acceptance(kind, format, format.max_identifier(), identifier);
        Self {
            acceptance,
            conforming,
            callback: None,
        }
    }

    /// Attaches `callback` to the filter
    pub fn with_callback(self, callback: Callback) -> Self {
        Self {
            callback: Some(callback),
            ..self
        }
    }

    /// Packed acceptance value
    pub fn acceptance(&self) -> u32 {
        self.acceptance
    }

    /// `false` if the rule could not be represented faithfully
    pub fn is_conforming(&self) -> bool {
        self.conforming
    }

    /// Attached callback
    pub fn callback(&self) -> Option<Callback> {
        self.callback
    }
}

bitflags! {
    /// Problems detected while compiling a filter table
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FilterErrors: u32 {
        /// More primary filters than the configuration provides; the excess
        /// is not programmed
        const TOO_MANY_PRIMARY_FILTERS = 1 << 12;
        /// At least one programmed primary filter is not conforming
        const NOT_CONFORMING_PRIMARY_FILTER = 1 << 13;
        /// More secondary filters than the configuration provides; the excess
        /// is not programmed
        const TOO_MANY_SECONDARY_FILTERS = 1 << 14;
        /// At least one programmed secondary filter is not conforming
        const NOT_CONFORMING_SECONDARY_FILTER = 1 << 15;
    }
}

/// Register values for the whole filter table, ready to be written while
/// the controller is frozen
#[derive(Clone, Debug)]
pub struct FilterTable {
    configuration: FilterConfiguration,
    /// Rx individual masks, `configuration.primary_capacity()` are used
    masks: [u32; MAX_PRIMARY_FILTERS],
    /// Identifier filter table, `configuration.total_capacity()` are used
    acceptances: [u32; ID_FILTER_COUNT],
    global_mask: u32,
    primary_count: usize,
    secondary_count: usize,
    callbacks: [Option<Callback>; ID_FILTER_COUNT],
    errors: FilterErrors,
}

impl FilterTable {
    /// Compiles `primary` and `secondary` filters for `configuration`.
    ///
    /// Filters beyond the configuration capacity are dropped and reported.
    /// Unused slots repeat the first filter of the list they belong to (or
    /// of the other list when it is empty) so they never widen what is
    /// accepted. With no filter at all, every frame is accepted.
    pub fn compile(
        configuration: FilterConfiguration,
        primary: &[PrimaryFilter],
        secondary: &[SecondaryFilter],
    ) -> Self {
        let max_primary = configuration.primary_capacity();
        let max_secondary = configuration.secondary_capacity();
        let primary_count = primary.len().min(max_primary);
        let secondary_count = secondary.len().min(max_secondary);
        let mut errors = FilterErrors::empty();
        if primary.len() > max_primary {
            errors |= FilterErrors::TOO_MANY_PRIMARY_FILTERS;
        }
        if secondary.len() > max_secondary {
            errors |= FilterErrors::TOO_MANY_SECONDARY_FILTERS;
        }

        let (default_mask, default_acceptance) = match (primary.first(), secondary.first()) {
            (Some(first), _) => (first.mask, first.acceptance),
            (None, Some(first)) => (SECONDARY_MASK, first.acceptance),
            (None, None) => (0, 0),
        };

        let mut masks = [default_mask; MAX_PRIMARY_FILTERS];
        let mut acceptances = [default_acceptance; ID_FILTER_COUNT];
        let mut callbacks = [None; ID_FILTER_COUNT];

        for (index, filter) in primary.iter().take(primary_count).enumerate() {
            masks[index] = filter.mask;
            acceptances[index] = filter.acceptance;
            callbacks[index] = filter.callback;
            if !filter.conforming {
                errors |= FilterErrors::NOT_CONFORMING_PRIMARY_FILTER;
            }
        }

        let secondary_fill = secondary.first().map_or(default_acceptance, |f| f.acceptance);
        acceptances[max_primary..].fill(secondary_fill);
        for (index, filter) in secondary.iter().take(secondary_count).enumerate() {
            acceptances[max_primary + index] = filter.acceptance;
            callbacks[primary_count + index] = filter.callback;
            if !filter.conforming {
                errors |= FilterErrors::NOT_CONFORMING_SECONDARY_FILTER;
            }
        }

        Self {
            configuration,
            masks,
            acceptances,
            global_mask: if secondary.is_empty() {
                default_mask
            } else {
                SECONDARY_MASK
            },
            primary_count,
            secondary_count,
            callbacks,
            errors,
        }
    }

    /// Configuration the table was compiled for
    pub fn configuration(&self) -> FilterConfiguration {
        self.configuration
    }

    /// Rx individual mask values, one per primary slot
    pub fn masks(&self) -> &[u32] {
        &self.masks[..self.configuration.primary_capacity()]
    }

    /// Identifier filter table values: primary slots, then secondary slots
    pub fn acceptances(&self) -> &[u32] {
        &self.acceptances[..self.configuration.total_capacity()]
    }

    /// Value of the Rx FIFO global mask
    pub fn global_mask(&self) -> u32 {
        self.global_mask
    }

    /// Number of programmed primary filters
    pub fn primary_count(&self) -> usize {
        self.primary_count
    }

    /// Number of programmed secondary filters
    pub fn secondary_count(&self) -> usize {
        self.secondary_count
    }

    /// Callbacks indexed by filter index: programmed primary filters first,
    /// then programmed secondary filters
    pub fn callbacks(&self) -> &[Option<Callback>] {
        &self.callbacks[..self.primary_count + self.secondary_count]
    }

    /// Problems found while compiling
    pub fn errors(&self) -> FilterErrors {
        self.errors
    }

    /// Maps the filter index reported by the hardware to the index into
    /// [`Self::callbacks`]. Secondary filters are reported with an offset of
    /// the primary capacity, which is larger than the programmed primary
    /// count when not all primary slots are used.
    pub fn remap_hit(&self, hit: u8) -> u8 {
        let max_primary = self.configuration.primary_capacity() as u8;
        if hit >= max_primary {
            hit - (max_primary - self.primary_count as u8)
        } else {
            hit
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop(_: &Frame) {}

    #[test]
    fn configuration_tiers() {
        let tiers = [
            (FilterConfiguration::Filters8_0, 8, 0),
            (FilterConfiguration::Filters10_6, 10, 6),
            (FilterConfiguration::Filters12_12, 12, 12),
            (FilterConfiguration::Filters14_18, 14, 18),
        ];
        for (configuration, primary, secondary) in tiers {
            assert_eq!(configuration.primary_capacity(), primary);
            assert_eq!(configuration.secondary_capacity(), secondary);
            assert_eq!(configuration.total_capacity(), primary + secondary);
            assert!(configuration.total_capacity() <= ID_FILTER_COUNT);
        }
        assert_eq!(FilterConfiguration::Filters14_18.total_capacity(), ID_FILTER_COUNT);
    }

    #[test]
    fn standard_and_extended_identifiers_use_different_offsets() {
        let standard = PrimaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 0x123);
        assert_eq!(standard.mask(), RTR_BIT | IDE_BIT | (0x7FF << 19));
        assert_eq!(standard.acceptance(), 0x123 << 19);
        assert!(standard.is_conforming());

        let extended =
            PrimaryFilter::identifier(FrameKind::Remote, FrameFormat::Extended, 0x1234_5678);
        assert_eq!(extended.mask(), RTR_BIT | IDE_BIT | (0x1FFF_FFFF << 1));
        assert_eq!(extended.acceptance(), RTR_BIT | IDE_BIT | (0x1234_5678 << 1));
        assert!(extended.is_conforming());
    }

    #[test]
    fn kind_filter_compares_only_flags() {
        let filter = PrimaryFilter::kind(FrameKind::Remote, FrameFormat::Standard);
        assert_eq!(filter.mask(), RTR_BIT | IDE_BIT);
        assert_eq!(filter.acceptance(), RTR_BIT);
        assert!(filter.is_conforming());
    }

    #[test]
    fn conforming_filters_keep_acceptance_within_mask() {
        let filters = [
            PrimaryFilter::any(),
            PrimaryFilter::kind(FrameKind::Data, FrameFormat::Extended),
            PrimaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 0x7FF),
            PrimaryFilter::masked(FrameKind::Data, FrameFormat::Standard, 0x7F0, 0x120),
            PrimaryFilter::masked(FrameKind::Remote, FrameFormat::Extended, 0xFFFF, 0x00AB),
        ];
        for filter in filters {
            assert!(filter.is_conforming());
            assert_eq!(filter.mask() & filter.acceptance(), filter.acceptance());
        }
    }

    #[test]
    fn violations_are_flagged() {
        // acceptance outside of mask
        let filter = PrimaryFilter::masked(FrameKind::Data, FrameFormat::Standard, 0x700, 0x123);
        assert!(!filter.is_conforming());
        // identifier too wide for the format
        let filter = PrimaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 0x800);
        assert!(!filter.is_conforming());
        let filter = SecondaryFilter::identifier(FrameKind::Data, FrameFormat::Extended, 1 << 29);
        assert!(!filter.is_conforming());
        // mask too wide for the format
        let filter = PrimaryFilter::masked(FrameKind::Data, FrameFormat::Standard, 0xFFF, 0x1);
        assert!(!filter.is_conforming());
        // the packed mask never clobbers the RTR/IDE bits
        assert_eq!(filter.mask() & 0x3F, 0);
    }

    #[test]
    fn too_many_primary_filters_are_truncated_and_reported() {
        let primary = [PrimaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 1); 13];
        let table = FilterTable::compile(FilterConfiguration::Filters12_12, &primary, &[]);
        assert_eq!(table.errors(), FilterErrors::TOO_MANY_PRIMARY_FILTERS);
        assert_eq!(table.primary_count(), 12);
        assert_eq!(table.masks().len(), 12);
        assert_eq!(table.acceptances().len(), 24);
    }

    #[test]
    fn non_conforming_filters_do_not_abort_compilation() {
        let primary = [
            PrimaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 0x10),
            PrimaryFilter::masked(FrameKind::Data, FrameFormat::Standard, 0x0F0, 0x123),
        ];
        let secondary = [
            SecondaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 0x900),
            SecondaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 0x20),
        ];
        let table = FilterTable::compile(FilterConfiguration::Filters10_6, &primary, &secondary);
        assert_eq!(
            table.errors(),
            FilterErrors::NOT_CONFORMING_PRIMARY_FILTER
                | FilterErrors::NOT_CONFORMING_SECONDARY_FILTER
        );
        assert_eq!(table.primary_count(), 2);
        assert_eq!(table.secondary_count(), 2);
        assert_eq!(table.acceptances()[11], 0x20 << 19);
    }

    #[test]
    fn unused_slots_replicate_first_filters() {
        let primary = [
            PrimaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 0x100),
            PrimaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 0x200),
        ];
        let secondary = [SecondaryFilter::identifier(FrameKind::Data, FrameFormat::Extended, 7)];
        let table = FilterTable::compile(FilterConfiguration::Filters12_12, &primary, &secondary);
        assert!(table.errors().is_empty());
        assert!(table.masks()[2..].iter().all(|&m| m == primary[0].mask()));
        assert!(table.acceptances()[2..12]
            .iter()
            .all(|&a| a == primary[0].acceptance()));
        assert!(table.acceptances()[13..]
            .iter()
            .all(|&a| a == secondary[0].acceptance()));
        assert_eq!(table.global_mask(), SECONDARY_MASK);
    }

    #[test]
    fn secondary_only_fills_primary_slots_with_global_mask() {
        let secondary = [SecondaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 5)];
        let table = FilterTable::compile(FilterConfiguration::Filters10_6, &[], &secondary);
        assert!(table.masks().iter().all(|&m| m == SECONDARY_MASK));
        assert!(table.acceptances().iter().all(|&a| a == 5 << 19));
    }

    #[test]
    fn no_filter_accepts_everything() {
        let table = FilterTable::compile(FilterConfiguration::Filters8_0, &[], &[]);
        assert!(table.masks().iter().all(|&m| m == 0));
        assert!(table.acceptances().iter().all(|&a| a == 0));
        assert_eq!(table.global_mask(), 0);
        assert!(table.callbacks().is_empty());
    }

    #[test]
    fn callbacks_follow_programmed_filters() {
        let primary = [PrimaryFilter::any().with_callback(noop), PrimaryFilter::any()];
        let secondary = [SecondaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 1)
            .with_callback(noop)];
        let table = FilterTable::compile(FilterConfiguration::Filters14_18, &primary, &secondary);
        let callbacks = table.callbacks();
        assert_eq!(callbacks.len(), 3);
        assert!(callbacks[0].is_some() && callbacks[1].is_none() && callbacks[2].is_some());
    }

    #[test]
    fn hits_on_secondary_filters_are_remapped() {
        let primary = [PrimaryFilter::any(); 3];
        let table = FilterTable::compile(FilterConfiguration::Filters12_12, &primary, &[]);
        assert_eq!(table.remap_hit(2), 2);
        // first secondary slot follows the last programmed primary filter
        assert_eq!(table.remap_hit(12), 3);
        assert_eq!(table.remap_hit(15), 6);
    }
}
