//! Handling of messages/frames

use core::cmp::min;
use embedded_can::{ExtendedId, Id, StandardId};

/// Maximum payload of a classic CAN frame
pub const MAX_DATA_LEN: usize = 8;

/// Classic CAN frame as exchanged with the driver queues
///
/// The payload is a plain byte array. Wider views are composed explicitly by
/// the `*_le` accessors, which treat byte 0 as the least significant byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    id: Id,
    remote: bool,
    len: u8,
    data: [u8; MAX_DATA_LEN],
    filter_index: u8,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            id: Id::Standard(StandardId::ZERO),
            remote: false,
            len: 0,
            data: [0; MAX_DATA_LEN],
            filter_index: 0,
        }
    }
}

impl Frame {
    /// Creates a data frame. Returns `None` if `data` is longer than 8 bytes.
    pub fn new_data(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_DATA_LEN {
            return None;
        }
        let mut frame = Self {
            id: id.into(),
            len: data.len() as u8,
            ..Self::default()
        };
        frame.data[..data.len()].copy_from_slice(data);
        Some(frame)
    }

    /// Creates a remote frame requesting `len` bytes. Returns `None` if `len`
    /// is greater than 8.
    pub fn new_remote(id: impl Into<Id>, len: usize) -> Option<Self> {
        if len > MAX_DATA_LEN {
            return None;
        }
        Some(Self {
            id: id.into(),
            remote: true,
            len: len as u8,
            ..Self::default()
        })
    }

    /// CAN identifier
    pub fn id(&self) -> Id {
        self.id
    }

    /// Raw 11 or 29-bit identifier
    pub fn raw_id(&self) -> u32 {
        match self.id {
            Id::Standard(id) => id.as_raw().into(),
            Id::Extended(id) => id.as_raw(),
        }
    }

    /// `true` if the frame uses a 29-bit identifier
    pub fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    /// `true` for remote transmission requests
    pub fn is_remote_frame(&self) -> bool {
        self.remote
    }

    /// Data length code, always in `0..=8`
    pub fn len(&self) -> usize {
        self.len.into()
    }

    /// `true` if the data length code is zero
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes. Empty for remote frames.
    pub fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.len()]
        }
    }

    /// All eight payload bytes, including the ones beyond [`Self::len`]
    pub fn raw_data(&self) -> &[u8; MAX_DATA_LEN] {
        &self.data
    }

    /// Mutable access to all eight payload bytes. Does not change the length.
    pub fn raw_data_mut(&mut self) -> &mut [u8; MAX_DATA_LEN] {
        &mut self.data
    }

    /// Sets the data length code, saturating at 8
    pub fn set_len(&mut self, len: usize) {
        self.len = min(len, MAX_DATA_LEN) as u8;
    }

    /// Index of the filter that accepted the frame. Meaningful for received
    /// frames only; primary filters come first, followed by secondary ones.
    pub fn filter_index(&self) -> u8 {
        self.filter_index
    }

    /// 16-bit word `index` (`0..4`) of the payload
    pub fn data16_le(&self, index: usize) -> Option<u16> {
        let bytes = self.data.get(index * 2..index * 2 + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// 32-bit word `index` (`0..2`) of the payload
    pub fn data32_le(&self, index: usize) -> Option<u32> {
        let bytes = self.data.get(index * 4..index * 4 + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Whole payload as one 64-bit word
    pub fn data64_le(&self) -> u64 {
        u64::from_le_bytes(self.data)
    }

    /// Stores `value` into 16-bit word `index`. Returns `false` if `index` is
    /// out of range.
    pub fn set_data16_le(&mut self, index: usize, value: u16) -> bool {
        match self.data.get_mut(index * 2..index * 2 + 2) {
            Some(bytes) => {
                bytes.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Stores `value` into 32-bit word `index`. Returns `false` if `index` is
    /// out of range.
    pub fn set_data32_le(&mut self, index: usize, value: u32) -> bool {
        match self.data.get_mut(index * 4..index * 4 + 4) {
            Some(bytes) => {
                bytes.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Stores `value` as the whole payload
    pub fn set_data64_le(&mut self, value: u64) {
        self.data = value.to_le_bytes();
    }

    pub(crate) fn set_filter_index(&mut self, index: u8) {
        self.filter_index = index;
    }

    /// Identifier as laid out in the mailbox ID word
    pub(crate) fn id_word(&self) -> u32 {
        match self.id {
            Id::Standard(id) => u32::from(id.as_raw()) << STANDARD_ID_SHIFT,
            Id::Extended(id) => id.as_raw(),
        }
    }

    /// Payload as the two big endian mailbox words
    pub(crate) fn data_words(&self) -> [u32; 2] {
        [
            u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]),
            u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]),
        ]
    }

    /// Rebuilds a frame from the mailbox words. Payload bytes beyond the data
    /// length code are zeroed.
    pub(crate) fn from_mailbox(
        extended: bool,
        remote: bool,
        dlc: u8,
        id_word: u32,
        words: [u32; 2],
    ) -> Self {
        let raw = id_word & ExtendedId::MAX.as_raw();
        let id = if extended {
            // The mask ensures the ID is in range for a 29-bit integer
            Id::Extended(unsafe { ExtendedId::new_unchecked(raw) })
        } else {
            // The mask ensures the ID is in range for a 11-bit integer
            Id::Standard(unsafe {
                StandardId::new_unchecked((raw >> STANDARD_ID_SHIFT) as u16 & StandardId::MAX.as_raw())
            })
        };
        let len = min(dlc as usize, MAX_DATA_LEN);
        let mut data = [0; MAX_DATA_LEN];
        data[..4].copy_from_slice(&words[0].to_be_bytes());
        data[4..].copy_from_slice(&words[1].to_be_bytes());
        data[len..].fill(0);
        Self {
            id,
            remote,
            len: len as u8,
            data,
            filter_index: 0,
        }
    }
}

/// Position of a standard identifier inside the mailbox ID word
pub(crate) const STANDARD_ID_SHIFT: u32 = 18;

impl embedded_can::Frame for Frame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::new_data(id, data)
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        Self::new_remote(id, dlc)
    }

    fn is_extended(&self) -> bool {
        self.is_extended()
    }

    fn is_remote_frame(&self) -> bool {
        self.is_remote_frame()
    }

    fn id(&self) -> Id {
        self.id()
    }

    fn dlc(&self) -> usize {
        self.len()
    }

    fn data(&self) -> &[u8] {
        self.data()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn std_id(raw: u16) -> StandardId {
        StandardId::new(raw).unwrap()
    }

    #[test]
    fn data_frame_longer_than_eight_bytes_is_rejected() {
        assert!(Frame::new_data(std_id(1), &[0; 9]).is_none());
        assert!(Frame::new_remote(std_id(1), 9).is_none());
    }

    #[test]
    fn payload_words_are_little_endian_compositions() {
        let frame = Frame::new_data(std_id(0x123), &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(frame.data16_le(0), Some(0x0201));
        assert_eq!(frame.data16_le(3), Some(0x0807));
        assert_eq!(frame.data16_le(4), None);
        assert_eq!(frame.data32_le(1), Some(0x0807_0605));
        assert_eq!(frame.data64_le(), 0x0807_0605_0403_0201);
    }

    #[test]
    fn word_setters_write_bytes_in_order() {
        let mut frame = Frame::default();
        assert!(frame.set_data32_le(0, 0xAABB_CCDD));
        assert!(frame.set_data16_le(2, 0x1122));
        assert!(!frame.set_data32_le(2, 0));
        assert_eq!(frame.raw_data(), &[0xDD, 0xCC, 0xBB, 0xAA, 0x22, 0x11, 0, 0]);
    }

    #[test]
    fn mailbox_words_are_big_endian() {
        let frame = Frame::new_data(std_id(0x7FF), &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(frame.data_words(), [0x0102_0304, 0x0500_0000]);
        assert_eq!(frame.id_word(), 0x7FF << 18);
    }

    #[test]
    fn mailbox_readout_zeroes_bytes_beyond_length() {
        let frame = Frame::from_mailbox(false, false, 3, 0x123 << 18, [0x0102_0304, 0x0506_0708]);
        assert_eq!(frame.raw_data(), &[1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(frame.raw_id(), 0x123);
        assert!(!frame.is_extended());
    }

    #[test]
    fn mailbox_readout_saturates_length() {
        let frame = Frame::from_mailbox(true, false, 15, 0x1FFF_FFFF, [0, 0]);
        assert_eq!(frame.len(), 8);
        assert_eq!(frame.raw_id(), 0x1FFF_FFFF);
        assert!(frame.is_extended());
    }

    #[test]
    fn remote_frame_has_no_data_but_keeps_length() {
        let frame = Frame::new_remote(ExtendedId::new(0x1234_5678).unwrap(), 4).unwrap();
        assert!(frame.data().is_empty());
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.id_word(), 0x1234_5678);
    }
}
