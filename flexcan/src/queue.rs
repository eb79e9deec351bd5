//! Bounded frame queues shared between the foreground and the interrupt
//! handler
//!
//! Capacities are part of the type, the storage lives inline in the driver.

use crate::message::Frame;
use generic_array::{ArrayLength, GenericArray};

/// Queue capacities of one controller
///
/// # Example
/// ```
/// use flexcan::generic_array::typenum::consts::*;
/// use flexcan::queue::Capacities;
///
/// pub struct Gateway;
///
/// impl Capacities for Gateway {
///     type RxQueue = U64;
///     type TxQueue = U8;
/// }
/// ```
pub trait Capacities {
    /// Number of received frames buffered until read by the application
    type RxQueue: ArrayLength<Frame>;
    /// Number of data frames waiting for the transmit mailbox
    type TxQueue: ArrayLength<Frame>;
}

/// Capacities used when none are given: 32 receive and 16 transmit frames
pub struct DefaultCapacities;

impl Capacities for DefaultCapacities {
    type RxQueue = generic_array::typenum::U32;
    type TxQueue = generic_array::typenum::U16;
}

/// Fixed capacity FIFO of [`Frame`]s
///
/// Besides the current length the queue tracks the highest length ever
/// reached. A push on a full queue is rejected and records `capacity + 1` as
/// the peak, which is how an overflow shows up to the application.
pub struct FrameQueue<N: ArrayLength<Frame>> {
    buffer: GenericArray<Frame, N>,
    read_index: usize,
    count: usize,
    peak_count: usize,
}

impl<N: ArrayLength<Frame>> Default for FrameQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: ArrayLength<Frame>> FrameQueue<N> {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self {
            buffer: GenericArray::default(),
            read_index: 0,
            count: 0,
            peak_count: 0,
        }
    }

    /// Maximum number of frames held
    pub fn capacity(&self) -> usize {
        N::USIZE
    }

    /// Current number of frames
    pub fn len(&self) -> usize {
        self.count
    }

    /// `true` if no frame is queued
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `true` if a push would be rejected
    pub fn is_full(&self) -> bool {
        self.count >= self.capacity()
    }

    /// Highest length reached so far, or `capacity + 1` once a push was
    /// rejected
    pub fn peak_count(&self) -> usize {
        self.peak_count
    }

    /// `true` once a push was rejected
    pub fn has_overflowed(&self) -> bool {
        self.peak_count > self.capacity()
    }

    /// Appends `frame`. A full queue hands the frame back.
    pub fn push(&mut self, frame: Frame) -> Result<(), Frame> {
        let capacity = self.capacity();
        if self.count >= capacity {
            self.peak_count = capacity + 1;
            return Err(frame);
        }
        let write_index = (self.read_index + self.count) % capacity;
        self.buffer[write_index] = frame;
        self.count += 1;
        if self.count > self.peak_count {
            self.peak_count = self.count;
        }
        Ok(())
    }

    /// Removes the oldest frame
    pub fn pop(&mut self) -> Option<Frame> {
        if self.count == 0 {
            return None;
        }
        let frame = self.buffer[self.read_index];
        self.read_index = (self.read_index + 1) % self.capacity();
        self.count -= 1;
        Some(frame)
    }
}
