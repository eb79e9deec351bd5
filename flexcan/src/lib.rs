#![no_std]
#![warn(missing_docs)]
//! # FlexCAN
//!
//! ## Overview
//! This crate provides an interrupt driven driver for the FlexCAN controller
//! found in NXP Kinetis microcontrollers.
//!
//! It provides the following features:
//!
//! - classical CAN 2.0B, standard and extended identifiers, data and remote
//!   frames
//! - a bit timing solver that derives prescaler and segment lengths from a
//!   bitrate, with a tolerance check and a consistency check for hand-edited
//!   values
//! - Rx FIFO acceptance filtering with individually masked *primary* filters
//!   and globally masked *secondary* filters, each with an optional callback
//! - software receive and transmit queues with type-level capacities, shared
//!   with the interrupt handler
//! - listen-only, loop-back and self-reception modes
//!
//! The register file, the interrupt line and the clock and pin setup of a
//! controller are provided through the [`flexcan_core`] traits, which
//! platform-specific HALs are expected to implement.
//!
//! ## Usage
//!
//! The driver is created stopped, usually in a `static` so the interrupt
//! handler can reach it, and started with [`Can::begin`]. Every problem with
//! the configuration is reported in the returned [`BeginErrors`].
//!
//! ```no_run
//! use flexcan::config::CanConfig;
//! use flexcan::filter::{FrameFormat, FrameKind, PrimaryFilter};
//! use flexcan::message::Frame;
//! use flexcan::prelude::*;
//! use flexcan::Can;
//! # use flexcan::core::{Dependencies, InterruptControl, PinConfig, Register, Registers};
//! # struct Regs;
//! # impl Registers for Regs {
//! #     fn read(&self, _: Register) -> u32 { 0 }
//! #     fn write(&self, _: Register, _: u32) {}
//! # }
//! # struct Irq;
//! # unsafe impl InterruptControl for Irq {
//! #     fn set_priority(&self, _: u8) {}
//! #     fn enable(&self) {}
//! #     fn disable(&self) {}
//! #     fn is_enabled(&self) -> bool { false }
//! # }
//! # struct Deps;
//! # unsafe impl Dependencies for Deps {
//! #     fn has_alternate_tx_pin(&self) -> bool { true }
//! #     fn has_alternate_rx_pin(&self) -> bool { true }
//! #     fn configure_pins(&self, _: &PinConfig) {}
//! #     fn enable_clock(&self) {}
//! # }
//!
//! // Safety: CAN0 is only used from the main loop and its own handler
//! static CAN0: Can<Regs, Irq, Deps> = unsafe { Can::new(Regs, Irq, Deps) };
//!
//! fn on_heartbeat(frame: &Frame) {
//!     let _ = frame.data16_le(0);
//! }
//!
//! fn can0_message_handler() {
//!     // Safety: only called from the CAN0 message interrupt
//!     unsafe { CAN0.on_interrupt() }
//! }
//!
//! let filters = [
//!     PrimaryFilter::identifier(FrameKind::Data, FrameFormat::Standard, 0x700)
//!         .with_callback(on_heartbeat),
//! ];
//! let errors = CAN0.begin(&CanConfig::new(500.kHz()), &filters, &[]);
//! assert!(errors.is_empty());
//!
//! let frame = Frame::new(flexcan::embedded_can::StandardId::new(0x123).unwrap(), &[1, 2]).unwrap();
//! CAN0.send(&frame);
//! loop {
//!     CAN0.dispatch_received(None);
//! }
//! ```

pub mod bus;
pub mod config;
pub mod filter;
pub mod interrupt;
pub mod message;
pub mod prelude;
pub mod queue;
pub mod reg;

#[cfg(test)]
mod mock;

pub use crate::bus::{BeginErrors, Can, ControllerState, NotRunning};
pub use embedded_can;
pub use flexcan_core as core;
pub use generic_array;
