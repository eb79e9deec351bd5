//! Traits needed to call the driver and frame methods
pub use embedded_can::nb::Can as _;
pub use embedded_can::Frame as _;
pub use flexcan_core::Registers as _;
pub use fugit::RateExtU32 as _;
