//! Sensing peripherals.

pub mod battery;
pub mod system;
