//! Hardware adapter: board pins and the battery ADC behind the traits the
//! peripherals are generic over.
//!
//! | Type          | Implements                         | Backed by                 |
//! |---------------|------------------------------------|---------------------------|
//! | `GpioInput`   | `embedded_hal::digital::InputPin`  | `hw_init::gpio_read`      |
//! | `GpioOutput`  | `embedded_hal::digital::OutputPin` | `hw_init::gpio_write`     |
//! | `OneshotAdc`  | `AdcPort`                          | `hw_init::adc1_read`      |
//! | `BoardDelay`  | `embedded_hal::delay::DelayNs`     | FreeRTOS / `thread::sleep`|
//!
//! `hw_init` carries the cfg split, so these types are identical on target
//! and on the host.

use core::convert::Infallible;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin, StatefulOutputPin};

use crate::app::ports::AdcPort;
use crate::drivers::hw_init;
use crate::error::SensorError;

// ── GPIO ──────────────────────────────────────────────────────

/// A GPIO configured as input by `hw_init::init_peripherals`.
#[derive(Debug, Clone, Copy)]
pub struct GpioInput {
    gpio: i32,
}

impl GpioInput {
    pub fn new(gpio: i32) -> Self {
        Self { gpio }
    }
}

impl ErrorType for GpioInput {
    type Error = Infallible;
}

impl InputPin for GpioInput {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(hw_init::gpio_read(self.gpio))
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!hw_init::gpio_read(self.gpio))
    }
}

/// A GPIO configured as output by `hw_init::init_peripherals`.
#[derive(Debug, Clone, Copy)]
pub struct GpioOutput {
    gpio: i32,
}

impl GpioOutput {
    pub fn new(gpio: i32) -> Self {
        Self { gpio }
    }
}

impl ErrorType for GpioOutput {
    type Error = Infallible;
}

impl OutputPin for GpioOutput {
    fn set_low(&mut self) -> Result<(), Infallible> {
        hw_init::gpio_write(self.gpio, false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        hw_init::gpio_write(self.gpio, true);
        Ok(())
    }
}

impl StatefulOutputPin for GpioOutput {
    fn is_set_high(&mut self) -> Result<bool, Infallible> {
        Ok(hw_init::gpio_read(self.gpio))
    }

    fn is_set_low(&mut self) -> Result<bool, Infallible> {
        Ok(!hw_init::gpio_read(self.gpio))
    }
}

// ── ADC ───────────────────────────────────────────────────────

/// One ADC1 channel in oneshot mode.
#[derive(Debug, Clone, Copy)]
pub struct OneshotAdc {
    channel: u32,
}

impl OneshotAdc {
    pub fn new(channel: u32) -> Self {
        Self { channel }
    }
}

impl AdcPort for OneshotAdc {
    fn read_raw(&mut self) -> Result<u16, SensorError> {
        hw_init::adc1_read(self.channel).ok_or(SensorError::AdcReadFailed)
    }

    fn full_scale(&self) -> u16 {
        hw_init::ADC1_FULL_SCALE
    }
}

// ── Delay ─────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub type BoardDelay = esp_idf_hal::delay::FreeRtos;

/// Host stand-in for the FreeRTOS delay.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct BoardDelay;

#[cfg(not(target_os = "espidf"))]
impl embedded_hal::delay::DelayNs for BoardDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(core::time::Duration::from_nanos(u64::from(ns)));
    }
}
