//! GPIO / ADC assignments for the HomeNode board (ESP32-S3).
//!
//! Single source of truth: drivers and `main` reference these constants
//! rather than hard-coding pin numbers.

// ---------------------------------------------------------------------------
// Battery sense (ADC1, resistive divider 1/6)
// ---------------------------------------------------------------------------

/// Divider tap on GPIO 4 = ADC1 channel 3.
pub const BATTERY_ADC_GPIO: i32 = 4;
pub const BATTERY_ADC_CHANNEL: u32 = 3;
/// Effective full-scale voltage at 12 dB attenuation.
pub const BATTERY_ADC_VREF: f32 = 3.3;
/// Pack volts per volt at the ADC pin (100 kΩ / 20 kΩ divider).
pub const BATTERY_DIVIDER_RATIO: f32 = 6.0;

// ---------------------------------------------------------------------------
// Relay outputs (active HIGH)
// ---------------------------------------------------------------------------

pub const LIGHT_INSIDE_GPIO: i32 = 5;
pub const LIGHT_OUTSIDE_GPIO: i32 = 6;
/// Status LED, lit while a network exchange is in progress.
pub const STATUS_LED_GPIO: i32 = 7;

// ---------------------------------------------------------------------------
// Wall switches (active-low, internal pull-up)
// ---------------------------------------------------------------------------

pub const SWITCH_INSIDE_GPIO: i32 = 15;
pub const SWITCH_OUTSIDE_GPIO: i32 = 16;

pub const OUTPUT_PINS: [i32; 3] = [LIGHT_INSIDE_GPIO, LIGHT_OUTSIDE_GPIO, STATUS_LED_GPIO];
pub const INPUT_PINS: [i32; 2] = [SWITCH_INSIDE_GPIO, SWITCH_OUTSIDE_GPIO];
