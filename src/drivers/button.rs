//! Polled, debounced push-button monitor.
//!
//! ## Hardware
//!
//! Momentary wall switch on a GPIO with pull-up (active-low) or pull-down
//! (active-high).  The pin is sampled from the main loop through
//! `Peripheral::update()`.
//!
//! ## Debounce
//!
//! A raw level must hold for [`DEBOUNCE_MS`] before it becomes the stable
//! state.  A stable released → pressed edge:
//!
//! | Effect            | Consumed by                                    |
//! |-------------------|------------------------------------------------|
//! | `pressed` latched | `take_pressed()` (main loop, local relay flip)  |
//! | trigger flag set  | `Registry::take_trigger()` (forced exchange)    |
//!
//! Releases are not reported.

use embedded_hal::digital::InputPin;
use log::{debug, info, warn};

use crate::app::commands::CommandSection;
use crate::app::ports::Peripheral;
use crate::app::registry::PeripheralName;
use crate::app::telemetry::StateCollector;

pub const TYPE_NAME: &str = "PushButtonMonitor";
pub const DEBOUNCE_MS: u64 = 50;

/// Electrical polarity of the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ActiveLow,
    ActiveHigh,
}

pub struct PushButtonMonitor<P> {
    name: PeripheralName,
    pin: P,
    polarity: Polarity,
    /// Relay toggled locally on press when `local_action` is set.
    target: Option<PeripheralName>,
    local_action: bool,

    raw_pressed: bool,
    stable_pressed: bool,
    last_change_ms: u64,

    pressed_event: bool,
    trigger: bool,
}

impl<P: InputPin> PushButtonMonitor<P> {
    pub fn new(name: &str, pin: P, polarity: Polarity) -> Self {
        Self {
            name: bounded(name),
            pin,
            polarity,
            target: None,
            local_action: true,
            raw_pressed: false,
            stable_pressed: false,
            last_change_ms: 0,
            pressed_event: false,
            trigger: false,
        }
    }

    /// Relay this switch flips locally.
    #[must_use]
    pub fn controlling(mut self, relay: &str) -> Self {
        self.target = Some(bounded(relay));
        self
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn local_action(&self) -> bool {
        self.local_action
    }

    pub fn set_local_action(&mut self, enabled: bool) {
        self.local_action = enabled;
    }

    pub fn is_pressed(&self) -> bool {
        self.stable_pressed
    }

    /// `true` once per debounced press.
    pub fn take_pressed(&mut self) -> bool {
        core::mem::take(&mut self.pressed_event)
    }

    fn sample(&mut self) -> Option<bool> {
        match self.pin.is_high() {
            Ok(high) => Some(match self.polarity {
                Polarity::ActiveLow => !high,
                Polarity::ActiveHigh => high,
            }),
            Err(_) => {
                warn!("{}: pin read failed", self.name);
                None
            }
        }
    }
}

fn bounded(name: &str) -> PeripheralName {
    let mut out = PeripheralName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

impl<P: InputPin> Peripheral for PushButtonMonitor<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) {
        if let Some(pressed) = self.sample() {
            // Adopt the boot level without generating an edge.
            self.raw_pressed = pressed;
            self.stable_pressed = pressed;
        }
    }

    fn update(&mut self, now_ms: u64) {
        let Some(pressed) = self.sample() else {
            return;
        };
        if pressed != self.raw_pressed {
            self.raw_pressed = pressed;
            self.last_change_ms = now_ms;
            return;
        }
        if pressed == self.stable_pressed
            || now_ms.saturating_sub(self.last_change_ms) < DEBOUNCE_MS
        {
            return;
        }
        self.stable_pressed = pressed;
        if pressed {
            info!("{}: pressed", self.name);
            self.pressed_event = true;
            self.trigger = true;
        } else {
            debug!("{}: released", self.name);
        }
    }

    fn should_trigger_exchange(&self) -> bool {
        self.trigger
    }

    fn reset_trigger_exchange(&mut self) {
        self.trigger = false;
    }

    fn add_to_state(&self, state: &mut StateCollector<'_>) {
        state.type_tag(TYPE_NAME);
        state.record("isPressed", self.stable_pressed);
        state.record("localAction", self.local_action);
    }

    fn apply_commands(&mut self, commands: &CommandSection<'_>) {
        if let Some(enabled) = commands.bool("localAction") {
            if enabled != self.local_action {
                info!("{}: localAction -> {}", self.name, enabled);
            }
            self.local_action = enabled;
        }
    }
}
