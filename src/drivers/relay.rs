//! Relay / LED output.
//!
//! A single digital output exposed as a [`Switchable`] peripheral.  The
//! commanded state is the source of truth; `refresh_state()` re-drives the
//! pin from it after a failed exchange.

use embedded_hal::digital::OutputPin;
use log::{info, warn};

use crate::app::commands::CommandSection;
use crate::app::ports::{Peripheral, Switchable};
use crate::app::registry::PeripheralName;
use crate::app::telemetry::StateCollector;

pub const TYPE_NAME: &str = "DeviceControl";

pub struct RelayControl<P> {
    name: PeripheralName,
    pin: P,
    active_low: bool,
    on: bool,
}

impl<P: OutputPin> RelayControl<P> {
    pub fn new(name: &str, pin: P) -> Self {
        let mut bounded = PeripheralName::new();
        for c in name.chars() {
            if bounded.push(c).is_err() {
                break;
            }
        }
        Self {
            name: bounded,
            pin,
            active_low: false,
            on: false,
        }
    }

    /// Drive the pin low to switch on.
    #[must_use]
    pub fn active_low(mut self) -> Self {
        self.active_low = true;
        self
    }

    fn drive(&mut self) {
        let high = self.on != self.active_low;
        let res = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if res.is_err() {
            warn!("{}: pin write failed", self.name);
        }
    }

    fn set(&mut self, on: bool) {
        if self.on != on {
            info!("{}: {}", self.name, if on { "on" } else { "off" });
        }
        self.on = on;
        self.drive();
    }
}

impl<P: OutputPin> Switchable for RelayControl<P> {
    fn turn_on(&mut self) {
        self.set(true);
    }

    fn turn_off(&mut self) {
        self.set(false);
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

impl<P: OutputPin> Peripheral for RelayControl<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) {
        self.drive();
    }

    fn refresh_state(&mut self) {
        self.drive();
    }

    fn add_to_state(&self, state: &mut StateCollector<'_>) {
        state.type_tag(TYPE_NAME);
        state.record("isOn", self.on);
    }

    fn apply_commands(&mut self, commands: &CommandSection<'_>) {
        if commands.bool("toggleState") == Some(true) {
            self.toggle();
        } else if let Some(on) = commands.bool("setState") {
            self.set(on);
        }
    }

    fn as_switchable(&mut self) -> Option<&mut dyn Switchable> {
        Some(self)
    }
}
