//! Application core: the telemetry & command exchange, zero direct I/O.
//!
//! Peripherals implement the capability ports in [`ports`] and are held in
//! the [`registry`].  The [`exchanger`] builds a [`telemetry`] snapshot from
//! them each cycle and routes the [`commands`] the controller sends back.
//! All transport and storage access goes through port traits, keeping this
//! layer fully testable without real peripherals.

pub mod commands;
pub mod context;
pub mod exchanger;
pub mod ports;
pub mod registry;
pub mod telemetry;
