//! HomeNode firmware library.
//!
//! Exposes the node logic for the binary and for host-side integration
//! tests. All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module, with a simulation
//! backend on every other target.

#![deny(unused_must_use)]

pub mod app;
pub mod config;
pub mod error;
pub mod pins;

pub mod adapters;
pub mod drivers;
pub mod sensors;
