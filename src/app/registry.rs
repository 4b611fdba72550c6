//! Peripheral registry.
//!
//! Append-only, iterated in registration order.  Built once during setup;
//! the loop and the [`Exchanger`](super::exchanger::Exchanger) only read it
//! afterwards.  Handles are `Rc<RefCell<_>>` so the loop can keep typed
//! references to the peripherals it reacts to (battery, buttons) while the
//! registry holds the same objects behind `dyn Peripheral`.

use core::cell::RefCell;
use std::rc::Rc;

use log::{info, warn};

use super::commands::ACK_ID_KEY;
use super::exchanger::EXCHANGER_NAME;
use super::ports::Peripheral;
use super::telemetry::ACK_KEY;
use crate::error::RegistryError;

/// Bounded peripheral name.
pub type PeripheralName = heapless::String<32>;

/// Shared, type-erased peripheral handle.
pub type PeripheralHandle = Rc<RefCell<dyn Peripheral>>;

struct Entry {
    name: PeripheralName,
    handle: PeripheralHandle,
}

#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under the name it reports.
    ///
    /// Names must be unique, 1–32 bytes, and must not collide with the
    /// reserved top-level document keys.
    pub fn register(&mut self, handle: PeripheralHandle) -> Result<(), RegistryError> {
        let name = {
            let p = handle.borrow();
            let raw = p.name();
            if raw.is_empty() || [ACK_KEY, ACK_ID_KEY, EXCHANGER_NAME].contains(&raw) {
                return Err(RegistryError::InvalidName);
            }
            PeripheralName::try_from(raw).map_err(|_| RegistryError::InvalidName)?
        };
        if self.contains(&name) {
            warn!("Registry: duplicate peripheral '{}' rejected", name);
            return Err(RegistryError::DuplicateName(name));
        }
        info!("Registry: registered '{}' (#{})", name, self.entries.len());
        self.entries.push(Entry { name, handle });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&PeripheralHandle> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, handle)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PeripheralHandle)> {
        self.entries.iter().map(|e| (e.name.as_str(), &e.handle))
    }

    /// Call `begin()` on every peripheral.
    pub fn begin_all(&self) {
        for (_, handle) in self.iter() {
            handle.borrow_mut().begin();
        }
    }

    /// Call `update()` on every peripheral.
    pub fn update_all(&self, now_ms: u64) {
        for (_, handle) in self.iter() {
            handle.borrow_mut().update(now_ms);
        }
    }

    /// Call `refresh_state()` on every peripheral.
    pub fn refresh_all(&self) {
        for (_, handle) in self.iter() {
            handle.borrow_mut().refresh_state();
        }
    }

    /// Name of the first peripheral requesting an exchange, clearing its flag.
    pub fn take_trigger(&self) -> Option<PeripheralName> {
        for (name, handle) in self.iter() {
            let mut p = handle.borrow_mut();
            if p.should_trigger_exchange() {
                p.reset_trigger_exchange();
                return PeripheralName::try_from(name).ok();
            }
        }
        None
    }

    /// Turn off every switchable peripheral named in `group`.
    /// Returns how many were switched.
    pub fn turn_off_group(&self, group: &[&str]) -> usize {
        let mut switched = 0;
        for name in group {
            let Some(handle) = self.get(name) else {
                warn!("Registry: no peripheral '{}' to switch off", name);
                continue;
            };
            let mut p = handle.borrow_mut();
            if let Some(sw) = p.as_switchable() {
                if sw.is_on() {
                    sw.turn_off();
                }
                switched += 1;
            }
        }
        switched
    }
}
