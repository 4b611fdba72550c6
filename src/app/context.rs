//! Node context: everything the cycle needs that is not owned by a
//! single component.
//!
//! Built once in `main` and passed by reference into the
//! [`Exchanger`](super::exchanger::Exchanger) and the loop.

use super::ports::{Clock, LinkPort};
use super::registry::Registry;
use crate::adapters::device_id::DeviceIdString;

pub struct NodeContext<L, C> {
    device_id: DeviceIdString,
    registry: Registry,
    link: L,
    clock: C,
}

impl<L: LinkPort, C: Clock> NodeContext<L, C> {
    pub fn new(device_id: DeviceIdString, link: L, clock: C) -> Self {
        Self {
            device_id,
            registry: Registry::new(),
            link,
            clock,
        }
    }

    pub fn device_id(&self) -> &str {
        self.device_id.as_str()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}
