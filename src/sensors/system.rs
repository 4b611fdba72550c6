//! System monitor: heap health, uptime and node-level commands.
//!
//! Reports free heap and the largest allocatable block every exchange.  A
//! largest block under [`FRAGMENTATION_CRITICAL_BYTES`] means the allocator
//! can no longer satisfy a TLS or JSON buffer; the loop reacts with a final
//! exchange and a restart.
//!
//! Commands (`"systemMonitor": {...}`):
//!
//! | Key            | Value     | Effect                                   |
//! |----------------|-----------|------------------------------------------|
//! | `reboot`       | `true`    | restart after the current exchange       |
//! | `sleep`        | ms        | deep sleep after the current exchange    |
//! | `setLoopDelay` | ms        | main loop delay, persisted               |

use log::{info, warn};
use serde::Deserialize;

use crate::app::commands::{number_or_string, CommandSection};
use crate::app::ports::Peripheral;
use crate::app::registry::PeripheralName;
use crate::app::telemetry::StateCollector;
use crate::config::{ConfigStore, SystemSettings, LOOP_DELAY_RANGE_MS};

pub const TYPE_NAME: &str = "SystemMonitor";
pub const FRAGMENTATION_CRITICAL_BYTES: u32 = 4096;
/// Sampling period for the heap counters.
pub const SAMPLE_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub free: u32,
    pub largest_block: u32,
}

impl HeapStats {
    #[cfg(target_os = "espidf")]
    pub fn read(_uptime_secs: u64) -> Self {
        use esp_idf_sys::*;
        let caps = MALLOC_CAP_8BIT;
        let free = unsafe { heap_caps_get_free_size(caps) } as u32;
        let largest_block = unsafe { heap_caps_get_largest_free_block(caps) } as u32;
        Self { free, largest_block }
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn read(uptime_secs: u64) -> Self {
        // Simulated heap shrinks slowly so long host runs see movement.
        let base_free: u32 = 307_200;
        let decay = (uptime_secs / 60) as u32 * 512;
        let free = base_free.saturating_sub(decay);
        Self {
            free,
            largest_block: free / 3,
        }
    }

    pub fn fragmentation_is_critical(&self) -> bool {
        self.largest_block < FRAGMENTATION_CRITICAL_BYTES
    }
}

/// Node-level action requested by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemAction {
    Reboot,
    DeepSleep { duration_ms: u64 },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemCommand {
    reboot: Option<bool>,
    sleep: Option<u64>,
    #[serde(default, deserialize_with = "number_or_string")]
    set_loop_delay: Option<u32>,
}

pub struct SystemMonitor {
    name: PeripheralName,
    device_id: heapless::String<16>,
    settings: SystemSettings,
    store: Option<ConfigStore>,
    probe: fn(u64) -> HeapStats,
    heap: HeapStats,
    last_sample_ms: Option<u64>,
    uptime_ms: u64,
    action: Option<SystemAction>,
    began: bool,
}

impl SystemMonitor {
    pub fn new(name: &str, device_id: &str, settings: SystemSettings) -> Self {
        let mut bounded = PeripheralName::new();
        let _ = bounded.push_str(&name[..floor_char_boundary(name, 32)]);
        let mut id = heapless::String::new();
        let _ = id.push_str(&device_id[..floor_char_boundary(device_id, 16)]);
        Self {
            name: bounded,
            device_id: id,
            settings,
            store: None,
            probe: HeapStats::read,
            heap: HeapStats::default(),
            last_sample_ms: None,
            uptime_ms: 0,
            action: None,
            began: false,
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the heap probe (host tests).
    #[must_use]
    pub fn with_probe(mut self, probe: fn(u64) -> HeapStats) -> Self {
        self.probe = probe;
        self
    }

    pub fn heap(&self) -> HeapStats {
        self.heap
    }

    pub fn loop_delay_ms(&self) -> u32 {
        self.settings.loop_delay_ms
    }

    pub fn fragmentation_is_critical(&self) -> bool {
        self.last_sample_ms.is_some() && self.heap.fragmentation_is_critical()
    }

    /// Pending reboot / sleep request, cleared on read.
    pub fn take_action(&mut self) -> Option<SystemAction> {
        self.action.take()
    }

    fn sample(&mut self, now_ms: u64) {
        self.heap = (self.probe)(now_ms / 1000);
        self.last_sample_ms = Some(now_ms);
        if self.heap.fragmentation_is_critical() {
            warn!(
                "{}: heap fragmented (free={} largest={})",
                self.name, self.heap.free, self.heap.largest_block
            );
        }
    }

    fn handle_command(&mut self, cmd: SystemCommand) -> bool {
        let mut changed = false;
        if let Some(ms) = cmd.set_loop_delay {
            if !LOOP_DELAY_RANGE_MS.contains(&ms) {
                warn!("{}: setLoopDelay {} out of range", self.name, ms);
            } else if ms != self.settings.loop_delay_ms {
                self.settings.loop_delay_ms = ms;
                changed = true;
            }
        }
        if cmd.reboot == Some(true) {
            info!("{}: reboot requested", self.name);
            self.action = Some(SystemAction::Reboot);
        } else if let Some(duration_ms) = cmd.sleep.filter(|ms| *ms > 0) {
            info!("{}: deep sleep for {} ms requested", self.name, duration_ms);
            self.action = Some(SystemAction::DeepSleep { duration_ms });
        }
        changed
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

impl Peripheral for SystemMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) {
        if self.began {
            return;
        }
        self.began = true;
        if let Some(saved) = self
            .store
            .as_ref()
            .and_then(|s| s.load::<SystemSettings>(&self.name))
        {
            info!("{}: loop delay {} ms (saved)", self.name, saved.loop_delay_ms);
            self.settings = saved;
        }
    }

    fn update(&mut self, now_ms: u64) {
        self.uptime_ms = now_ms;
        let due = self
            .last_sample_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= SAMPLE_INTERVAL_MS);
        if due {
            self.sample(now_ms);
        }
    }

    fn add_to_state(&self, state: &mut StateCollector<'_>) {
        state.type_tag(TYPE_NAME);
        state.record("deviceId", self.device_id.as_str());
        state.record("freeHeap", self.heap.free);
        state.record("largestBlock", self.heap.largest_block);
        state.record("fragmented", self.fragmentation_is_critical());
        state.record("uptime", self.uptime_ms / 1000);
        state.record("loopDelay", self.settings.loop_delay_ms);
    }

    fn apply_commands(&mut self, commands: &CommandSection<'_>) {
        let cmd: SystemCommand = match commands.parse(TYPE_NAME) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("{}: {}", self.name, e);
                return;
            }
        };
        if !self.handle_command(cmd) {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.name, &self.settings) {
                warn!("{}: could not persist settings ({})", self.name, e);
            }
        }
    }
}
