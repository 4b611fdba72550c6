//! Persisted configuration.
//!
//! Every component that survives a reboot owns one settings struct here.
//! Values travel to flash as a versioned [`postcard`] record:
//!
//! ```text
//! ┌──────────────┬─────────┬───────────────────────┐
//! │ magic (u32)  │ version │ payload (settings T)  │
//! │ 0xCAFE_BABE  │  (u16)  │                       │
//! └──────────────┴─────────┴───────────────────────┘
//! ```
//!
//! [`ConfigStore::load`] returns `None` on a missing key, a sentinel or
//! version mismatch, a decode failure, or a payload that fails validation.
//! Callers keep their compiled-in defaults in every one of those cases.
//! [`ConfigStore::save`] validates first and then writes the whole record in
//! one atomic NVS commit.

use core::cell::RefCell;
use std::rc::Rc;

use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::app::ports::{ConfigError, StorageError, StoragePort};

/// NVS namespace shared by every persisted component.
pub const CONFIG_NAMESPACE: &str = "homenode";

/// Sentinel marking a record written by this firmware.
pub const RECORD_MAGIC: u32 = 0xCAFE_BABE;

/// ESP-IDF limits NVS keys to 15 bytes.
pub const MAX_KEY_LEN: usize = 15;

const MAX_RECORD_SIZE: usize = 512;

/// Bounded URL string (HTTP endpoint or broker URL).
pub type UrlString = heapless::String<128>;

// ───────────────────────────────────────────────────────────────
// Record framing
// ───────────────────────────────────────────────────────────────

/// A settings type that can be stored through [`ConfigStore`].
pub trait Persisted: Serialize + DeserializeOwned {
    /// Bump whenever the field layout changes; old records are then ignored.
    const VERSION: u16;

    fn validate(&self) -> Result<(), ConfigError>;
}

#[derive(Serialize, Deserialize)]
struct RecordHeader {
    magic: u32,
    version: u16,
}

#[derive(Serialize)]
struct Record<'a, T> {
    magic: u32,
    version: u16,
    payload: &'a T,
}

fn encode<T: Persisted>(settings: &T) -> Result<Vec<u8>, ConfigError> {
    let record = Record {
        magic: RECORD_MAGIC,
        version: T::VERSION,
        payload: settings,
    };
    let bytes = postcard::to_allocvec(&record).map_err(|_| ConfigError::Corrupted)?;
    if bytes.len() > MAX_RECORD_SIZE {
        return Err(ConfigError::ValidationFailed("record exceeds 512 bytes"));
    }
    Ok(bytes)
}

fn decode<T: Persisted>(bytes: &[u8]) -> Result<T, ConfigError> {
    let (header, rest) =
        postcard::take_from_bytes::<RecordHeader>(bytes).map_err(|_| ConfigError::Corrupted)?;
    if header.magic != RECORD_MAGIC || header.version != T::VERSION {
        return Err(ConfigError::Corrupted);
    }
    let payload: T = postcard::from_bytes(rest).map_err(|_| ConfigError::Corrupted)?;
    payload.validate()?;
    Ok(payload)
}

/// Truncate a component name to a valid NVS key.
pub fn storage_key(name: &str) -> &str {
    if name.len() <= MAX_KEY_LEN {
        return name;
    }
    let mut end = MAX_KEY_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// ───────────────────────────────────────────────────────────────
// ConfigStore
// ───────────────────────────────────────────────────────────────

/// Cloneable handle onto the node's storage backend.
///
/// The node is single-threaded, so every component holding a clone shares
/// the one backend through `Rc<RefCell<_>>`.
#[derive(Clone)]
pub struct ConfigStore {
    storage: Rc<RefCell<dyn StoragePort>>,
}

impl ConfigStore {
    pub fn new(storage: Rc<RefCell<dyn StoragePort>>) -> Self {
        Self { storage }
    }

    /// Load the record stored under `name`, or `None` if it is absent or
    /// unusable.  Never mutates anything.
    pub fn load<T: Persisted>(&self, name: &str) -> Option<T> {
        let key = storage_key(name);
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let len = match self.storage.borrow().read(CONFIG_NAMESPACE, key, &mut buf) {
            Ok(len) => len,
            Err(StorageError::NotFound) => {
                info!("ConfigStore: no record for '{}', using defaults", key);
                return None;
            }
            Err(e) => {
                warn!("ConfigStore: read of '{}' failed ({}), using defaults", key, e);
                return None;
            }
        };
        match decode::<T>(&buf[..len]) {
            Ok(settings) => {
                info!("ConfigStore: loaded '{}' ({} bytes)", key, len);
                Some(settings)
            }
            Err(e) => {
                warn!("ConfigStore: record '{}' rejected ({}), using defaults", key, e);
                None
            }
        }
    }

    /// Validate `settings` and persist them under `name`.
    pub fn save<T: Persisted>(&self, name: &str, settings: &T) -> Result<(), ConfigError> {
        settings.validate()?;
        let key = storage_key(name);
        let bytes = encode(settings)?;
        self.storage
            .borrow_mut()
            .write(CONFIG_NAMESPACE, key, &bytes)?;
        info!("ConfigStore: saved '{}' ({} bytes)", key, bytes.len());
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Exchanger settings
// ───────────────────────────────────────────────────────────────

/// Accepted range for the scheduled exchange interval (ms).
pub const EXCHANGE_INTERVAL_RANGE_MS: core::ops::RangeInclusive<u32> = 10_000..=600_000;

/// Transport configuration of the [`Exchanger`](crate::app::exchanger::Exchanger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSettings {
    /// Scheduled exchange period.
    pub interval_ms: u32,
    /// HTTP endpoint; empty disables HTTP.
    pub http_url: UrlString,
    /// Broker URL (`mqtt://host:port`); empty disables the broker.
    pub mqtt_url: UrlString,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            http_url: UrlString::new(),
            mqtt_url: UrlString::new(),
        }
    }
}

impl ExchangeSettings {
    /// Build settings from plain strings, rejecting URLs over 127 bytes.
    pub fn new(interval_ms: u32, http_url: &str, mqtt_url: &str) -> Result<Self, ConfigError> {
        let settings = Self {
            interval_ms,
            http_url: UrlString::try_from(http_url)
                .map_err(|_| ConfigError::ValidationFailed("http_url too long"))?,
            mqtt_url: UrlString::try_from(mqtt_url)
                .map_err(|_| ConfigError::ValidationFailed("mqtt_url too long"))?,
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl Persisted for ExchangeSettings {
    const VERSION: u16 = 1;

    fn validate(&self) -> Result<(), ConfigError> {
        if !EXCHANGE_INTERVAL_RANGE_MS.contains(&self.interval_ms) {
            return Err(ConfigError::ValidationFailed(
                "interval_ms must be 10000–600000",
            ));
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Battery monitor settings
// ───────────────────────────────────────────────────────────────

/// Battery chemistry label (`"flooded"`, `"agm"`, `"lifepo4"`, …).
pub type BatteryType = heapless::String<20>;

/// Chemistry that receives temperature compensation.
pub const FLOODED: &str = "flooded";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatterySettings {
    /// Low-voltage alarm threshold (V).
    pub low_threshold: f32,
    /// Critical-voltage alarm threshold (V).
    pub critical_threshold: f32,
    /// Ring capacity in acquisition cycles.
    pub buffer_size: u16,
    /// Calibration multiplier applied to every converted sample.
    pub adjustment: f32,
    /// Battery temperature used for flooded-cell compensation (°C).
    pub temperature_c: f32,
    /// Nominal pack voltage, reported only.
    pub nominal_voltage: f32,
    pub battery_type: BatteryType,
}

impl Default for BatterySettings {
    fn default() -> Self {
        let mut battery_type = BatteryType::new();
        let _ = battery_type.push_str(FLOODED);
        Self {
            low_threshold: 11.9,
            critical_threshold: 11.5,
            buffer_size: 60,
            adjustment: 1.0,
            temperature_c: 25.0,
            nominal_voltage: 12.0,
            battery_type,
        }
    }
}

/// Thresholds must sit strictly inside this band (V).
pub const THRESHOLD_RANGE_V: (f32, f32) = (9.0, 20.0);
/// Accepted ring size, in cycles.
pub const BUFFER_SIZE_RANGE: core::ops::Range<u16> = 1..1000;
/// Accepted compensation temperature (°C).
pub const TEMPERATURE_RANGE_C: core::ops::RangeInclusive<f32> = -40.0..=85.0;

pub fn threshold_in_range(volts: f32) -> bool {
    volts > THRESHOLD_RANGE_V.0 && volts < THRESHOLD_RANGE_V.1
}

impl Persisted for BatterySettings {
    const VERSION: u16 = 1;

    fn validate(&self) -> Result<(), ConfigError> {
        if !threshold_in_range(self.low_threshold) {
            return Err(ConfigError::ValidationFailed("low_threshold must be 9–20 V"));
        }
        if !threshold_in_range(self.critical_threshold) {
            return Err(ConfigError::ValidationFailed(
                "critical_threshold must be 9–20 V",
            ));
        }
        if !BUFFER_SIZE_RANGE.contains(&self.buffer_size) {
            return Err(ConfigError::ValidationFailed("buffer_size must be 1–999"));
        }
        if !(self.adjustment > 0.0 && self.adjustment.is_finite()) {
            return Err(ConfigError::ValidationFailed("adjustment must be > 0"));
        }
        if !TEMPERATURE_RANGE_C.contains(&self.temperature_c) {
            return Err(ConfigError::ValidationFailed(
                "temperature_c must be -40–85 °C",
            ));
        }
        if !(self.nominal_voltage > 0.0 && self.nominal_voltage <= 20.0) {
            return Err(ConfigError::ValidationFailed("nominal_voltage must be 0–20 V"));
        }
        if self.battery_type.is_empty() {
            return Err(ConfigError::ValidationFailed("battery_type must not be empty"));
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// System monitor settings
// ───────────────────────────────────────────────────────────────

pub const LOOP_DELAY_RANGE_MS: core::ops::RangeInclusive<u32> = 10..=60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Idle time at the end of every main-loop iteration.
    pub loop_delay_ms: u32,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self { loop_delay_ms: 1000 }
    }
}

impl Persisted for SystemSettings {
    const VERSION: u16 = 1;

    fn validate(&self) -> Result<(), ConfigError> {
        if !LOOP_DELAY_RANGE_MS.contains(&self.loop_delay_ms) {
            return Err(ConfigError::ValidationFailed(
                "loop_delay_ms must be 10–60000",
            ));
        }
        Ok(())
    }
}
