//! Port traits: the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Exchanger / peripherals (domain)
//! ```
//!
//! Two families live here:
//!
//! - **Capability ports** ([`Peripheral`], [`Switchable`]) are what every
//!   peripheral driver implements to take part in the exchange cycle.
//! - **Driven ports** ([`BrokerPort`], [`HttpPort`], [`LinkPort`],
//!   [`StoragePort`], [`AdcPort`], [`Clock`]) are implemented by the
//!   adapters in [`crate::adapters`] and by the mocks in the tests.
//!
//! All port errors are typed; callers handle every variant explicitly.

use super::commands::CommandSection;
use super::telemetry::StateCollector;
use crate::error::SensorError;

// ───────────────────────────────────────────────────────────────
// Peripheral capability contract
// ───────────────────────────────────────────────────────────────

/// The contract every registered peripheral fulfils.
///
/// A peripheral only ever sees its own subtree: [`add_to_state`] receives a
/// collector already scoped to [`name`], and [`apply_commands`] receives the
/// section of the command document addressed to it.  It is never called when
/// the document has nothing for it.
///
/// [`update`] must return within a small bounded budget; the whole node runs
/// on one cooperative loop.
///
/// [`add_to_state`]: Peripheral::add_to_state
/// [`apply_commands`]: Peripheral::apply_commands
/// [`name`]: Peripheral::name
/// [`update`]: Peripheral::update
pub trait Peripheral {
    /// Stable unique key used in both telemetry and command documents.
    fn name(&self) -> &str;

    /// One-time initialisation (load persisted settings, configure pins).
    /// Calling it twice has no further effect.
    fn begin(&mut self) {}

    /// Advance internal state.  `now_ms` is the loop's monotonic time.
    fn update(&mut self, _now_ms: u64) {}

    /// Re-apply the last commanded actuator state without new input.
    /// The loop calls this after an exchange genuinely failed.
    fn refresh_state(&mut self) {}

    /// Edge-triggered request for an out-of-band exchange.
    fn should_trigger_exchange(&self) -> bool {
        false
    }

    fn reset_trigger_exchange(&mut self) {}

    /// Append this peripheral's fields to its own telemetry subtree.
    fn add_to_state(&self, state: &mut StateCollector<'_>);

    /// Apply the command subtree addressed to this peripheral.
    /// Unrecognised keys are ignored.
    fn apply_commands(&mut self, _commands: &CommandSection<'_>) {}

    /// Actuator operations, for peripherals that drive an output.
    fn as_switchable(&mut self) -> Option<&mut dyn Switchable> {
        None
    }
}

/// Actuator operations shared by relays, lights and other switched outputs.
pub trait Switchable {
    fn turn_on(&mut self);

    fn turn_off(&mut self);

    fn is_on(&self) -> bool;

    fn toggle(&mut self) {
        if self.is_on() {
            self.turn_off();
        } else {
            self.turn_on();
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Transport ports (driven adapters: domain ↔ controller)
// ───────────────────────────────────────────────────────────────

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe message broker client (MQTT on the target).
pub trait BrokerPort {
    fn is_connected(&self) -> bool;

    /// Open a session.  May block for a bounded connect timeout.
    fn connect(&mut self, url: &str, client_id: &str) -> Result<(), TransportError>;

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Publish `payload`.  `Ok` means the client accepted the message.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Pop the next queued inbound message, if any.
    fn poll(&mut self) -> Option<InboundMessage>;

    fn disconnect(&mut self);
}

/// Request/response transport (HTTP on the target).
pub trait HttpPort {
    /// POST `body` as `application/json` and return the response body.
    ///
    /// Non-2xx statuses are reported as [`TransportError::HttpStatus`].
    /// An empty body is returned as `Ok(vec![])`; the caller decides what
    /// that means.
    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Network link state (WiFi station on the target).
pub trait LinkPort {
    fn is_up(&self) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Platform ports
// ───────────────────────────────────────────────────────────────

/// Monotonic millisecond clock.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// A single ADC channel.
pub trait AdcPort {
    /// One raw conversion.
    fn read_raw(&mut self) -> Result<u16, SensorError>;

    /// Raw value corresponding to the reference voltage.
    fn full_scale(&self) -> u16;
}

// ───────────────────────────────────────────────────────────────
// Storage port (driven adapter: domain ↔ NVS / flash)
// ───────────────────────────────────────────────────────────────

/// Persistent key-value storage.
///
/// - Keys are namespaced to prevent collisions between subsystems.
/// - Write operations MUST be atomic: no partial writes on power loss.
///   The ESP-IDF NVS API guarantees this natively; in-memory simulation
///   achieves it trivially.
pub trait StoragePort {
    /// Read a value.  Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`BrokerPort`] and [`HttpPort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Broker session is not established.
    NotConnected,
    /// Broker or server refused or timed out the connection.
    ConnectFailed,
    /// Broker client rejected the publish or subscribe.
    PublishFailed,
    /// Request could not be sent or the response could not be read.
    RequestFailed,
    /// Server answered with a non-2xx status.
    HttpStatus(u16),
}

/// Errors from persisted-configuration operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Sentinel or version mismatch, or the record failed to decode.
    Corrupted,
    /// A field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
    /// Underlying storage failed.
    Storage(StorageError),
}

/// Errors from [`StoragePort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Generic I/O error.
    IoError,
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "broker not connected"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::PublishFailed => write!(f, "publish rejected"),
            Self::RequestFailed => write!(f, "request failed"),
            Self::HttpStatus(code) => write!(f, "HTTP status {}", code),
        }
    }
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for TransportError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for StorageError {}

impl From<StorageError> for ConfigError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}
