//! Unified error types for the HomeNode firmware.
//!
//! Every subsystem returns its own small error enum; each converts into the
//! top-level [`Error`] so the main loop's setup path can funnel them through
//! a single type.  Port-level errors ([`TransportError`], [`StorageError`],
//! [`ConfigError`]) live next to the port traits in
//! [`app::ports`](crate::app::ports).

use core::fmt;

use crate::app::ports::{ConfigError, StorageError, TransportError};

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A sensor could not be read.
    Sensor(SensorError),
    /// Broker or HTTP transport failed.
    Transport(TransportError),
    /// Non-volatile storage failed.
    Storage(StorageError),
    /// A persisted configuration record was rejected.
    Config(ConfigError),
    /// Peripheral registration was refused.
    Registry(RegistryError),
    /// An inbound command document could not be parsed.
    Envelope(EnvelopeError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sensor(e) => write!(f, "sensor: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Registry(e) => write!(f, "registry: {e}"),
            Self::Envelope(e) => write!(f, "envelope: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Sensor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// ADC read returned an error or timed out.
    AdcReadFailed,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdcReadFailed => write!(f, "ADC read failed"),
        }
    }
}

impl std::error::Error for SensorError {}

impl From<SensorError> for Error {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A peripheral with this name is already registered.
    DuplicateName(heapless::String<32>),
    /// Empty, too long, or one of the reserved top-level document keys.
    InvalidName,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName(name) => write!(f, "peripheral '{name}' already registered"),
            Self::InvalidName => write!(f, "invalid peripheral name"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

// ---------------------------------------------------------------------------
// Command envelope errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Payload is not valid JSON.
    Malformed,
    /// Payload is JSON but not an object at the top level.
    NotAnObject,
    /// A peripheral subtree did not match the fields it expects.
    InvalidSection(&'static str),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed JSON"),
            Self::NotAnObject => write!(f, "top level is not an object"),
            Self::InvalidSection(who) => write!(f, "invalid command section for {who}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<EnvelopeError> for Error {
    fn from(e: EnvelopeError) -> Self {
        Self::Envelope(e)
    }
}

// ---------------------------------------------------------------------------
// Port error conversions
// ---------------------------------------------------------------------------

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
