//! WiFi station-mode adapter.
//!
//! Implements [`LinkPort`]: the Exchanger only asks whether the link is up
//! before it tries to reach the broker.  The main loop calls
//! [`WifiLink::update`] each pass to drive reconnection.
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: `BlockingWifi<EspWifi>` from `esp_idf_svc::wifi`.
//! - **all other targets**: an in-memory link that tests can drop and restore.
//!
//! ## Reconnection policy
//!
//! On disconnect the adapter waits an exponential backoff (2 s → 4 s →
//! 8 s … capped at 60 s) before retrying.

use core::fmt;
use log::{error, info, warn};

use crate::app::ports::LinkPort;

#[cfg(target_os = "espidf")]
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiError {
    InvalidSsid,
    InvalidPassword,
    ConnectionFailed,
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSsid => write!(f, "SSID invalid (must be 1-32 printable ASCII bytes)"),
            Self::InvalidPassword => {
                write!(f, "password invalid (must be 8-64 bytes for WPA2, or empty for open)")
            }
            Self::ConnectionFailed => write!(f, "WiFi connection failed"),
        }
    }
}

impl std::error::Error for WifiError {}

// ── Credentials ───────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WifiCredentials {
    ssid: heapless::String<32>,
    password: heapless::String<64>,
}

impl WifiCredentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, WifiError> {
        validate_ssid(ssid)?;
        validate_password(password)?;
        Ok(Self {
            ssid: heapless::String::try_from(ssid).map_err(|_| WifiError::InvalidSsid)?,
            password: heapless::String::try_from(password)
                .map_err(|_| WifiError::InvalidPassword)?,
        })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

fn validate_ssid(ssid: &str) -> Result<(), WifiError> {
    if ssid.is_empty() || ssid.len() > 32 || !ssid.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
        return Err(WifiError::InvalidSsid);
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), WifiError> {
    if !password.is_empty() && !(8..=64).contains(&password.len()) {
        return Err(WifiError::InvalidPassword);
    }
    Ok(())
}

// ── Link state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiState {
    Down,
    Up,
    Reconnecting { attempt: u32, retry_at_ms: u64 },
}

pub const INITIAL_BACKOFF_MS: u64 = 2_000;
pub const MAX_BACKOFF_MS: u64 = 60_000;

pub struct WifiLink {
    credentials: WifiCredentials,
    state: WifiState,
    backoff_ms: u64,
    #[cfg(target_os = "espidf")]
    wifi: BlockingWifi<EspWifi<'static>>,
    #[cfg(not(target_os = "espidf"))]
    sim_available: bool,
}

impl WifiLink {
    #[cfg(target_os = "espidf")]
    pub fn new(wifi: BlockingWifi<EspWifi<'static>>, credentials: WifiCredentials) -> Self {
        Self {
            credentials,
            state: WifiState::Down,
            backoff_ms: INITIAL_BACKOFF_MS,
            wifi,
        }
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn new(credentials: WifiCredentials) -> Self {
        Self {
            credentials,
            state: WifiState::Down,
            backoff_ms: INITIAL_BACKOFF_MS,
            sim_available: true,
        }
    }

    pub fn state(&self) -> WifiState {
        self.state
    }

    /// First connection attempt.  A failure is not fatal; `update()` keeps
    /// retrying with backoff.
    pub fn begin(&mut self, now_ms: u64) {
        info!("WiFi: connecting to '{}'", self.credentials.ssid());
        self.attempt(0, now_ms);
    }

    /// Drive the reconnect state machine.
    pub fn update(&mut self, now_ms: u64) {
        match self.state {
            WifiState::Up => {
                if !self.platform_is_connected() {
                    warn!("WiFi: connection lost, entering reconnect");
                    self.backoff_ms = INITIAL_BACKOFF_MS;
                    self.state = WifiState::Reconnecting {
                        attempt: 0,
                        retry_at_ms: now_ms + self.backoff_ms,
                    };
                }
            }
            WifiState::Reconnecting {
                attempt,
                retry_at_ms,
            } if now_ms >= retry_at_ms => {
                info!(
                    "WiFi: reconnect attempt {} (backoff {} ms)",
                    attempt + 1,
                    self.backoff_ms
                );
                self.attempt(attempt + 1, now_ms);
            }
            WifiState::Down => self.attempt(0, now_ms),
            WifiState::Reconnecting { .. } => {}
        }
    }

    fn attempt(&mut self, attempt: u32, now_ms: u64) {
        match self.platform_connect() {
            Ok(()) => {
                info!("WiFi: connected");
                self.state = WifiState::Up;
                self.backoff_ms = INITIAL_BACKOFF_MS;
            }
            Err(e) => {
                error!("WiFi: {}", e);
                if attempt > 0 {
                    self.backoff_ms = (self.backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
                self.state = WifiState::Reconnecting {
                    attempt,
                    retry_at_ms: now_ms + self.backoff_ms,
                };
            }
        }
    }

    // ── Platform-specific ─────────────────────────────────────

    #[cfg(target_os = "espidf")]
    fn platform_connect(&mut self) -> Result<(), WifiError> {
        let ssid = self
            .credentials
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| WifiError::InvalidSsid)?;
        let password = self
            .credentials
            .password
            .as_str()
            .try_into()
            .map_err(|_| WifiError::InvalidPassword)?;
        let auth_method = if self.credentials.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let config = Configuration::Client(ClientConfiguration {
            ssid,
            password,
            auth_method,
            ..Default::default()
        });

        let result = (|| {
            self.wifi.set_configuration(&config)?;
            if !self.wifi.is_started()? {
                self.wifi.start()?;
            }
            self.wifi.connect()?;
            self.wifi.wait_netif_up()
        })();
        result.map_err(|e| {
            warn!("WiFi(espidf): {}", e);
            let _ = self.wifi.disconnect();
            WifiError::ConnectionFailed
        })
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_connect(&mut self) -> Result<(), WifiError> {
        if self.sim_available {
            Ok(())
        } else {
            Err(WifiError::ConnectionFailed)
        }
    }

    #[cfg(target_os = "espidf")]
    fn platform_is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_is_connected(&self) -> bool {
        self.sim_available
    }

    /// Simulate the access point going away or coming back.
    #[cfg(not(target_os = "espidf"))]
    pub fn sim_set_available(&mut self, available: bool) {
        self.sim_available = available;
    }
}

impl LinkPort for WifiLink {
    fn is_up(&self) -> bool {
        self.state == WifiState::Up
    }
}
