//! Battery voltage monitor.
//!
//! Reads the pack voltage through a resistive divider on one ADC channel and
//! keeps a ring of accepted samples whose mean is the reported voltage.
//!
//! ## Acquisition cycle (at most every 900 ms)
//!
//! | Step | Action                                                               |
//! |------|----------------------------------------------------------------------|
//! | 0    | No sample accepted for >30 s → clear ring, drop cached mean          |
//! | 1    | Take 5 conversions, 2 ms apart; drop any outside 0–20 V              |
//! | 2    | Ring full → drop a sample more than 10 % away from the ring mean     |
//! | 3    | Store accepted samples circularly                                    |
//! | 4    | Ring full → cache the mean                                           |
//! | 5    | Update the low / critical alarms from the cached mean                |
//!
//! Until the ring fills (after boot, a resize, or a stuck reset) the last
//! cached mean is reported with `stale = true`.
//!
//! ## Alarms
//!
//! Each alarm activates below its threshold and clears only above
//! threshold + 0.5 V.  Every activation latches a one-shot event consumed by
//! [`BatteryMonitor::got_low`] / [`BatteryMonitor::got_critical`].  Below
//! 9 V the battery is treated as disconnected and both alarms are cleared.

use embedded_hal::delay::DelayNs;
use log::{info, warn};
use serde::Deserialize;

use crate::app::commands::CommandSection;
use crate::app::ports::{AdcPort, Peripheral};
use crate::app::registry::PeripheralName;
use crate::app::telemetry::{rounded, StateCollector};
use crate::config::{
    threshold_in_range, BatterySettings, BatteryType, ConfigStore, BUFFER_SIZE_RANGE, FLOODED,
    TEMPERATURE_RANGE_C,
};

pub const TYPE_NAME: &str = "BatteryMonitor";

pub const MIN_SAMPLE_VOLTAGE: f32 = 0.0;
pub const MAX_SAMPLE_VOLTAGE: f32 = 20.0;
/// Below this mean the battery is considered disconnected.
pub const DISCONNECTED_BELOW: f32 = 9.0;
pub const SAMPLES_PER_CYCLE: usize = 5;
pub const MIN_CYCLE_INTERVAL_MS: u64 = 900;
pub const SAMPLE_SETTLE_MS: u32 = 2;
/// Relative deviation from the ring mean beyond which a sample is an outlier.
pub const OUTLIER_MARGIN: f32 = 0.10;
/// Longest tolerated run without an accepted sample.
pub const STUCK_TIMEOUT_MS: u64 = 30_000;
pub const HYSTERESIS_V: f32 = 0.5;

/// Flooded lead-acid compensation, volts per °C below 25 °C.
const FLOODED_COMP_V_PER_C: f32 = 0.024;
const REFERENCE_TEMP_C: f32 = 25.0;

/// Analog front-end: ADC reference and divider ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcScaling {
    pub v_ref: f32,
    /// Pack volts per volt at the ADC pin (6.0 for a 1/6 divider).
    pub divider_ratio: f32,
}

impl Default for AdcScaling {
    fn default() -> Self {
        Self {
            v_ref: 3.3,
            divider_ratio: 6.0,
        }
    }
}

/// Reported voltage together with its freshness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageReading {
    /// Ring mean, or the last cached mean while refilling.  `None` until a
    /// mean has ever been computed.
    pub volts: Option<f32>,
    /// The ring is not full; `volts` is the previous cached mean.
    pub stale: bool,
}

/// What happened to one offered sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleVerdict {
    Accepted,
    OutOfRange,
    Outlier,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatteryCounters {
    pub accepted: u32,
    pub rejected_out_of_range: u32,
    pub rejected_outliers: u32,
    pub read_errors: u32,
    pub stuck_resets: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatteryCommand {
    set_low: Option<f32>,
    set_critical: Option<f32>,
    set_buffer_size: Option<u32>,
    set_adjustment: Option<f32>,
    set_temperature: Option<f32>,
    set_battery_type: Option<String>,
    set_battery_voltage: Option<f32>,
}

pub struct BatteryMonitor<A, D> {
    name: PeripheralName,
    adc: A,
    delay: D,
    scaling: AdcScaling,
    settings: BatterySettings,
    store: Option<ConfigStore>,
    began: bool,

    ring: Vec<f32>,
    head: usize,
    fill: usize,
    cached_mean: Option<f32>,
    momentary: Option<f32>,

    last_cycle_ms: Option<u64>,
    last_accept_ms: Option<u64>,

    low: bool,
    critical: bool,
    low_event: bool,
    critical_event: bool,

    counters: BatteryCounters,
}

impl<A: AdcPort, D: DelayNs> BatteryMonitor<A, D> {
    /// Names longer than 32 bytes are truncated.  A `buffer_size` outside
    /// [`BUFFER_SIZE_RANGE`] is clamped into it.
    pub fn new(
        name: &str,
        adc: A,
        delay: D,
        scaling: AdcScaling,
        mut settings: BatterySettings,
    ) -> Self {
        let mut bounded = PeripheralName::new();
        for c in name.chars() {
            if bounded.push(c).is_err() {
                break;
            }
        }
        let clamped = settings
            .buffer_size
            .clamp(BUFFER_SIZE_RANGE.start, BUFFER_SIZE_RANGE.end - 1);
        if clamped != settings.buffer_size {
            warn!(
                "{}: buffer size {} out of range, using {}",
                bounded, settings.buffer_size, clamped
            );
            settings.buffer_size = clamped;
        }
        let capacity = Self::capacity_for(settings.buffer_size);
        Self {
            name: bounded,
            adc,
            delay,
            scaling,
            settings,
            store: None,
            began: false,
            ring: vec![0.0; capacity],
            head: 0,
            fill: 0,
            cached_mean: None,
            momentary: None,
            last_cycle_ms: None,
            last_accept_ms: None,
            low: false,
            critical: false,
            low_event: false,
            critical_event: false,
            counters: BatteryCounters::default(),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    fn capacity_for(buffer_size: u16) -> usize {
        usize::from(buffer_size) * SAMPLES_PER_CYCLE
    }

    // ── Readings ──────────────────────────────────────────────

    pub fn voltage(&self) -> VoltageReading {
        if self.is_full() {
            VoltageReading {
                volts: Some(self.ring_mean()),
                stale: false,
            }
        } else {
            VoltageReading {
                volts: self.cached_mean,
                stale: true,
            }
        }
    }

    pub fn is_low(&self) -> bool {
        self.low
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// `true` once per low-alarm activation.
    pub fn got_low(&mut self) -> bool {
        core::mem::take(&mut self.low_event)
    }

    /// `true` once per critical-alarm activation.
    pub fn got_critical(&mut self) -> bool {
        core::mem::take(&mut self.critical_event)
    }

    pub fn is_connected(&self) -> bool {
        self.cached_mean.is_some_and(|v| v > DISCONNECTED_BELOW)
    }

    pub fn settings(&self) -> &BatterySettings {
        &self.settings
    }

    pub fn counters(&self) -> BatteryCounters {
        self.counters
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    pub fn is_full(&self) -> bool {
        self.fill == self.ring.len()
    }

    fn ring_mean(&self) -> f32 {
        if self.fill == 0 {
            return 0.0;
        }
        self.ring[..self.fill].iter().sum::<f32>() / self.fill as f32
    }

    // ── Configuration ─────────────────────────────────────────

    /// Resize the ring to `buffer_size` cycles.  Clears the ring and restarts
    /// fill tracking; the cached mean is kept and reported as stale.
    /// Returns whether anything changed.
    pub fn set_buffer_size(&mut self, buffer_size: u16) -> bool {
        if !BUFFER_SIZE_RANGE.contains(&buffer_size) {
            warn!("{}: buffer size {} out of range", self.name, buffer_size);
            return false;
        }
        if buffer_size == self.settings.buffer_size {
            return false;
        }
        self.settings.buffer_size = buffer_size;
        self.ring = vec![0.0; Self::capacity_for(buffer_size)];
        self.head = 0;
        self.fill = 0;
        info!("{}: buffer resized to {} samples", self.name, self.ring.len());
        true
    }

    fn apply_settings(&mut self, settings: BatterySettings) {
        let buffer_size = settings.buffer_size;
        let old_size = self.settings.buffer_size;
        self.settings = settings;
        // Let set_buffer_size see the old size so it rebuilds the ring.
        self.settings.buffer_size = old_size;
        self.set_buffer_size(buffer_size);
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&self.name, &self.settings) {
            warn!("{}: could not persist settings ({})", self.name, e);
        }
    }

    // ── Acquisition ───────────────────────────────────────────

    /// Convert a raw conversion to pack volts, including calibration and
    /// temperature compensation.
    pub fn raw_to_volts(&self, raw: u16) -> f32 {
        let full_scale = f32::from(self.adc.full_scale().max(1));
        let volts = f32::from(raw) / full_scale
            * self.scaling.v_ref
            * self.scaling.divider_ratio
            * self.settings.adjustment;
        volts + self.compensation()
    }

    fn compensation(&self) -> f32 {
        if self.settings.battery_type == FLOODED {
            (REFERENCE_TEMP_C - self.settings.temperature_c) * FLOODED_COMP_V_PER_C
        } else {
            0.0
        }
    }

    /// Offer one converted sample to the ring.
    pub fn offer_sample(&mut self, volts: f32, now_ms: u64) -> SampleVerdict {
        if !(MIN_SAMPLE_VOLTAGE..=MAX_SAMPLE_VOLTAGE).contains(&volts) {
            self.counters.rejected_out_of_range += 1;
            return SampleVerdict::OutOfRange;
        }
        if self.is_full() {
            let mean = self.ring_mean();
            if (volts - mean).abs() > OUTLIER_MARGIN * mean {
                self.counters.rejected_outliers += 1;
                return SampleVerdict::Outlier;
            }
        }
        let capacity = self.ring.len();
        self.ring[self.head] = volts;
        self.head = (self.head + 1) % capacity;
        self.fill = (self.fill + 1).min(capacity);
        self.counters.accepted += 1;
        self.last_accept_ms = Some(now_ms);
        SampleVerdict::Accepted
    }

    fn reset_if_stuck(&mut self, now_ms: u64) {
        let Some(last) = self.last_accept_ms else {
            self.last_accept_ms = Some(now_ms);
            return;
        };
        if now_ms.saturating_sub(last) <= STUCK_TIMEOUT_MS {
            return;
        }
        warn!(
            "{}: no sample accepted for {} ms, resetting buffer",
            self.name,
            now_ms - last
        );
        self.head = 0;
        self.fill = 0;
        self.cached_mean = None;
        self.last_accept_ms = Some(now_ms);
        self.counters.stuck_resets += 1;
    }

    fn acquire(&mut self, now_ms: u64) {
        for i in 0..SAMPLES_PER_CYCLE {
            if i > 0 {
                self.delay.delay_ms(SAMPLE_SETTLE_MS);
            }
            let raw = match self.adc.read_raw() {
                Ok(raw) => raw,
                Err(e) => {
                    self.counters.read_errors += 1;
                    log::debug!("{}: {}", self.name, e);
                    continue;
                }
            };
            let volts = self.raw_to_volts(raw);
            self.momentary = Some(volts);
            self.offer_sample(volts, now_ms);
        }
        if self.is_full() {
            self.cached_mean = Some(self.ring_mean());
        }
    }

    fn evaluate_alarms(&mut self) {
        let Some(v) = self.cached_mean else {
            return;
        };
        if v < DISCONNECTED_BELOW {
            self.low = false;
            self.critical = false;
            return;
        }
        let was_low = self.low;
        let was_critical = self.critical;
        step_alarm(&mut self.low, &mut self.low_event, v, self.settings.low_threshold);
        step_alarm(
            &mut self.critical,
            &mut self.critical_event,
            v,
            self.settings.critical_threshold,
        );
        if self.low && !was_low {
            warn!("{}: low battery ({:.2} V)", self.name, v);
        }
        if self.critical && !was_critical {
            warn!("{}: critical battery ({:.2} V)", self.name, v);
        }
    }

    // ── Commands ──────────────────────────────────────────────

    fn handle_command(&mut self, cmd: BatteryCommand) -> bool {
        let mut changed = false;

        if let Some(v) = cmd.set_low {
            if threshold_in_range(v) {
                changed |= replace(&mut self.settings.low_threshold, v);
            } else {
                warn!("{}: setLow {} out of range", self.name, v);
            }
        }
        if let Some(v) = cmd.set_critical {
            if threshold_in_range(v) {
                changed |= replace(&mut self.settings.critical_threshold, v);
            } else {
                warn!("{}: setCritical {} out of range", self.name, v);
            }
        }
        if let Some(n) = cmd.set_buffer_size {
            match u16::try_from(n) {
                Ok(n) => changed |= self.set_buffer_size(n),
                Err(_) => warn!("{}: setBufferSize {} out of range", self.name, n),
            }
        }
        if let Some(v) = cmd.set_adjustment {
            if v > 0.0 && v.is_finite() {
                changed |= replace(&mut self.settings.adjustment, v);
            } else {
                warn!("{}: setAdjustment {} must be > 0", self.name, v);
            }
        }
        if let Some(v) = cmd.set_temperature {
            if TEMPERATURE_RANGE_C.contains(&v) {
                changed |= replace(&mut self.settings.temperature_c, v);
            } else {
                warn!("{}: setTemperature {} out of range", self.name, v);
            }
        }
        if let Some(t) = cmd.set_battery_type.as_deref() {
            match BatteryType::try_from(t) {
                Ok(t) if !t.is_empty() && t != self.settings.battery_type => {
                    self.settings.battery_type = t;
                    changed = true;
                }
                Ok(_) => {}
                Err(()) => warn!("{}: setBatteryType too long", self.name),
            }
        }
        if let Some(v) = cmd.set_battery_voltage {
            if v > 0.0 && v <= MAX_SAMPLE_VOLTAGE {
                changed |= replace(&mut self.settings.nominal_voltage, v);
            }
        }
        changed
    }
}

fn step_alarm(active: &mut bool, event: &mut bool, volts: f32, threshold: f32) {
    if !*active && volts < threshold {
        *active = true;
        *event = true;
    } else if *active && volts > threshold + HYSTERESIS_V {
        *active = false;
    }
}

fn replace(slot: &mut f32, value: f32) -> bool {
    if (*slot - value).abs() < f32::EPSILON {
        return false;
    }
    *slot = value;
    true
}

impl<A: AdcPort, D: DelayNs> Peripheral for BatteryMonitor<A, D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&mut self) {
        if self.began {
            return;
        }
        self.began = true;
        let saved = self
            .store
            .as_ref()
            .and_then(|s| s.load::<BatterySettings>(&self.name));
        if let Some(saved) = saved {
            info!(
                "{}: restored settings (low={:.2} V, critical={:.2} V, buffer={})",
                self.name, saved.low_threshold, saved.critical_threshold, saved.buffer_size
            );
            self.apply_settings(saved);
        }
    }

    fn update(&mut self, now_ms: u64) {
        if let Some(last) = self.last_cycle_ms {
            if now_ms.saturating_sub(last) < MIN_CYCLE_INTERVAL_MS {
                return;
            }
        }
        self.last_cycle_ms = Some(now_ms);

        self.reset_if_stuck(now_ms);
        self.acquire(now_ms);
        self.evaluate_alarms();
    }

    fn add_to_state(&self, state: &mut StateCollector<'_>) {
        let reading = self.voltage();
        state.type_tag(TYPE_NAME);
        state.record("voltage", reading.volts.map(|v| rounded(v, 2)));
        state.record("isStale", reading.stale);
        state.record("isConnected", self.is_connected());
        state.record_rounded("thresholdLow", self.settings.low_threshold, 2);
        state.record_rounded("thresholdCritical", self.settings.critical_threshold, 2);
        state.record("isLow", self.low);
        state.record("isCritical", self.critical);
        state.record("bufferSize", self.settings.buffer_size);
        state.record("bufferFill", self.fill as u64);
        state.record_rounded("adjustment", self.settings.adjustment, 3);
        state.record_rounded("temperature", self.settings.temperature_c, 2);
        state.record("batteryType", self.settings.battery_type.as_str());
        state.record_rounded("batteryVoltage", self.settings.nominal_voltage, 2);
        state.record("momentary", self.momentary.map(|v| rounded(v, 2)));
        state.record("rejectedOutOfRange", self.counters.rejected_out_of_range);
        state.record("rejectedOutliers", self.counters.rejected_outliers);
    }

    fn apply_commands(&mut self, commands: &CommandSection<'_>) {
        let cmd: BatteryCommand = match commands.parse(TYPE_NAME) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("{}: {}", self.name, e);
                return;
            }
        };
        if self.handle_command(cmd) {
            self.persist();
        }
    }
}
