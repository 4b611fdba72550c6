//! Exchanger: scheduled telemetry out, commands in.
//!
//! One call to [`Exchanger::exchange`] runs a full cycle:
//!
//! ```text
//!  ┌────────────────────┐   broker URL set, link up, ≥5 s since last try
//!  │ 1. broker upkeep   │── reconnect + subscribe, drain inbound commands
//!  └─────────┬──────────┘
//!  ┌─────────▼──────────┐   not forced and interval not elapsed
//!  │ 2. interval gate   │────────────────────────────────▶ NotDue
//!  └─────────┬──────────┘
//!  ┌─────────▼──────────┐
//!  │ 3. snapshot        │   own subtree + every peripheral, pending "ack"
//!  └─────────┬──────────┘
//!  ┌─────────▼──────────┐   broker connected & publish accepted
//!  │ 4. transmit        │────────────────────────────────▶ Published
//!  └─────────┬──────────┘
//!            │ HTTP POST (fallback, or the only transport)
//!  ┌─────────▼──────────┐   error / non-2xx / empty body
//!  │ 5. response        │────────────────────────────────▶ Failed
//!  └─────────┬──────────┘
//!            └─ parse envelope, dispatch per peripheral ───▶ Posted
//! ```
//!
//! A command that arrives over the broker carrying an `ackId` causes one
//! extra forced cycle (trigger `"commandAck"`) at the end of the same call,
//! so the controller sees the acknowledgment without waiting a full interval.
//!
//! | Topic                          | Direction | Payload            |
//! |--------------------------------|-----------|--------------------|
//! | `homenode/<device>/data`       | publish   | telemetry document |
//! | `homenode/<device>/command`    | subscribe | command document   |

use log::{debug, info, warn};
use serde::Deserialize;

use super::commands::{number_or_string, CommandEnvelope, CommandSection};
use super::context::NodeContext;
use super::ports::{BrokerPort, Clock, HttpPort, LinkPort};
use super::telemetry::{StateCollector, TelemetrySnapshot};
use crate::config::{ConfigStore, ExchangeSettings, UrlString, EXCHANGE_INTERVAL_RANGE_MS};
use crate::error::EnvelopeError;

/// The Exchanger's own key in both documents.
pub const EXCHANGER_NAME: &str = "dataExchanger";
pub const EXCHANGER_TYPE: &str = "DataExchanger";

/// Trigger reported by the acknowledgment follow-up cycle.
pub const ACK_REASON: &str = "commandAck";

/// Minimum spacing between broker connection attempts.
pub const RECONNECT_INTERVAL_MS: u64 = 5_000;

/// Inbound broker messages handled per call.
pub const MAX_INBOUND_PER_CALL: usize = 8;

/// URLs must fit the persisted 128-byte field with room to spare.
pub const MAX_URL_LEN: usize = 127;

const TOPIC_PREFIX: &str = "homenode";

// ───────────────────────────────────────────────────────────────
// Outcome
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Interval not elapsed; no transport was touched.
    NotDue,
    /// Broker accepted the telemetry publish.
    Published,
    /// HTTP endpoint answered with a non-empty body.
    Posted,
    /// No transport delivered the document.
    Failed,
}

impl ExchangeOutcome {
    /// `false` only for a genuine transport failure.
    pub fn succeeded(self) -> bool {
        !matches!(self, Self::Failed)
    }

    /// A document actually left the node.
    pub fn transmitted(self) -> bool {
        matches!(self, Self::Published | Self::Posted)
    }
}

/// Per-device broker topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub data: String,
    pub command: String,
}

impl Topics {
    pub fn for_device(device_id: &str) -> Self {
        Self {
            data: format!("{TOPIC_PREFIX}/{device_id}/data"),
            command: format!("{TOPIC_PREFIX}/{device_id}/command"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsCommand {
    #[serde(default, deserialize_with = "number_or_string")]
    set_interval: Option<u32>,
    set_url: Option<String>,
    set_mqtt_url: Option<String>,
}

// ───────────────────────────────────────────────────────────────
// Exchanger
// ───────────────────────────────────────────────────────────────

pub struct Exchanger<B, H> {
    settings: ExchangeSettings,
    store: Option<ConfigStore>,
    broker: B,
    http: H,
    last_cycle_ms: u64,
    last_connect_attempt_ms: Option<u64>,
    pending_ack: Option<String>,
    began: bool,
}

impl<B: BrokerPort, H: HttpPort> Exchanger<B, H> {
    pub fn new(settings: ExchangeSettings, broker: B, http: H) -> Self {
        Self {
            settings,
            store: None,
            broker,
            http,
            last_cycle_ms: 0,
            last_connect_attempt_ms: None,
            pending_ack: None,
            began: false,
        }
    }

    /// Persist accepted setting changes through `store`.
    #[must_use]
    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the compiled-in settings with the persisted record, if one
    /// is valid.  Idempotent.
    pub fn begin(&mut self) {
        if self.began {
            return;
        }
        self.began = true;
        if let Some(saved) = self
            .store
            .as_ref()
            .and_then(|s| s.load::<ExchangeSettings>(EXCHANGER_NAME))
        {
            info!(
                "Exchanger: restored settings (interval={} ms, url='{}', mqtt='{}')",
                saved.interval_ms, saved.http_url, saved.mqtt_url
            );
            self.settings = saved;
        }
    }

    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    /// Delivery id waiting to be echoed in the next document.
    pub fn pending_ack(&self) -> Option<&str> {
        self.pending_ack.as_deref()
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn http(&self) -> &H {
        &self.http
    }

    pub fn http_mut(&mut self) -> &mut H {
        &mut self.http
    }

    fn broker_configured(&self) -> bool {
        !self.settings.mqtt_url.is_empty()
    }

    // ── Cycle ─────────────────────────────────────────────────

    /// Run one exchange cycle.  See the module docs for the sequence.
    pub fn exchange<L: LinkPort, C: Clock>(
        &mut self,
        node: &NodeContext<L, C>,
        force: bool,
        reason: Option<&str>,
    ) -> ExchangeOutcome {
        let topics = Topics::for_device(node.device_id());
        let ack_requested = self.service_broker(node, &topics);

        let outcome = self.cycle(node, &topics, force, reason);

        // The scheduled cycle may already have carried the ack.
        if ack_requested && self.pending_ack.is_some() {
            info!("Exchanger: acknowledging broker command");
            return self.cycle(node, &topics, true, Some(ACK_REASON));
        }
        outcome
    }

    fn cycle<L: LinkPort, C: Clock>(
        &mut self,
        node: &NodeContext<L, C>,
        topics: &Topics,
        force: bool,
        reason: Option<&str>,
    ) -> ExchangeOutcome {
        let now = node.now_ms();
        if !force && now.saturating_sub(self.last_cycle_ms) < u64::from(self.settings.interval_ms) {
            return ExchangeOutcome::NotDue;
        }
        self.last_cycle_ms = now;

        let trigger = match reason {
            Some(r) if !r.is_empty() => r,
            _ if force => "forced",
            _ => "scheduled",
        };

        let body = match self.snapshot(node, trigger).to_bytes() {
            Ok(body) => body,
            Err(e) => {
                warn!("Exchanger: could not serialize snapshot ({})", e);
                return ExchangeOutcome::Failed;
            }
        };

        if self.broker_configured() && self.broker.is_connected() {
            match self.broker.publish(&topics.data, &body) {
                Ok(()) => {
                    debug!("Exchanger: published {} bytes ({})", body.len(), trigger);
                    self.pending_ack = None;
                    return ExchangeOutcome::Published;
                }
                Err(e) => warn!("Exchanger: publish failed ({}), trying HTTP", e),
            }
        }

        if self.settings.http_url.is_empty() {
            warn!("Exchanger: no usable transport for '{}' cycle", trigger);
            return ExchangeOutcome::Failed;
        }

        match self.http.post_json(&self.settings.http_url, &body) {
            Ok(response) if response.is_empty() => {
                warn!("Exchanger: empty HTTP response");
                ExchangeOutcome::Failed
            }
            Ok(response) => {
                debug!("Exchanger: posted {} bytes, {} back", body.len(), response.len());
                self.pending_ack = None;
                if let Err(e) = self.dispatch(node, &response) {
                    warn!("Exchanger: discarding HTTP response ({})", e);
                }
                ExchangeOutcome::Posted
            }
            Err(e) => {
                warn!("Exchanger: HTTP POST failed ({})", e);
                ExchangeOutcome::Failed
            }
        }
    }

    // ── Broker upkeep ─────────────────────────────────────────

    /// Reconnect if due and drain the inbound queue.
    /// Returns `true` if a drained command asked for an acknowledgment.
    fn service_broker<L: LinkPort, C: Clock>(
        &mut self,
        node: &NodeContext<L, C>,
        topics: &Topics,
    ) -> bool {
        if !self.broker_configured() {
            if self.broker.is_connected() {
                self.broker.disconnect();
            }
            return false;
        }

        if !self.broker.is_connected() {
            self.try_connect(node, topics);
            if !self.broker.is_connected() {
                return false;
            }
        }

        let mut ack_requested = false;
        for _ in 0..MAX_INBOUND_PER_CALL {
            let Some(message) = self.broker.poll() else {
                break;
            };
            if message.topic != topics.command {
                debug!("Exchanger: ignoring message on '{}'", message.topic);
                continue;
            }
            match self.dispatch(node, &message.payload) {
                Ok(has_ack) => ack_requested |= has_ack,
                Err(e) => warn!("Exchanger: discarding broker command ({})", e),
            }
        }
        ack_requested
    }

    fn try_connect<L: LinkPort, C: Clock>(&mut self, node: &NodeContext<L, C>, topics: &Topics) {
        if !node.link().is_up() {
            return;
        }
        let now = node.now_ms();
        if let Some(last) = self.last_connect_attempt_ms {
            if now.saturating_sub(last) < RECONNECT_INTERVAL_MS {
                return;
            }
        }
        self.last_connect_attempt_ms = Some(now);

        info!("Exchanger: connecting to broker '{}'", self.settings.mqtt_url);
        if let Err(e) = self.broker.connect(&self.settings.mqtt_url, node.device_id()) {
            warn!("Exchanger: broker connect failed ({})", e);
            return;
        }
        if let Err(e) = self.broker.subscribe(&topics.command) {
            warn!("Exchanger: subscribe to '{}' failed ({})", topics.command, e);
            self.broker.disconnect();
            return;
        }
        info!("Exchanger: broker connected, listening on '{}'", topics.command);
    }

    // ── Snapshot & dispatch ───────────────────────────────────

    fn snapshot<L: LinkPort, C: Clock>(
        &self,
        node: &NodeContext<L, C>,
        trigger: &str,
    ) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot::new();
        self.add_own_state(&mut snapshot.collector(EXCHANGER_NAME), trigger);

        for (name, handle) in node.registry().iter() {
            if name == EXCHANGER_NAME {
                warn!("Exchanger: peripheral '{}' shadows the exchanger key, skipped", name);
                continue;
            }
            match handle.try_borrow() {
                Ok(p) => p.add_to_state(&mut snapshot.collector(name)),
                Err(_) => warn!("Exchanger: '{}' busy, left out of snapshot", name),
            }
        }

        if let Some(ack) = &self.pending_ack {
            snapshot.set_ack(ack);
        }
        snapshot
    }

    fn add_own_state(&self, state: &mut StateCollector<'_>, trigger: &str) {
        state.type_tag(EXCHANGER_TYPE);
        state.record("interval", self.settings.interval_ms);
        state.record("url", self.settings.http_url.as_str());
        state.record("mqttUrl", self.settings.mqtt_url.as_str());
        state.record("mqttConnected", self.broker.is_connected());
        state.record("trigger", trigger);
    }

    /// Parse `payload` and hand each subtree to its owner.
    /// Returns whether the envelope carried an `ackId`.
    fn dispatch<L: LinkPort, C: Clock>(
        &mut self,
        node: &NodeContext<L, C>,
        payload: &[u8],
    ) -> Result<bool, EnvelopeError> {
        let envelope = CommandEnvelope::parse(payload)?;
        if let Some(id) = envelope.ack_id() {
            self.pending_ack = Some(id.to_owned());
        }

        for (name, handle) in node.registry().iter() {
            if name == EXCHANGER_NAME {
                continue;
            }
            let Some(section) = envelope.section(name) else {
                continue;
            };
            match handle.try_borrow_mut() {
                Ok(mut p) => p.apply_commands(&section),
                Err(_) => warn!("Exchanger: '{}' busy, commands dropped", name),
            }
        }

        if let Some(section) = envelope.section(EXCHANGER_NAME) {
            self.apply_settings(&section);
        }
        Ok(envelope.ack_id().is_some())
    }

    // ── Runtime settings ──────────────────────────────────────

    fn apply_settings(&mut self, section: &CommandSection<'_>) {
        let cmd: SettingsCommand = match section.parse(EXCHANGER_NAME) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Exchanger: {}", e);
                return;
            }
        };

        let mut changed = false;

        if let Some(interval) = cmd.set_interval {
            if !EXCHANGE_INTERVAL_RANGE_MS.contains(&interval) {
                warn!("Exchanger: setInterval {} out of range", interval);
            } else if interval != self.settings.interval_ms {
                info!("Exchanger: interval {} -> {} ms", self.settings.interval_ms, interval);
                self.settings.interval_ms = interval;
                changed = true;
            }
        }

        if let Some(url) = cmd.set_url.as_deref() {
            changed |= replace_url(&mut self.settings.http_url, url, "url");
        }

        if let Some(url) = cmd.set_mqtt_url.as_deref() {
            if replace_url(&mut self.settings.mqtt_url, url, "mqttUrl") {
                changed = true;
                // Reconnect to the new broker on the next call.
                self.broker.disconnect();
                self.last_connect_attempt_ms = None;
            }
        }

        if changed {
            self.persist();
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(EXCHANGER_NAME, &self.settings) {
            warn!("Exchanger: could not persist settings ({})", e);
        }
    }
}

/// Replace `slot` with `url` if it is acceptable and different.
fn replace_url(slot: &mut UrlString, url: &str, field: &str) -> bool {
    if url.is_empty() || url.len() > MAX_URL_LEN {
        warn!("Exchanger: {} rejected (length {})", field, url.len());
        return false;
    }
    if slot.as_str() == url {
        return false;
    }
    match UrlString::try_from(url) {
        Ok(new) => {
            info!("Exchanger: {} -> '{}'", field, new);
            *slot = new;
            true
        }
        Err(()) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_per_device() {
        let t = Topics::for_device("HN-EFCAFE");
        assert_eq!(t.data, "homenode/HN-EFCAFE/data");
        assert_eq!(t.command, "homenode/HN-EFCAFE/command");
    }

    #[test]
    fn only_failure_counts_as_unsuccessful() {
        assert!(ExchangeOutcome::NotDue.succeeded());
        assert!(ExchangeOutcome::Published.succeeded());
        assert!(ExchangeOutcome::Posted.succeeded());
        assert!(!ExchangeOutcome::Failed.succeeded());
        assert!(!ExchangeOutcome::NotDue.transmitted());
    }

    #[test]
    fn replace_url_bounds_and_change_detection() {
        let mut slot = UrlString::try_from("http://a/api").unwrap();
        assert!(!replace_url(&mut slot, "", "url"));
        assert!(!replace_url(&mut slot, &"x".repeat(128), "url"));
        assert!(!replace_url(&mut slot, "http://a/api", "url"));
        assert!(replace_url(&mut slot, "http://b/api", "url"));
        assert_eq!(slot.as_str(), "http://b/api");
        assert!(replace_url(&mut slot, &"y".repeat(127), "url"));
    }
}
