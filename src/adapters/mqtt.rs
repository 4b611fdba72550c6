//! MQTT broker adapter.
//!
//! Implements [`BrokerPort`] over the ESP-IDF MQTT client.  The client runs
//! its own task and delivers events through a callback; received messages
//! are pushed into a bounded, mutex-protected inbox that the Exchanger
//! drains from the loop thread via `poll()`.
//!
//! ```text
//!  esp-mqtt task                      loop thread
//!  ─────────────                      ───────────
//!  Connected     ──► connected=true
//!  Received{..}  ──► inbox.push_back ──► poll() → Exchanger::dispatch
//!  Disconnected  ──► connected=false
//! ```
//!
//! Auto-reconnect is disabled: a dropped session stays down until the
//! Exchanger calls `connect()`, which also renews the command
//! subscription.
//!
//! The simulation backend is an in-memory broker: publishes are recorded,
//! and tests inject inbound messages with [`MqttBroker::sim_inject`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::info;

use crate::app::ports::{BrokerPort, InboundMessage, TransportError};

/// Inbound messages held before the oldest is dropped.
pub const INBOX_CAPACITY: usize = 16;

#[cfg(target_os = "espidf")]
pub const CONNECT_TIMEOUT_MS: u32 = 5_000;

#[derive(Default)]
struct Inbox {
    messages: VecDeque<InboundMessage>,
    dropped: u32,
}

impl Inbox {
    fn push(&mut self, msg: InboundMessage) {
        if self.messages.len() >= INBOX_CAPACITY {
            self.messages.pop_front();
            self.dropped += 1;
        }
        self.messages.push_back(msg);
    }
}

#[cfg(target_os = "espidf")]
mod esp {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS};
    use log::warn;

    pub struct Session {
        pub client: EspMqttClient<'static>,
        pub connected: Arc<AtomicBool>,
    }

    pub fn open(
        url: &str,
        client_id: &str,
        inbox: Arc<Mutex<Inbox>>,
    ) -> Result<Session, TransportError> {
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            disable_auto_reconnect: true,
            ..Default::default()
        };

        let client = EspMqttClient::new_cb(url, &conf, move |event| match event.payload() {
            EventPayload::Connected(_) => flag.store(true, Ordering::Release),
            EventPayload::Disconnected => flag.store(false, Ordering::Release),
            EventPayload::Received {
                topic: Some(topic),
                data,
                ..
            } => {
                if let Ok(mut inbox) = inbox.lock() {
                    inbox.push(InboundMessage {
                        topic: topic.into(),
                        payload: data.to_vec(),
                    });
                }
            }
            _ => {}
        })
        .map_err(|e| {
            warn!("MQTT: client init failed ({})", e);
            TransportError::ConnectFailed
        })?;

        let mut waited = 0;
        while !connected.load(Ordering::Acquire) {
            if waited >= CONNECT_TIMEOUT_MS {
                return Err(TransportError::ConnectFailed);
            }
            FreeRtos::delay_ms(50);
            waited += 50;
        }
        Ok(Session { client, connected })
    }

    impl Session {
        pub fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }

        pub fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .map(|_| ())
                .map_err(|_| TransportError::PublishFailed)
        }

        pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .map(|_| ())
                .map_err(|_| TransportError::PublishFailed)
        }
    }
}

/// Simulated broker connection.
#[cfg(not(target_os = "espidf"))]
struct SimSession {
    subscriptions: Vec<String>,
    connected: bool,
}

pub struct MqttBroker {
    inbox: Arc<Mutex<Inbox>>,
    #[cfg(target_os = "espidf")]
    session: Option<esp::Session>,
    #[cfg(not(target_os = "espidf"))]
    session: Option<SimSession>,
    #[cfg(not(target_os = "espidf"))]
    sim_reachable: bool,
    #[cfg(not(target_os = "espidf"))]
    sim_published: Vec<InboundMessage>,
}

impl Default for MqttBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttBroker {
    pub fn new() -> Self {
        Self {
            inbox: Arc::new(Mutex::new(Inbox::default())),
            session: None,
            #[cfg(not(target_os = "espidf"))]
            sim_reachable: true,
            #[cfg(not(target_os = "espidf"))]
            sim_published: Vec::new(),
        }
    }

    /// Inbound messages dropped because the inbox was full.
    pub fn dropped(&self) -> u32 {
        self.inbox.lock().map(|i| i.dropped).unwrap_or(0)
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn sim_set_reachable(&mut self, reachable: bool) {
        self.sim_reachable = reachable;
        if !reachable {
            self.session = None;
        }
    }

    /// Deliver a message as if the broker had routed it to this client.
    /// Only topics the client subscribed to are delivered.
    #[cfg(not(target_os = "espidf"))]
    pub fn sim_inject(&self, topic: &str, payload: &[u8]) {
        let subscribed = self
            .session
            .as_ref()
            .is_some_and(|s| s.connected && s.subscriptions.iter().any(|t| t == topic));
        if !subscribed {
            return;
        }
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.push(InboundMessage {
                topic: topic.into(),
                payload: payload.to_vec(),
            });
        }
    }

    /// Broker closed the connection.  The session stays down until the
    /// next `connect()`.
    #[cfg(not(target_os = "espidf"))]
    pub fn sim_drop_connection(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.connected = false;
        }
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn sim_published(&self) -> &[InboundMessage] {
        &self.sim_published
    }
}

impl BrokerPort for MqttBroker {
    fn is_connected(&self) -> bool {
        #[cfg(target_os = "espidf")]
        {
            self.session.as_ref().is_some_and(esp::Session::is_connected)
        }
        #[cfg(not(target_os = "espidf"))]
        {
            self.session.as_ref().is_some_and(|s| s.connected)
        }
    }

    fn connect(&mut self, url: &str, client_id: &str) -> Result<(), TransportError> {
        self.disconnect();
        info!("MQTT: connecting to {} as {}", url, client_id);

        #[cfg(target_os = "espidf")]
        {
            self.session = Some(esp::open(url, client_id, self.inbox.clone())?);
        }
        #[cfg(not(target_os = "espidf"))]
        {
            if !self.sim_reachable {
                return Err(TransportError::ConnectFailed);
            }
            self.session = Some(SimSession {
                subscriptions: Vec::new(),
                connected: true,
            });
        }

        info!("MQTT: connected");
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        #[cfg(target_os = "espidf")]
        session.subscribe(topic)?;
        #[cfg(not(target_os = "espidf"))]
        {
            if !session.connected {
                return Err(TransportError::NotConnected);
            }
            session.subscriptions.push(topic.into());
        }
        info!("MQTT: subscribed to {}", topic);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        #[cfg(target_os = "espidf")]
        {
            let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
            session.publish(topic, payload)
        }
        #[cfg(not(target_os = "espidf"))]
        {
            self.sim_published.push(InboundMessage {
                topic: topic.into(),
                payload: payload.to_vec(),
            });
            Ok(())
        }
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        self.inbox.lock().ok()?.messages.pop_front()
    }

    fn disconnect(&mut self) {
        if self.session.take().is_some() {
            info!("MQTT: disconnected");
        }
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.messages.clear();
        }
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;

    #[test]
    fn only_subscribed_topics_are_delivered() {
        let mut b = MqttBroker::new();
        b.connect("mqtt://broker", "HN-EFCAFE").unwrap();
        b.subscribe("homenode/HN-EFCAFE/command").unwrap();

        b.sim_inject("homenode/other/command", b"{}");
        assert!(b.poll().is_none());

        b.sim_inject("homenode/HN-EFCAFE/command", b"{\"a\":{}}");
        let msg = b.poll().unwrap();
        assert_eq!(msg.payload, b"{\"a\":{}}");
    }

    #[test]
    fn inbox_drops_oldest_when_full() {
        let mut b = MqttBroker::new();
        b.connect("mqtt://broker", "id").unwrap();
        b.subscribe("t").unwrap();
        for i in 0..=INBOX_CAPACITY {
            b.sim_inject("t", &[i as u8]);
        }
        assert_eq!(b.dropped(), 1);
        assert_eq!(b.poll().unwrap().payload, vec![1u8]);
    }

    #[test]
    fn dropped_connection_needs_connect_and_subscribe() {
        let mut b = MqttBroker::new();
        b.connect("mqtt://broker", "id").unwrap();
        b.subscribe("t").unwrap();

        b.sim_drop_connection();
        assert!(!b.is_connected());
        b.sim_inject("t", b"lost");
        assert!(b.poll().is_none());
        assert_eq!(b.publish("t", b"x"), Err(TransportError::NotConnected));

        b.connect("mqtt://broker", "id").unwrap();
        b.sim_inject("t", b"early");
        assert!(b.poll().is_none(), "fresh session has no subscriptions");

        b.subscribe("t").unwrap();
        b.sim_inject("t", b"late");
        assert_eq!(b.poll().unwrap().payload, b"late");
    }

    #[test]
    fn unreachable_broker_fails_connect() {
        let mut b = MqttBroker::new();
        b.sim_set_reachable(false);
        assert_eq!(
            b.connect("mqtt://broker", "id"),
            Err(TransportError::ConnectFailed)
        );
        assert!(!b.is_connected());
        assert_eq!(b.publish("t", b"x"), Err(TransportError::NotConnected));
    }
}
