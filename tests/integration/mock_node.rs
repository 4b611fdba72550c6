//! Mock adapters for integration tests.
//!
//! The broker and HTTP transports come from the crate's own simulation
//! backends (`MqttBroker`, `HttpClient`); everything else the node needs is
//! mocked here so tests control time, link state and storage directly.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use homenode::adapters::device_id;
use homenode::adapters::http::HttpClient;
use homenode::adapters::mqtt::MqttBroker;
use homenode::app::commands::CommandSection;
use homenode::app::context::NodeContext;
use homenode::app::exchanger::Exchanger;
use homenode::app::ports::{Clock, LinkPort, Peripheral, StorageError, StoragePort};
use homenode::app::telemetry::StateCollector;
use homenode::config::{ConfigStore, ExchangeSettings};
use serde_json::Value;

// ── Clock ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockClock {
    now: Cell<u64>,
}

#[allow(dead_code)]
impl MockClock {
    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

// ── Link ──────────────────────────────────────────────────────

pub struct MockLink {
    pub up: bool,
}

impl LinkPort for MockLink {
    fn is_up(&self) -> bool {
        self.up
    }
}

// ── Storage ───────────────────────────────────────────────────

/// In-memory storage that counts writes.
#[derive(Default)]
pub struct MemStorage {
    data: HashMap<String, Vec<u8>>,
    pub writes: usize,
}

#[allow(dead_code)]
impl MemStorage {
    pub fn raw(&self, key: &str) -> Option<&Vec<u8>> {
        self.data.get(&format!("homenode::{key}"))
    }

    pub fn put_raw(&mut self, key: &str, bytes: &[u8]) {
        self.data.insert(format!("homenode::{key}"), bytes.to_vec());
    }
}

impl StoragePort for MemStorage {
    fn read(&self, ns: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let v = self
            .data
            .get(&format!("{ns}::{key}"))
            .ok_or(StorageError::NotFound)?;
        if v.len() > buf.len() {
            return Err(StorageError::IoError);
        }
        buf[..v.len()].copy_from_slice(v);
        Ok(v.len())
    }

    fn write(&mut self, ns: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.writes += 1;
        self.data.insert(format!("{ns}::{key}"), data.to_vec());
        Ok(())
    }

    fn delete(&mut self, ns: &str, key: &str) -> Result<(), StorageError> {
        self.data.remove(&format!("{ns}::{key}"));
        Ok(())
    }

    fn exists(&self, ns: &str, key: &str) -> bool {
        self.data.contains_key(&format!("{ns}::{key}"))
    }
}

pub fn mem_store() -> (ConfigStore, Rc<RefCell<MemStorage>>) {
    let mem = Rc::new(RefCell::new(MemStorage::default()));
    (ConfigStore::new(mem.clone()), mem)
}

// ── Recording peripheral ──────────────────────────────────────

/// Reports a counter and records every command subtree it receives.
pub struct RecordingPeripheral {
    name: String,
    pub counter: u32,
    pub received: Vec<Value>,
    pub trigger: bool,
}

#[allow(dead_code)]
impl RecordingPeripheral {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            counter: 0,
            received: Vec::new(),
            trigger: false,
        }
    }

    pub fn shared(name: &str) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new(name)))
    }
}

impl Peripheral for RecordingPeripheral {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_trigger_exchange(&self) -> bool {
        self.trigger
    }

    fn reset_trigger_exchange(&mut self) {
        self.trigger = false;
    }

    fn add_to_state(&self, state: &mut StateCollector<'_>) {
        state.type_tag("Recorder");
        state.record("counter", self.counter);
    }

    fn apply_commands(&mut self, commands: &CommandSection<'_>) {
        if let Ok(v) = commands.parse::<Value>("Recorder") {
            self.received.push(v);
        }
    }
}

// ── Node fixture ──────────────────────────────────────────────

pub type TestNode = NodeContext<MockLink, MockClock>;
pub type TestExchanger = Exchanger<MqttBroker, HttpClient>;

pub const HTTP_URL: &str = "http://controller.local/api/data";
pub const MQTT_URL: &str = "mqtt://controller.local:1883";

pub fn node() -> TestNode {
    let mac = device_id::read_mac();
    NodeContext::new(
        device_id::device_id(&mac),
        MockLink { up: true },
        MockClock::default(),
    )
}

pub fn exchanger(http_url: &str, mqtt_url: &str) -> TestExchanger {
    let settings = ExchangeSettings::new(60_000, http_url, mqtt_url).unwrap();
    Exchanger::new(settings, MqttBroker::new(), HttpClient::new())
}

/// Parse the body of the `n`th recorded HTTP request.
#[allow(dead_code)]
pub fn posted_document(ex: &TestExchanger, n: usize) -> Value {
    serde_json::from_slice(&ex.http().sim_requests()[n].body).unwrap()
}

/// Parse the `n`th payload published over the broker.
#[allow(dead_code)]
pub fn published_document(ex: &TestExchanger, n: usize) -> Value {
    serde_json::from_slice(&ex.broker().sim_published()[n].payload).unwrap()
}
