//! Fuzz target: inbound command documents
//!
//! Feeds arbitrary bytes to the HTTP response path of the `Exchanger` and
//! verifies:
//! - No panics while parsing or dispatching
//! - A payload that is not a JSON object never reaches a peripheral
//! - The relay only ever ends up on or off (no torn state)
//!
//! cargo fuzz run fuzz_command_envelope

#![no_main]

use std::cell::RefCell;
use std::rc::Rc;

use homenode::adapters::device_id;
use homenode::adapters::hardware::GpioOutput;
use homenode::adapters::http::HttpClient;
use homenode::adapters::mqtt::MqttBroker;
use homenode::app::commands::CommandEnvelope;
use homenode::app::context::NodeContext;
use homenode::app::exchanger::Exchanger;
use homenode::app::ports::{Clock, LinkPort, Switchable};
use homenode::config::ExchangeSettings;
use homenode::drivers::relay::RelayControl;
use libfuzzer_sys::fuzz_target;

struct Offline;

impl LinkPort for Offline {
    fn is_up(&self) -> bool {
        false
    }
}

struct Frozen;

impl Clock for Frozen {
    fn now_ms(&self) -> u64 {
        0
    }
}

fuzz_target!(|data: &[u8]| {
    let relay = Rc::new(RefCell::new(RelayControl::new("lightInside", GpioOutput::new(60))));
    let mut node = NodeContext::new(device_id::device_id(&device_id::read_mac()), Offline, Frozen);
    if node.registry_mut().register(relay.clone()).is_err() {
        return;
    }

    let Ok(settings) = ExchangeSettings::new(60_000, "http://fuzz.local/", "") else {
        return;
    };
    let mut http = HttpClient::new();
    http.sim_respond(Ok(data.to_vec()));
    let mut exchanger = Exchanger::new(settings, MqttBroker::new(), http);

    let before = relay.borrow().is_on();
    let _ = exchanger.exchange(&node, true, Some("fuzz"));

    if CommandEnvelope::parse(data).is_err() {
        assert_eq!(relay.borrow().is_on(), before, "rejected payload changed state");
        assert_eq!(exchanger.pending_ack(), None);
    }
    assert!(!exchanger.settings().http_url.is_empty());
});
