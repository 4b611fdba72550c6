//! Exchanger integration tests: scheduling, transport selection, command
//! dispatch, acknowledgments and settings persistence.

use std::cell::RefCell;
use std::rc::Rc;

use crate::mock_node::*;

use homenode::app::exchanger::{ExchangeOutcome, Topics, ACK_REASON, EXCHANGER_NAME};
use homenode::app::ports::{BrokerPort, TransportError};
use homenode::config::ExchangeSettings;
use serde_json::json;

fn register(node: &mut TestNode, names: &[&str]) -> Vec<Rc<RefCell<RecordingPeripheral>>> {
    names
        .iter()
        .map(|name| {
            let p = RecordingPeripheral::shared(name);
            node.registry_mut().register(p.clone()).unwrap();
            p
        })
        .collect()
}

// ── Scheduling ────────────────────────────────────────────────

#[test]
fn unforced_cycle_waits_for_interval() {
    let node = node();
    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(b"{}".to_vec()));

    let outcome = ex.exchange(&node, false, None);
    assert_eq!(outcome, ExchangeOutcome::NotDue);
    assert!(outcome.succeeded());
    node.clock().set(59_999);
    assert_eq!(ex.exchange(&node, false, None), ExchangeOutcome::NotDue);
    assert!(ex.http().sim_requests().is_empty());

    node.clock().set(60_000);
    assert_eq!(ex.exchange(&node, false, None), ExchangeOutcome::Posted);
    let doc = posted_document(&ex, 0);
    assert_eq!(doc[EXCHANGER_NAME]["trigger"], "scheduled");
}

#[test]
fn forced_cycle_restarts_interval() {
    let node = node();
    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(b"{}".to_vec()));

    node.clock().set(50_000);
    assert_eq!(ex.exchange(&node, true, Some("startup")), ExchangeOutcome::Posted);
    assert_eq!(posted_document(&ex, 0)[EXCHANGER_NAME]["trigger"], "startup");

    // Scheduled cycle is now measured from the forced one.
    node.clock().set(60_000);
    assert_eq!(ex.exchange(&node, false, None), ExchangeOutcome::NotDue);
}

#[test]
fn forced_cycle_without_reason_reports_forced() {
    let node = node();
    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(b"{}".to_vec()));
    ex.exchange(&node, true, Some(""));
    assert_eq!(posted_document(&ex, 0)[EXCHANGER_NAME]["trigger"], "forced");
}

// ── Telemetry document ────────────────────────────────────────

#[test]
fn document_holds_every_peripheral_subtree() {
    let mut node = node();
    let peripherals = register(&mut node, &["A", "B"]);
    peripherals[1].borrow_mut().counter = 7;

    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(b"{}".to_vec()));
    ex.exchange(&node, true, Some("test"));

    let doc = posted_document(&ex, 0);
    assert_eq!(doc[EXCHANGER_NAME]["trigger"], "test");
    assert_eq!(doc["A"], json!({"type": "Recorder", "counter": 0}));
    assert_eq!(doc["B"], json!({"type": "Recorder", "counter": 7}));
    assert_eq!(doc[EXCHANGER_NAME]["type"], "DataExchanger");
    assert_eq!(doc[EXCHANGER_NAME]["interval"], 60_000);
    assert_eq!(doc[EXCHANGER_NAME]["url"], HTTP_URL);
    assert_eq!(doc[EXCHANGER_NAME]["mqttConnected"], false);
    assert!(doc.get("ack").is_none());
}

// ── HTTP transport ────────────────────────────────────────────

#[test]
fn http_failure_is_reported_and_nothing_dispatched() {
    let mut node = node();
    let peripherals = register(&mut node, &["A"]);
    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Err(TransportError::HttpStatus(500)));

    let outcome = ex.exchange(&node, true, None);
    assert_eq!(outcome, ExchangeOutcome::Failed);
    assert!(!outcome.succeeded());
    assert!(peripherals[0].borrow().received.is_empty());
}

#[test]
fn empty_http_body_counts_as_failure() {
    let node = node();
    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(Vec::new()));
    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Failed);
}

#[test]
fn no_transport_configured_fails_without_requests() {
    let node = node();
    let mut ex = exchanger("", "");
    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Failed);
    assert!(ex.http().sim_requests().is_empty());
}

#[test]
fn response_commands_reach_only_their_owner() {
    let mut node = node();
    let peripherals = register(&mut node, &["A", "B"]);
    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut()
        .sim_respond(Ok(br#"{"A":{"setState":true},"C":{"x":1}}"#.to_vec()));

    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Posted);
    assert_eq!(peripherals[0].borrow().received, vec![json!({"setState": true})]);
    assert!(peripherals[1].borrow().received.is_empty());
}

#[test]
fn malformed_response_is_ignored() {
    let mut node = node();
    let peripherals = register(&mut node, &["A"]);
    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(b"<html>".to_vec()));
    ex.http_mut().sim_respond(Ok(b"[1,2,3]".to_vec()));

    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Posted);
    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Posted);
    assert!(peripherals[0].borrow().received.is_empty());
    assert_eq!(ex.settings(), &ExchangeSettings::new(60_000, HTTP_URL, "").unwrap());
}

// ── Broker transport ──────────────────────────────────────────

#[test]
fn command_topic_uses_device_id() {
    let node = node();
    let topics = Topics::for_device(node.device_id());
    assert_eq!(topics.command, "homenode/HN-EFCAFE/command");
    assert_eq!(topics.data, "homenode/HN-EFCAFE/data");
}

#[test]
fn broker_publish_skips_http() {
    let mut node = node();
    register(&mut node, &["A"]);
    let mut ex = exchanger(HTTP_URL, MQTT_URL);

    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Published);
    assert!(ex.broker().is_connected());
    assert!(ex.http().sim_requests().is_empty());

    let published = &ex.broker().sim_published()[0];
    assert_eq!(published.topic, "homenode/HN-EFCAFE/data");
    let doc = published_document(&ex, 0);
    assert_eq!(doc["A"]["type"], "Recorder");
    assert_eq!(doc[EXCHANGER_NAME]["mqttConnected"], true);
}

#[test]
fn link_down_falls_back_to_http() {
    let mut node = node();
    node.link_mut().up = false;
    let mut ex = exchanger(HTTP_URL, MQTT_URL);
    ex.http_mut().sim_respond(Ok(b"{}".to_vec()));

    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Posted);
    assert!(!ex.broker().is_connected());
}

#[test]
fn reconnect_attempts_are_rate_limited() {
    let node = node();
    let mut ex = exchanger("", MQTT_URL);
    ex.broker_mut().sim_set_reachable(false);

    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Failed);
    ex.broker_mut().sim_set_reachable(true);

    node.clock().set(4_999);
    ex.exchange(&node, false, None);
    assert!(!ex.broker().is_connected(), "retry held back");

    node.clock().set(5_000);
    ex.exchange(&node, false, None);
    assert!(ex.broker().is_connected());
}

#[test]
fn broker_command_is_dispatched_and_acknowledged() {
    let mut node = node();
    let peripherals = register(&mut node, &["A"]);
    let mut ex = exchanger("", MQTT_URL);
    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Published);

    let topic = Topics::for_device(node.device_id()).command;
    ex.broker_mut()
        .sim_inject(&topic, br#"{"ackId":"42","A":{"setState":false}}"#);

    node.clock().set(1_000);
    assert_eq!(ex.exchange(&node, false, None), ExchangeOutcome::Published);
    assert_eq!(peripherals[0].borrow().received, vec![json!({"setState": false})]);

    let ack_doc = published_document(&ex, 1);
    assert_eq!(ack_doc["ack"], "42");
    assert_eq!(ack_doc[EXCHANGER_NAME]["trigger"], ACK_REASON);
    assert_eq!(ex.pending_ack(), None);

    // The ack is carried once.
    node.clock().set(120_000);
    ex.exchange(&node, false, None);
    assert!(published_document(&ex, 2).get("ack").is_none());
}

#[test]
fn dropped_broker_is_reconnected_and_resubscribed() {
    let mut node = node();
    let peripherals = register(&mut node, &["A"]);
    let mut ex = exchanger("", MQTT_URL);
    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Published);

    let topic = Topics::for_device(node.device_id()).command;
    ex.broker_mut().sim_drop_connection();
    ex.broker_mut().sim_inject(&topic, br#"{"A":{"n":1}}"#);

    node.clock().set(1_000);
    assert_eq!(ex.exchange(&node, false, None), ExchangeOutcome::NotDue);
    assert!(!ex.broker().is_connected(), "retry held back");
    assert!(peripherals[0].borrow().received.is_empty());

    node.clock().set(5_000);
    ex.exchange(&node, false, None);
    assert!(ex.broker().is_connected());

    ex.broker_mut().sim_inject(&topic, br#"{"A":{"n":2}}"#);
    node.clock().set(6_000);
    ex.exchange(&node, false, None);
    assert_eq!(peripherals[0].borrow().received, vec![json!({"n": 2})]);
}

#[test]
fn numeric_ack_id_is_echoed_as_text() {
    let node = node();
    let mut ex = exchanger("", MQTT_URL);
    ex.exchange(&node, true, None);

    let topic = Topics::for_device(node.device_id()).command;
    ex.broker_mut().sim_inject(&topic, br#"{"ackId":7}"#);
    ex.exchange(&node, false, None);
    assert_eq!(published_document(&ex, 1)["ack"], "7");
}

#[test]
fn malformed_broker_command_is_dropped() {
    let mut node = node();
    let peripherals = register(&mut node, &["A"]);
    let mut ex = exchanger("", MQTT_URL);
    ex.exchange(&node, true, None);

    let topic = Topics::for_device(node.device_id()).command;
    ex.broker_mut().sim_inject(&topic, b"{not json");
    ex.broker_mut().sim_inject(&topic, br#"{"A":{"n":1}}"#);

    node.clock().set(1_000);
    assert_eq!(ex.exchange(&node, false, None), ExchangeOutcome::NotDue);
    assert_eq!(peripherals[0].borrow().received, vec![json!({"n": 1})]);
    assert_eq!(ex.broker().sim_published().len(), 1);
}

// ── Settings ──────────────────────────────────────────────────

#[test]
fn settings_are_persisted_only_on_change() {
    let (store, mem) = mem_store();
    let node = node();
    let mut ex = exchanger(HTTP_URL, "").with_store(store);
    ex.begin();

    let cmd = br#"{"dataExchanger":{"setInterval":"30000"}}"#.to_vec();
    ex.http_mut().sim_respond(Ok(cmd.clone()));
    ex.http_mut().sim_respond(Ok(cmd));
    ex.http_mut()
        .sim_respond(Ok(br#"{"dataExchanger":{"setInterval":5}}"#.to_vec()));

    ex.exchange(&node, true, None);
    assert_eq!(ex.settings().interval_ms, 30_000);
    assert_eq!(mem.borrow().writes, 1);

    ex.exchange(&node, true, None);
    assert_eq!(mem.borrow().writes, 1, "same value is not rewritten");

    ex.exchange(&node, true, None);
    assert_eq!(ex.settings().interval_ms, 30_000, "out of range ignored");
    assert_eq!(mem.borrow().writes, 1);
}

#[test]
fn persisted_settings_survive_restart() {
    let (store, _mem) = mem_store();
    let node = node();
    {
        let mut ex = exchanger(HTTP_URL, "").with_store(store.clone());
        ex.begin();
        ex.http_mut().sim_respond(Ok(
            br#"{"dataExchanger":{"setUrl":"http://new.local/x","setInterval":20000}}"#.to_vec(),
        ));
        ex.exchange(&node, true, None);
    }

    let mut rebooted = exchanger(HTTP_URL, "").with_store(store);
    rebooted.begin();
    assert_eq!(rebooted.settings().http_url.as_str(), "http://new.local/x");
    assert_eq!(rebooted.settings().interval_ms, 20_000);
}

#[test]
fn corrupt_record_keeps_compiled_defaults() {
    let (store, mem) = mem_store();
    mem.borrow_mut().put_raw(EXCHANGER_NAME, &[0xBA, 0xAD, 0xF0, 0x0D, 1, 0]);

    let mut ex = exchanger(HTTP_URL, "").with_store(store);
    ex.begin();
    assert_eq!(ex.settings().http_url.as_str(), HTTP_URL);
    assert_eq!(ex.settings().interval_ms, 60_000);
}

#[test]
fn overlong_url_is_rejected() {
    let node = node();
    let mut ex = exchanger(HTTP_URL, "");
    let long = format!("http://{}", "x".repeat(130));
    let body = format!(r#"{{"dataExchanger":{{"setUrl":"{long}"}}}}"#);
    ex.http_mut().sim_respond(Ok(body.into_bytes()));

    ex.exchange(&node, true, None);
    assert_eq!(ex.settings().http_url.as_str(), HTTP_URL);
}

#[test]
fn new_broker_url_forces_reconnect() {
    let node = node();
    let mut ex = exchanger("", MQTT_URL);
    ex.exchange(&node, true, None);
    assert!(ex.broker().is_connected());

    let topic = Topics::for_device(node.device_id()).command;
    ex.broker_mut()
        .sim_inject(&topic, br#"{"dataExchanger":{"setMqttUrl":"mqtt://other:1883"}}"#);
    node.clock().set(1_000);
    ex.exchange(&node, false, None);
    assert_eq!(ex.settings().mqtt_url.as_str(), "mqtt://other:1883");
    assert!(!ex.broker().is_connected());

    // Next call reconnects without waiting for the rate limit.
    node.clock().set(1_500);
    ex.exchange(&node, false, None);
    assert!(ex.broker().is_connected());
}
