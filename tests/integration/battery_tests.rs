//! Battery monitor driven through the node: acquisition, telemetry,
//! remote configuration and persistence across a restart.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::mock_node::*;

use embedded_hal::delay::DelayNs;
use homenode::app::exchanger::ExchangeOutcome;
use homenode::app::ports::{AdcPort, Peripheral};
use homenode::config::{BatterySettings, ConfigStore};
use homenode::error::SensorError;
use homenode::sensors::battery::{AdcScaling, BatteryMonitor};

// ── Fakes ─────────────────────────────────────────────────────

/// 200 counts per volt with [`SCALING`].
const SCALING: AdcScaling = AdcScaling {
    v_ref: 1.0,
    divider_ratio: 20.0,
};

/// ADC whose level the test can move while the monitor owns it.
#[derive(Clone)]
struct SharedAdc {
    raw: Rc<Cell<u16>>,
}

impl SharedAdc {
    fn at(volts: f32) -> Self {
        let adc = Self {
            raw: Rc::new(Cell::new(0)),
        };
        adc.set(volts);
        adc
    }

    fn set(&self, volts: f32) {
        self.raw.set((volts * 200.0).round() as u16);
    }
}

impl AdcPort for SharedAdc {
    fn read_raw(&mut self) -> Result<u16, SensorError> {
        Ok(self.raw.get())
    }

    fn full_scale(&self) -> u16 {
        4000
    }
}

struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

type Monitor = BatteryMonitor<SharedAdc, NoDelay>;

fn monitor(adc: &SharedAdc, store: &ConfigStore, buffer_size: u16) -> Rc<RefCell<Monitor>> {
    let settings = BatterySettings {
        buffer_size,
        ..BatterySettings::default()
    };
    Rc::new(RefCell::new(
        BatteryMonitor::new("batteryMonitor", adc.clone(), NoDelay, SCALING, settings)
            .with_store(store.clone()),
    ))
}

// ── Tests ─────────────────────────────────────────────────────

#[test]
fn battery_subtree_reports_filtered_voltage() {
    let (store, _) = mem_store();
    let adc = SharedAdc::at(12.5);
    let battery = monitor(&adc, &store, 1);

    let mut node = node();
    node.registry_mut().register(battery.clone()).unwrap();
    node.registry().begin_all();
    node.registry().update_all(0);

    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(b"{}".to_vec()));
    assert_eq!(ex.exchange(&node, true, None), ExchangeOutcome::Posted);

    let doc = posted_document(&ex, 0);
    let b = &doc["batteryMonitor"];
    assert_eq!(b["type"], "BatteryMonitor");
    assert!((b["voltage"].as_f64().unwrap() - 12.5).abs() < 0.01);
    assert_eq!(b["isStale"], false);
    assert_eq!(b["isConnected"], true);
    assert_eq!(b["isLow"], false);
    assert_eq!(b["bufferSize"], 1);
    assert_eq!(b["bufferFill"], 5);
    assert_eq!(b["batteryType"], "flooded");
}

#[test]
fn remote_threshold_raises_alarm_once_and_persists() {
    let (store, mem) = mem_store();
    let adc = SharedAdc::at(12.5);
    let battery = monitor(&adc, &store, 1);

    let mut node = node();
    node.registry_mut().register(battery.clone()).unwrap();
    node.registry().begin_all();
    node.registry().update_all(0);
    assert!(!battery.borrow().is_low());

    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(
        br#"{"batteryMonitor":{"setLow":12.8,"setBufferSize":2}}"#.to_vec(),
    ));
    ex.exchange(&node, true, None);
    assert!((battery.borrow().settings().low_threshold - 12.8).abs() < 1e-6);
    assert_eq!(battery.borrow().capacity(), 10);
    assert_eq!(mem.borrow().writes, 1);

    // Ring restarted: the reading is stale but alarms still evaluate.
    node.registry().update_all(1_000);
    {
        let mut b = battery.borrow_mut();
        assert!(b.voltage().stale);
        assert!(b.is_low());
        assert!(b.got_low());
        assert!(!b.got_low(), "one event per activation");
    }

    node.registry().update_all(2_000);
    assert!(battery.borrow().is_low());
    assert!(!battery.borrow_mut().got_low());

    // A fresh monitor on the same storage restores the new settings.
    let rebooted = monitor(&adc, &store, 1);
    rebooted.borrow_mut().begin();
    assert!((rebooted.borrow().settings().low_threshold - 12.8).abs() < 1e-6);
    assert_eq!(rebooted.borrow().settings().buffer_size, 2);
    assert_eq!(rebooted.borrow().capacity(), 10);
}

#[test]
fn zero_buffer_size_still_persists_commands() {
    let (store, mem) = mem_store();
    let adc = SharedAdc::at(12.5);
    let battery = monitor(&adc, &store, 0);
    assert_eq!(battery.borrow().settings().buffer_size, 1);
    assert_eq!(battery.borrow().capacity(), 5);

    let mut node = node();
    node.registry_mut().register(battery.clone()).unwrap();
    node.registry().begin_all();

    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut()
        .sim_respond(Ok(br#"{"batteryMonitor":{"setLow":12.2}}"#.to_vec()));
    ex.exchange(&node, true, None);
    assert_eq!(mem.borrow().writes, 1);
}

#[test]
fn wrongly_typed_field_rejects_whole_section() {
    let (store, mem) = mem_store();
    let adc = SharedAdc::at(12.5);
    let battery = monitor(&adc, &store, 1);

    let mut node = node();
    node.registry_mut().register(battery.clone()).unwrap();
    node.registry().begin_all();

    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(
        br#"{"batteryMonitor":{"setLow":"high","setCritical":11.0}}"#.to_vec(),
    ));
    ex.exchange(&node, true, None);

    let expected = BatterySettings {
        buffer_size: 1,
        ..BatterySettings::default()
    };
    assert_eq!(battery.borrow().settings(), &expected);
    assert_eq!(mem.borrow().writes, 0);
}

#[test]
fn critical_recovers_only_above_hysteresis_band() {
    let (store, _) = mem_store();
    let adc = SharedAdc::at(12.5);
    let battery = monitor(&adc, &store, 1);
    let mut b = battery.borrow_mut();

    b.update(0);
    adc.set(10.5);
    // A 2 V step is an outlier against a full ring until the stuck reset.
    b.update(1_000);
    assert!(!b.is_critical());
    assert_eq!(b.counters().rejected_outliers, 5);

    b.update(40_000);
    assert!(b.is_critical());
    assert!(b.got_critical());
    assert!(!b.got_critical());

    // Critical clears above 11.5 + 0.5 V.
    adc.set(11.5);
    b.update(41_000);
    assert!(b.is_critical());
    adc.set(11.9);
    b.update(42_000);
    assert!(b.is_critical());
    adc.set(12.1);
    b.update(43_000);
    assert!(!b.is_critical());
    assert!(!b.got_critical());
}
