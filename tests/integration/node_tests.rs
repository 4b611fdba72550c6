//! Wall switch → relay → exchange, wired through the board adapters the
//! firmware uses.
//!
//! Pins 44-47 are reserved for this file; the simulated GPIO bank is
//! process-wide.

use std::cell::RefCell;
use std::rc::Rc;

use crate::mock_node::*;

use homenode::adapters::hardware::{GpioInput, GpioOutput};
use homenode::app::exchanger::{ExchangeOutcome, EXCHANGER_NAME};
use homenode::app::ports::Switchable;
use homenode::drivers::button::{Polarity, PushButtonMonitor};
use homenode::drivers::hw_init;
use homenode::drivers::relay::RelayControl;

const RELAY_PIN: i32 = 44;
const SWITCH_PIN: i32 = 45;

#[test]
fn switch_press_toggles_relay_and_forces_exchange() {
    hw_init::sim_set_level(SWITCH_PIN, true);

    let switch = Rc::new(RefCell::new(
        PushButtonMonitor::new("lightSwitchInside", GpioInput::new(SWITCH_PIN), Polarity::ActiveLow)
            .controlling("lightInside"),
    ));

    let mut node = node();
    node.registry_mut()
        .register(Rc::new(RefCell::new(RelayControl::new(
            "lightInside",
            GpioOutput::new(RELAY_PIN),
        ))))
        .unwrap();
    node.registry_mut().register(switch.clone()).unwrap();
    node.registry().begin_all();
    assert!(!hw_init::gpio_read(RELAY_PIN));

    // Press and hold past the debounce window.
    hw_init::sim_set_level(SWITCH_PIN, false);
    node.registry().update_all(100);
    assert!(node.registry().take_trigger().is_none());
    node.registry().update_all(160);

    assert!(switch.borrow_mut().take_pressed());
    let target = switch.borrow().target().map(str::to_owned).unwrap();
    node.registry()
        .get(&target)
        .unwrap()
        .borrow_mut()
        .as_switchable()
        .unwrap()
        .toggle();
    assert!(hw_init::gpio_read(RELAY_PIN));

    let reason = node.registry().take_trigger().unwrap();
    assert_eq!(reason.as_str(), "lightSwitchInside");
    assert!(node.registry().take_trigger().is_none(), "edge-triggered");

    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut().sim_respond(Ok(
        br#"{"lightInside":{"toggleState":true,"setState":true}}"#.to_vec(),
    ));
    assert_eq!(
        ex.exchange(&node, true, Some(reason.as_str())),
        ExchangeOutcome::Posted
    );

    let doc = posted_document(&ex, 0);
    assert_eq!(doc[EXCHANGER_NAME]["trigger"], "lightSwitchInside");
    assert_eq!(doc["lightSwitchInside"]["isPressed"], true);
    assert_eq!(doc["lightInside"]["type"], "DeviceControl");
    assert_eq!(doc["lightInside"]["isOn"], true);

    // toggleState wins over setState.
    assert!(!hw_init::gpio_read(RELAY_PIN));

    // A glitched output is restored from the commanded state.
    hw_init::sim_set_level(RELAY_PIN, true);
    node.registry().refresh_all();
    assert!(!hw_init::gpio_read(RELAY_PIN));
}

#[test]
fn group_shutdown_skips_missing_members() {
    let mut node = node();
    let lamp = Rc::new(RefCell::new(RelayControl::new("lamp", GpioOutput::new(47))));
    node.registry_mut().register(lamp.clone()).unwrap();
    node.registry_mut()
        .register(RecordingPeripheral::shared("sensor"))
        .unwrap();

    lamp.borrow_mut().turn_on();
    assert!(hw_init::gpio_read(47));

    let switched = node.registry().turn_off_group(&["lamp", "sensor", "missing"]);
    assert_eq!(switched, 1);
    assert!(!lamp.borrow().is_on());
    assert!(!hw_init::gpio_read(47));
}

#[test]
fn local_action_can_be_disabled_remotely() {
    hw_init::sim_set_level(46, true);
    let mut node = node();
    let switch = Rc::new(RefCell::new(PushButtonMonitor::new(
        "lightSwitchOutside",
        GpioInput::new(46),
        Polarity::ActiveLow,
    )));
    node.registry_mut().register(switch.clone()).unwrap();

    let mut ex = exchanger(HTTP_URL, "");
    ex.http_mut()
        .sim_respond(Ok(br#"{"lightSwitchOutside":{"localAction":false}}"#.to_vec()));
    ex.exchange(&node, true, None);
    assert!(!switch.borrow().local_action());
}
