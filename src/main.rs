//! HomeNode firmware main entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  WifiLink (LinkPort)   MqttBroker (BrokerPort)                 │
//! │  HttpClient (HttpPort) NvsStorage (StoragePort)                │
//! │  SystemClock (Clock)   OneshotAdc / GpioInput / GpioOutput     │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  Registry of peripherals ──► Exchanger (telemetry out, │    │
//! │  │  battery · system · relays · switches   commands in)   │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One cooperative loop, one thread:
//!
//! | Step | Action                                                          |
//! |------|-----------------------------------------------------------------|
//! | 1    | WiFi upkeep                                                     |
//! | 2    | Scheduled exchange; refresh actuators if it failed; then update |
//! |      | every peripheral                                                |
//! | 3    | Battery low → lights off, one forced exchange per activation    |
//! | 4    | Battery critical → lights off, final exchange, deep sleep 1 h   |
//! | 5    | Heap fragmented → final exchange, restart                       |
//! | 6    | Switch pressed → local relay toggle, forced exchange            |
//! | 7    | Pending reboot / sleep command                                  |
//! | 8    | Delay `loopDelay` ms                                            |
#![deny(unused_must_use)]

use core::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use log::{error, info, warn};

use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};

use homenode::adapters::device_id;
use homenode::adapters::hardware::{BoardDelay, GpioInput, GpioOutput, OneshotAdc};
use homenode::adapters::http::HttpClient;
use homenode::adapters::mqtt::MqttBroker;
use homenode::adapters::nvs::NvsStorage;
use homenode::adapters::time::SystemClock;
use homenode::adapters::wifi::{WifiCredentials, WifiLink};
use homenode::app::context::NodeContext;
use homenode::app::exchanger::Exchanger;
use homenode::app::ports::{Peripheral, StoragePort};
use homenode::app::registry::Registry;
use homenode::config::{BatterySettings, ConfigStore, ExchangeSettings, SystemSettings};
use homenode::drivers::button::{Polarity, PushButtonMonitor};
use homenode::drivers::hw_init;
use homenode::drivers::relay::RelayControl;
use homenode::pins;
use homenode::sensors::battery::{AdcScaling, BatteryMonitor};
use homenode::sensors::system::{SystemAction, SystemMonitor};

// ── Peripheral names ──────────────────────────────────────────

const BATTERY: &str = "batteryMonitor";
const SYSTEM: &str = "systemMonitor";
const LIGHT_INSIDE: &str = "lightInside";
const LIGHT_OUTSIDE: &str = "lightOutside";
const STATUS_LED: &str = "statusLed";
const SWITCH_OUTSIDE: &str = "lightSwitchOutside";
const SWITCH_INSIDE: &str = "lightSwitchInside";

/// Switched off on low or critical battery.
const LIGHTS: [&str; 2] = [LIGHT_INSIDE, LIGHT_OUTSIDE];

const CRITICAL_SLEEP_MS: u64 = 3_600_000;

type Switch = PushButtonMonitor<GpioInput>;

// ── Build-time configuration ──────────────────────────────────

fn build_settings() -> Result<ExchangeSettings> {
    Ok(ExchangeSettings::new(
        ExchangeSettings::default().interval_ms,
        option_env!("HOMENODE_HTTP_URL").unwrap_or(""),
        option_env!("HOMENODE_MQTT_URL").unwrap_or(""),
    )?)
}

fn wifi_credentials() -> Result<WifiCredentials> {
    Ok(WifiCredentials::new(
        option_env!("HOMENODE_WIFI_SSID").unwrap_or("HomeNode"),
        option_env!("HOMENODE_WIFI_PASS").unwrap_or(""),
    )?)
}

// ── Power ─────────────────────────────────────────────────────

fn deep_sleep(duration_ms: u64) {
    info!("Power: deep sleep for {} s", duration_ms / 1000);
    // SAFETY: arms the RTC timer, then powers down; the chip resets on wake.
    unsafe {
        esp_idf_sys::esp_sleep_enable_timer_wakeup(duration_ms * 1000);
        esp_idf_sys::esp_deep_sleep_start();
    }
}

fn restart() -> ! {
    info!("Power: restarting");
    esp_idf_hal::reset::restart()
}

/// Toggle the relay a switch controls, if local action is enabled.
fn apply_local_action(registry: &Registry, switch: &Rc<RefCell<Switch>>) {
    let sw = switch.borrow();
    if !sw.local_action() {
        return;
    }
    let Some(target) = sw.target() else {
        return;
    };
    let Some(handle) = registry.get(target) else {
        warn!("Main: switch '{}' targets unknown '{}'", sw.name(), target);
        return;
    };
    if let Some(relay) = handle.borrow_mut().as_switchable() {
        relay.toggle();
    }
}

fn set_status_led(registry: &Registry, on: bool) {
    if let Some(handle) = registry.get(STATUS_LED) {
        if let Some(led) = handle.borrow_mut().as_switchable() {
            if on {
                led.turn_on();
            } else {
                led.turn_off();
            }
        }
    }
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  HomeNode v{}                        ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    if let Err(e) = hw_init::init_peripherals() {
        error!("HAL init failed: {}, halting", e);
        #[allow(clippy::empty_loop)]
        loop {}
    }

    let mac = device_id::read_mac();
    let dev_id = device_id::device_id(&mac);
    info!("Device ID: {} (hostname: {})", dev_id, device_id::hostname(&mac));

    // ── 2. Persistence ────────────────────────────────────────
    let storage: Rc<RefCell<dyn StoragePort>> = Rc::new(RefCell::new(NvsStorage::new()?));
    let store = ConfigStore::new(storage);

    // ── 3. Network ────────────────────────────────────────────
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut esp_wifi = EspWifi::new(peripherals.modem, sysloop.clone(), Some(nvs_partition))?;
    if let Err(e) = esp_wifi
        .sta_netif_mut()
        .set_hostname(device_id::hostname(&mac).as_str())
    {
        warn!("WiFi: could not set hostname ({})", e);
    }
    let wifi = WifiLink::new(BlockingWifi::wrap(esp_wifi, sysloop)?, wifi_credentials()?);

    let clock = SystemClock::new();
    let mut node = NodeContext::new(dev_id.clone(), wifi, clock);
    let boot_ms = node.now_ms();
    node.link_mut().begin(boot_ms);

    // ── 4. Peripherals (registration order = document order) ──
    let battery = Rc::new(RefCell::new(
        BatteryMonitor::new(
            BATTERY,
            OneshotAdc::new(pins::BATTERY_ADC_CHANNEL),
            BoardDelay,
            AdcScaling {
                v_ref: pins::BATTERY_ADC_VREF,
                divider_ratio: pins::BATTERY_DIVIDER_RATIO,
            },
            BatterySettings::default(),
        )
        .with_store(store.clone()),
    ));
    let system = Rc::new(RefCell::new(
        SystemMonitor::new(SYSTEM, &dev_id, SystemSettings::default()).with_store(store.clone()),
    ));
    let switch_outside = Rc::new(RefCell::new(
        Switch::new(SWITCH_OUTSIDE, GpioInput::new(pins::SWITCH_OUTSIDE_GPIO), Polarity::ActiveLow)
            .controlling(LIGHT_OUTSIDE),
    ));
    let switch_inside = Rc::new(RefCell::new(
        Switch::new(SWITCH_INSIDE, GpioInput::new(pins::SWITCH_INSIDE_GPIO), Polarity::ActiveLow)
            .controlling(LIGHT_INSIDE),
    ));

    {
        let registry = node.registry_mut();
        registry.register(battery.clone())?;
        registry.register(system.clone())?;
        registry.register(Rc::new(RefCell::new(RelayControl::new(
            LIGHT_INSIDE,
            GpioOutput::new(pins::LIGHT_INSIDE_GPIO),
        ))))?;
        registry.register(Rc::new(RefCell::new(RelayControl::new(
            LIGHT_OUTSIDE,
            GpioOutput::new(pins::LIGHT_OUTSIDE_GPIO),
        ))))?;
        registry.register(Rc::new(RefCell::new(RelayControl::new(
            STATUS_LED,
            GpioOutput::new(pins::STATUS_LED_GPIO),
        ))))?;
        registry.register(switch_outside.clone())?;
        registry.register(switch_inside.clone())?;
        registry.begin_all();
    }

    let mut exchanger =
        Exchanger::new(build_settings()?, MqttBroker::new(), HttpClient::new()).with_store(store);
    exchanger.begin();

    // ── 5. Startup report ─────────────────────────────────────
    node.registry().turn_off_group(&LIGHTS);
    set_status_led(node.registry(), true);
    let outcome = exchanger.exchange(&node, true, Some("startup"));
    set_status_led(node.registry(), false);
    info!("Startup exchange: {:?}", outcome);

    info!("System ready. Entering loop.");

    // ── 6. Loop ───────────────────────────────────────────────
    loop {
        let now = node.now_ms();
        node.link_mut().update(now);

        if !exchanger.exchange(&node, false, None).succeeded() {
            node.registry().refresh_all();
        }
        node.registry().update_all(now);

        // Battery policy.
        let (low, got_low, critical) = {
            let mut b = battery.borrow_mut();
            (b.is_low(), b.got_low(), b.is_critical())
        };
        if critical {
            warn!("Main: critical battery, shutting down");
            node.registry().turn_off_group(&LIGHTS);
            set_status_led(node.registry(), true);
            exchanger.exchange(&node, true, Some("critical_battery_shutdown"));
            set_status_led(node.registry(), false);
            deep_sleep(CRITICAL_SLEEP_MS);
        }
        if low {
            node.registry().turn_off_group(&LIGHTS);
            if got_low {
                exchanger.exchange(&node, true, Some("low_battery"));
            }
        }

        // Heap health.
        if system.borrow().fragmentation_is_critical() {
            error!("Main: heap fragmentation critical");
            exchanger.exchange(&node, true, Some("critical_fragmentation_reboot"));
            restart();
        }

        // Wall switches.
        for switch in [&switch_outside, &switch_inside] {
            if switch.borrow_mut().take_pressed() {
                apply_local_action(node.registry(), switch);
            }
        }
        while let Some(name) = node.registry().take_trigger() {
            set_status_led(node.registry(), true);
            exchanger.exchange(&node, true, Some(name.as_str()));
            set_status_led(node.registry(), false);
        }

        // Controller-requested power actions.
        let action = system.borrow_mut().take_action();
        match action {
            Some(SystemAction::Reboot) => restart(),
            Some(SystemAction::DeepSleep { duration_ms }) => deep_sleep(duration_ms),
            None => {}
        }

        FreeRtos::delay_ms(system.borrow().loop_delay_ms());
    }
}
