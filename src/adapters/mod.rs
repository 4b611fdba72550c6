//! Adapters: concrete implementations of the port traits.
//!
//! | Adapter     | Implements              | Connects to                 |
//! |-------------|-------------------------|-----------------------------|
//! | `hardware`  | AdcPort, embedded-hal   | ESP32 ADC1, GPIO            |
//! | `http`      | HttpPort                | ESP-IDF HTTP client         |
//! | `mqtt`      | BrokerPort              | ESP-IDF MQTT client         |
//! | `nvs`       | StoragePort             | NVS / in-memory store       |
//! | `time`      | Clock                   | ESP32 high-resolution timer |
//! | `wifi`      | LinkPort                | ESP-IDF WiFi STA            |
//! | `device_id` | (free functions)        | eFuse MAC                   |

pub mod device_id;
pub mod hardware;
pub mod http;
pub mod mqtt;
pub mod nvs;
pub mod time;
pub mod wifi;
