//! Node identity from the factory MAC address.
//!
//! `HN-XXYYZZ` (last three MAC bytes, uppercase hex) is the MQTT client id,
//! the `<id>` segment of both topics and the `deviceId` telemetry field.
//! The lowercase `homenode-xxyyzz` form is the DHCP hostname.

use core::fmt::Write;

pub type DeviceIdString = heapless::String<16>;
pub type Hostname = heapless::String<24>;
pub type MacAddress = [u8; 6];

#[cfg(target_os = "espidf")]
pub fn read_mac() -> MacAddress {
    let mut mac: MacAddress = [0u8; 6];
    // SAFETY: writes exactly 6 bytes into `mac`.
    unsafe {
        esp_idf_sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

#[cfg(not(target_os = "espidf"))]
pub fn read_mac() -> MacAddress {
    [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE]
}

pub fn device_id(mac: &MacAddress) -> DeviceIdString {
    let mut id = DeviceIdString::new();
    let _ = write!(id, "HN-{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5]);
    id
}

pub fn hostname(mac: &MacAddress) -> Hostname {
    let mut name = Hostname::new();
    let _ = write!(name, "homenode-{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5]);
    name
}
